//! 메모리 입력 -- 미리 만든 프레임을 차례로 내보냅니다.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::InputError;
use crate::frame::Frame;
use crate::registry::ProtocolRegistry;

use super::{Input, InputCaps, ReadOutcome, resolve_link};

/// 메모리 입력
///
/// 프레임은 (타임스탬프, 바이트)로 받고, 첫 레이어 프로토콜은 `open`에서
/// `link` 이름으로 찾습니다.
pub struct MemoryInput {
    link: String,
    pending: VecDeque<(Duration, Bytes)>,
    frames: VecDeque<Frame>,
    is_live: bool,
    opened: bool,
}

impl MemoryInput {
    pub fn new(link: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            pending: VecDeque::new(),
            frames: VecDeque::new(),
            is_live: false,
            opened: false,
        }
    }

    /// 라이브 캡처처럼 동작하게 합니다 (링이 가득 차면 버림).
    pub fn live(mut self, is_live: bool) -> Self {
        self.is_live = is_live;
        self
    }

    pub fn push(&mut self, timestamp: Duration, data: impl Into<Bytes>) {
        self.pending.push_back((timestamp, data.into()));
    }

    pub fn with_frame(mut self, timestamp: Duration, data: impl Into<Bytes>) -> Self {
        self.push(timestamp, data);
        self
    }

    pub fn remaining(&self) -> usize {
        self.pending.len() + self.frames.len()
    }
}

impl Input for MemoryInput {
    fn name(&self) -> &str {
        "memory"
    }

    fn open(&mut self, protocols: &ProtocolRegistry) -> Result<(), InputError> {
        let first = resolve_link(protocols, &self.link)?;
        self.frames
            .extend(self.pending.drain(..).map(|(ts, data)| Frame::new(data, ts, first)));
        self.opened = true;
        Ok(())
    }

    fn read(&mut self, cancel: &CancellationToken) -> Result<ReadOutcome, InputError> {
        if cancel.is_cancelled() {
            return Err(InputError::Interrupted);
        }
        if !self.opened {
            return Err(InputError::Read("input is not open".to_owned()));
        }
        Ok(match self.frames.pop_front() {
            Some(frame) => ReadOutcome::Frame(frame),
            None => ReadOutcome::Eof,
        })
    }

    fn caps(&self) -> InputCaps {
        InputCaps {
            snaplen: 65535,
            is_live: self.is_live,
            buffer_alignment: 1,
        }
    }

    fn close(&mut self) {
        self.frames.clear();
        self.opened = false;
    }
}
