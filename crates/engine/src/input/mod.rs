//! 입력 소스
//!
//! 입력은 입력 스레드에서 [`Input::read`]로 프레임을 하나씩 만들어
//! [`FrameRing`]에 넣습니다. 처리 스레드는 [`Input::caps`]의 `is_live`를 보고
//! 링의 오버플로우 정책을 고릅니다.
//!
//! # 구현체
//! - [`PcapFileInput`]: pcap / pcapng 파일 재생
//! - [`MemoryInput`]: 미리 만든 프레임 목록 (테스트/벤치마크)

pub mod memory;
pub mod pcap;
pub mod ring;

pub use memory::MemoryInput;
pub use pcap::PcapFileInput;
pub use ring::{FrameRing, PopOutcome, PushOutcome};

use tokio_util::sync::CancellationToken;

use crate::error::InputError;
use crate::frame::Frame;
use crate::registry::ProtocolRegistry;

/// 입력 특성
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputCaps {
    /// 프레임 최대 캡처 길이
    pub snaplen: u32,
    /// 라이브 캡처 여부 (오버플로우 시 버림/대기 결정)
    pub is_live: bool,
    /// 버퍼 정렬 요구 (바이트)
    pub buffer_alignment: usize,
}

/// [`Input::read`] 결과
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    /// 지금은 읽을 프레임이 없음
    WouldBlock,
    /// 더 이상 프레임이 없음
    Eof,
}

/// 입력 소스
pub trait Input: Send {
    /// 로그에 쓸 이름
    fn name(&self) -> &str;

    /// 입력을 엽니다. 첫 레이어 프로토콜은 `protocols`에서 찾습니다.
    fn open(&mut self, protocols: &ProtocolRegistry) -> Result<(), InputError>;

    /// 프레임 하나를 읽습니다.
    ///
    /// `cancel`이 취소되면 상태를 망가뜨리지 않고 [`InputError::Interrupted`]를 반환합니다.
    fn read(&mut self, cancel: &CancellationToken) -> Result<ReadOutcome, InputError>;

    fn caps(&self) -> InputCaps;

    fn close(&mut self);
}

/// 링크 계층 이름에 해당하는 프로토콜 ID를 찾습니다.
pub(crate) fn resolve_link(
    protocols: &ProtocolRegistry,
    name: &str,
) -> Result<crate::registry::ProtoId, InputError> {
    protocols.lookup(name).ok_or_else(|| InputError::Open {
        path: name.to_owned(),
        reason: format!("protocol '{name}' is not registered"),
    })
}
