//! 실행 루프 -- 입력 스레드와 처리 루프
//!
//! ```text
//! input thread: Input::read --push--> FrameRing --pop_timeout--> main loop
//!                                                  process_frame + process_timers
//! ```
//!
//! 입력 스레드는 프레임을 링에 넣기만 합니다. 처리 루프는 링이 비어 있으면
//! `poll_interval`만큼 기다렸다가 프레임이 없어도 타이머를 처리합니다.
//! 링의 오버플로우 정책은 입력의 `is_live`로 정합니다.
//!
//! [`Runner::run`]은 블로킹 함수입니다. 비동기 런타임에서는
//! `tokio::task::spawn_blocking`으로 실행합니다.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flowmatic_core::metrics as m;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::OverflowPolicy;
use crate::engine::{Engine, EngineStats};
use crate::error::{EngineError, InputError};
use crate::input::{FrameRing, Input, PopOutcome, PushOutcome, ReadOutcome};

/// 입력이 당장 프레임을 주지 못할 때 다시 읽기 전 대기 시간
const WOULD_BLOCK_BACKOFF: Duration = Duration::from_millis(10);

/// 실행 결과
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// 입력에서 읽은 프레임 수
    pub frames_read: u64,
    /// 링이 가득 차 버린 프레임 수
    pub ring_dropped: u64,
    /// 취소로 멈췄는지 여부
    pub cancelled: bool,
    pub stats: EngineStats,
}

/// 입력 하나를 끝까지 엔진에 흘려보내는 실행기
pub struct Runner {
    engine: Arc<Engine>,
    cancel: CancellationToken,
}

impl Runner {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            cancel: CancellationToken::new(),
        }
    }

    /// 외부 취소 토큰을 사용합니다 (데몬 종료 신호 등).
    pub fn with_cancel(engine: Arc<Engine>, cancel: CancellationToken) -> Self {
        Self { engine, cancel }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// 입력을 열고 EOF나 취소까지 처리합니다.
    pub fn run(&self, mut input: Box<dyn Input>) -> Result<RunReport, EngineError> {
        input.open(self.engine.protocols())?;
        let caps = input.caps();
        let policy = OverflowPolicy::for_input(caps.is_live);
        let config = self.engine.config();
        let ring = Arc::new(FrameRing::new(config.ring_capacity, policy));
        let poll = config.poll_interval();

        tracing::info!(
            input = input.name(),
            live = caps.is_live,
            snaplen = caps.snaplen,
            policy = ?policy,
            ring_capacity = ring.capacity(),
            "input opened"
        );

        let reader = {
            let ring = Arc::clone(&ring);
            let cancel = self.cancel.clone();
            thread::Builder::new()
                .name("flowmatic-input".to_owned())
                .spawn(move || read_loop(input, &ring, &cancel))?
        };

        let mut cancelled = false;
        loop {
            if !cancelled && self.cancel.is_cancelled() {
                cancelled = true;
                ring.close();
                tracing::info!(pending = ring.len(), "cancellation requested, draining ring");
            }
            match ring.pop_timeout(poll) {
                PopOutcome::Frame(frame) => {
                    self.engine.process_frame(frame);
                    self.engine.process_timers(self.clock(caps.is_live));
                }
                PopOutcome::TimedOut => {
                    self.engine.process_timers(self.clock(caps.is_live));
                }
                PopOutcome::Closed => break,
            }
        }

        let read_result = reader
            .join()
            .map_err(|_| InputError::Read("input thread panicked".to_owned()))?;
        let ring_dropped = ring.dropped_count();
        self.engine.record_ring_overflow(ring_dropped);
        let frames_read = read_result?;

        let report = RunReport {
            frames_read,
            ring_dropped,
            cancelled,
            stats: self.engine.stats(),
        };
        tracing::info!(
            frames_read,
            ring_dropped,
            processed = report.stats.frames_processed,
            dropped = report.stats.frames_dropped,
            claimed = report.stats.frames_claimed,
            reinjected = report.stats.frames_reinjected,
            "input finished"
        );
        Ok(report)
    }

    /// 타이머 기준 시각. 라이브 입력은 벽시계, 재생 입력은 마지막 프레임 시각.
    fn clock(&self, is_live: bool) -> Duration {
        if is_live {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
        } else {
            self.engine.now()
        }
    }
}

/// 입력 스레드 본체. 읽은 프레임 수를 반환합니다.
fn read_loop(
    mut input: Box<dyn Input>,
    ring: &FrameRing,
    cancel: &CancellationToken,
) -> Result<u64, InputError> {
    let mut frames = 0u64;
    let result = loop {
        match input.read(cancel) {
            Ok(ReadOutcome::Frame(frame)) => {
                frames += 1;
                metrics::counter!(m::INPUT_FRAMES_READ_TOTAL).increment(1);
                if ring.push(frame) == PushOutcome::Closed {
                    break Ok(frames);
                }
            }
            Ok(ReadOutcome::WouldBlock) => {
                if cancel.is_cancelled() {
                    break Ok(frames);
                }
                thread::sleep(WOULD_BLOCK_BACKOFF);
            }
            Ok(ReadOutcome::Eof) => {
                tracing::debug!(input = input.name(), frames, "input reached end");
                break Ok(frames);
            }
            Err(InputError::Interrupted) => {
                tracing::debug!(input = input.name(), frames, "input read interrupted");
                break Ok(frames);
            }
            Err(e) => {
                tracing::error!(input = input.name(), error = %e, "input read failed");
                break Err(e);
            }
        }
    };
    input.close();
    ring.close();
    result
}
