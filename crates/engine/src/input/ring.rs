//! 프레임 링 버퍼 -- 입력 스레드와 처리 스레드 사이의 유한 큐
//!
//! 입력 스레드가 [`FrameRing::push`]로 넣고 처리 스레드가 [`FrameRing::pop_timeout`]으로
//! 꺼냅니다. 가득 찼을 때의 동작은 [`OverflowPolicy`]가 정합니다.
//!
//! - [`OverflowPolicy::Block`]: 자리가 날 때까지 입력 스레드를 재움 (파일 재생)
//! - [`OverflowPolicy::DropNewest`]: 새 프레임을 버리고 카운터를 올림 (라이브 캡처)

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use flowmatic_core::metrics as m;

use crate::config::OverflowPolicy;
use crate::frame::Frame;

/// [`FrameRing::push`] 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// 가득 차서 버림
    Dropped,
    /// 링이 닫혀 받지 않음
    Closed,
}

/// [`FrameRing::pop_timeout`] 결과
#[derive(Debug)]
pub enum PopOutcome {
    Frame(Frame),
    TimedOut,
    /// 닫혔고 남은 프레임도 없음
    Closed,
}

struct RingState {
    frames: VecDeque<Frame>,
    closed: bool,
    dropped: u64,
    total_received: u64,
}

/// 입력 → 처리 프레임 큐
pub struct FrameRing {
    state: Mutex<RingState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
}

impl FrameRing {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(RingState {
                frames: VecDeque::with_capacity(capacity.min(10_000)),
                closed: false,
                dropped: 0,
                total_received: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state
            .lock()
            .unwrap_or_else(|_| panic!("frame ring lock poisoned"))
    }

    /// 프레임을 넣습니다.
    pub fn push(&self, frame: Frame) -> PushOutcome {
        let mut state = self.lock();
        state.total_received += 1;
        loop {
            if state.closed {
                return PushOutcome::Closed;
            }
            if state.frames.len() < self.capacity {
                break;
            }
            match self.policy {
                OverflowPolicy::DropNewest => {
                    state.dropped += 1;
                    metrics::counter!(m::INPUT_RING_OVERFLOW_TOTAL).increment(1);
                    tracing::debug!(
                        dropped = state.dropped,
                        capacity = self.capacity,
                        "ring full, rejected new frame"
                    );
                    return PushOutcome::Dropped;
                }
                OverflowPolicy::Block => {
                    state = self
                        .not_full
                        .wait(state)
                        .unwrap_or_else(|_| panic!("frame ring lock poisoned"));
                }
            }
        }
        state.frames.push_back(frame);
        drop(state);
        self.not_empty.notify_one();
        PushOutcome::Queued
    }

    /// 프레임을 꺼냅니다. 비어 있으면 `timeout`까지 기다립니다.
    pub fn pop_timeout(&self, timeout: Duration) -> PopOutcome {
        let mut state = self.lock();
        if state.frames.is_empty() && !state.closed {
            state = self
                .not_empty
                .wait_timeout_while(state, timeout, |s| s.frames.is_empty() && !s.closed)
                .unwrap_or_else(|_| panic!("frame ring lock poisoned"))
                .0;
        }
        match state.frames.pop_front() {
            Some(frame) => {
                drop(state);
                self.not_full.notify_one();
                PopOutcome::Frame(frame)
            }
            None if state.closed => PopOutcome::Closed,
            None => PopOutcome::TimedOut,
        }
    }

    /// 링을 닫습니다. 대기 중인 생산자/소비자가 모두 깨어납니다.
    ///
    /// 이미 들어간 프레임은 계속 꺼낼 수 있습니다.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// 지금까지 버린 프레임 수
    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }

    pub fn total_received(&self) -> u64 {
        self.lock().total_received
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::registry::ProtoId;

    fn frame(tag: u8) -> Frame {
        Frame::new(vec![tag], Duration::ZERO, ProtoId::UNDEFINED)
    }

    fn tag(outcome: PopOutcome) -> u8 {
        match outcome {
            PopOutcome::Frame(f) => f.data()[0],
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn live_policy_drops_newest() {
        let ring = FrameRing::new(2, OverflowPolicy::DropNewest);
        assert_eq!(ring.push(frame(1)), PushOutcome::Queued);
        assert_eq!(ring.push(frame(2)), PushOutcome::Queued);
        assert_eq!(ring.push(frame(3)), PushOutcome::Dropped);
        assert_eq!(ring.dropped_count(), 1);
        assert_eq!(ring.total_received(), 3);
        assert_eq!(tag(ring.pop_timeout(Duration::ZERO)), 1);
        assert_eq!(tag(ring.pop_timeout(Duration::ZERO)), 2);
    }

    #[test]
    fn empty_ring_times_out() {
        let ring = FrameRing::new(4, OverflowPolicy::Block);
        assert!(matches!(
            ring.pop_timeout(Duration::from_millis(10)),
            PopOutcome::TimedOut
        ));
    }

    #[test]
    fn replay_policy_blocks_until_consumed() {
        let ring = Arc::new(FrameRing::new(1, OverflowPolicy::Block));
        ring.push(frame(1));

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.push(frame(2)))
        };

        assert_eq!(tag(ring.pop_timeout(Duration::from_secs(5))), 1);
        assert_eq!(producer.join().unwrap(), PushOutcome::Queued);
        assert_eq!(tag(ring.pop_timeout(Duration::from_secs(5))), 2);
        assert_eq!(ring.dropped_count(), 0);
    }

    #[test]
    fn close_wakes_blocked_producer_and_drains() {
        let ring = Arc::new(FrameRing::new(1, OverflowPolicy::Block));
        ring.push(frame(1));
        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.push(frame(2)))
        };
        thread::sleep(Duration::from_millis(20));
        ring.close();
        assert_eq!(producer.join().unwrap(), PushOutcome::Closed);
        assert_eq!(tag(ring.pop_timeout(Duration::ZERO)), 1);
        assert!(matches!(ring.pop_timeout(Duration::ZERO), PopOutcome::Closed));
    }
}
