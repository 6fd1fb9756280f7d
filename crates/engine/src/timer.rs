//! 타이머 휠 -- 만료 시간 길이별 FIFO 큐
//!
//! 같은 길이로 등록된 타이머는 등록 순서가 곧 만료 순서이므로, 길이별로 큐를 만들고
//! 큐를 길이 오름차순으로 정렬해 둡니다([`BTreeMap`]). 처리 시에는 각 큐의 머리에서
//! 만료된 타이머만 꺼냅니다.
//!
//! 타이머 슬롯은 아레나에 있고 큐는 슬롯 인덱스로 이중 연결됩니다.
//! 타이머는 동시에 하나의 큐에만 들어갈 수 있습니다 (`queue` 필드가 `Some`이면 큐 안).
//!
//! 시간은 외부에서 주입합니다. 오프라인 입력은 마지막 패킷의 타임스탬프를,
//! 라이브 입력은 벽시계를 사용합니다.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::conntrack::EntryId;
use crate::expectation::ExpectationId;
use crate::registry::ProtoId;

/// 타이머가 만료되었을 때 누구에게 알릴지
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOwner {
    /// 연결 추적 엔트리의 유휴 만료
    Conntrack(EntryId),
    /// 헬퍼 내부 상태 (예: IPv4 조각 그룹)
    Helper { proto: ProtoId, token: u64 },
    /// 기대 연결 만료
    Expectation(ExpectationId),
}

/// 타이머 핸들
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    index: u32,
    generation: u32,
}

/// 타이머 조작 실패
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    /// 이미 큐에 있는 타이머를 다시 넣으려 함
    #[error("timer is already queued")]
    AlreadyQueued,
    /// 해제된 타이머
    #[error("unknown or freed timer")]
    Unknown,
}

#[derive(Debug)]
struct Timer<T> {
    owner: T,
    expires: Duration,
    queue: Option<u64>,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    timer: Option<Timer<T>>,
}

#[derive(Debug, Default)]
struct TimerQueue {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

/// 길이별 큐로 구성된 타이머 휠
#[derive(Debug)]
pub struct TimerWheel<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    queues: BTreeMap<u64, TimerQueue>,
    live: usize,
}

impl<T: Copy> TimerWheel<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            queues: BTreeMap::new(),
            live: 0,
        }
    }

    /// 큐에 넣지 않은 타이머를 할당합니다.
    pub fn alloc(&mut self, owner: T) -> TimerId {
        let timer = Timer {
            owner,
            expires: Duration::ZERO,
            queue: None,
            prev: None,
            next: None,
        };
        self.live += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.timer = Some(timer);
            return TimerId {
                index,
                generation: slot.generation,
            };
        }

        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            timer: Some(timer),
        });
        TimerId {
            index,
            generation: 0,
        }
    }

    /// 타이머를 해제합니다. 큐에 있으면 먼저 뺍니다.
    pub fn free(&mut self, id: TimerId) -> Option<T> {
        self.timer(id)?;
        self.dequeue(id);
        let slot = &mut self.slots[id.index as usize];
        let timer = slot.timer.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(timer.owner)
    }

    fn timer(&self, id: TimerId) -> Option<&Timer<T>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.timer.as_ref()
    }

    fn timer_mut(&mut self, id: TimerId) -> Option<&mut Timer<T>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.timer.as_mut()
    }

    /// 타이머를 `now + secs`에 만료되도록 `secs` 길이 큐의 꼬리에 넣습니다.
    pub fn queue(&mut self, id: TimerId, secs: u64, now: Duration) -> Result<(), TimerError> {
        let timer = self.timer_mut(id).ok_or(TimerError::Unknown)?;
        if timer.queue.is_some() {
            return Err(TimerError::AlreadyQueued);
        }
        timer.expires = now + Duration::from_secs(secs);
        timer.queue = Some(secs);

        let queue = self.queues.entry(secs).or_default();
        let old_tail = queue.tail.replace(id.index);
        if queue.head.is_none() {
            queue.head = Some(id.index);
        }
        queue.len += 1;

        if let Some(tail) = old_tail {
            if let Some(t) = self.slots[tail as usize].timer.as_mut() {
                t.next = Some(id.index);
            }
        }
        if let Some(t) = self.slots[id.index as usize].timer.as_mut() {
            t.prev = old_tail;
            t.next = None;
        }
        Ok(())
    }

    /// 큐에 있으면 빼고 다시 넣습니다.
    pub fn requeue(&mut self, id: TimerId, secs: u64, now: Duration) -> Result<(), TimerError> {
        self.dequeue(id);
        self.queue(id, secs, now)
    }

    /// 큐에서 뺍니다. 큐에 없었으면 `false`.
    pub fn dequeue(&mut self, id: TimerId) -> bool {
        let Some(timer) = self.timer_mut(id) else {
            return false;
        };
        let Some(secs) = timer.queue.take() else {
            return false;
        };
        let prev = timer.prev.take();
        let next = timer.next.take();

        if let Some(p) = prev {
            if let Some(t) = self.slots[p as usize].timer.as_mut() {
                t.next = next;
            }
        }
        if let Some(n) = next {
            if let Some(t) = self.slots[n as usize].timer.as_mut() {
                t.prev = prev;
            }
        }

        if let Some(queue) = self.queues.get_mut(&secs) {
            if queue.head == Some(id.index) {
                queue.head = next;
            }
            if queue.tail == Some(id.index) {
                queue.tail = prev;
            }
            queue.len -= 1;
            if queue.len == 0 {
                self.queues.remove(&secs);
            }
        }
        true
    }

    pub fn is_queued(&self, id: TimerId) -> bool {
        self.timer(id).is_some_and(|t| t.queue.is_some())
    }

    /// 만료 시각. 큐에 없으면 `None`.
    pub fn expires(&self, id: TimerId) -> Option<Duration> {
        self.timer(id)
            .filter(|t| t.queue.is_some())
            .map(|t| t.expires)
    }

    /// `now` 이전에 만료된 타이머를 모두 큐에서 빼고 소유자를 반환합니다.
    ///
    /// 타이머는 해제되지 않습니다. 소유자가 다시 넣거나 해제해야 합니다.
    /// 큐는 길이 오름차순, 큐 안은 등록 순서로 반환됩니다.
    pub fn process(&mut self, now: Duration) -> Vec<T> {
        let mut due = Vec::new();
        let durations: Vec<u64> = self.queues.keys().copied().collect();

        for secs in durations {
            loop {
                let Some(head) = self.queues.get(&secs).and_then(|q| q.head) else {
                    break;
                };
                let slot = &self.slots[head as usize];
                let Some(timer) = slot.timer.as_ref() else {
                    break;
                };
                if timer.expires >= now {
                    break;
                }
                let owner = timer.owner;
                let id = TimerId {
                    index: head,
                    generation: slot.generation,
                };
                self.dequeue(id);
                due.push(owner);
            }
        }
        due
    }

    /// 할당된 타이머 수
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// 큐에 들어 있는 타이머 수
    pub fn queued(&self) -> usize {
        self.queues.values().map(|q| q.len).sum()
    }

    /// 현재 존재하는 큐(길이) 수
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}

impl<T: Copy> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}
