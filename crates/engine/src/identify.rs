//! 레이어 식별 단계
//!
//! 프레임 처리의 즉시 식별 루프와 규칙 평가 중의 지연 식별이 모두
//! [`identify_layer`] 하나를 사용합니다. 단계는 항상 같은 순서입니다.
//!
//! 1. 이미 식별된 레이어면 그대로 반환 (식별은 한 번만). 실패가 기록된 레이어는 멈춤
//! 2. 부모 페이로드 범위(첫 레이어는 프레임 전체) 안에서 `identify` 호출
//! 3. 페이로드가 부모 범위를 벗어나면 손상 패킷
//! 4. 프로토콜 헬퍼에 `need_help` 질의
//! 5. 다음 레이어 할당
//!
//! 실패 처리만 모드에 따라 다릅니다. 즉시 식별은 체인을 그 자리에서 자르고
//! 레이어에 실패를 기록합니다. 지연 식별은 레이어를 다시 undefined로 되돌려
//! 다른 규칙이 다른 후보로 시도할 수 있게 하고, 실패한 후보는 다시 시도하지 않습니다.
//! 부모가 없는 첫 레이어는 프레임의 첫 프로토콜로만 식별하므로 어느 모드든
//! 실패가 기록됩니다.

use std::collections::VecDeque;
use std::time::Duration;

use crate::frame::Frame;
use crate::helper::{HelpRequest, HelpVerdict, HelperEnv, HelperSet};
use crate::layer::{LayerId, LayerPool, describe_chain};
use crate::param::ParamTable;
use crate::registry::ProtocolTable;
use crate::timer::{TimerOwner, TimerWheel};

/// 식별 주체
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// 프레임 처리 시작 시 체인을 끝까지 따라감
    Eager,
    /// 규칙 리프가 후보 프로토콜로 요청
    Lazy,
}

/// 식별 단계 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Identified,
    /// undefined이거나 식별 실패. 체인은 여기서 끝남
    Stopped,
    /// 헬퍼가 패킷을 흡수함
    Claimed,
    /// 레이어 범위 위반 또는 헬퍼가 손상 판정
    Malformed,
}

/// 프레임 처리 중단 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Halt {
    Claimed,
    Malformed,
}

/// 프레임 하나를 식별하는 동안 빌려 쓰는 엔진 상태
pub(crate) struct FrameScope<'a, 'p> {
    pub frame: &'a Frame,
    pub protocols: &'a ProtocolTable<'p>,
    pub pool: &'a mut LayerPool,
    pub helpers: &'a mut HelperSet,
    pub timers: &'a mut TimerWheel<TimerOwner>,
    pub reinject: &'a mut VecDeque<Frame>,
    pub params: &'a ParamTable,
    pub now: Duration,
    pub dump_invalid: bool,
    pub halt: Option<Halt>,
}

impl FrameScope<'_, '_> {
    fn first_layer(&self, mut id: LayerId) -> LayerId {
        while let Some(prev) = self.pool.get(id).prev() {
            id = prev;
        }
        id
    }

    fn report_malformed(&self, id: LayerId, reason: &str) {
        if !self.dump_invalid {
            return;
        }
        let first = self.first_layer(id);
        tracing::warn!(
            proto = self.protocols.name(self.pool.get(id).proto()),
            layers = %describe_chain(self.pool, Some(first), self.protocols),
            reason,
            "malformed packet dropped"
        );
    }
}

/// 레이어 하나를 식별합니다.
pub(crate) fn identify_layer(scope: &mut FrameScope<'_, '_>, id: LayerId, mode: Mode) -> Step {
    let protocols = scope.protocols;
    let layer = scope.pool.get(id);
    if layer.is_identified() {
        return Step::Identified;
    }
    let proto = layer.proto();
    if layer.is_failed() || proto.is_undefined() {
        return Step::Stopped;
    }
    let (start, len) = match layer.prev() {
        Some(parent) => {
            let parent = scope.pool.get(parent);
            (parent.payload_start(), parent.payload_size())
        }
        None => (0, scope.frame.len()),
    };

    let Some(decoder) = protocols.get(proto) else {
        return Step::Stopped;
    };
    let next = match decoder.identify(scope.frame.data(), scope.pool.get_mut(id), start, len) {
        Ok(next) => next,
        Err(e) => {
            tracing::trace!(proto = decoder.name(), error = %e, "identify failed");
            let first = scope.pool.get(id).prev().is_none();
            match mode {
                Mode::Lazy if !first => scope.pool.reject_candidate(id),
                _ => {
                    scope.pool.truncate_at(id);
                    scope.pool.mark_failed(id);
                }
            }
            return Step::Stopped;
        }
    };
    scope.pool.mark_identified(id, start);

    let layer = scope.pool.get(id);
    let payload_end = layer.payload_start().saturating_add(layer.payload_size());
    if layer.payload_start() < start || payload_end > start + len {
        scope.report_malformed(id, "layer payload exceeds parent bounds");
        return Step::Malformed;
    }

    let verdict = {
        let req = HelpRequest::new(scope.frame, start, len, scope.pool, id);
        let env = HelperEnv {
            now: scope.now,
            timers: &mut *scope.timers,
            reinject: &mut *scope.reinject,
            params: scope.params,
        };
        scope.helpers.need_help(proto, &req, env)
    };
    match verdict {
        Ok(HelpVerdict::NoHelp) => {}
        Ok(HelpVerdict::NeedsHelp) => return Step::Claimed,
        Err(e) => {
            scope.report_malformed(id, &e.to_string());
            return Step::Malformed;
        }
    }

    let next = protocols.resolve_next(proto, next);
    let payload_size = scope.pool.get(id).payload_size();
    if (!next.is_undefined() || payload_size > 0) && scope.pool.alloc(next, Some(id)).is_none() {
        tracing::trace!(proto = decoder.name(), "layer limit reached");
    }
    Step::Identified
}

/// 즉시 식별 루프. 체인을 가능한 깊이까지 식별합니다.
pub(crate) fn identify_chain(scope: &mut FrameScope<'_, '_>, first: LayerId) -> Step {
    let mut cur = first;
    loop {
        match identify_layer(scope, cur, Mode::Eager) {
            Step::Identified => match scope.pool.get(cur).next() {
                Some(next) => cur = next,
                None => return Step::Identified,
            },
            Step::Stopped => return Step::Stopped,
            Step::Claimed => {
                scope.halt = Some(Halt::Claimed);
                return Step::Claimed;
            }
            Step::Malformed => {
                scope.halt = Some(Halt::Malformed);
                return Step::Malformed;
            }
        }
    }
}
