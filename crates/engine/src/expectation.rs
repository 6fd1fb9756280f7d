//! 기대 연결 테이블
//!
//! 타겟이 "곧 이런 흐름이 올 것"이라고 등록하는 수명이 짧은 술어입니다
//! (예: 제어 연결에서 알아낸 데이터 연결). 기대 연결은 생성 시점 패킷의
//! 레이어 체인을 그대로 본떠, 레이어마다 프로토콜과 필드 값 비교 목록을 가집니다.
//!
//! 방향이 `REV`이면 각 필드는 [`Protocol::expectation_field`]가 돌려주는 반대쪽
//! 필드 값과 비교합니다 (ipv4 `src`는 원래 패킷의 `dst` 값과 비교).
//!
//! 기대 연결은 처음 매칭된 패킷에서 소비되어 테이블에서 사라집니다.
//! 매칭되지 않으면 만료 타이머가 정리합니다.
//!
//! [`Protocol::expectation_field`]: crate::registry::Protocol::expectation_field

use std::sync::Arc;
use std::time::Duration;

use flowmatic_core::metrics as m;
use flowmatic_core::{CmpOp, Value};
use serde::Serialize;

use crate::conntrack::{ConnectionState, CtFlags, EntryId};
use crate::layer::Packet;
use crate::registry::{ProtoId, ProtocolTable};
use crate::target::{TargetId, TargetSlot};
use crate::timer::{TimerId, TimerOwner, TimerWheel};

/// 기대 연결 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ExpectationId(u64);

impl ExpectationId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// 레이어 하나에 대한 기대
#[derive(Debug, Clone)]
struct ExpectationNode {
    proto: ProtoId,
    fields: Vec<(usize, CmpOp, Value)>,
}

impl ExpectationNode {
    fn matches(&self, layer: &crate::layer::Layer) -> bool {
        layer.proto() == self.proto
            && self
                .fields
                .iter()
                .all(|(idx, op, value)| layer.field(*idx).is_some_and(|v| v.compare(*op, value)))
    }
}

struct Expectation {
    id: ExpectationId,
    owner: Arc<TargetSlot>,
    parent: Option<EntryId>,
    protocols: Vec<ProtoId>,
    /// 방향별 레이어 체인 (BOTH면 두 개)
    alternatives: Vec<Vec<ExpectationNode>>,
    timer: TimerId,
    state: Option<Box<dyn ConnectionState>>,
    created: Duration,
}

impl Expectation {
    fn matches(&self, packet: &Packet<'_>) -> bool {
        self.alternatives.iter().any(|chain| {
            let mut layers = packet.layers();
            chain
                .iter()
                .all(|node| layers.next().is_some_and(|layer| node.matches(layer)))
        })
    }
}

/// 매칭으로 소비된 기대 연결
pub struct ExpectationMatch {
    pub id: ExpectationId,
    /// 기대 연결을 만든 타겟. 매칭 패킷을 처리합니다.
    pub owner: Arc<TargetSlot>,
    /// 기대 연결을 만든 흐름
    pub parent: Option<EntryId>,
    /// 새 흐름에 붙일 타겟 상태
    pub state: Option<Box<dyn ConnectionState>>,
}

/// 기대 연결 요약
#[derive(Debug, Clone, Serialize)]
pub struct ExpectationSummary {
    pub id: ExpectationId,
    pub owner: TargetId,
    pub parent: Option<EntryId>,
    pub protocols: Vec<&'static str>,
    pub created: Duration,
}

/// 기대 연결 목록
///
/// 항목 수가 적다고 가정한 평면 목록입니다. 새 항목이 앞에 옵니다.
#[derive(Default)]
pub struct ExpectationTable {
    entries: Vec<Expectation>,
    next_id: u64,
}

impl ExpectationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 패킷의 레이어 체인을 본떠 기대 연결을 등록합니다.
    ///
    /// `dir`이 `REV`면 반대 방향 패킷을, `BOTH`면 양쪽 모두를 기대합니다.
    /// 식별된 레이어가 없으면 `None`.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        packet: &Packet<'_>,
        owner: Arc<TargetSlot>,
        parent: Option<EntryId>,
        dir: CtFlags,
        timeout_secs: u64,
        state: Option<Box<dyn ConnectionState>>,
        timers: &mut TimerWheel<TimerOwner>,
        now: Duration,
    ) -> Option<ExpectationId> {
        let protocols = packet.protocols();
        let directions: Vec<CtFlags> = match dir {
            CtFlags::BOTH => vec![CtFlags::FWD, CtFlags::REV],
            CtFlags::REV => vec![CtFlags::REV],
            _ => vec![CtFlags::FWD],
        };

        let alternatives: Vec<Vec<ExpectationNode>> = directions
            .iter()
            .map(|d| build_chain(packet, protocols, *d))
            .collect();
        let chain_protos: Vec<ProtoId> = alternatives
            .first()
            .map(|c| c.iter().map(|n| n.proto).collect())
            .unwrap_or_default();
        if chain_protos.is_empty() {
            return None;
        }
        for proto in &chain_protos {
            protocols.acquire(*proto);
        }

        self.next_id += 1;
        let id = ExpectationId(self.next_id);
        let timer = timers.alloc(TimerOwner::Expectation(id));
        if let Err(e) = timers.queue(timer, timeout_secs, now) {
            tracing::warn!(expectation = id.0, error = %e, "failed to queue expectation timer");
        }

        tracing::debug!(
            expectation = id.0,
            owner = owner.kind(),
            layers = chain_protos.len(),
            timeout_secs,
            "expectation added"
        );
        self.entries.insert(
            0,
            Expectation {
                id,
                owner,
                parent,
                protocols: chain_protos,
                alternatives,
                timer,
                state,
                created: now,
            },
        );
        Some(id)
    }

    /// 패킷과 맞는 기대 연결을 모두 소비합니다.
    pub fn take_matches(
        &mut self,
        packet: &Packet<'_>,
        timers: &mut TimerWheel<TimerOwner>,
    ) -> Vec<ExpectationMatch> {
        if self.entries.is_empty() {
            return Vec::new();
        }
        let protocols = packet.protocols();
        let mut matched = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if !self.entries[i].matches(packet) {
                i += 1;
                continue;
            }
            let mut expt = self.entries.remove(i);
            release(&expt, protocols, timers);
            metrics::counter!(m::EXPECTATION_MATCHED_TOTAL).increment(1);
            tracing::debug!(expectation = expt.id.0, "expectation matched");
            matched.push(ExpectationMatch {
                id: expt.id,
                owner: Arc::clone(&expt.owner),
                parent: expt.parent,
                state: expt.state.take(),
            });
        }
        matched
    }

    /// 만료 타이머 처리. 붙어 있던 타겟 상태는 연결 없이 정리됩니다.
    pub fn expire(&mut self, id: ExpectationId, protocols: &ProtocolTable<'_>, timers: &mut TimerWheel<TimerOwner>) {
        let Some(pos) = self.entries.iter().position(|e| e.id == id) else {
            return;
        };
        let expt = self.entries.remove(pos);
        metrics::counter!(m::EXPECTATION_EXPIRED_TOTAL).increment(1);
        tracing::debug!(expectation = id.0, "expectation expired");
        discard(expt, protocols, timers);
    }

    /// 닫힌 타겟이 만든 기대 연결을 모두 버립니다.
    pub fn remove_owner(
        &mut self,
        owner: TargetId,
        protocols: &ProtocolTable<'_>,
        timers: &mut TimerWheel<TimerOwner>,
    ) -> usize {
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.owner.id() == owner);
        self.entries = kept;
        let count = gone.len();
        for expt in gone {
            discard(expt, protocols, timers);
        }
        count
    }

    /// 모든 기대 연결을 버립니다 (종료 시).
    pub fn clear(&mut self, protocols: &ProtocolTable<'_>, timers: &mut TimerWheel<TimerOwner>) {
        for expt in std::mem::take(&mut self.entries) {
            discard(expt, protocols, timers);
        }
    }

    pub fn summaries(&self, protocols: &ProtocolTable<'_>) -> Vec<ExpectationSummary> {
        self.entries
            .iter()
            .map(|e| ExpectationSummary {
                id: e.id,
                owner: e.owner.id(),
                parent: e.parent,
                protocols: e.protocols.iter().map(|p| protocols.name(*p)).collect(),
                created: e.created,
            })
            .collect()
    }
}

fn build_chain(packet: &Packet<'_>, protocols: &ProtocolTable<'_>, dir: CtFlags) -> Vec<ExpectationNode> {
    packet
        .layers()
        .map(|layer| {
            let proto = layer.proto();
            let fields = protocols
                .get(proto)
                .map(|p| {
                    layer
                        .fields()
                        .filter_map(|(idx, _)| {
                            let mirror = p.expectation_field(idx, dir)?;
                            let Some(value) = layer.field(mirror) else {
                                tracing::warn!(
                                    proto = p.name(),
                                    field = idx,
                                    mirror,
                                    "expectation mirror field is not set"
                                );
                                return None;
                            };
                            Some((idx, CmpOp::Eq, value.clone()))
                        })
                        .collect()
                })
                .unwrap_or_default();
            ExpectationNode { proto, fields }
        })
        .collect()
}

fn release(expt: &Expectation, protocols: &ProtocolTable<'_>, timers: &mut TimerWheel<TimerOwner>) {
    timers.free(expt.timer);
    for proto in &expt.protocols {
        protocols.release(*proto);
    }
}

fn discard(mut expt: Expectation, protocols: &ProtocolTable<'_>, timers: &mut TimerWheel<TimerOwner>) {
    release(&expt, protocols, timers);
    if let Some(state) = expt.state.take() {
        state.cleanup(None);
    }
}
