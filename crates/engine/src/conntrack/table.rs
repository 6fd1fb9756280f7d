//! 연결 추적 테이블 -- 엔트리 아레나와 정방향/역방향 해시 버킷
//!
//! 정방향 버킷은 방향 무관 해시(`CtFlags::NONE`)로, 역방향 버킷은 역방향 관점
//! 해시(`CtFlags::REV`)로 색인합니다. 두 버킷은 같은 [`EntryId`]를 가리키고,
//! 서로의 위치는 엔트리에 저장된 버킷 번호로 찾습니다.
//!
//! 버킷 체인은 최근에 생성된 엔트리부터 검사합니다.

use std::any::Any;
use std::time::Duration;

use serde::Serialize;

use flowmatic_core::metrics as m;

use super::entry::{HelperState, MatchState, TargetState};
use super::hash::jhash_2words;
use super::{ConnectionState, ConntrackEntry, CtFlags, EntryId, FlowDirection};
use crate::layer::Packet;
use crate::registry::{ProtoId, ProtocolTable};
use crate::target::TargetId;
use crate::timer::{TimerOwner, TimerWheel};

/// 흐름 해시 초기값
const INITVAL: u32 = 0xdf92_b6eb;

struct EntrySlot {
    generation: u32,
    entry: Option<ConntrackEntry>,
}

/// 조회용 엔트리 요약
#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub id: EntryId,
    pub protocols: Vec<&'static str>,
    pub direction: FlowDirection,
    pub parent: Option<EntryId>,
    pub packets: [u64; 2],
    pub bytes: [u64; 2],
    pub timeout_secs: u64,
}

/// 연결 추적 테이블
pub struct ConntrackTable {
    slots: Vec<EntrySlot>,
    free: Vec<u32>,
    fwd: Vec<Vec<EntryId>>,
    rev: Vec<Vec<EntryId>>,
    size: usize,
    default_timeout_secs: u64,
    live: usize,
}

impl ConntrackTable {
    /// `size`개의 버킷을 가진 테이블을 생성합니다.
    pub fn new(size: usize, default_timeout_secs: u64) -> Self {
        let size = size.max(1);
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            fwd: vec![Vec::new(); size],
            rev: vec![Vec::new(); size],
            size,
            default_timeout_secs,
            live: 0,
        }
    }

    /// 살아있는 엔트리 수
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn get(&self, id: EntryId) -> Option<&ConntrackEntry> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn get_mut(&mut self, id: EntryId) -> Option<&mut ConntrackEntry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// `dir` 관점의 흐름 해시 (테이블 크기로 나누기 전)
    ///
    /// 기여 프로토콜 레이어가 하나도 없으면 추적 대상이 아니므로 `None`.
    pub fn flow_hash(packet: &Packet<'_>, dir: CtFlags) -> Option<u32> {
        let protocols = packet.protocols();
        let mut hash = INITVAL;
        let mut contributed = false;

        for layer in packet.layers() {
            let Some(ct) = protocols.contributor(layer.proto()) else {
                continue;
            };
            contributed = true;
            if ct.flags().contributes(dir) {
                let res = ct.hash(packet.data(), layer.start(), dir);
                hash = jhash_2words(hash, res, INITVAL);
            }
        }
        contributed.then_some(hash)
    }

    fn bucket(&self, hash: u32) -> usize {
        hash as usize % self.size
    }

    /// 패킷이 속한 엔트리를 찾습니다.
    ///
    /// 정방향 테이블을 먼저 검사하고, 없으면 역방향 관점 해시로 역방향 테이블을
    /// 검사합니다. 찾은 엔트리에 매칭 방향을 기록합니다.
    pub fn lookup(&mut self, packet: &Packet<'_>) -> Option<(EntryId, FlowDirection)> {
        let hash = Self::flow_hash(packet, CtFlags::NONE)?;
        let bucket = self.bucket(hash);
        let found = self.fwd[bucket]
            .iter()
            .rev()
            .copied()
            .find(|id| self.matches(*id, packet, CtFlags::NONE))
            .map(|id| (id, FlowDirection::Forward));

        let found = found.or_else(|| {
            let hash = Self::flow_hash(packet, CtFlags::FWD)?;
            let bucket = self.bucket(hash);
            self.rev[bucket]
                .iter()
                .rev()
                .copied()
                .find(|id| self.matches(*id, packet, CtFlags::REV))
                .map(|id| (id, FlowDirection::Reverse))
        })?;

        if let Some(entry) = self.get_mut(found.0) {
            entry.direction = found.1;
        }
        Some(found)
    }

    /// 후보 엔트리가 이 패킷의 흐름인지 재확인합니다.
    ///
    /// 실패는 이 후보만 제외합니다. 기여 레이어 구성이 다르면 다른 흐름입니다.
    fn matches(&self, id: EntryId, packet: &Packet<'_>, dir: CtFlags) -> bool {
        let Some(entry) = self.get(id) else {
            return false;
        };
        let protocols = packet.protocols();

        let mut layers = packet
            .layers()
            .filter(|l| protocols.contributor(l.proto()).is_some());
        for state in &entry.match_states {
            let Some(layer) = layers.next() else {
                return false;
            };
            if layer.proto() != state.proto {
                return false;
            }
            let Some(ct) = protocols.contributor(state.proto) else {
                return false;
            };
            if ct.flags().contributes(dir)
                && !ct.doublecheck(packet.data(), layer.start(), state.state.as_ref(), dir)
            {
                return false;
            }
        }
        layers.next().is_none()
    }

    /// 패킷의 흐름으로 새 엔트리를 만듭니다.
    ///
    /// 기여 레이어마다 식별 상태를 저장하고 해당 프로토콜의 참조 카운트를 올립니다.
    /// 만료 타이머는 기본 유휴 시간으로 등록됩니다.
    pub fn create(
        &mut self,
        packet: &Packet<'_>,
        timers: &mut TimerWheel<TimerOwner>,
        now: Duration,
    ) -> Option<EntryId> {
        let hash = Self::flow_hash(packet, CtFlags::NONE)?;
        let hash_rev = Self::flow_hash(packet, CtFlags::REV)?;
        let protocols = packet.protocols();

        let match_states: Vec<MatchState> = packet
            .layers()
            .filter_map(|layer| {
                let ct = protocols.contributor(layer.proto())?;
                protocols.acquire(layer.proto());
                Some(MatchState {
                    proto: layer.proto(),
                    state: ct.alloc_state(packet.data(), layer.start()),
                })
            })
            .collect();

        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(EntrySlot {
                    generation: 0,
                    entry: None,
                });
                u32::try_from(self.slots.len() - 1).ok()?
            }
        };
        let generation = self.slots[index as usize].generation;
        let id = EntryId { index, generation };

        let timer = timers.alloc(TimerOwner::Conntrack(id));
        let fwd_bucket = self.bucket(hash);
        let rev_bucket = self.bucket(hash_rev);
        let len = packet.frame().len() as u64;

        self.slots[index as usize].entry = Some(ConntrackEntry {
            id,
            hash,
            fwd_bucket,
            rev_bucket,
            direction: FlowDirection::Forward,
            parent: None,
            match_states,
            helper_states: Vec::new(),
            target_states: Vec::new(),
            timer,
            timeout_secs: self.default_timeout_secs,
            created: now,
            last_seen: now,
            packets: [1, 0],
            bytes: [len, 0],
        });
        self.fwd[fwd_bucket].push(id);
        self.rev[rev_bucket].push(id);
        self.live += 1;

        self.requeue_timer(id, packet, FlowDirection::Forward, timers, now);
        metrics::counter!(m::CONNTRACK_CREATED_TOTAL).increment(1);
        metrics::gauge!(m::CONNTRACK_ENTRIES).set(self.live as f64);
        tracing::trace!(entry = ?id, hash, "conntrack entry created");
        Some(id)
    }

    /// 조회에 성공한 패킷을 반영합니다 (카운터, 만료 타이머).
    pub fn touch(
        &mut self,
        id: EntryId,
        packet: &Packet<'_>,
        dir: FlowDirection,
        timers: &mut TimerWheel<TimerOwner>,
        now: Duration,
    ) {
        let Some(entry) = self.get_mut(id) else {
            return;
        };
        entry.packets[dir.slot()] += 1;
        entry.bytes[dir.slot()] += packet.frame().len() as u64;
        entry.last_seen = now;
        self.requeue_timer(id, packet, dir, timers, now);
    }

    /// 가장 안쪽 기여 프로토콜이 정한 유휴 시간으로 타이머를 다시 등록합니다.
    ///
    /// 매치 상태는 기여 레이어와 순서대로 짝지어집니다. 같은 프로토콜이 여러 번
    /// 나오는 터널 스택에서도 상태마다 자기 레이어를 봅니다.
    fn requeue_timer(
        &mut self,
        id: EntryId,
        packet: &Packet<'_>,
        dir: FlowDirection,
        timers: &mut TimerWheel<TimerOwner>,
        now: Duration,
    ) {
        let default = self.default_timeout_secs;
        let protocols = packet.protocols();
        let Some(entry) = self.get_mut(id) else {
            return;
        };

        let starts: Vec<(ProtoId, usize)> = packet
            .layers()
            .filter(|l| protocols.contributor(l.proto()).is_some())
            .map(|l| (l.proto(), l.start()))
            .collect();
        let mut timeout = None;
        for (state, (proto, start)) in entry.match_states.iter_mut().zip(starts).rev() {
            if proto != state.proto {
                continue;
            }
            let Some(ct) = protocols.contributor(state.proto) else {
                continue;
            };
            if let Some(secs) = ct.refresh(packet.data(), start, state.state.as_mut(), dir) {
                timeout = Some(secs);
                break;
            }
        }

        entry.timeout_secs = timeout.unwrap_or(default);
        if let Err(e) = timers.requeue(entry.timer, entry.timeout_secs, now) {
            tracing::warn!(entry = ?id, error = %e, "failed to queue conntrack timer");
        }
    }

    /// 기대 연결로 생성된 엔트리의 부모를 설정합니다.
    pub fn set_parent(&mut self, id: EntryId, parent: Option<EntryId>) {
        if let Some(entry) = self.get_mut(id) {
            entry.parent = parent;
        }
    }

    // ─── 헬퍼 상태 ───────────────────────────────────────────────

    /// 헬퍼 상태를 붙입니다. 같은 프로토콜 상태가 있으면 교체합니다.
    pub fn add_helper_state(&mut self, id: EntryId, proto: ProtoId, state: Box<dyn ConnectionState>) -> bool {
        let Some(entry) = self.get_mut(id) else {
            return false;
        };
        entry.helper_states.retain(|h| h.proto != proto);
        entry.helper_states.push(HelperState { proto, state });
        true
    }

    /// 헬퍼 상태를 구체 타입으로 빌려옵니다.
    pub fn helper_state_mut<T: ConnectionState + Any>(&mut self, id: EntryId, proto: ProtoId) -> Option<&mut T> {
        self.get_mut(id)?
            .helper_states
            .iter_mut()
            .find(|h| h.proto == proto)?
            .state
            .as_mut()
            .as_any_mut()
            .downcast_mut::<T>()
    }

    pub fn has_helper_state(&self, id: EntryId, proto: ProtoId) -> bool {
        self.get(id)
            .is_some_and(|e| e.helper_states.iter().any(|h| h.proto == proto))
    }

    /// 헬퍼 상태를 떼어냅니다. 엔트리에 아무 상태도 남지 않으면 엔트리를 파기합니다.
    ///
    /// 상태가 없으면 아무 일도 하지 않습니다.
    pub fn remove_helper_state(
        &mut self,
        id: EntryId,
        proto: ProtoId,
        protocols: &ProtocolTable<'_>,
        timers: &mut TimerWheel<TimerOwner>,
    ) -> Option<Box<dyn ConnectionState>> {
        let entry = self.get_mut(id)?;
        let pos = entry.helper_states.iter().position(|h| h.proto == proto)?;
        let removed = entry.helper_states.remove(pos).state;
        self.collect_if_unreferenced(id, protocols, timers);
        Some(removed)
    }

    /// 등록 해제된 헬퍼의 상태를 모든 엔트리에서 떼어냅니다. 떼어낸 상태 수를 반환합니다.
    pub fn remove_helper_proto(
        &mut self,
        proto: ProtoId,
        protocols: &ProtocolTable<'_>,
        timers: &mut TimerWheel<TimerOwner>,
    ) -> usize {
        let ids: Vec<EntryId> = self
            .slots
            .iter()
            .filter_map(|s| s.entry.as_ref())
            .filter(|e| e.helper_states.iter().any(|h| h.proto == proto))
            .map(|e| e.id)
            .collect();
        let mut removed = 0;
        for id in ids {
            if let Some(state) = self.remove_helper_state(id, proto, protocols, timers) {
                state.cleanup(Some(id));
                removed += 1;
            }
        }
        removed
    }

    // ─── 타겟 상태 ───────────────────────────────────────────────

    /// 타겟 상태를 붙입니다. 같은 타겟의 상태가 있으면 교체합니다.
    pub fn add_target_state(&mut self, id: EntryId, owner: TargetId, state: Box<dyn ConnectionState>) -> bool {
        let Some(entry) = self.get_mut(id) else {
            return false;
        };
        entry.target_states.retain(|t| t.owner != owner);
        entry.target_states.push(TargetState { owner, state });
        true
    }

    /// 타겟 상태를 구체 타입으로 빌려옵니다.
    pub fn target_state_mut<T: ConnectionState + Any>(&mut self, id: EntryId, owner: TargetId) -> Option<&mut T> {
        self.get_mut(id)?
            .target_states
            .iter_mut()
            .find(|t| t.owner == owner)?
            .state
            .as_mut()
            .as_any_mut()
            .downcast_mut::<T>()
    }

    /// 엔트리에 이 타겟의 상태가 있는지
    pub fn has_target_state(&self, id: EntryId, owner: TargetId) -> bool {
        self.get(id)
            .is_some_and(|e| e.target_states.iter().any(|t| t.owner == owner))
    }

    /// 엔트리에 상태를 붙인 타겟 목록
    pub fn target_owners(&self, id: EntryId) -> Vec<TargetId> {
        self.get(id)
            .map(|e| e.target_states.iter().map(|t| t.owner).collect())
            .unwrap_or_default()
    }

    /// 타겟 상태를 떼어냅니다. 엔트리에 아무 상태도 남지 않으면 엔트리를 파기합니다.
    pub fn remove_target_state(
        &mut self,
        id: EntryId,
        owner: TargetId,
        protocols: &ProtocolTable<'_>,
        timers: &mut TimerWheel<TimerOwner>,
    ) -> Option<Box<dyn ConnectionState>> {
        let entry = self.get_mut(id)?;
        let pos = entry.target_states.iter().position(|t| t.owner == owner)?;
        let removed = entry.target_states.remove(pos).state;
        self.collect_if_unreferenced(id, protocols, timers);
        Some(removed)
    }

    /// 닫힌 타겟의 상태를 모든 엔트리에서 떼어냅니다. 떼어낸 상태 수를 반환합니다.
    pub fn remove_owner(
        &mut self,
        owner: TargetId,
        protocols: &ProtocolTable<'_>,
        timers: &mut TimerWheel<TimerOwner>,
    ) -> usize {
        let ids: Vec<EntryId> = self
            .slots
            .iter()
            .filter_map(|s| s.entry.as_ref())
            .filter(|e| e.target_states.iter().any(|t| t.owner == owner))
            .map(|e| e.id)
            .collect();
        let mut removed = 0;
        for id in ids {
            if let Some(state) = self.remove_target_state(id, owner, protocols, timers) {
                state.cleanup(Some(id));
                removed += 1;
            }
        }
        removed
    }

    fn collect_if_unreferenced(
        &mut self,
        id: EntryId,
        protocols: &ProtocolTable<'_>,
        timers: &mut TimerWheel<TimerOwner>,
    ) {
        if self.get(id).is_some_and(ConntrackEntry::is_unreferenced) {
            self.destroy(id, protocols, timers);
        }
    }

    // ─── 닫기/파기 ───────────────────────────────────────────────

    /// 헬퍼 상태에 버퍼된 데이터가 있는지 확인합니다.
    ///
    /// 모든 헬퍼가 비어 있으면 `true` (닫을 수 있음).
    pub fn close(&mut self, id: EntryId) -> bool {
        let Some(entry) = self.get_mut(id) else {
            return true;
        };
        let mut pending = false;
        for helper in &mut entry.helper_states {
            pending |= helper.state.flush();
        }
        !pending
    }

    /// 엔트리를 파기합니다.
    ///
    /// 매치 상태 해제(참조 카운트 감소), 헬퍼 상태와 타겟 상태 정리,
    /// 두 버킷에서 제거, 타이머 해제 순서로 진행합니다.
    pub fn destroy(&mut self, id: EntryId, protocols: &ProtocolTable<'_>, timers: &mut TimerWheel<TimerOwner>) -> bool {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return false;
        };
        if slot.generation != id.generation {
            return false;
        }
        let Some(entry) = slot.entry.take() else {
            return false;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;

        for state in entry.match_states {
            protocols.release(state.proto);
        }
        for helper in entry.helper_states {
            helper.state.cleanup(Some(id));
        }
        for target in entry.target_states {
            target.state.cleanup(Some(id));
        }

        unlink(&mut self.fwd[entry.fwd_bucket], id);
        unlink(&mut self.rev[entry.rev_bucket], id);
        timers.free(entry.timer);

        metrics::counter!(m::CONNTRACK_DESTROYED_TOTAL).increment(1);
        metrics::gauge!(m::CONNTRACK_ENTRIES).set(self.live as f64);
        tracing::trace!(entry = ?id, "conntrack entry destroyed");
        true
    }

    /// 유휴 타이머 만료 처리
    ///
    /// 닫을 수 있으면 파기하고, 헬퍼가 아직 데이터를 들고 있으면 같은 시간으로 다시 기다립니다.
    pub fn on_timeout(
        &mut self,
        id: EntryId,
        protocols: &ProtocolTable<'_>,
        timers: &mut TimerWheel<TimerOwner>,
        now: Duration,
    ) {
        if self.close(id) {
            self.destroy(id, protocols, timers);
            return;
        }
        if let Some(entry) = self.get(id) {
            tracing::debug!(entry = ?id, "conntrack close deferred, helper data pending");
            if let Err(e) = timers.requeue(entry.timer, entry.timeout_secs, now) {
                tracing::warn!(entry = ?id, error = %e, "failed to requeue conntrack timer");
            }
        }
    }

    /// 모든 엔트리를 파기합니다 (종료 시).
    pub fn clear(&mut self, protocols: &ProtocolTable<'_>, timers: &mut TimerWheel<TimerOwner>) {
        let ids: Vec<EntryId> = self.slots.iter().filter_map(|s| s.entry.as_ref().map(|e| e.id)).collect();
        for id in ids {
            self.destroy(id, protocols, timers);
        }
    }

    /// 엔트리 요약 목록
    pub fn summaries(&self, protocols: &ProtocolTable<'_>) -> Vec<FlowSummary> {
        self.slots
            .iter()
            .filter_map(|s| s.entry.as_ref())
            .map(|e| FlowSummary {
                id: e.id,
                protocols: e.protocols().map(|p| protocols.name(p)).collect(),
                direction: e.direction,
                parent: e.parent,
                packets: e.packets,
                bytes: e.bytes,
                timeout_secs: e.timeout_secs,
            })
            .collect()
    }

    /// 버킷 체인 길이 합계 (정방향, 역방향). 각각 엔트리 수와 같아야 합니다.
    pub fn bucket_occupancy(&self) -> (usize, usize) {
        (
            self.fwd.iter().map(Vec::len).sum(),
            self.rev.iter().map(Vec::len).sum(),
        )
    }
}

fn unlink(chain: &mut Vec<EntryId>, id: EntryId) {
    if let Some(pos) = chain.iter().position(|e| *e == id) {
        chain.remove(pos);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::conntrack::FlowContributor;
    use crate::error::IdentifyError;
    use crate::frame::Frame;
    use crate::layer::{Layer, LayerPool};
    use crate::registry::{Next, Protocol, ProtocolRegistry};
    use crate::target::{NullTarget, TargetSlot};

    /// 2바이트 캡슐화 헤더: `[안쪽도 tun이면 1, 유휴 시간(초)]`
    struct Tun;

    impl Protocol for Tun {
        fn name(&self) -> &'static str {
            "tun"
        }

        fn dependencies(&self) -> &'static [&'static str] {
            &["tun"]
        }

        fn identify(&self, data: &[u8], layer: &mut Layer, start: usize, len: usize) -> Result<Next, IdentifyError> {
            if len < 2 {
                return Err(IdentifyError::Invalid {
                    proto: "tun",
                    reason: "short header".to_owned(),
                });
            }
            layer.set_payload(start + 2, len - 2);
            Ok(if data[start] == 1 { Next::Proto(0) } else { Next::Undefined })
        }

        fn conntrack(&self) -> Option<&dyn FlowContributor> {
            Some(self)
        }
    }

    impl FlowContributor for Tun {
        fn flags(&self) -> CtFlags {
            CtFlags::NONE
        }

        fn hash(&self, data: &[u8], start: usize, _dir: CtFlags) -> u32 {
            u32::from(data[start + 1])
        }

        fn doublecheck(&self, data: &[u8], start: usize, state: &(dyn Any + Send), _dir: CtFlags) -> bool {
            state.downcast_ref::<u8>() == Some(&data[start + 1])
        }

        fn alloc_state(&self, data: &[u8], start: usize) -> Box<dyn Any + Send> {
            Box::new(data[start + 1])
        }

        fn refresh(&self, data: &[u8], start: usize, _state: &mut (dyn Any + Send), _dir: FlowDirection) -> Option<u64> {
            Some(u64::from(data[start + 1]))
        }
    }

    /// `pending`이 켜져 있는 동안 버퍼 데이터가 남아 있다고 답하는 헬퍼 상태
    struct Buffered {
        pending: Arc<AtomicBool>,
    }

    impl ConnectionState for Buffered {
        fn flush(&mut self) -> bool {
            self.pending.load(Ordering::SeqCst)
        }
    }

    struct Marker;

    impl ConnectionState for Marker {}

    struct Fixture {
        registry: ProtocolRegistry,
        tun: ProtoId,
        pool: LayerPool,
        timers: TimerWheel<TimerOwner>,
        table: ConntrackTable,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = ProtocolRegistry::new();
            let tun = registry.register(Box::new(Tun)).unwrap();
            Self {
                registry,
                tun,
                pool: LayerPool::new(8),
                timers: TimerWheel::new(),
                table: ConntrackTable::new(16, 600),
            }
        }

        /// tun 체인을 식별하고 연결을 만듭니다.
        fn create(&mut self, frame: &Frame) -> EntryId {
            let protocols = self.registry.read();
            self.pool.reset();
            let (mut prev, mut proto) = (None, frame.first_proto());
            let (mut start, mut len) = (0, frame.len());
            while !proto.is_undefined() {
                let id = self.pool.alloc(proto, prev).unwrap();
                let next = Tun.identify(frame.data(), self.pool.get_mut(id), start, len).unwrap();
                self.pool.mark_identified(id, start);
                start = self.pool.get(id).payload_start();
                len = self.pool.get(id).payload_size();
                proto = protocols.resolve_next(proto, next);
                prev = Some(id);
            }
            let packet = Packet::new(frame, &self.pool, self.pool.head(), &protocols);
            self.table.create(&packet, &mut self.timers, frame.timestamp()).unwrap()
        }
    }

    #[test]
    fn nested_layers_of_one_protocol_refresh_from_their_own_header() {
        let mut fx = Fixture::new();
        // 바깥 tun은 30초, 안쪽 tun은 90초
        let frame = Frame::new(vec![1, 30, 0, 90], Duration::ZERO, fx.tun);
        let id = fx.create(&frame);

        let entry = fx.table.get(id).unwrap();
        assert_eq!(entry.match_states.len(), 2);
        assert_eq!(entry.timeout_secs, 90);
        assert_eq!(fx.timers.expires(entry.timer), Some(Duration::from_secs(90)));
        assert_eq!(fx.registry.read().refcount(fx.tun), 2);
    }

    #[test]
    fn helper_state_keeps_entry_after_last_target_state_is_removed() {
        let mut fx = Fixture::new();
        let frame = Frame::new(vec![0, 30], Duration::ZERO, fx.tun);
        let id = fx.create(&frame);
        let owner = TargetSlot::new(Box::new(NullTarget::default())).id();

        assert!(fx.table.add_helper_state(id, fx.tun, Box::new(Marker)));
        assert!(fx.table.add_target_state(id, owner, Box::new(Marker)));

        let protocols = fx.registry.read();
        assert!(fx.table.remove_target_state(id, owner, &protocols, &mut fx.timers).is_some());
        assert_eq!(fx.table.len(), 1);
        assert!(fx.table.has_helper_state(id, fx.tun));
        assert!(fx.table.helper_state_mut::<Marker>(id, fx.tun).is_some());

        assert!(fx.table.remove_helper_state(id, fx.tun, &protocols, &mut fx.timers).is_some());
        assert!(fx.table.is_empty());
        assert!(fx.table.get(id).is_none());
        assert_eq!(protocols.refcount(fx.tun), 0);
        assert!(fx.timers.is_empty());
    }

    #[test]
    fn timeout_waits_while_helper_holds_buffered_data() {
        let mut fx = Fixture::new();
        let frame = Frame::new(vec![0, 30], Duration::ZERO, fx.tun);
        let id = fx.create(&frame);
        let pending = Arc::new(AtomicBool::new(true));
        fx.table.add_helper_state(
            id,
            fx.tun,
            Box::new(Buffered {
                pending: Arc::clone(&pending),
            }),
        );
        let protocols = fx.registry.read();

        let now = Duration::from_secs(31);
        assert_eq!(fx.timers.process(now), vec![TimerOwner::Conntrack(id)]);
        assert!(!fx.table.close(id));
        fx.table.on_timeout(id, &protocols, &mut fx.timers, now);

        // 같은 유휴 시간으로 다시 대기
        let timer = fx.table.get(id).unwrap().timer;
        assert_eq!(fx.table.len(), 1);
        assert!(fx.timers.is_queued(timer));
        assert_eq!(fx.timers.expires(timer), Some(Duration::from_secs(61)));

        pending.store(false, Ordering::SeqCst);
        let now = Duration::from_secs(62);
        assert_eq!(fx.timers.process(now), vec![TimerOwner::Conntrack(id)]);
        fx.table.on_timeout(id, &protocols, &mut fx.timers, now);
        assert!(fx.table.is_empty());
        assert_eq!(protocols.refcount(fx.tun), 0);
    }
}
