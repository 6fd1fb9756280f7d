//! 헬퍼 -- 여러 패킷에 걸친 상태가 필요한 프로토콜 처리 (예: IPv4 조각 재조립)
//!
//! 레이어 식별 루프는 레이어 하나를 식별할 때마다 해당 프로토콜의 헬퍼에게
//! [`Helper::need_help`]를 묻습니다. `NeedsHelp`이면 패킷은 헬퍼가 흡수한 것이며
//! 규칙 평가와 타겟에 도달하지 않습니다. 헬퍼가 완성한 프레임은 재주입 큐에 들어가
//! 원래 프레임 처리가 끝난 뒤 같은 경로로 처리됩니다.
//!
//! 헬퍼 타이머는 [`TimerOwner::Helper`]로 등록되며 `token`은 헬퍼가 정합니다.
//!
//! 규칙 평가가 끝난 패킷은 연결 조회 뒤에 [`Helper::on_flow`]로 다시 헬퍼를 거칩니다.
//! 헬퍼는 [`FlowContext`]로 연결에 헬퍼 상태를 붙이거나 뗍니다. 헬퍼 상태가
//! 버퍼 데이터를 들고 있으면 연결 닫기가 미뤄집니다.

pub mod ipv4;

use std::collections::VecDeque;
use std::time::Duration;

use flowmatic_core::Value;

use crate::conntrack::{ConnectionState, ConntrackTable, EntryId, FlowDirection};
use crate::error::{EngineError, HelperError, RegistryError};
use crate::frame::Frame;
use crate::layer::{Layer, LayerId, LayerPool, Packet};
use crate::param::{ParamSpec, ParamTable};
use crate::registry::{ProtoId, ProtocolTable};
use crate::timer::{TimerError, TimerId, TimerOwner, TimerWheel};

pub use ipv4::Ipv4Reassembly;

/// 헬퍼 판정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelpVerdict {
    /// 평소처럼 계속 처리
    NoHelp,
    /// 헬퍼가 패킷을 흡수함
    NeedsHelp,
}

/// 바깥 레이어 위치 (재조립 후 길이 보정용)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OuterLayer {
    pub proto: ProtoId,
    pub start: usize,
    pub payload_start: usize,
}

/// `need_help` 입력
pub struct HelpRequest<'a> {
    frame: &'a Frame,
    start: usize,
    len: usize,
    pool: &'a LayerPool,
    layer: LayerId,
}

impl<'a> HelpRequest<'a> {
    pub(crate) fn new(frame: &'a Frame, start: usize, len: usize, pool: &'a LayerPool, layer: LayerId) -> Self {
        Self {
            frame,
            start,
            len,
            pool,
            layer,
        }
    }

    pub fn frame(&self) -> &'a Frame {
        self.frame
    }

    /// 헤더 시작 오프셋
    pub fn start(&self) -> usize {
        self.start
    }

    /// 부모 레이어가 허용하는 최대 길이
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 방금 식별된 레이어
    pub fn layer(&self) -> &'a Layer {
        self.pool.get(self.layer)
    }

    /// 이 레이어를 감싸는 바깥 레이어들 (안쪽부터)
    pub fn outer_layers(&self) -> Vec<OuterLayer> {
        let mut out = Vec::new();
        let mut cur = self.layer().prev();
        while let Some(id) = cur {
            let layer = self.pool.get(id);
            out.push(OuterLayer {
                proto: layer.proto(),
                start: layer.start(),
                payload_start: layer.payload_start(),
            });
            cur = layer.prev();
        }
        out
    }
}

/// 헬퍼 호출 동안 엔진이 빌려주는 자원
pub struct HelperContext<'a> {
    proto: ProtoId,
    now: Duration,
    timers: &'a mut TimerWheel<TimerOwner>,
    reinject: &'a mut VecDeque<Frame>,
    params: &'a ParamTable,
    others: &'a [HelperSlot],
}

impl HelperContext<'_> {
    /// 현재 시각 (입력 기준)
    pub fn now(&self) -> Duration {
        self.now
    }

    /// 이 헬퍼가 붙은 프로토콜
    pub fn proto(&self) -> ProtoId {
        self.proto
    }

    pub fn param(&self, name: &str) -> Option<Value> {
        self.params.get(name)
    }

    /// `token`으로 돌아오는 타이머를 만듭니다.
    pub fn alloc_timer(&mut self, token: u64) -> TimerId {
        self.timers.alloc(TimerOwner::Helper {
            proto: self.proto,
            token,
        })
    }

    pub fn requeue_timer(&mut self, id: TimerId, secs: u64) -> Result<(), TimerError> {
        self.timers.requeue(id, secs, self.now)
    }

    pub fn free_timer(&mut self, id: TimerId) {
        self.timers.free(id);
    }

    /// 완성한 프레임을 재주입 큐에 넣습니다.
    pub fn reinject(&mut self, frame: Frame) {
        self.reinject.push_back(frame);
    }

    /// 다른 프로토콜 헬퍼의 길이 보정 훅을 호출합니다. 헬퍼가 없으면 무시합니다.
    pub fn resize(&self, proto: ProtoId, buf: &mut [u8], start: usize, payload_size: usize) {
        if let Some(helper) = self
            .others
            .iter()
            .find(|s| s.proto == proto)
            .and_then(|s| s.helper.as_ref())
        {
            helper.resize(buf, start, payload_size);
        }
    }
}

/// `on_flow` 동안 헬퍼가 빌려 쓰는 연결 추적 자원
pub struct FlowContext<'a, 'p> {
    proto: ProtoId,
    conntrack: &'a mut ConntrackTable,
    timers: &'a mut TimerWheel<TimerOwner>,
    protocols: &'a ProtocolTable<'p>,
    entry: Option<(EntryId, FlowDirection)>,
    now: Duration,
}

impl<'a, 'p> FlowContext<'a, 'p> {
    pub(crate) fn new(
        conntrack: &'a mut ConntrackTable,
        timers: &'a mut TimerWheel<TimerOwner>,
        protocols: &'a ProtocolTable<'p>,
        entry: Option<(EntryId, FlowDirection)>,
        now: Duration,
    ) -> Self {
        Self {
            proto: ProtoId::UNDEFINED,
            conntrack,
            timers,
            protocols,
            entry,
            now,
        }
    }

    /// 호출 중인 헬퍼의 프로토콜. 헬퍼 상태의 키입니다.
    pub fn proto(&self) -> ProtoId {
        self.proto
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    /// 프레임이 속한 연결 (없거나 파기되었으면 `None`)
    pub fn entry(&self) -> Option<EntryId> {
        self.entry.map(|(id, _)| id)
    }

    pub fn direction(&self) -> Option<FlowDirection> {
        self.entry.map(|(_, dir)| dir)
    }

    pub fn conntrack(&self) -> &ConntrackTable {
        self.conntrack
    }

    /// 프레임의 연결을 반환합니다. 없으면 새로 만듭니다.
    pub fn ensure_entry(&mut self, packet: &Packet<'_>) -> Option<EntryId> {
        if let Some(id) = self.entry() {
            if self.conntrack.get(id).is_some() {
                return Some(id);
            }
        }
        let id = self.conntrack.create(packet, self.timers, self.now)?;
        self.entry = Some((id, FlowDirection::Forward));
        Some(id)
    }

    pub fn has_state(&self) -> bool {
        self.entry()
            .is_some_and(|id| self.conntrack.has_helper_state(id, self.proto))
    }

    /// 이 헬퍼가 연결에 붙인 상태
    pub fn state_mut<T: ConnectionState + std::any::Any>(&mut self) -> Option<&mut T> {
        let entry = self.entry()?;
        self.conntrack.helper_state_mut::<T>(entry, self.proto)
    }

    /// 연결에 헬퍼 상태를 붙입니다. 연결이 없으면 `false`.
    pub fn add_state(&mut self, state: Box<dyn ConnectionState>) -> bool {
        match self.entry() {
            Some(entry) => self.conntrack.add_helper_state(entry, self.proto, state),
            None => false,
        }
    }

    /// 헬퍼 상태를 떼어냅니다. 연결에 남은 상태가 없으면 연결이 파기됩니다.
    pub fn remove_state(&mut self) -> Option<Box<dyn ConnectionState>> {
        let entry = self.entry()?;
        let state = self
            .conntrack
            .remove_helper_state(entry, self.proto, self.protocols, self.timers);
        if self.conntrack.get(entry).is_none() {
            self.entry = None;
        }
        state
    }

    /// 헬퍼 호출이 끝난 뒤의 연결
    pub(crate) fn into_entry(self) -> Option<(EntryId, FlowDirection)> {
        self.entry
    }
}

/// 헬퍼 구현
pub trait Helper: Send {
    /// 헬퍼가 붙는 프로토콜 이름
    fn protocol(&self) -> &'static str;

    /// 등록 시 함께 등록할 파라미터
    fn params(&self) -> &'static [ParamSpec] {
        &[]
    }

    /// 방금 식별된 레이어의 패킷을 헬퍼가 가져가야 하는지 판단합니다.
    fn need_help(
        &mut self,
        cx: &mut HelperContext<'_>,
        req: &HelpRequest<'_>,
    ) -> Result<HelpVerdict, HelperError>;

    /// 재조립 등으로 안쪽 페이로드 길이가 바뀌었을 때 헤더의 길이 필드를 고칩니다.
    fn resize(&self, _buf: &mut [u8], _start: usize, _payload_size: usize) {}

    /// 헬퍼의 프로토콜 레이어가 있는 패킷이 연결 조회를 마친 뒤 호출됩니다.
    fn on_flow(&mut self, _flow: &mut FlowContext<'_, '_>, _packet: &Packet<'_>) {}

    /// 이 헬퍼가 등록한 타이머의 만료
    fn on_timer(&mut self, _token: u64, _cx: &mut HelperContext<'_>) {}

    /// 버퍼된 상태를 모두 버립니다 (종료 시).
    fn cleanup(&mut self, _cx: &mut HelperContext<'_>) {}

    /// 버퍼 중인 작업 수
    fn pending(&self) -> usize {
        0
    }
}

pub(crate) struct HelperSlot {
    proto: ProtoId,
    name: &'static str,
    params: &'static [ParamSpec],
    helper: Option<Box<dyn Helper>>,
}

/// 헬퍼 호출에 필요한 엔진 자원 묶음
pub(crate) struct HelperEnv<'a> {
    pub now: Duration,
    pub timers: &'a mut TimerWheel<TimerOwner>,
    pub reinject: &'a mut VecDeque<Frame>,
    pub params: &'a ParamTable,
}

/// 등록된 헬퍼 목록 (프로토콜당 하나)
#[derive(Default)]
pub struct HelperSet {
    slots: Vec<HelperSlot>,
}

impl HelperSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 헬퍼를 등록하고 파라미터를 함께 등록합니다.
    ///
    /// 프로토콜의 참조 카운트를 올려 헬퍼가 있는 동안 해제되지 않게 합니다.
    pub fn register(
        &mut self,
        helper: Box<dyn Helper>,
        protocols: &ProtocolTable<'_>,
        params: &ParamTable,
    ) -> Result<ProtoId, EngineError> {
        let name = helper.protocol();
        let proto = protocols.lookup(name).ok_or_else(|| EngineError::NotFound {
            kind: "protocol",
            name: name.to_owned(),
        })?;
        if self.slots.iter().any(|s| s.proto == proto) {
            return Err(RegistryError::AlreadyRegistered {
                kind: "helper",
                name: name.to_owned(),
            }
            .into());
        }

        let specs = helper.params();
        for (i, spec) in specs.iter().enumerate() {
            if let Err(e) = params.register(spec) {
                for done in &specs[..i] {
                    params.unregister(done.name);
                }
                return Err(e);
            }
        }

        protocols.acquire(proto);
        self.slots.push(HelperSlot {
            proto,
            name,
            params: specs,
            helper: Some(helper),
        });
        tracing::debug!(helper = name, "helper registered");
        Ok(proto)
    }

    /// 헬퍼 등록을 해제합니다. 버퍼된 상태는 버려집니다.
    pub(crate) fn unregister(
        &mut self,
        name: &str,
        protocols: &ProtocolTable<'_>,
        env: HelperEnv<'_>,
    ) -> Result<(), EngineError> {
        let pos = self
            .slots
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| RegistryError::NotRegistered {
                kind: "helper",
                name: name.to_owned(),
            })?;
        let proto = self.slots[pos].proto;
        let params = env.params;
        self.call(proto, env, |h, cx| h.cleanup(cx));

        let slot = self.slots.remove(pos);
        for spec in slot.params {
            params.unregister(spec.name);
        }
        protocols.release(proto);
        tracing::debug!(helper = name, "helper unregistered");
        Ok(())
    }

    pub fn is_registered(&self, proto: ProtoId) -> bool {
        self.slots.iter().any(|s| s.proto == proto)
    }

    /// 등록된 헬퍼 이름
    pub fn names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|s| s.name).collect()
    }

    /// 모든 헬퍼의 버퍼 중인 작업 수 합계
    pub fn pending(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|s| s.helper.as_ref())
            .map(|h| h.pending())
            .sum()
    }

    /// 헬퍼를 슬롯에서 잠시 꺼내 호출합니다.
    ///
    /// 호출 중에도 다른 헬퍼의 `resize`는 사용할 수 있습니다.
    fn call<R>(
        &mut self,
        proto: ProtoId,
        env: HelperEnv<'_>,
        f: impl FnOnce(&mut dyn Helper, &mut HelperContext<'_>) -> R,
    ) -> Option<R> {
        let idx = self.slots.iter().position(|s| s.proto == proto)?;
        let mut helper = self.slots[idx].helper.take()?;
        let result = {
            let mut cx = HelperContext {
                proto,
                now: env.now,
                timers: env.timers,
                reinject: env.reinject,
                params: env.params,
                others: &self.slots,
            };
            f(helper.as_mut(), &mut cx)
        };
        self.slots[idx].helper = Some(helper);
        Some(result)
    }

    /// 프로토콜에 헬퍼가 있으면 판정을 묻습니다. 없으면 `NoHelp`.
    pub(crate) fn need_help(
        &mut self,
        proto: ProtoId,
        req: &HelpRequest<'_>,
        env: HelperEnv<'_>,
    ) -> Result<HelpVerdict, HelperError> {
        self.call(proto, env, |h, cx| h.need_help(cx, req))
            .unwrap_or(Ok(HelpVerdict::NoHelp))
    }

    /// 패킷에 레이어가 있는 프로토콜의 헬퍼마다 `on_flow`를 호출합니다.
    pub(crate) fn on_flow(&mut self, flow: &mut FlowContext<'_, '_>, packet: &Packet<'_>) {
        for slot in &mut self.slots {
            let Some(helper) = slot.helper.as_mut() else {
                continue;
            };
            if packet.find(slot.proto).is_some() {
                flow.proto = slot.proto;
                helper.on_flow(flow, packet);
            }
        }
    }

    pub(crate) fn on_timer(&mut self, proto: ProtoId, token: u64, env: HelperEnv<'_>) {
        if self.call(proto, env, |h, cx| h.on_timer(token, cx)).is_none() {
            tracing::debug!(proto = proto.raw(), token, "timer for unregistered helper ignored");
        }
    }

    /// 모든 헬퍼의 버퍼를 버립니다.
    pub(crate) fn cleanup(&mut self, env: HelperEnv<'_>) {
        let HelperEnv {
            now,
            timers,
            reinject,
            params,
        } = env;
        let protos: Vec<ProtoId> = self.slots.iter().map(|s| s.proto).collect();
        for proto in protos {
            let env = HelperEnv {
                now,
                timers: &mut *timers,
                reinject: &mut *reinject,
                params,
            };
            self.call(proto, env, |h, cx| h.cleanup(cx));
        }
    }
}
