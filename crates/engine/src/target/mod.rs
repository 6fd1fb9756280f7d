//! 타겟 -- 매칭된 프레임을 소비하는 출력/동작 모듈
//!
//! 규칙마다 타겟 목록을 가지며, 규칙이 매칭되면 각 타겟의 [`Target::process`]가
//! 호출됩니다. 타겟은 [`TargetContext`]를 통해 연결 추적 엔트리에 자기 상태를
//! 붙이거나 기대 연결을 등록할 수 있습니다.
//!
//! # 상태 전이
//! - `Created` → `open()` → `Open`
//! - `process()` 또는 `sighup()` 실패 → `Failed` (닫힘, 이후 호출은 무시)
//! - 규칙 제거/종료 → `close()` → `Closed`
//!
//! 타겟이 닫히면 엔진은 그 타겟이 연결에 붙인 상태와 기대 연결을 모두 정리합니다.

pub mod expect;
pub mod log;
pub mod null;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use flowmatic_core::metrics as m;
use serde::{Deserialize, Serialize};

use crate::conntrack::{ConnectionState, ConntrackTable, CtFlags, EntryId, FlowDirection};
use crate::error::{EngineError, RegistryError, TargetError};
use crate::expectation::{ExpectationId, ExpectationTable};
use crate::layer::Packet;
use crate::registry::ProtocolTable;
use crate::timer::{TimerOwner, TimerWheel};

pub use expect::ExpectReverseTarget;
pub use log::LogTarget;
pub use null::NullTarget;

/// 타겟 인스턴스 ID (프로세스 안에서 유일)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TargetId(u64);

impl TargetId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 타겟 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    /// 생성됨 (open 전)
    Created,
    /// 프레임 처리 중
    Open,
    /// 정상 종료
    Closed,
    /// 처리 실패로 닫힘
    Failed,
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// 규칙 파일의 타겟 선언
///
/// ```yaml
/// targets:
///   - type: log
///     params:
///       conntrack: true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    /// 타겟 종류 (null, log, expect-reverse)
    #[serde(rename = "type")]
    pub kind: String,
    /// 타겟별 옵션
    #[serde(default)]
    pub params: TargetParams,
}

impl TargetSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: TargetParams::default(),
        }
    }
}

/// 타겟 옵션 (YAML 값 그대로 보관)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetParams(BTreeMap<String, serde_yaml::Value>);

impl TargetParams {
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<serde_yaml::Value>) {
        self.0.insert(name.into(), value.into());
    }

    fn invalid(&self, kind: &str, name: &str, expected: &str) -> TargetError {
        TargetError::Failed {
            target: kind.to_owned(),
            reason: format!("option '{name}' must be {expected}"),
        }
    }

    /// bool 옵션. 없으면 `default`.
    pub fn bool_or(&self, kind: &str, name: &str, default: bool) -> Result<bool, TargetError> {
        match self.0.get(name) {
            None => Ok(default),
            Some(v) => v.as_bool().ok_or_else(|| self.invalid(kind, name, "a boolean")),
        }
    }

    /// 정수 옵션. 없으면 `default`.
    pub fn u64_or(&self, kind: &str, name: &str, default: u64) -> Result<u64, TargetError> {
        match self.0.get(name) {
            None => Ok(default),
            Some(v) => v
                .as_u64()
                .ok_or_else(|| self.invalid(kind, name, "a non-negative integer")),
        }
    }

    pub fn str(&self, kind: &str, name: &str) -> Result<Option<String>, TargetError> {
        match self.0.get(name) {
            None => Ok(None),
            Some(v) => v
                .as_str()
                .map(|s| Some(s.to_owned()))
                .ok_or_else(|| self.invalid(kind, name, "a string")),
        }
    }

    /// 알 수 없는 옵션 이름이 있으면 실패합니다.
    pub fn deny_unknown(&self, kind: &str, known: &[&str]) -> Result<(), TargetError> {
        match self.0.keys().find(|k| !known.contains(&k.as_str())) {
            Some(k) => Err(TargetError::Failed {
                target: kind.to_owned(),
                reason: format!("unknown option '{k}'"),
            }),
            None => Ok(()),
        }
    }
}

/// 타겟 구현
pub trait Target: Send {
    /// 타겟 종류 이름
    fn kind(&self) -> &'static str;

    /// 프레임을 받기 전에 한 번 호출됩니다.
    fn open(&mut self) -> Result<(), TargetError> {
        Ok(())
    }

    /// 매칭된 프레임 하나를 처리합니다.
    fn process(&mut self, cx: &mut TargetContext<'_, '_>, packet: &Packet<'_>) -> Result<(), TargetError>;

    fn close(&mut self) {}

    /// 재설정 신호 (로그 파일 재오픈 등)
    fn sighup(&mut self) -> Result<(), TargetError> {
        Ok(())
    }
}

/// 규칙에 붙은 타겟 인스턴스
///
/// 규칙 목록의 읽기 잠금 아래에서도 처리할 수 있도록 내부 가변성을 가집니다.
pub struct TargetSlot {
    id: TargetId,
    kind: &'static str,
    target: Mutex<Box<dyn Target>>,
    status: Mutex<TargetStatus>,
    processed: AtomicU64,
    errors: AtomicU64,
}

impl TargetSlot {
    pub fn new(target: Box<dyn Target>) -> Self {
        Self {
            id: TargetId::next(),
            kind: target.kind(),
            target: Mutex::new(target),
            status: Mutex::new(TargetStatus::Created),
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Target>> {
        self.target
            .lock()
            .unwrap_or_else(|_| panic!("target lock poisoned"))
    }

    fn status_lock(&self) -> MutexGuard<'_, TargetStatus> {
        self.status
            .lock()
            .unwrap_or_else(|_| panic!("target status lock poisoned"))
    }

    pub fn id(&self) -> TargetId {
        self.id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn status(&self) -> TargetStatus {
        *self.status_lock()
    }

    pub fn is_open(&self) -> bool {
        self.status() == TargetStatus::Open
    }

    /// 처리한 프레임 수
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// 타겟을 엽니다. 이미 열려 있으면 아무 일도 하지 않습니다.
    pub fn open(&self) -> Result<(), TargetError> {
        let mut status = self.status_lock();
        if *status == TargetStatus::Open {
            return Ok(());
        }
        self.lock().open()?;
        *status = TargetStatus::Open;
        tracing::debug!(target_id = %self.id, kind = self.kind, "target opened");
        Ok(())
    }

    /// 프레임을 처리합니다. 실패하면 타겟을 닫고 `false`를 반환합니다.
    ///
    /// 닫힌 타겟은 프레임을 무시하고 `true`를 반환합니다.
    pub(crate) fn process(&self, cx: &mut TargetContext<'_, '_>, packet: &Packet<'_>) -> bool {
        if !self.is_open() {
            return true;
        }
        let result = self.lock().process(cx, packet);
        match result {
            Ok(()) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.fail(&e);
                false
            }
        }
    }

    fn fail(&self, err: &TargetError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(m::TARGET_ERRORS_TOTAL, m::LABEL_TARGET => self.kind).increment(1);
        tracing::warn!(target_id = %self.id, kind = self.kind, error = %err, "target failed, closing");
        self.lock().close();
        *self.status_lock() = TargetStatus::Failed;
    }

    /// 재설정 신호를 전달합니다. 실패하면 타겟을 닫습니다.
    pub fn sighup(&self) -> bool {
        if !self.is_open() {
            return true;
        }
        let result = self.lock().sighup();
        match result {
            Ok(()) => true,
            Err(e) => {
                self.fail(&e);
                false
            }
        }
    }

    /// 타겟을 닫습니다. 열려 있지 않으면 아무 일도 하지 않습니다.
    pub fn close(&self) {
        let mut status = self.status_lock();
        if *status != TargetStatus::Open {
            return;
        }
        self.lock().close();
        *status = TargetStatus::Closed;
        tracing::debug!(target_id = %self.id, kind = self.kind, "target closed");
    }
}

impl fmt::Debug for TargetSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetSlot")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}

/// `process` 동안 타겟이 빌려 쓰는 엔진 자원
pub struct TargetContext<'a, 'p> {
    owner: Option<Arc<TargetSlot>>,
    conntrack: &'a mut ConntrackTable,
    expectations: &'a mut ExpectationTable,
    timers: &'a mut TimerWheel<TimerOwner>,
    protocols: &'a ProtocolTable<'p>,
    entry: Option<(EntryId, FlowDirection)>,
    now: Duration,
}

impl<'a, 'p> TargetContext<'a, 'p> {
    pub(crate) fn new(
        conntrack: &'a mut ConntrackTable,
        expectations: &'a mut ExpectationTable,
        timers: &'a mut TimerWheel<TimerOwner>,
        protocols: &'a ProtocolTable<'p>,
        entry: Option<(EntryId, FlowDirection)>,
        now: Duration,
    ) -> Self {
        Self {
            owner: None,
            conntrack,
            expectations,
            timers,
            protocols,
            entry,
            now,
        }
    }

    /// 다음 `process` 호출의 타겟을 지정합니다.
    pub(crate) fn bind(&mut self, slot: &Arc<TargetSlot>) {
        self.owner = Some(Arc::clone(slot));
    }

    /// 기대 연결로 이어진 흐름에 부모 흐름을 기록합니다.
    pub(crate) fn set_parent(&mut self, parent: Option<EntryId>) {
        if let Some(id) = self.entry() {
            if parent != Some(id) {
                self.conntrack.set_parent(id, parent);
            }
        }
    }

    /// 처리 중인 타겟 ID
    pub fn owner(&self) -> Option<TargetId> {
        self.owner.as_ref().map(|s| s.id())
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    /// 프레임이 속한 연결 (없으면 `None`)
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
    ///
    /// 흐름 식별에 참여하는 레이어가 없으면 `None`.
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

    /// 이 타겟이 연결에 붙인 상태
    pub fn state_mut<T: ConnectionState + std::any::Any>(&mut self) -> Option<&mut T> {
        let (entry, owner) = (self.entry()?, self.owner()?);
        self.conntrack.target_state_mut::<T>(entry, owner)
    }

    pub fn has_state(&self) -> bool {
        match (self.entry(), self.owner()) {
            (Some(entry), Some(owner)) => self.conntrack.has_target_state(entry, owner),
            _ => false,
        }
    }

    /// 연결에 상태를 붙입니다. 연결이 없으면 `false`.
    pub fn add_state(&mut self, state: Box<dyn ConnectionState>) -> bool {
        match (self.entry(), self.owner()) {
            (Some(entry), Some(owner)) => self.conntrack.add_target_state(entry, owner, state),
            _ => false,
        }
    }

    /// 상태를 떼어냅니다. 연결에 남은 상태가 없으면 연결이 파기됩니다.
    pub fn remove_state(&mut self) -> Option<Box<dyn ConnectionState>> {
        let (entry, owner) = (self.entry()?, self.owner()?);
        let state = self
            .conntrack
            .remove_target_state(entry, owner, self.protocols, self.timers);
        if self.conntrack.get(entry).is_none() {
            self.entry = None;
        }
        state
    }

    /// 이 패킷을 본뜬 기대 연결을 등록합니다. 부모는 현재 연결입니다.
    pub fn expect(
        &mut self,
        packet: &Packet<'_>,
        dir: CtFlags,
        timeout_secs: u64,
        state: Option<Box<dyn ConnectionState>>,
    ) -> Option<ExpectationId> {
        let owner = Arc::clone(self.owner.as_ref()?);
        let parent = self.entry();
        self.expectations
            .create(packet, owner, parent, dir, timeout_secs, state, self.timers, self.now)
    }
}

/// 타겟 생성 함수
pub type TargetFactory = fn(&TargetParams) -> Result<Box<dyn Target>, TargetError>;

/// 타겟 종류 레지스트리
pub struct TargetRegistry {
    factories: RwLock<Vec<(&'static str, TargetFactory)>>,
}

impl TargetRegistry {
    /// 빈 레지스트리를 생성합니다.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(Vec::new()),
        }
    }

    /// 내장 타겟(null, log, expect-reverse)이 등록된 레지스트리
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        for (kind, factory) in [
            (null::KIND, null::create as TargetFactory),
            (log::KIND, log::create as TargetFactory),
            (expect::KIND, expect::create as TargetFactory),
        ] {
            if let Err(e) = registry.register(kind, factory) {
                tracing::error!(kind, error = %e, "builtin target registration failed");
            }
        }
        registry
    }

    /// 타겟 종류를 등록합니다.
    pub fn register(&self, kind: &'static str, factory: TargetFactory) -> Result<(), RegistryError> {
        let mut factories = self
            .factories
            .write()
            .unwrap_or_else(|_| panic!("target registry lock poisoned"));
        if factories.iter().any(|(k, _)| *k == kind) {
            return Err(RegistryError::AlreadyRegistered {
                kind: "target",
                name: kind.to_owned(),
            });
        }
        factories.push((kind, factory));
        Ok(())
    }

    /// 선언으로 타겟을 만들고 엽니다.
    pub fn create(&self, spec: &TargetSpec) -> Result<Arc<TargetSlot>, EngineError> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(|_| panic!("target registry lock poisoned"))
            .iter()
            .find(|(k, _)| *k == spec.kind)
            .map(|(_, f)| *f)
            .ok_or_else(|| EngineError::NotFound {
                kind: "target",
                name: spec.kind.clone(),
            })?;

        let to_engine = |e: TargetError| EngineError::Target {
            target: spec.kind.clone(),
            reason: e.to_string(),
        };
        let slot = TargetSlot::new(factory(&spec.params).map_err(to_engine)?);
        slot.open().map_err(to_engine)?;
        Ok(Arc::new(slot))
    }

    /// 등록된 타겟 종류
    pub fn kinds(&self) -> Vec<&'static str> {
        self.factories
            .read()
            .unwrap_or_else(|_| panic!("target registry lock poisoned"))
            .iter()
            .map(|(k, _)| *k)
            .collect()
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}
