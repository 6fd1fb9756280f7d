//! 매치 레지스트리 -- 프로토콜 ID와 식별 함수의 디스패치 테이블
//!
//! 프로토콜은 [`Protocol`] trait 구현으로 정적으로 등록됩니다. 규칙 트리와 레이어는
//! 문자열이 아니라 작은 정수 [`ProtoId`]를 저장합니다. ID 0은 "undefined"
//! 센티넬로 예약되어 있습니다.
//!
//! # 잠금
//! 테이블은 `RwLock` 하나로 보호됩니다. 등록/해제는 쓰기 잠금을, 패킷 처리는
//! 프레임 하나 동안 [`ProtocolRegistry::read`]로 얻은 읽기 잠금을 유지합니다.
//! 참조 카운트는 원자 변수라 읽기 잠금 아래에서도 갱신할 수 있습니다.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use flowmatic_core::ValueKind;
use serde::Serialize;

use crate::conntrack::{CtFlags, FlowContributor};
use crate::error::{IdentifyError, RegistryError};
use crate::layer::Layer;

/// 등록 가능한 최대 프로토콜 수 (undefined 포함)
pub const MAX_PROTOCOLS: usize = 64;

/// 예약된 센티넬 프로토콜 이름
pub const UNDEFINED_NAME: &str = "undefined";

/// 프로토콜 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProtoId(u16);

impl ProtoId {
    /// "더 이상 알 수 없음" 센티넬
    pub const UNDEFINED: ProtoId = ProtoId(0);

    pub(crate) const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn is_undefined(self) -> bool {
        self == Self::UNDEFINED
    }

    fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// 필드 스키마 항목
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: ValueKind,
    pub description: &'static str,
}

/// `identify`가 알려주는 다음 레이어
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// [`Protocol::dependencies`]의 인덱스
    Proto(usize),
    /// 다음 레이어를 알 수 없음
    Undefined,
}

/// 프로토콜 디코더
///
/// `identify`는 `data[start..start + len]`에 있는 헤더를 읽어 레이어의 페이로드
/// 범위와 필드를 채우고 다음 프로토콜을 알려줍니다.
pub trait Protocol: Send + Sync {
    /// 등록 이름 (규칙 텍스트에서 사용)
    fn name(&self) -> &'static str;

    /// 필드 스키마. 인덱스가 필드 ID입니다.
    fn fields(&self) -> &'static [FieldSpec] {
        &[]
    }

    /// `Next::Proto(i)`가 가리키는 프로토콜 이름 목록
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    /// 헤더를 해석합니다.
    fn identify(
        &self,
        data: &[u8],
        layer: &mut Layer,
        start: usize,
        len: usize,
    ) -> Result<Next, IdentifyError>;

    /// 반대 방향 기대 연결에서 `field`와 비교할 필드 ID
    ///
    /// 예: ipv4의 `src`는 역방향에서 `dst`와 비교합니다. 미러링할 필드가 없으면 `None`.
    fn expectation_field(&self, _field: usize, _dir: CtFlags) -> Option<usize> {
        None
    }

    /// 연결 추적 기여자 (흐름 식별에 참여하는 프로토콜만)
    fn conntrack(&self) -> Option<&dyn FlowContributor> {
        None
    }
}

struct Undefined;

impl Protocol for Undefined {
    fn name(&self) -> &'static str {
        UNDEFINED_NAME
    }

    fn identify(&self, _: &[u8], _: &mut Layer, _: usize, _: usize) -> Result<Next, IdentifyError> {
        Err(IdentifyError::Invalid {
            proto: UNDEFINED_NAME,
            reason: "undefined layer cannot be identified".to_owned(),
        })
    }
}

struct Registration {
    proto: Box<dyn Protocol>,
    deps: Vec<ProtoId>,
    refcount: AtomicUsize,
}

/// 프로토콜 레지스트리
pub struct ProtocolRegistry {
    slots: RwLock<Vec<Option<Registration>>>,
}

impl ProtocolRegistry {
    /// undefined만 등록된 레지스트리를 생성합니다.
    pub fn new() -> Self {
        let undefined = Registration {
            proto: Box::new(Undefined),
            deps: Vec::new(),
            refcount: AtomicUsize::new(0),
        };
        Self {
            slots: RwLock::new(vec![Some(undefined)]),
        }
    }

    /// 내장 프로토콜이 모두 등록된 레지스트리를 생성합니다.
    pub fn with_builtin() -> Result<Self, RegistryError> {
        let registry = Self::new();
        crate::protocols::register_builtin(&registry)?;
        Ok(registry)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Option<Registration>>> {
        self.slots
            .write()
            .unwrap_or_else(|_| panic!("protocol registry lock poisoned"))
    }

    /// 프레임 처리나 조회 동안 유지할 읽기 뷰
    pub fn read(&self) -> ProtocolTable<'_> {
        ProtocolTable {
            slots: self
                .slots
                .read()
                .unwrap_or_else(|_| panic!("protocol registry lock poisoned")),
        }
    }

    /// 프로토콜을 등록합니다.
    ///
    /// 이름이 겹치거나 테이블이 가득 차면 실패하고, 기존 등록은 영향받지 않습니다.
    pub fn register(&self, proto: Box<dyn Protocol>) -> Result<ProtoId, RegistryError> {
        let mut slots = self.write();
        let name = proto.name();

        if slots.iter().flatten().any(|r| r.proto.name() == name) {
            return Err(RegistryError::AlreadyRegistered {
                kind: "protocol",
                name: name.to_owned(),
            });
        }

        let index = match slots.iter().position(Option::is_none) {
            Some(i) => i,
            None if slots.len() < MAX_PROTOCOLS => {
                slots.push(None);
                slots.len() - 1
            }
            None => {
                return Err(RegistryError::TableFull {
                    kind: "protocol",
                    capacity: MAX_PROTOCOLS,
                });
            }
        };

        slots[index] = Some(Registration {
            proto,
            deps: Vec::new(),
            refcount: AtomicUsize::new(0),
        });
        resolve_dependencies(&mut slots);

        let id = ProtoId(u16::try_from(index).map_err(|_| RegistryError::TableFull {
            kind: "protocol",
            capacity: MAX_PROTOCOLS,
        })?);
        tracing::debug!(proto = name, id = id.0, "protocol registered");
        Ok(id)
    }

    /// 프로토콜 등록을 해제합니다. 규칙이나 연결이 참조 중이면 실패합니다.
    pub fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        let mut slots = self.write();
        let not_registered = || RegistryError::NotRegistered {
            kind: "protocol",
            name: name.to_owned(),
        };

        if name == UNDEFINED_NAME {
            return Err(RegistryError::InUse {
                kind: "protocol",
                name: name.to_owned(),
                refcount: usize::MAX,
            });
        }

        let index = slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|r| r.proto.name() == name))
            .ok_or_else(not_registered)?;

        let refcount = slots[index]
            .as_ref()
            .map_or(0, |r| r.refcount.load(Ordering::Acquire));
        if refcount > 0 {
            return Err(RegistryError::InUse {
                kind: "protocol",
                name: name.to_owned(),
                refcount,
            });
        }

        slots[index] = None;
        resolve_dependencies(&mut slots);
        tracing::debug!(proto = name, "protocol unregistered");
        Ok(())
    }

    /// 이름으로 ID를 찾습니다.
    pub fn lookup(&self, name: &str) -> Option<ProtoId> {
        self.read().lookup(name)
    }

    /// 등록된 프로토콜 정보 목록
    pub fn list(&self) -> Vec<ProtocolInfo> {
        self.read().list()
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_dependencies(slots: &mut [Option<Registration>]) {
    let names: Vec<Option<&'static str>> = slots
        .iter()
        .map(|s| s.as_ref().map(|r| r.proto.name()))
        .collect();
    let find = |dep: &str| {
        names
            .iter()
            .position(|n| *n == Some(dep))
            .and_then(|i| u16::try_from(i).ok())
            .map_or(ProtoId::UNDEFINED, ProtoId)
    };
    for reg in slots.iter_mut().flatten() {
        reg.deps = reg.proto.dependencies().iter().map(|d| find(d)).collect();
    }
}

/// 등록된 프로토콜 요약
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolInfo {
    pub id: ProtoId,
    pub name: &'static str,
    pub fields: Vec<FieldSpec>,
    pub refcount: usize,
    pub conntrack: bool,
}

/// 레지스트리 읽기 잠금을 쥔 뷰
pub struct ProtocolTable<'a> {
    slots: RwLockReadGuard<'a, Vec<Option<Registration>>>,
}

impl ProtocolTable<'_> {
    fn reg(&self, id: ProtoId) -> Option<&Registration> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get(&self, id: ProtoId) -> Option<&dyn Protocol> {
        self.reg(id).map(|r| r.proto.as_ref())
    }

    /// 프로토콜 이름. 등록되지 않은 ID는 `"?"`.
    pub fn name(&self, id: ProtoId) -> &'static str {
        self.reg(id).map_or("?", |r| r.proto.name())
    }

    pub fn lookup(&self, name: &str) -> Option<ProtoId> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|r| r.proto.name() == name))
            .and_then(|i| u16::try_from(i).ok())
            .map(ProtoId)
    }

    /// 필드 이름으로 필드 ID를 찾습니다.
    pub fn field_index(&self, id: ProtoId, field: &str) -> Option<usize> {
        self.get(id)?.fields().iter().position(|f| f.name == field)
    }

    pub fn field_spec(&self, id: ProtoId, field: usize) -> Option<&'static FieldSpec> {
        self.get(id)?.fields().get(field)
    }

    /// `identify`가 돌려준 [`Next`]를 실제 프로토콜 ID로 바꿉니다.
    pub fn resolve_next(&self, id: ProtoId, next: Next) -> ProtoId {
        match next {
            Next::Undefined => ProtoId::UNDEFINED,
            Next::Proto(i) => self
                .reg(id)
                .and_then(|r| r.deps.get(i).copied())
                .unwrap_or(ProtoId::UNDEFINED),
        }
    }

    pub fn contributor(&self, id: ProtoId) -> Option<&dyn FlowContributor> {
        self.get(id)?.conntrack()
    }

    /// 참조 카운트를 올립니다.
    pub fn acquire(&self, id: ProtoId) {
        if let Some(reg) = self.reg(id) {
            reg.refcount.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// 참조 카운트를 내립니다.
    pub fn release(&self, id: ProtoId) {
        if let Some(reg) = self.reg(id) {
            let prev = reg
                .refcount
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            debug_assert!(prev.is_ok(), "refcount underflow for {}", reg.proto.name());
        }
    }

    pub fn refcount(&self, id: ProtoId) -> usize {
        self.reg(id).map_or(0, |r| r.refcount.load(Ordering::Acquire))
    }

    pub fn list(&self) -> Vec<ProtocolInfo> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                let reg = s.as_ref()?;
                Some(ProtocolInfo {
                    id: ProtoId(u16::try_from(i).ok()?),
                    name: reg.proto.name(),
                    fields: reg.proto.fields().to_vec(),
                    refcount: reg.refcount.load(Ordering::Acquire),
                    conntrack: reg.proto.conntrack().is_some(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(&'static str, &'static [&'static str]);

    impl Protocol for Dummy {
        fn name(&self) -> &'static str {
            self.0
        }

        fn dependencies(&self) -> &'static [&'static str] {
            self.1
        }

        fn identify(&self, _: &[u8], layer: &mut Layer, start: usize, len: usize) -> Result<Next, IdentifyError> {
            layer.set_payload(start, len);
            Ok(Next::Proto(0))
        }
    }

    #[test]
    fn undefined_is_reserved_at_zero() {
        let reg = ProtocolRegistry::new();
        assert_eq!(reg.lookup(UNDEFINED_NAME), Some(ProtoId::UNDEFINED));
        assert!(reg.unregister(UNDEFINED_NAME).is_err());
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let reg = ProtocolRegistry::new();
        reg.register(Box::new(Dummy("a", &[]))).unwrap();
        let err = reg.register(Box::new(Dummy("a", &[]))).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));
    }

    #[test]
    fn dependencies_resolve_late() {
        let reg = ProtocolRegistry::new();
        let a = reg.register(Box::new(Dummy("a", &["b"]))).unwrap();
        {
            let table = reg.read();
            assert_eq!(table.resolve_next(a, Next::Proto(0)), ProtoId::UNDEFINED);
        }
        let b = reg.register(Box::new(Dummy("b", &[]))).unwrap();
        let table = reg.read();
        assert_eq!(table.resolve_next(a, Next::Proto(0)), b);
        assert_eq!(table.resolve_next(a, Next::Proto(9)), ProtoId::UNDEFINED);
    }

    #[test]
    fn unregister_fails_while_referenced() {
        let reg = ProtocolRegistry::new();
        let a = reg.register(Box::new(Dummy("a", &[]))).unwrap();
        reg.read().acquire(a);

        let err = reg.unregister("a").unwrap_err();
        assert!(matches!(err, RegistryError::InUse { refcount: 1, .. }));

        reg.read().release(a);
        reg.unregister("a").unwrap();
        assert!(reg.lookup("a").is_none());
    }

    #[test]
    fn table_full_is_reported() {
        let reg = ProtocolRegistry::new();
        let names: Vec<&'static str> = (1..MAX_PROTOCOLS)
            .map(|i| &*Box::leak(format!("p{i}").into_boxed_str()))
            .collect();
        for name in &names {
            reg.register(Box::new(Dummy(name, &[]))).unwrap();
        }
        let err = reg.register(Box::new(Dummy("overflow", &[]))).unwrap_err();
        assert!(matches!(err, RegistryError::TableFull { .. }));
        assert_eq!(reg.list().len(), MAX_PROTOCOLS);
    }

    #[test]
    fn freed_slot_is_reused() {
        let reg = ProtocolRegistry::new();
        let a = reg.register(Box::new(Dummy("a", &[]))).unwrap();
        reg.unregister("a").unwrap();
        let b = reg.register(Box::new(Dummy("b", &[]))).unwrap();
        assert_eq!(a, b);
    }
}
