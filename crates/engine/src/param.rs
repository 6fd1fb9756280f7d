//! 파라미터 테이블 -- 헬퍼와 엔진이 노출하는 실행 중 조정 가능한 값
//!
//! 헬퍼는 등록될 때 자기 파라미터(`ipv4.frag_timeout` 등)를 함께 등록합니다.
//! 값은 [`Value`]로 저장하며 `set`은 파라미터 종류로 파싱 검증을 거칩니다.
//! 값이 바뀔 때마다 serial이 증가합니다.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use flowmatic_core::{Value, ValueKind};
use serde::Serialize;

use crate::error::{EngineError, RegistryError};

/// 파라미터 선언
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ValueKind,
    pub default: &'static str,
    pub description: &'static str,
}

struct Param {
    name: &'static str,
    kind: ValueKind,
    value: Value,
    default: Value,
    description: &'static str,
}

/// 파라미터 조회 결과
#[derive(Debug, Clone, Serialize)]
pub struct ParamInfo {
    pub name: &'static str,
    pub kind: ValueKind,
    pub value: Value,
    pub default: Value,
    pub description: &'static str,
}

/// 파라미터 테이블
#[derive(Default)]
pub struct ParamTable {
    params: RwLock<Vec<Param>>,
    serial: AtomicU64,
}

impl ParamTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Param>> {
        self.params
            .read()
            .unwrap_or_else(|_| panic!("param table lock poisoned"))
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Param>> {
        self.params
            .write()
            .unwrap_or_else(|_| panic!("param table lock poisoned"))
    }

    /// 파라미터를 등록합니다. 기본값은 `kind`로 파싱할 수 있어야 합니다.
    pub fn register(&self, spec: &ParamSpec) -> Result<(), EngineError> {
        let default = Value::parse(spec.kind, spec.default)?;
        let mut params = self.write();
        if params.iter().any(|p| p.name == spec.name) {
            return Err(RegistryError::AlreadyRegistered {
                kind: "param",
                name: spec.name.to_owned(),
            }
            .into());
        }
        params.push(Param {
            name: spec.name,
            kind: spec.kind,
            value: default.clone(),
            default,
            description: spec.description,
        });
        Ok(())
    }

    /// 파라미터 등록을 해제합니다. 없으면 아무 일도 하지 않습니다.
    pub fn unregister(&self, name: &str) {
        self.write().retain(|p| p.name != name);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.read()
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.clone())
    }

    /// 정수 파라미터
    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name)?.as_u64()
    }

    /// bool 파라미터
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name)?.as_bool()
    }

    /// 문자열을 파라미터 종류로 파싱해 값을 바꿉니다.
    pub fn set(&self, name: &str, text: &str) -> Result<(), EngineError> {
        let mut params = self.write();
        let param = params
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| EngineError::NotFound {
                kind: "param",
                name: name.to_owned(),
            })?;
        param.value = Value::parse(param.kind, text)?;
        self.serial.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(param = name, value = %param.value, "parameter updated");
        Ok(())
    }

    /// 값이 바뀐 횟수
    pub fn serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    pub fn list(&self) -> Vec<ParamInfo> {
        self.read()
            .iter()
            .map(|p| ParamInfo {
                name: p.name,
                kind: p.kind,
                value: p.value.clone(),
                default: p.default.clone(),
                description: p.description,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: ParamSpec = ParamSpec {
        name: "test.timeout",
        kind: ValueKind::U32,
        default: "60",
        description: "timeout",
    };

    #[test]
    fn register_and_get_default() {
        let table = ParamTable::new();
        table.register(&TIMEOUT).unwrap();
        assert_eq!(table.get_u64("test.timeout"), Some(60));
        assert!(table.register(&TIMEOUT).is_err());
    }

    #[test]
    fn set_validates_and_bumps_serial() {
        let table = ParamTable::new();
        table.register(&TIMEOUT).unwrap();

        table.set("test.timeout", "5").unwrap();
        assert_eq!(table.get("test.timeout"), Some(Value::U32(5)));
        assert_eq!(table.serial(), 1);

        assert!(table.set("test.timeout", "soon").is_err());
        assert_eq!(table.serial(), 1);
    }

    #[test]
    fn unknown_param_is_not_found() {
        let table = ParamTable::new();
        let err = table.set("nope", "1").unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "param", .. }));
        assert!(table.get("nope").is_none());
    }

    #[test]
    fn invalid_default_is_rejected() {
        let table = ParamTable::new();
        let spec = ParamSpec {
            default: "sixty",
            ..TIMEOUT
        };
        assert!(table.register(&spec).is_err());
        assert!(table.list().is_empty());
    }
}
