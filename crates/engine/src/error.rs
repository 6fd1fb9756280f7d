//! 엔진 에러 타입
//!
//! [`EngineError`]는 등록, 규칙 파싱/로딩, 입력, 설정 등 제어 경로에서 발생하는
//! 모든 에러를 표현합니다. 패킷 단위 에러([`IdentifyError`], [`HelperError`],
//! [`TargetError`])는 프레임 처리 함수 밖으로 전파되지 않고 드롭 결정으로 바뀝니다.
//!
//! `From<EngineError> for FlowmaticError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 전파할 수 있습니다.

use flowmatic_core::error::{EngineFailure, FlowmaticError, ValueError};

/// 엔진 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// 레지스트리 등록/해제 실패
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// 규칙 표현식 파싱 실패
    #[error("rule parse error: rule '{rule_id}': {reason}")]
    RuleParse {
        /// 문제가 된 규칙 ID (파일에 적힌 이름)
        rule_id: String,
        /// 실패 사유
        reason: String,
    },

    /// 규칙 파일 로딩 실패
    #[error("rule load error: {path}: {reason}")]
    RuleLoad {
        /// 규칙 파일 경로
        path: String,
        /// 로딩 실패 사유
        reason: String,
    },

    /// 이름/ID로 찾는 대상이 없음
    #[error("{kind} not found: {name}")]
    NotFound {
        /// 대상 종류 (rule, protocol, field, param, target)
        kind: &'static str,
        /// 찾으려던 이름 또는 ID
        name: String,
    },

    /// 타겟 생성/열기 실패
    #[error("target error: {target}: {reason}")]
    Target {
        /// 타겟 종류
        target: String,
        /// 실패 사유
        reason: String,
    },

    /// 입력 소스 에러
    #[error(transparent)]
    Input(#[from] InputError),

    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 값 파싱 에러 (규칙 비교 값, 파라미터)
    #[error(transparent)]
    Value(#[from] ValueError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 레지스트리 에러
///
/// 프로토콜, 타겟 종류, 파라미터 테이블에 공통으로 사용합니다.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// 같은 이름이 이미 등록됨
    #[error("{kind} '{name}' is already registered")]
    AlreadyRegistered { kind: &'static str, name: String },

    /// 고정 크기 테이블이 가득 참
    #[error("{kind} table is full (capacity {capacity})")]
    TableFull { kind: &'static str, capacity: usize },

    /// 등록되지 않은 이름
    #[error("{kind} '{name}' is not registered")]
    NotRegistered { kind: &'static str, name: String },

    /// 참조 중이라 해제할 수 없음
    #[error("{kind} '{name}' is still in use ({refcount} references)")]
    InUse {
        kind: &'static str,
        name: String,
        refcount: usize,
    },
}

/// 프로토콜 식별 실패
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifyError {
    /// 헤더를 읽기에 바이트가 부족함
    #[error("{proto}: truncated header (need {need} bytes, have {have})")]
    Truncated {
        proto: &'static str,
        need: usize,
        have: usize,
    },

    /// 헤더 값이 유효하지 않음
    #[error("{proto}: {reason}")]
    Invalid { proto: &'static str, reason: String },
}

/// 헬퍼 처리 실패 (손상 패킷으로 취급)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HelperError {
    /// 조각이 부모 레이어 범위를 넘거나 헤더가 어긋남
    #[error("{helper}: malformed fragment: {reason}")]
    Malformed { helper: &'static str, reason: String },
}

/// 타겟 처리 실패
///
/// `process`가 이 에러를 반환하면 해당 타겟은 닫히고 파이프라인은 계속 진행합니다.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    /// 처리 실패
    #[error("{target}: {reason}")]
    Failed { target: String, reason: String },

    /// 이미 닫힌 타겟
    #[error("{0}: target is closed")]
    Closed(String),
}

/// 입력 소스 에러
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    /// 입력 열기 실패
    #[error("failed to open input {path}: {reason}")]
    Open { path: String, reason: String },

    /// 읽기 실패
    #[error("input read error: {0}")]
    Read(String),

    /// 취소 요청으로 읽기가 중단됨 (재시도 가능)
    #[error("input read interrupted")]
    Interrupted,

    /// 지원하지 않는 링크 타입
    #[error("unsupported link type: {0}")]
    UnsupportedLinkType(i32),
}

impl From<EngineError> for FlowmaticError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Registry(e) => FlowmaticError::Engine(EngineFailure::Registration(
                e.to_string(),
            )),
            EngineError::RuleParse { .. } | EngineError::RuleLoad { .. } => {
                FlowmaticError::Engine(EngineFailure::Rule(err.to_string()))
            }
            EngineError::Input(e) => FlowmaticError::Engine(EngineFailure::Input(e.to_string())),
            EngineError::Value(e) => FlowmaticError::Value(e),
            EngineError::Io(e) => FlowmaticError::Io(e),
            other => FlowmaticError::Engine(EngineFailure::InitFailed(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_error_display() {
        let err = RegistryError::InUse {
            kind: "protocol",
            name: "tcp".to_owned(),
            refcount: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("tcp"));
        assert!(msg.contains('3'));
    }

    #[test]
    fn rule_parse_error_converts_to_rule_failure() {
        let err = EngineError::RuleParse {
            rule_id: "web".to_owned(),
            reason: "unmatched ')'".to_owned(),
        };
        let root: FlowmaticError = err.into();
        assert!(matches!(root, FlowmaticError::Engine(EngineFailure::Rule(_))));
        assert!(root.to_string().contains("unmatched"));
    }

    #[test]
    fn registry_error_converts_to_registration_failure() {
        let err: EngineError = RegistryError::TableFull {
            kind: "protocol",
            capacity: 64,
        }
        .into();
        let root: FlowmaticError = err.into();
        assert!(matches!(
            root,
            FlowmaticError::Engine(EngineFailure::Registration(_))
        ));
    }

    #[test]
    fn not_found_converts_to_init_failure() {
        let err = EngineError::NotFound {
            kind: "param",
            name: "ipv4.nope".to_owned(),
        };
        let root: FlowmaticError = err.into();
        assert!(root.to_string().contains("ipv4.nope"));
    }

    #[test]
    fn identify_error_display() {
        let err = IdentifyError::Truncated {
            proto: "ipv4",
            need: 20,
            have: 7,
        };
        assert_eq!(
            err.to_string(),
            "ipv4: truncated header (need 20 bytes, have 7)"
        );
    }
}
