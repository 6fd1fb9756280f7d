//! 에러 타입 -- 도메인별 에러 정의

use crate::value::ValueKind;

/// Flowmatic 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum FlowmaticError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 필드 값 파싱/변환 에러
    #[error("value error: {0}")]
    Value(#[from] ValueError),

    /// 엔진(패킷 파이프라인) 에러
    #[error("engine error: {0}")]
    Engine(#[from] EngineFailure),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 타입 값(ptype) 에러
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    /// 문자열을 지정한 타입으로 해석할 수 없음
    #[error("invalid {kind} value '{input}': {reason}")]
    Invalid {
        kind: ValueKind,
        input: String,
        reason: String,
    },

    /// 알 수 없는 비교 연산자
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
}

/// 엔진 계층에서 올라온 실패
///
/// 엔진 크레이트의 상세 에러를 core 쪽으로 전달할 때 사용합니다.
#[derive(Debug, thiserror::Error)]
pub enum EngineFailure {
    /// 등록/해제 실패 (이름 충돌, 테이블 가득 참 등)
    #[error("registration failed: {0}")]
    Registration(String),

    /// 규칙 파싱/로딩 실패
    #[error("rule error: {0}")]
    Rule(String),

    /// 입력 소스 실패
    #[error("input error: {0}")]
    Input(String),

    /// 엔진 초기화 실패
    #[error("init failed: {0}")]
    InitFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_converts_to_root() {
        let err: FlowmaticError = ConfigError::ParseFailed {
            reason: "bad".to_owned(),
        }
        .into();
        assert!(matches!(err, FlowmaticError::Config(_)));
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn value_error_display_contains_kind_and_input() {
        let err = ValueError::Invalid {
            kind: ValueKind::Ipv4,
            input: "300.1.1.1".to_owned(),
            reason: "out of range".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("ipv4"));
        assert!(msg.contains("300.1.1.1"));
    }

    #[test]
    fn engine_failure_display() {
        let err = FlowmaticError::from(EngineFailure::Rule("unmatched ')'".to_owned()));
        assert!(err.to_string().contains("unmatched"));
    }
}
