//! 설정 관리 -- flowmatic.toml 파싱 및 런타임 설정
//!
//! [`FlowmaticConfig`]는 데몬과 CLI가 공유하는 최상위 설정 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`FLOWMATIC_INPUT_PATH=/data/trace.pcap` 형식)
//! 3. 설정 파일 (`flowmatic.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), flowmatic_core::error::FlowmaticError> {
//! use flowmatic_core::config::FlowmaticConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = FlowmaticConfig::load("flowmatic.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = FlowmaticConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, FlowmaticError};

/// 연결 추적 테이블 버킷 수 상한
const MAX_CONNTRACK_TABLE_SIZE: usize = 1 << 24;

/// 입력 링 버퍼 용량 상한 (프레임 수)
const MAX_RING_CAPACITY: usize = 1_000_000;

/// Flowmatic 통합 설정
///
/// `flowmatic.toml` 파일의 최상위 구조를 나타냅니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowmaticConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 패킷 입력 설정
    #[serde(default)]
    pub input: InputConfig,
    /// 엔진 설정
    #[serde(default)]
    pub engine: EngineSection,
    /// 헬퍼(재조립) 설정
    #[serde(default)]
    pub helpers: HelperSection,
    /// 메트릭 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl FlowmaticConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    ///
    /// 설정 로딩 순서:
    /// 1. TOML 파일 파싱
    /// 2. 환경변수 오버라이드 적용
    /// 3. 유효성 검증
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, FlowmaticError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowmaticError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FlowmaticError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                FlowmaticError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, FlowmaticError> {
        toml::from_str(toml_str).map_err(|e| {
            FlowmaticError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `FLOWMATIC_{SECTION}_{FIELD}`
    /// 예: `FLOWMATIC_ENGINE_RULES_DIR=/etc/flowmatic/rules`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "FLOWMATIC_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "FLOWMATIC_GENERAL_LOG_FORMAT");
        override_string(&mut self.general.pid_file, "FLOWMATIC_GENERAL_PID_FILE");

        // Input
        override_string(&mut self.input.kind, "FLOWMATIC_INPUT_KIND");
        override_string(&mut self.input.path, "FLOWMATIC_INPUT_PATH");
        override_bool(&mut self.input.live, "FLOWMATIC_INPUT_LIVE");
        override_usize(
            &mut self.input.ring_capacity,
            "FLOWMATIC_INPUT_RING_CAPACITY",
        );
        override_u32(&mut self.input.snaplen, "FLOWMATIC_INPUT_SNAPLEN");

        // Engine
        override_string(&mut self.engine.rules_dir, "FLOWMATIC_ENGINE_RULES_DIR");
        override_u64(
            &mut self.engine.poll_interval_secs,
            "FLOWMATIC_ENGINE_POLL_INTERVAL_SECS",
        );
        override_usize(
            &mut self.engine.conntrack_table_size,
            "FLOWMATIC_ENGINE_CONNTRACK_TABLE_SIZE",
        );
        override_u64(
            &mut self.engine.conntrack_default_timeout_secs,
            "FLOWMATIC_ENGINE_CONNTRACK_DEFAULT_TIMEOUT_SECS",
        );
        override_usize(&mut self.engine.max_layers, "FLOWMATIC_ENGINE_MAX_LAYERS");
        override_bool(
            &mut self.engine.dump_invalid_packets,
            "FLOWMATIC_ENGINE_DUMP_INVALID_PACKETS",
        );

        // Helpers
        override_u64(
            &mut self.helpers.ipv4_frag_timeout_secs,
            "FLOWMATIC_HELPERS_IPV4_FRAG_TIMEOUT_SECS",
        );
        override_bool(
            &mut self.helpers.ipv4_fix_checksum,
            "FLOWMATIC_HELPERS_IPV4_FIX_CHECKSUM",
        );

        // Metrics
        override_bool(&mut self.metrics.enabled, "FLOWMATIC_METRICS_ENABLED");
        override_string(
            &mut self.metrics.listen_addr,
            "FLOWMATIC_METRICS_LISTEN_ADDR",
        );
        override_u16(&mut self.metrics.port, "FLOWMATIC_METRICS_PORT");
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), FlowmaticError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        let valid_inputs = ["pcap"];
        if !valid_inputs.contains(&self.input.kind.as_str()) {
            return Err(invalid(
                "input.kind",
                format!("must be one of: {}", valid_inputs.join(", ")),
            ));
        }

        if self.input.ring_capacity == 0 || self.input.ring_capacity > MAX_RING_CAPACITY {
            return Err(invalid(
                "input.ring_capacity",
                format!("must be 1-{MAX_RING_CAPACITY}"),
            ));
        }

        if self.input.snaplen < 64 {
            return Err(invalid("input.snaplen", "must be at least 64".to_owned()));
        }

        if self.engine.poll_interval_secs == 0 {
            return Err(invalid(
                "engine.poll_interval_secs",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.engine.conntrack_table_size == 0
            || self.engine.conntrack_table_size > MAX_CONNTRACK_TABLE_SIZE
        {
            return Err(invalid(
                "engine.conntrack_table_size",
                format!("must be 1-{MAX_CONNTRACK_TABLE_SIZE}"),
            ));
        }

        if self.engine.conntrack_default_timeout_secs == 0 {
            return Err(invalid(
                "engine.conntrack_default_timeout_secs",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.engine.max_layers < 2 {
            return Err(invalid(
                "engine.max_layers",
                "must be at least 2".to_owned(),
            ));
        }

        if self.helpers.ipv4_frag_timeout_secs == 0 {
            return Err(invalid(
                "helpers.ipv4_frag_timeout_secs",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.metrics.enabled && self.metrics.listen_addr.is_empty() {
            return Err(invalid(
                "metrics.listen_addr",
                "listen_addr must not be empty when metrics are enabled".to_owned(),
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: String) -> FlowmaticError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason,
    }
    .into()
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
    /// PID 파일 경로 (빈 문자열이면 기록하지 않음)
    pub pid_file: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
            pid_file: String::new(),
        }
    }
}

/// 패킷 입력 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// 입력 종류 (pcap)
    pub kind: String,
    /// 캡처 파일 경로
    pub path: String,
    /// 라이브 캡처 여부 (true면 링 버퍼가 가득 찰 때 새 프레임을 버림)
    pub live: bool,
    /// 입력 스레드와 처리 스레드 사이 링 버퍼 용량 (프레임 수)
    pub ring_capacity: usize,
    /// 최대 캡처 길이 (바이트)
    pub snaplen: u32,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            kind: "pcap".to_owned(),
            path: String::new(),
            live: false,
            ring_capacity: 1000,
            snaplen: 65535,
        }
    }
}

/// 엔진 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// YAML 규칙 디렉토리
    pub rules_dir: String,
    /// 링 버퍼가 비었을 때 처리 스레드의 대기 간격 (초)
    pub poll_interval_secs: u64,
    /// 연결 추적 해시 테이블 버킷 수
    pub conntrack_table_size: usize,
    /// 프로토콜이 타임아웃을 주지 않을 때의 연결 유휴 타임아웃 (초)
    pub conntrack_default_timeout_secs: u64,
    /// 프레임당 최대 레이어 수
    pub max_layers: usize,
    /// 손상 패킷의 레이어 덤프를 경고 로그로 남길지 여부
    pub dump_invalid_packets: bool,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            rules_dir: "/etc/flowmatic/rules".to_owned(),
            poll_interval_secs: 3,
            conntrack_table_size: 65535,
            conntrack_default_timeout_secs: 300,
            max_layers: 32,
            dump_invalid_packets: true,
        }
    }
}

/// 헬퍼 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperSection {
    /// IPv4 조각 그룹 만료 시간 (초)
    pub ipv4_frag_timeout_secs: u64,
    /// 재조립한 IPv4 헤더의 체크섬을 다시 계산할지 여부
    pub ipv4_fix_checksum: bool,
}

impl Default for HelperSection {
    fn default() -> Self {
        Self {
            ipv4_frag_timeout_secs: 60,
            ipv4_fix_checksum: true,
        }
    }
}

/// 메트릭 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus 엔드포인트 활성화 여부
    pub enabled: bool,
    /// 바인드 주소
    pub listen_addr: String,
    /// 포트
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9105,
        }
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_usize(target: &mut usize, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<usize>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse usize from env var, ignoring"
            ),
        }
    }
}

fn override_u16(target: &mut u16, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u16>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u16 from env var, ignoring"
            ),
        }
    }
}

fn override_u32(target: &mut u32, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u32>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u32 from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}
