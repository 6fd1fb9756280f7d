//! 엔진 설정
//!
//! [`EngineConfig`]는 core의 [`FlowmaticConfig`]에서
//! 파이프라인이 실제로 사용하는 값만 모은 것입니다.
//!
//! # 사용 예시
//! ```ignore
//! use flowmatic_core::FlowmaticConfig;
//! use flowmatic_engine::config::EngineConfig;
//!
//! let core_config = FlowmaticConfig::default();
//! let config = EngineConfig::from_core(&core_config);
//! ```

use std::time::Duration;

use flowmatic_core::FlowmaticConfig;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// 링 버퍼가 가득 찼을 때의 동작
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// 소비자가 비울 때까지 입력 스레드를 멈춤 (파일 재생)
    #[default]
    Block,
    /// 새 프레임을 버리고 카운터를 올림 (라이브 캡처)
    DropNewest,
}

impl OverflowPolicy {
    /// 입력 종류에 맞는 정책
    pub fn for_input(is_live: bool) -> Self {
        if is_live {
            Self::DropNewest
        } else {
            Self::Block
        }
    }
}

/// 파이프라인 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 프레임당 최대 레이어 수
    pub max_layers: usize,
    /// conntrack 해시 버킷 수
    pub conntrack_table_size: usize,
    /// 프로토콜이 유휴 시간을 정하지 않을 때의 기본값 (초)
    pub conntrack_default_timeout_secs: u64,
    /// 링 버퍼가 비었을 때 메인 스레드의 대기 시간 (초)
    pub poll_interval_secs: u64,
    /// 링 버퍼 용량 (프레임 수)
    pub ring_capacity: usize,
    /// 손상 패킷의 레이어 체인을 로그로 남길지 여부
    pub dump_invalid_packets: bool,
    /// IPv4 조각 그룹 만료 시간 (초)
    pub ipv4_frag_timeout_secs: u64,
    /// 재조립한 IPv4 헤더 체크섬 재계산 여부
    pub ipv4_fix_checksum: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_layers: 32,
            conntrack_table_size: 65535,
            conntrack_default_timeout_secs: 300,
            poll_interval_secs: 3,
            ring_capacity: 1000,
            dump_invalid_packets: true,
            ipv4_frag_timeout_secs: 60,
            ipv4_fix_checksum: true,
        }
    }
}

impl EngineConfig {
    /// core 설정에서 엔진 설정을 생성합니다.
    pub fn from_core(core: &FlowmaticConfig) -> Self {
        Self {
            max_layers: core.engine.max_layers,
            conntrack_table_size: core.engine.conntrack_table_size,
            conntrack_default_timeout_secs: core.engine.conntrack_default_timeout_secs,
            poll_interval_secs: core.engine.poll_interval_secs,
            ring_capacity: core.input.ring_capacity,
            dump_invalid_packets: core.engine.dump_invalid_packets,
            ipv4_frag_timeout_secs: core.helpers.ipv4_frag_timeout_secs,
            ipv4_fix_checksum: core.helpers.ipv4_fix_checksum,
        }
    }

    /// 메인 스레드 대기 시간
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), EngineError> {
        const MAX_LAYERS: usize = 256;
        const MAX_TABLE_SIZE: usize = 16 * 1024 * 1024;
        const MAX_RING_CAPACITY: usize = 1_000_000;

        if self.max_layers == 0 || self.max_layers > MAX_LAYERS {
            return Err(EngineError::Config {
                field: "max_layers".to_owned(),
                reason: format!("must be 1-{MAX_LAYERS}"),
            });
        }

        if self.conntrack_table_size == 0 || self.conntrack_table_size > MAX_TABLE_SIZE {
            return Err(EngineError::Config {
                field: "conntrack_table_size".to_owned(),
                reason: format!("must be 1-{MAX_TABLE_SIZE}"),
            });
        }

        if self.conntrack_default_timeout_secs == 0 {
            return Err(EngineError::Config {
                field: "conntrack_default_timeout_secs".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }

        if self.poll_interval_secs == 0 {
            return Err(EngineError::Config {
                field: "poll_interval_secs".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }

        if self.ring_capacity == 0 || self.ring_capacity > MAX_RING_CAPACITY {
            return Err(EngineError::Config {
                field: "ring_capacity".to_owned(),
                reason: format!("must be 1-{MAX_RING_CAPACITY}"),
            });
        }

        if self.ipv4_frag_timeout_secs == 0 {
            return Err(EngineError::Config {
                field: "ipv4_frag_timeout_secs".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }

        Ok(())
    }
}

/// 엔진 설정 빌더
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_layers(mut self, max_layers: usize) -> Self {
        self.config.max_layers = max_layers;
        self
    }

    /// conntrack 버킷 수를 설정합니다.
    pub fn conntrack_table_size(mut self, size: usize) -> Self {
        self.config.conntrack_table_size = size;
        self
    }

    pub fn conntrack_default_timeout_secs(mut self, secs: u64) -> Self {
        self.config.conntrack_default_timeout_secs = secs;
        self
    }

    pub fn poll_interval_secs(mut self, secs: u64) -> Self {
        self.config.poll_interval_secs = secs;
        self
    }

    pub fn ring_capacity(mut self, capacity: usize) -> Self {
        self.config.ring_capacity = capacity;
        self
    }

    pub fn dump_invalid_packets(mut self, dump: bool) -> Self {
        self.config.dump_invalid_packets = dump;
        self
    }

    /// IPv4 조각 만료 시간을 설정합니다.
    pub fn ipv4_frag_timeout_secs(mut self, secs: u64) -> Self {
        self.config.ipv4_frag_timeout_secs = secs;
        self
    }

    pub fn ipv4_fix_checksum(mut self, fix: bool) -> Self {
        self.config.ipv4_fix_checksum = fix;
        self
    }

    /// 설정을 검증하고 `EngineConfig`를 생성합니다.
    pub fn build(self) -> Result<EngineConfig, EngineError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
