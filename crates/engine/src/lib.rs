#![doc = include_str!("../README.md")]
//!
//! # 모듈 구성
//!
//! - [`registry`]: 프로토콜 레지스트리 (작은 정수 ID, 참조 카운트)
//! - [`protocols`]: 내장 프로토콜 디코더 (ethernet, vlan, ipv4, ipv6, tcp, udp, icmp)
//! - [`layer`]: 프레임당 레이어 풀과 레이어 체인 뷰
//! - [`rule`]: 규칙 표현식 파서, 아레나 기반 규칙 트리, 평가기, YAML 로더
//! - [`conntrack`]: 양방향 흐름 테이블
//! - [`timer`]: 만료 시간 길이별 타이머 큐
//! - [`helper`]: 여러 패킷에 걸친 처리 (IPv4 조각 재조립)
//! - [`expectation`]: 타겟이 등록하는 기대 연결
//! - [`target`]: 매칭된 프레임을 소비하는 타겟
//! - [`input`]: 입력 소스와 입력/처리 스레드 사이의 링 버퍼
//! - [`engine`]: 프레임 처리 파이프라인과 관리 API
//! - [`runner`]: 입력 스레드 + 처리 루프
//! - [`param`]: 실행 중 조정 가능한 파라미터
//! - [`config`]: 엔진 설정 (core 설정에서 파생)
//! - [`error`]: 도메인 에러 타입

pub mod config;
pub mod conntrack;
pub mod engine;
pub mod error;
pub mod expectation;
pub mod frame;
pub mod helper;
pub mod input;
pub mod layer;
pub mod param;
pub mod protocols;
pub mod registry;
pub mod rule;
pub mod runner;
pub mod target;
pub mod timer;

mod identify;

// --- 주요 타입 re-export ---

// 엔진
pub use engine::{Engine, EngineStats, FrameOutcome};
pub use runner::{RunReport, Runner};

// 설정
pub use config::{EngineConfig, EngineConfigBuilder, OverflowPolicy};

// 에러
pub use error::{EngineError, HelperError, IdentifyError, InputError, RegistryError, TargetError};

// 프레임/레이어
pub use frame::{Frame, FrameOrigin};
pub use layer::{Layer, LayerId, LayerPool, Packet};

// 레지스트리
pub use registry::{FieldSpec, Next, ProtoId, Protocol, ProtocolInfo, ProtocolRegistry, ProtocolTable};

// 규칙
pub use rule::{RuleDefinition, RuleInfo, RuleList, RuleLoader, RuleTree, parse_expression};

// 연결 추적
pub use conntrack::{ConnectionState, ConntrackTable, CtFlags, EntryId, FlowDirection, FlowSummary};
pub use expectation::{ExpectationId, ExpectationSummary, ExpectationTable};
pub use timer::{TimerId, TimerOwner, TimerWheel};

// 헬퍼
pub use helper::{FlowContext, HelpVerdict, HelpRequest, Helper, HelperContext, Ipv4Reassembly};

// 타겟
pub use target::{Target, TargetContext, TargetId, TargetRegistry, TargetSpec, TargetStatus};

// 입력
pub use input::{FrameRing, Input, InputCaps, MemoryInput, PcapFileInput, ReadOutcome};

// 파라미터
pub use param::{ParamInfo, ParamSpec, ParamTable};
