//! 연결 엔트리와 서브시스템별 상태

use std::any::Any;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::registry::ProtoId;
use crate::target::TargetId;
use crate::timer::TimerId;

/// 엔트리 핸들 (아레나 인덱스 + 세대)
///
/// 엔트리가 파기되면 같은 슬롯이 재사용되어도 이전 핸들은 더 이상 유효하지 않습니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EntryId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// 마지막으로 매칭된 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowDirection {
    Forward,
    Reverse,
}

impl fmt::Display for FlowDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Reverse => write!(f, "reverse"),
        }
    }
}

impl FlowDirection {
    pub(crate) fn slot(self) -> usize {
        match self {
            Self::Forward => 0,
            Self::Reverse => 1,
        }
    }
}

/// 트레이트 객체를 구체 타입으로 되돌리기 위한 보조 trait
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// 헬퍼나 타겟이 연결에 붙이는 상태
pub trait ConnectionState: AsAny + Send {
    /// 아직 내보내지 않은 버퍼 데이터가 있으면 `true`. 연결 닫기가 미뤄집니다.
    fn flush(&mut self) -> bool {
        false
    }

    /// 엔트리 파기 시 호출됩니다. 연결에 붙기 전에 버려지는 상태(만료된 기대 연결)는 `None`.
    fn cleanup(self: Box<Self>, _entry: Option<EntryId>) {}
}

pub(crate) struct MatchState {
    pub(crate) proto: ProtoId,
    pub(crate) state: Box<dyn Any + Send>,
}

pub(crate) struct HelperState {
    pub(crate) proto: ProtoId,
    pub(crate) state: Box<dyn ConnectionState>,
}

pub(crate) struct TargetState {
    pub(crate) owner: TargetId,
    pub(crate) state: Box<dyn ConnectionState>,
}

/// 흐름 하나
pub struct ConntrackEntry {
    pub(crate) id: EntryId,
    pub(crate) hash: u32,
    pub(crate) fwd_bucket: usize,
    pub(crate) rev_bucket: usize,
    pub(crate) direction: FlowDirection,
    pub(crate) parent: Option<EntryId>,
    pub(crate) match_states: Vec<MatchState>,
    pub(crate) helper_states: Vec<HelperState>,
    pub(crate) target_states: Vec<TargetState>,
    pub(crate) timer: TimerId,
    pub(crate) timeout_secs: u64,
    pub(crate) created: Duration,
    pub(crate) last_seen: Duration,
    pub(crate) packets: [u64; 2],
    pub(crate) bytes: [u64; 2],
}

impl ConntrackEntry {
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// 정방향 전체 해시 (테이블 크기로 나누기 전)
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// 마지막으로 매칭된 방향
    pub fn direction(&self) -> FlowDirection {
        self.direction
    }

    /// 기대 연결로 생긴 자식 흐름이면 부모 엔트리
    pub fn parent(&self) -> Option<EntryId> {
        self.parent
    }

    /// 흐름 식별에 참여한 프로토콜 (바깥에서 안쪽 순)
    pub fn protocols(&self) -> impl Iterator<Item = ProtoId> + '_ {
        self.match_states.iter().map(|m| m.proto)
    }

    pub fn helper_state_count(&self) -> usize {
        self.helper_states.len()
    }

    pub fn target_state_count(&self) -> usize {
        self.target_states.len()
    }

    /// 현재 적용 중인 유휴 만료 시간 (초)
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    pub fn created(&self) -> Duration {
        self.created
    }

    pub fn last_seen(&self) -> Duration {
        self.last_seen
    }

    /// 방향별 패킷 수
    pub fn packets(&self, dir: FlowDirection) -> u64 {
        self.packets[dir.slot()]
    }

    /// 방향별 바이트 수
    pub fn bytes(&self, dir: FlowDirection) -> u64 {
        self.bytes[dir.slot()]
    }

    pub(crate) fn is_unreferenced(&self) -> bool {
        self.helper_states.is_empty() && self.target_states.is_empty()
    }
}

impl std::fmt::Debug for ConntrackEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConntrackEntry")
            .field("id", &self.id)
            .field("hash", &format_args!("{:#010x}", self.hash))
            .field("direction", &self.direction)
            .field("parent", &self.parent)
            .field("match_states", &self.match_states.len())
            .field("helper_states", &self.helper_states.len())
            .field("target_states", &self.target_states.len())
            .finish()
    }
}
