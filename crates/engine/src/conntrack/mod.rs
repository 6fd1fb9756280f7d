//! 연결 추적 -- 프레임을 양방향 흐름 엔트리에 연결
//!
//! # 구조
//! - [`ConntrackTable`]: 엔트리 아레나 + 정방향/역방향 해시 버킷
//! - [`ConntrackEntry`]: 흐름 하나의 상태 (매치/헬퍼/타겟 상태 목록, 만료 타이머)
//! - [`FlowContributor`]: 프로토콜별 해시 기여, 충돌 재확인, 유휴 만료 계산
//!
//! # 수명
//! 엔트리는 헬퍼 상태와 타겟 상태가 **모두** 비었을 때 파기됩니다.
//! 이 검사는 상태를 제거할 때마다 실행됩니다. 유휴 타이머가 만료되면 먼저
//! 닫기를 시도하고, 헬퍼에 버퍼된 데이터가 없을 때만 파기합니다.

pub mod entry;
pub mod hash;
pub mod table;

use std::any::Any;

pub use entry::{AsAny, ConnectionState, ConntrackEntry, EntryId, FlowDirection};
pub use table::{ConntrackTable, FlowSummary};

/// 흐름 식별 방향 플래그
///
/// `NONE`은 방향 무관(한쪽 방향 해시), `FWD`/`REV`는 각 방향 해시에 기여함을 뜻합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CtFlags(u8);

impl CtFlags {
    pub const NONE: CtFlags = CtFlags(0);
    pub const FWD: CtFlags = CtFlags(1);
    pub const REV: CtFlags = CtFlags(2);
    pub const BOTH: CtFlags = CtFlags(3);

    pub fn intersects(self, other: CtFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// 이 플래그를 가진 프로토콜이 `dir` 방향 해시에 참여하는지
    pub fn contributes(self, dir: CtFlags) -> bool {
        dir == Self::NONE || self.intersects(dir)
    }
}

/// 흐름 식별에 참여하는 프로토콜의 연결 추적 함수
///
/// `start`는 해당 프로토콜 헤더의 시작 오프셋입니다. 레이어가 이미 식별된 뒤에만
/// 호출되므로 헤더 길이는 검증된 상태입니다.
pub trait FlowContributor: Send + Sync {
    /// 어느 방향 해시에 기여하는지
    fn flags(&self) -> CtFlags;

    /// `dir` 방향 관점의 해시 기여값
    fn hash(&self, data: &[u8], start: usize, dir: CtFlags) -> u32;

    /// 해시 충돌 재확인. 저장된 상태가 이 패킷의 `dir` 방향과 같은 흐름인지.
    fn doublecheck(&self, data: &[u8], start: usize, state: &(dyn Any + Send), dir: CtFlags)
    -> bool;

    /// 엔트리 생성 시 저장할 흐름 식별 상태
    fn alloc_state(&self, data: &[u8], start: usize) -> Box<dyn Any + Send>;

    /// 패킷을 본 뒤의 유휴 만료 시간 (초). `None`이면 엔진 기본값.
    fn refresh(
        &self,
        _data: &[u8],
        _start: usize,
        _state: &mut (dyn Any + Send),
        _dir: FlowDirection,
    ) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_direction_includes_every_contributor() {
        assert!(CtFlags::NONE.contributes(CtFlags::NONE));
        assert!(CtFlags::BOTH.contributes(CtFlags::NONE));
    }

    #[test]
    fn one_way_contributor_skips_directional_hashes() {
        assert!(!CtFlags::NONE.contributes(CtFlags::FWD));
        assert!(!CtFlags::NONE.contributes(CtFlags::REV));
        assert!(CtFlags::BOTH.contributes(CtFlags::REV));
        assert!(CtFlags::FWD.contributes(CtFlags::FWD));
        assert!(!CtFlags::FWD.contributes(CtFlags::REV));
    }
}
