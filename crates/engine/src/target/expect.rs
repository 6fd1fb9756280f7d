//! expect-reverse 타겟 -- 연결마다 반대 방향 기대 연결을 하나 등록합니다.
//!
//! 기대 연결 테이블을 끝까지 돌려보기 위한 진단용 타겟입니다.
//! 같은 연결에 두 번 등록하지 않도록 연결에 표시 상태를 붙입니다.

use crate::conntrack::{ConnectionState, CtFlags};
use crate::error::TargetError;
use crate::layer::Packet;

use super::{Target, TargetContext, TargetParams};

pub(crate) const KIND: &str = "expect-reverse";

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug)]
pub struct ExpectReverseTarget {
    timeout_secs: u64,
    registered: u64,
    matched: u64,
}

pub(crate) fn create(params: &TargetParams) -> Result<Box<dyn Target>, TargetError> {
    params.deny_unknown(KIND, &["timeout"])?;
    let timeout_secs = params.u64_or(KIND, "timeout", DEFAULT_TIMEOUT_SECS)?;
    if timeout_secs == 0 {
        return Err(TargetError::Failed {
            target: KIND.to_owned(),
            reason: "timeout must be greater than 0".to_owned(),
        });
    }
    Ok(Box::new(ExpectReverseTarget {
        timeout_secs,
        registered: 0,
        matched: 0,
    }))
}

/// 기대 연결을 이미 등록한 연결 표시
struct Expected;

impl ConnectionState for Expected {}

impl Target for ExpectReverseTarget {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn process(&mut self, cx: &mut TargetContext<'_, '_>, packet: &Packet<'_>) -> Result<(), TargetError> {
        if cx.ensure_entry(packet).is_none() {
            return Ok(());
        }
        if cx.has_state() {
            self.matched += 1;
            return Ok(());
        }
        if cx
            .expect(packet, CtFlags::REV, self.timeout_secs, None)
            .is_some()
        {
            self.registered += 1;
            cx.add_state(Box::new(Expected));
        }
        Ok(())
    }

    fn close(&mut self) {
        tracing::debug!(
            registered = self.registered,
            matched = self.matched,
            "expect-reverse target closed"
        );
    }
}
