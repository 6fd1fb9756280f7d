//! log 타겟 -- 프레임마다 레이어 체인을 로그로 남깁니다.
//!
//! `conntrack: true`면 연결마다 방향별 패킷/바이트 수를 세고,
//! 연결이 파기될 때 합계를 한 번 더 남깁니다.

use std::time::Duration;

use crate::conntrack::{ConnectionState, EntryId, FlowDirection};
use crate::error::TargetError;
use crate::layer::Packet;

use super::{Target, TargetContext, TargetParams};

pub(crate) const KIND: &str = "log";

#[derive(Debug)]
pub struct LogTarget {
    prefix: String,
    conntrack: bool,
}

pub(crate) fn create(params: &TargetParams) -> Result<Box<dyn Target>, TargetError> {
    params.deny_unknown(KIND, &["conntrack", "prefix"])?;
    Ok(Box::new(LogTarget {
        prefix: params.str(KIND, "prefix")?.unwrap_or_else(|| KIND.to_owned()),
        conntrack: params.bool_or(KIND, "conntrack", false)?,
    }))
}

/// 연결 하나의 누적 통계
#[derive(Debug)]
struct FlowLog {
    prefix: String,
    first_seen: Duration,
    last_seen: Duration,
    packets: [u64; 2],
    bytes: [u64; 2],
}

impl FlowLog {
    fn record(&mut self, dir: FlowDirection, len: usize, now: Duration) {
        let slot = usize::from(dir == FlowDirection::Reverse);
        self.packets[slot] += 1;
        self.bytes[slot] += len as u64;
        self.last_seen = now;
    }
}

impl ConnectionState for FlowLog {
    fn cleanup(self: Box<Self>, entry: Option<EntryId>) {
        tracing::info!(
            prefix = %self.prefix,
            entry = ?entry,
            fwd_packets = self.packets[0],
            fwd_bytes = self.bytes[0],
            rev_packets = self.packets[1],
            rev_bytes = self.bytes[1],
            duration_secs = self.last_seen.saturating_sub(self.first_seen).as_secs(),
            "connection closed"
        );
    }
}

impl Target for LogTarget {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn process(&mut self, cx: &mut TargetContext<'_, '_>, packet: &Packet<'_>) -> Result<(), TargetError> {
        tracing::info!(
            prefix = %self.prefix,
            len = packet.data().len(),
            layers = %packet.describe(),
            "frame"
        );

        if !self.conntrack || cx.ensure_entry(packet).is_none() {
            return Ok(());
        }
        let dir = cx.direction().unwrap_or(FlowDirection::Forward);
        let (len, now) = (packet.data().len(), cx.now());
        if let Some(flow) = cx.state_mut::<FlowLog>() {
            flow.record(dir, len, now);
            return Ok(());
        }

        let mut flow = FlowLog {
            prefix: self.prefix.clone(),
            first_seen: now,
            last_seen: now,
            packets: [0; 2],
            bytes: [0; 2],
        };
        flow.record(dir, len, now);
        cx.add_state(Box::new(flow));
        Ok(())
    }
}
