//! TCP
//!
//! 흐름 식별: 양방향, (출발지 포트, 목적지 포트).
//! 유휴 만료는 TCP 상태(SYN, FIN/RST, ESTABLISHED 등)에 따라 달라집니다.

use std::any::Any;

use flowmatic_core::{Value, ValueKind};

use super::{be16, be32, header};
use crate::conntrack::hash::jhash_1word;
use crate::conntrack::{CtFlags, FlowContributor, FlowDirection};
use crate::error::IdentifyError;
use crate::layer::Layer;
use crate::registry::{FieldSpec, Next, Protocol};

pub const FIELD_SPORT: usize = 0;
pub const FIELD_DPORT: usize = 1;
pub const FIELD_FLAGS: usize = 2;
pub const FIELD_SEQ: usize = 3;
pub const FIELD_ACK: usize = 4;
pub const FIELD_WIN: usize = 5;

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_ACK: u8 = 0x10;

const MIN_HEADER_LEN: usize = 20;
const INITVAL: u32 = 0x84fa_0b2c;

// 상태별 유휴 만료 (초)
const SYN_SENT_TIMEOUT: u64 = 2 * 60;
const SYN_RECV_TIMEOUT: u64 = 60;
const LAST_ACK_TIMEOUT: u64 = 30;
const CLOSE_TIMEOUT: u64 = 2;
const ESTABLISHED_TIMEOUT: u64 = 2 * 60 * 60;

const FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "sport",
        kind: ValueKind::U16,
        description: "Source port",
    },
    FieldSpec {
        name: "dport",
        kind: ValueKind::U16,
        description: "Destination port",
    },
    FieldSpec {
        name: "flags",
        kind: ValueKind::U8,
        description: "Control flags",
    },
    FieldSpec {
        name: "seq",
        kind: ValueKind::U32,
        description: "Sequence number",
    },
    FieldSpec {
        name: "ack",
        kind: ValueKind::U32,
        description: "Acknowledgment number",
    },
    FieldSpec {
        name: "win",
        kind: ValueKind::U16,
        description: "Window size",
    },
];

pub struct Tcp;

impl Protocol for Tcp {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn identify(
        &self,
        data: &[u8],
        layer: &mut Layer,
        start: usize,
        len: usize,
    ) -> Result<Next, IdentifyError> {
        let hdr = header("tcp", data, start, len, MIN_HEADER_LEN)?;
        let hdr_len = usize::from(hdr[12] >> 4) * 4;
        if hdr_len < MIN_HEADER_LEN {
            return Err(IdentifyError::Invalid {
                proto: "tcp",
                reason: format!("data offset {hdr_len} below minimum"),
            });
        }
        if len < hdr_len || hdr.len() < hdr_len {
            return Err(IdentifyError::Truncated {
                proto: "tcp",
                need: hdr_len,
                have: hdr.len(),
            });
        }

        layer.set_payload(start + hdr_len, len - hdr_len);
        layer.set_field(FIELD_SPORT, Value::U16(be16(hdr, 0)));
        layer.set_field(FIELD_DPORT, Value::U16(be16(hdr, 2)));
        layer.set_field(FIELD_FLAGS, Value::U8(hdr[13]));
        layer.set_field(FIELD_SEQ, Value::U32(be32(hdr, 4)));
        layer.set_field(FIELD_ACK, Value::U32(be32(hdr, 8)));
        layer.set_field(FIELD_WIN, Value::U16(be16(hdr, 14)));

        Ok(Next::Undefined)
    }

    fn expectation_field(&self, field: usize, dir: CtFlags) -> Option<usize> {
        match (field, dir == CtFlags::REV) {
            (FIELD_SPORT, false) | (FIELD_DPORT, true) => Some(FIELD_SPORT),
            (FIELD_DPORT, false) | (FIELD_SPORT, true) => Some(FIELD_DPORT),
            _ => None,
        }
    }

    fn conntrack(&self) -> Option<&dyn FlowContributor> {
        Some(self)
    }
}

/// 연결 추적용 TCP 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    New,
    SynSent,
    SynRecv,
    Established,
    LastAck,
    Close,
}

impl TcpState {
    /// 제어 플래그를 보고 다음 상태와 유휴 만료 시간을 정합니다.
    pub fn advance(self, flags: u8) -> (TcpState, u64) {
        if flags & FLAG_SYN != 0 && flags & FLAG_ACK != 0 {
            (Self::SynRecv, SYN_RECV_TIMEOUT)
        } else if flags & FLAG_SYN != 0 {
            (Self::SynSent, SYN_SENT_TIMEOUT)
        } else if flags & (FLAG_RST | FLAG_FIN) != 0 {
            (Self::LastAck, LAST_ACK_TIMEOUT)
        } else if self == Self::LastAck && flags & FLAG_ACK != 0 {
            (Self::Close, CLOSE_TIMEOUT)
        } else if self == Self::Close {
            (Self::Close, CLOSE_TIMEOUT)
        } else {
            (Self::Established, ESTABLISHED_TIMEOUT)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TcpFlow {
    sport: u16,
    dport: u16,
    state: TcpState,
}

fn ports(data: &[u8], start: usize) -> (u16, u16) {
    (be16(data, start), be16(data, start + 2))
}

impl FlowContributor for Tcp {
    fn flags(&self) -> CtFlags {
        CtFlags::BOTH
    }

    fn hash(&self, data: &[u8], start: usize, dir: CtFlags) -> u32 {
        let (sport, dport) = ports(data, start);
        let (a, b) = if dir == CtFlags::REV {
            (dport, sport)
        } else {
            (sport, dport)
        };
        jhash_1word((u32::from(a) << 16) | u32::from(b), INITVAL)
    }

    fn doublecheck(&self, data: &[u8], start: usize, state: &(dyn Any + Send), dir: CtFlags) -> bool {
        let Some(flow) = state.downcast_ref::<TcpFlow>() else {
            return false;
        };
        let (sport, dport) = ports(data, start);
        if dir == CtFlags::REV {
            flow.sport == dport && flow.dport == sport
        } else {
            flow.sport == sport && flow.dport == dport
        }
    }

    fn alloc_state(&self, data: &[u8], start: usize) -> Box<dyn Any + Send> {
        let (sport, dport) = ports(data, start);
        Box::new(TcpFlow {
            sport,
            dport,
            state: TcpState::New,
        })
    }

    fn refresh(
        &self,
        data: &[u8],
        start: usize,
        state: &mut (dyn Any + Send),
        _dir: FlowDirection,
    ) -> Option<u64> {
        let flow = state.downcast_mut::<TcpFlow>()?;
        let flags = data.get(start + 13).copied()?;
        let (next, timeout) = flow.state.advance(flags);
        flow.state = next;
        Some(timeout)
    }
}
