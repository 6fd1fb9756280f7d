//! IPv4 (RFC 791)
//!
//! 흐름 식별: 양방향, (출발지, 목적지) 주소 쌍.
//! 기대 연결: 역방향에서 `src`와 `dst`를 서로 비교합니다.

use std::any::Any;
use std::net::Ipv4Addr;

use flowmatic_core::{Value, ValueKind};

use super::{be16, be32, header};
use crate::conntrack::hash::jhash_2words;
use crate::conntrack::{CtFlags, FlowContributor};
use crate::error::IdentifyError;
use crate::layer::Layer;
use crate::registry::{FieldSpec, Next, Protocol};

pub const FIELD_SRC: usize = 0;
pub const FIELD_DST: usize = 1;
pub const FIELD_TOS: usize = 2;
pub const FIELD_TTL: usize = 3;
pub const FIELD_PROTO: usize = 4;
pub const FIELD_ID: usize = 5;
pub const FIELD_FRAG_OFF: usize = 6;

/// 헤더 최소 길이
pub const MIN_HEADER_LEN: usize = 20;

/// 조각내지 않음 플래그
pub const FLAG_DONT_FRAGMENT: u16 = 0x4000;
/// 조각이 더 있음 플래그
pub const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
/// 13비트 조각 오프셋 (8바이트 단위)
pub const OFFSET_MASK: u16 = 0x1fff;

const INITVAL: u32 = 0x5fb8_3a0c;

const FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "src",
        kind: ValueKind::Ipv4,
        description: "Source address",
    },
    FieldSpec {
        name: "dst",
        kind: ValueKind::Ipv4,
        description: "Destination address",
    },
    FieldSpec {
        name: "tos",
        kind: ValueKind::U8,
        description: "Type of service",
    },
    FieldSpec {
        name: "ttl",
        kind: ValueKind::U8,
        description: "Time to live",
    },
    FieldSpec {
        name: "proto",
        kind: ValueKind::U8,
        description: "Payload protocol number",
    },
    FieldSpec {
        name: "id",
        kind: ValueKind::U16,
        description: "Identification",
    },
    FieldSpec {
        name: "frag_off",
        kind: ValueKind::U16,
        description: "Flags and fragment offset (raw 16-bit field)",
    },
];

/// 헤더 길이(바이트)
pub fn header_len(hdr: &[u8]) -> usize {
    usize::from(hdr.first().copied().unwrap_or(0) & 0x0f) * 4
}

/// RFC 1071 헤더 체크섬
pub fn checksum(hdr: &[u8]) -> u16 {
    let mut sum: u32 = hdr
        .chunks(2)
        .map(|c| u32::from(u16::from_be_bytes([c[0], c.get(1).copied().unwrap_or(0)])))
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// 체크섬 필드를 다시 계산해 씁니다.
pub fn fix_checksum(hdr: &mut [u8]) {
    if hdr.len() < MIN_HEADER_LEN {
        return;
    }
    hdr[10] = 0;
    hdr[11] = 0;
    let sum = checksum(hdr);
    hdr[10..12].copy_from_slice(&sum.to_be_bytes());
}

pub struct Ipv4;

impl Protocol for Ipv4 {
    fn name(&self) -> &'static str {
        "ipv4"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["icmp", "tcp", "udp", "ipv6"]
    }

    fn identify(
        &self,
        data: &[u8],
        layer: &mut Layer,
        start: usize,
        len: usize,
    ) -> Result<Next, IdentifyError> {
        let hdr = header("ipv4", data, start, len, MIN_HEADER_LEN)?;
        if hdr[0] >> 4 != 4 {
            return Err(IdentifyError::Invalid {
                proto: "ipv4",
                reason: format!("version {} is not 4", hdr[0] >> 4),
            });
        }
        let hdr_len = header_len(hdr);
        let total_len = usize::from(be16(hdr, 2));
        if hdr_len < MIN_HEADER_LEN || total_len < hdr_len {
            return Err(IdentifyError::Invalid {
                proto: "ipv4",
                reason: format!("header length {hdr_len}, total length {total_len}"),
            });
        }
        if hdr.len() < hdr_len {
            return Err(IdentifyError::Truncated {
                proto: "ipv4",
                need: hdr_len,
                have: hdr.len(),
            });
        }

        layer.set_payload(start + hdr_len, total_len - hdr_len);
        layer.set_field(FIELD_SRC, Value::Ipv4(Ipv4Addr::from(be32(hdr, 12))));
        layer.set_field(FIELD_DST, Value::Ipv4(Ipv4Addr::from(be32(hdr, 16))));
        layer.set_field(FIELD_TOS, Value::U8(hdr[1]));
        layer.set_field(FIELD_TTL, Value::U8(hdr[8]));
        layer.set_field(FIELD_PROTO, Value::U8(hdr[9]));
        layer.set_field(FIELD_ID, Value::U16(be16(hdr, 4)));
        let frag_off = be16(hdr, 6);
        layer.set_field(FIELD_FRAG_OFF, Value::U16(frag_off));

        // 첫 조각이 아니면 페이로드는 상위 헤더가 아님
        if frag_off & OFFSET_MASK != 0 {
            return Ok(Next::Undefined);
        }

        Ok(match hdr[9] {
            1 => Next::Proto(0),
            6 => Next::Proto(1),
            17 => Next::Proto(2),
            41 => Next::Proto(3),
            _ => Next::Undefined,
        })
    }

    fn expectation_field(&self, field: usize, dir: CtFlags) -> Option<usize> {
        match (field, dir == CtFlags::REV) {
            (FIELD_SRC, false) => Some(FIELD_SRC),
            (FIELD_DST, false) => Some(FIELD_DST),
            (FIELD_SRC, true) => Some(FIELD_DST),
            (FIELD_DST, true) => Some(FIELD_SRC),
            _ => None,
        }
    }

    fn conntrack(&self) -> Option<&dyn FlowContributor> {
        Some(self)
    }
}

/// 연결 엔트리에 저장하는 주소 쌍
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ipv4Flow {
    src: u32,
    dst: u32,
}

fn addrs(data: &[u8], start: usize) -> (u32, u32) {
    (be32(data, start + 12), be32(data, start + 16))
}

impl FlowContributor for Ipv4 {
    fn flags(&self) -> CtFlags {
        CtFlags::BOTH
    }

    fn hash(&self, data: &[u8], start: usize, dir: CtFlags) -> u32 {
        let (src, dst) = addrs(data, start);
        if dir == CtFlags::REV {
            jhash_2words(dst, src, INITVAL)
        } else {
            jhash_2words(src, dst, INITVAL)
        }
    }

    fn doublecheck(&self, data: &[u8], start: usize, state: &(dyn Any + Send), dir: CtFlags) -> bool {
        let Some(flow) = state.downcast_ref::<Ipv4Flow>() else {
            return false;
        };
        let (src, dst) = addrs(data, start);
        if dir == CtFlags::REV {
            flow.src == dst && flow.dst == src
        } else {
            flow.src == src && flow.dst == dst
        }
    }

    fn alloc_state(&self, data: &[u8], start: usize) -> Box<dyn Any + Send> {
        let (src, dst) = addrs(data, start);
        Box::new(Ipv4Flow { src, dst })
    }
}
