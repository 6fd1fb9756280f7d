//! IPv6 (고정 헤더만, 확장 헤더는 다음 레이어를 undefined로 둠)

use std::any::Any;
use std::net::Ipv6Addr;

use flowmatic_core::{Value, ValueKind};

use super::{be16, header};
use crate::conntrack::hash::jhash_3words;
use crate::conntrack::{CtFlags, FlowContributor};
use crate::error::IdentifyError;
use crate::layer::Layer;
use crate::registry::{FieldSpec, Next, Protocol};

pub const FIELD_SRC: usize = 0;
pub const FIELD_DST: usize = 1;
pub const FIELD_HLIM: usize = 2;
pub const FIELD_NEXT_HDR: usize = 3;

const HEADER_LEN: usize = 40;
const INITVAL: u32 = 0x8529_fc6a;

const FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "src",
        kind: ValueKind::Ipv6,
        description: "Source address",
    },
    FieldSpec {
        name: "dst",
        kind: ValueKind::Ipv6,
        description: "Destination address",
    },
    FieldSpec {
        name: "hlim",
        kind: ValueKind::U8,
        description: "Hop limit",
    },
    FieldSpec {
        name: "next_hdr",
        kind: ValueKind::U8,
        description: "Next header",
    },
];

pub struct Ipv6;

fn addr(data: &[u8], off: usize) -> [u8; 16] {
    data.get(off..off + 16)
        .and_then(|b| b.try_into().ok())
        .unwrap_or([0; 16])
}

/// 주소 128비트를 32비트로 접습니다.
fn fold(a: &[u8; 16]) -> u32 {
    let w = |i: usize| u32::from_be_bytes([a[i], a[i + 1], a[i + 2], a[i + 3]]);
    jhash_3words(w(0), w(4), w(8) ^ w(12), INITVAL)
}

impl Protocol for Ipv6 {
    fn name(&self) -> &'static str {
        "ipv6"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["tcp", "udp"]
    }

    fn identify(
        &self,
        data: &[u8],
        layer: &mut Layer,
        start: usize,
        len: usize,
    ) -> Result<Next, IdentifyError> {
        let hdr = header("ipv6", data, start, len, HEADER_LEN)?;
        if hdr[0] >> 4 != 6 {
            return Err(IdentifyError::Invalid {
                proto: "ipv6",
                reason: format!("version {} is not 6", hdr[0] >> 4),
            });
        }
        let payload_len = usize::from(be16(hdr, 4));
        let next_hdr = hdr[6];

        layer.set_payload(start + HEADER_LEN, payload_len);
        layer.set_field(FIELD_SRC, Value::Ipv6(Ipv6Addr::from(addr(hdr, 8))));
        layer.set_field(FIELD_DST, Value::Ipv6(Ipv6Addr::from(addr(hdr, 24))));
        layer.set_field(FIELD_HLIM, Value::U8(hdr[7]));
        layer.set_field(FIELD_NEXT_HDR, Value::U8(next_hdr));

        Ok(match next_hdr {
            6 => Next::Proto(0),
            17 => Next::Proto(1),
            _ => Next::Undefined,
        })
    }

    fn expectation_field(&self, field: usize, dir: CtFlags) -> Option<usize> {
        match (field, dir == CtFlags::REV) {
            (FIELD_SRC, false) | (FIELD_DST, true) => Some(FIELD_SRC),
            (FIELD_DST, false) | (FIELD_SRC, true) => Some(FIELD_DST),
            _ => None,
        }
    }

    fn conntrack(&self) -> Option<&dyn FlowContributor> {
        Some(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ipv6Flow {
    src: [u8; 16],
    dst: [u8; 16],
}

impl FlowContributor for Ipv6 {
    fn flags(&self) -> CtFlags {
        CtFlags::BOTH
    }

    fn hash(&self, data: &[u8], start: usize, dir: CtFlags) -> u32 {
        let src = fold(&addr(data, start + 8));
        let dst = fold(&addr(data, start + 24));
        if dir == CtFlags::REV {
            jhash_3words(dst, src, 0, INITVAL)
        } else {
            jhash_3words(src, dst, 0, INITVAL)
        }
    }

    fn doublecheck(&self, data: &[u8], start: usize, state: &(dyn Any + Send), dir: CtFlags) -> bool {
        let Some(flow) = state.downcast_ref::<Ipv6Flow>() else {
            return false;
        };
        let src = addr(data, start + 8);
        let dst = addr(data, start + 24);
        if dir == CtFlags::REV {
            flow.src == dst && flow.dst == src
        } else {
            flow.src == src && flow.dst == dst
        }
    }

    fn alloc_state(&self, data: &[u8], start: usize) -> Box<dyn Any + Send> {
        Box::new(Ipv6Flow {
            src: addr(data, start + 8),
            dst: addr(data, start + 24),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerPool;
    use crate::registry::ProtoId;

    fn packet(next: u8, payload: u16) -> Vec<u8> {
        let mut h = vec![0x60, 0, 0, 0];
        h.extend_from_slice(&payload.to_be_bytes());
        h.extend_from_slice(&[next, 64]);
        h.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        h.extend_from_slice(&"2001:db8::1".parse::<Ipv6Addr>().unwrap().octets());
        h.resize(40 + usize::from(payload), 0);
        h
    }

    #[test]
    fn parses_fixed_header() {
        let data = packet(17, 8);
        let mut pool = LayerPool::new(1);
        let id = pool.alloc(ProtoId::UNDEFINED, None).unwrap();
        let next = Ipv6.identify(&data, pool.get_mut(id), 0, data.len()).unwrap();
        assert_eq!(next, Next::Proto(1));

        let layer = pool.get(id);
        assert_eq!(layer.payload_start(), 40);
        assert_eq!(layer.payload_size(), 8);
        assert_eq!(layer.field(FIELD_SRC), Some(&Value::Ipv6(Ipv6Addr::LOCALHOST)));
        assert_eq!(layer.field(FIELD_HLIM), Some(&Value::U8(64)));
    }

    #[test]
    fn reverse_hash_matches_swapped_packet() {
        let fwd = packet(6, 0);
        let mut rev = fwd.clone();
        rev[8..24].copy_from_slice(&fwd[24..40]);
        rev[24..40].copy_from_slice(&fwd[8..24]);
        assert_eq!(Ipv6.hash(&fwd, 0, CtFlags::REV), Ipv6.hash(&rev, 0, CtFlags::FWD));
        assert_ne!(Ipv6.hash(&fwd, 0, CtFlags::FWD), Ipv6.hash(&rev, 0, CtFlags::FWD));
    }

    #[test]
    fn expectation_mirrors_addresses() {
        assert_eq!(Ipv6.expectation_field(FIELD_SRC, CtFlags::REV), Some(FIELD_DST));
        assert_eq!(Ipv6.expectation_field(FIELD_DST, CtFlags::REV), Some(FIELD_SRC));
        assert_eq!(Ipv6.expectation_field(FIELD_DST, CtFlags::FWD), Some(FIELD_DST));
    }
}
