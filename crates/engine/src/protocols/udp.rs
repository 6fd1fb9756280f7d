//! UDP

use std::any::Any;

use flowmatic_core::{Value, ValueKind};

use super::{be16, header};
use crate::conntrack::hash::jhash_1word;
use crate::conntrack::{CtFlags, FlowContributor, FlowDirection};
use crate::error::IdentifyError;
use crate::layer::Layer;
use crate::registry::{FieldSpec, Next, Protocol};

pub const FIELD_SPORT: usize = 0;
pub const FIELD_DPORT: usize = 1;

const HEADER_LEN: usize = 8;
const INITVAL: u32 = 0x7513_adf4;
const IDLE_TIMEOUT: u64 = 180;

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
];

pub struct Udp;

impl Protocol for Udp {
    fn name(&self) -> &'static str {
        "udp"
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
        let hdr = header("udp", data, start, len, HEADER_LEN)?;
        let udp_len = usize::from(be16(hdr, 4));
        if udp_len < HEADER_LEN {
            return Err(IdentifyError::Invalid {
                proto: "udp",
                reason: format!("length {udp_len} below header size"),
            });
        }

        layer.set_payload(start + HEADER_LEN, udp_len - HEADER_LEN);
        layer.set_field(FIELD_SPORT, Value::U16(be16(hdr, 0)));
        layer.set_field(FIELD_DPORT, Value::U16(be16(hdr, 2)));

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

#[derive(Debug, Clone, Copy)]
struct UdpFlow {
    sport: u16,
    dport: u16,
}

fn ports(data: &[u8], start: usize) -> (u16, u16) {
    (be16(data, start), be16(data, start + 2))
}

impl FlowContributor for Udp {
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
        let Some(flow) = state.downcast_ref::<UdpFlow>() else {
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
        Box::new(UdpFlow { sport, dport })
    }

    fn refresh(&self, _: &[u8], _: usize, _: &mut (dyn Any + Send), _: FlowDirection) -> Option<u64> {
        Some(IDLE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerPool;
    use crate::registry::ProtoId;

    #[test]
    fn parses_datagram() {
        let data = [0x04, 0xd2, 0x00, 0x35, 0x00, 0x0c, 0x00, 0x00, 1, 2, 3, 4];
        let mut pool = LayerPool::new(1);
        let id = pool.alloc(ProtoId::UNDEFINED, None).unwrap();
        Udp.identify(&data, pool.get_mut(id), 0, data.len()).unwrap();

        let layer = pool.get(id);
        assert_eq!(layer.field(FIELD_SPORT), Some(&Value::U16(1234)));
        assert_eq!(layer.field(FIELD_DPORT), Some(&Value::U16(53)));
        assert_eq!(layer.payload_size(), 4);
    }

    #[test]
    fn length_below_header_is_invalid() {
        let data = [0, 1, 0, 2, 0, 4, 0, 0];
        let mut pool = LayerPool::new(1);
        let id = pool.alloc(ProtoId::UNDEFINED, None).unwrap();
        assert!(Udp.identify(&data, pool.get_mut(id), 0, data.len()).is_err());
    }

    #[test]
    fn idle_timeout_is_fixed() {
        let data = [0u8; 8];
        let mut state = Udp.alloc_state(&data, 0);
        assert_eq!(
            Udp.refresh(&data, 0, state.as_mut(), FlowDirection::Reverse),
            Some(180)
        );
    }
}
