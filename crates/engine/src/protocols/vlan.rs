//! IEEE 802.1Q VLAN 태그

use flowmatic_core::{Value, ValueKind};

use super::ethernet::{ETHERTYPE_DEPS, next_for_ethertype};
use super::{be16, header};
use crate::error::IdentifyError;
use crate::layer::Layer;
use crate::registry::{FieldSpec, Next, Protocol};

pub const FIELD_VID: usize = 0;
pub const FIELD_TYPE: usize = 1;

const HEADER_LEN: usize = 4;

const FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "vid",
        kind: ValueKind::U16,
        description: "VLAN identifier",
    },
    FieldSpec {
        name: "type",
        kind: ValueKind::U16,
        description: "Encapsulated EtherType",
    },
];

pub struct Vlan;

impl Protocol for Vlan {
    fn name(&self) -> &'static str {
        "vlan"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn dependencies(&self) -> &'static [&'static str] {
        ETHERTYPE_DEPS
    }

    fn identify(
        &self,
        data: &[u8],
        layer: &mut Layer,
        start: usize,
        len: usize,
    ) -> Result<Next, IdentifyError> {
        let hdr = header("vlan", data, start, len, HEADER_LEN)?;
        let vid = be16(hdr, 0) & 0x0fff;
        let ethertype = be16(hdr, 2);

        layer.set_payload(start + HEADER_LEN, hdr.len() - HEADER_LEN);
        layer.set_field(FIELD_VID, Value::U16(vid));
        layer.set_field(FIELD_TYPE, Value::U16(ethertype));

        Ok(next_for_ethertype(ethertype))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerPool;
    use crate::registry::ProtoId;

    #[test]
    fn masks_priority_bits() {
        let data = [0xe0, 0x64, 0x08, 0x00, 0xaa, 0xbb];
        let mut pool = LayerPool::new(1);
        let id = pool.alloc(ProtoId::UNDEFINED, None).unwrap();
        let layer = pool.get_mut(id);

        let next = Vlan.identify(&data, layer, 0, data.len()).unwrap();
        assert_eq!(next, Next::Proto(0));
        assert_eq!(layer.field(FIELD_VID), Some(&Value::U16(100)));
        assert_eq!(layer.payload_size(), 2);
    }
}
