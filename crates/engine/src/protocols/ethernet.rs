//! Ethernet II

use flowmatic_core::{MacAddr, Value, ValueKind};

use super::{be16, header};
use crate::error::IdentifyError;
use crate::layer::Layer;
use crate::registry::{FieldSpec, Next, Protocol};

pub const FIELD_SRC: usize = 0;
pub const FIELD_DST: usize = 1;
pub const FIELD_TYPE: usize = 2;

const HEADER_LEN: usize = 14;

const FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "src",
        kind: ValueKind::Mac,
        description: "Source MAC address",
    },
    FieldSpec {
        name: "dst",
        kind: ValueKind::Mac,
        description: "Destination MAC address",
    },
    FieldSpec {
        name: "type",
        kind: ValueKind::U16,
        description: "EtherType",
    },
];

/// EtherType → 다음 프로토콜 (의존성 목록 인덱스)
pub(crate) const ETHERTYPE_DEPS: &[&str] = &["ipv4", "ipv6", "vlan"];

pub(crate) fn next_for_ethertype(ethertype: u16) -> Next {
    match ethertype {
        0x0800 => Next::Proto(0),
        0x86dd => Next::Proto(1),
        0x8100 => Next::Proto(2),
        _ => Next::Undefined,
    }
}

pub struct Ethernet;

impl Protocol for Ethernet {
    fn name(&self) -> &'static str {
        "ethernet"
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
        let hdr = header("ethernet", data, start, len, HEADER_LEN)?;
        let dst = MacAddr::from_slice(&hdr[0..6]).unwrap_or_default();
        let src = MacAddr::from_slice(&hdr[6..12]).unwrap_or_default();
        let ethertype = be16(hdr, 12);

        layer.set_payload(start + HEADER_LEN, hdr.len() - HEADER_LEN);
        layer.set_field(FIELD_SRC, Value::Mac(src));
        layer.set_field(FIELD_DST, Value::Mac(dst));
        layer.set_field(FIELD_TYPE, Value::U16(ethertype));

        Ok(next_for_ethertype(ethertype))
    }
}
