//! ICMP (IPv4)

use flowmatic_core::{Value, ValueKind};

use super::header;
use crate::error::IdentifyError;
use crate::layer::Layer;
use crate::registry::{FieldSpec, Next, Protocol};

pub const FIELD_TYPE: usize = 0;
pub const FIELD_CODE: usize = 1;

const HEADER_LEN: usize = 8;

const FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "type",
        kind: ValueKind::U8,
        description: "Message type",
    },
    FieldSpec {
        name: "code",
        kind: ValueKind::U8,
        description: "Message code",
    },
];

pub struct Icmp;

impl Protocol for Icmp {
    fn name(&self) -> &'static str {
        "icmp"
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
        let hdr = header("icmp", data, start, len, HEADER_LEN)?;
        layer.set_payload(start + HEADER_LEN, len - HEADER_LEN);
        layer.set_field(FIELD_TYPE, Value::U8(hdr[0]));
        layer.set_field(FIELD_CODE, Value::U8(hdr[1]));
        Ok(Next::Undefined)
    }
}
