//! null 타겟 -- 프레임 수만 셉니다.

use crate::error::TargetError;
use crate::layer::Packet;

use super::{Target, TargetContext, TargetParams};

pub(crate) const KIND: &str = "null";

#[derive(Debug, Default)]
pub struct NullTarget {
    frames: u64,
    bytes: u64,
}

impl NullTarget {
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

pub(crate) fn create(params: &TargetParams) -> Result<Box<dyn Target>, TargetError> {
    params.deny_unknown(KIND, &[])?;
    Ok(Box::new(NullTarget::default()))
}

impl Target for NullTarget {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn process(&mut self, _cx: &mut TargetContext<'_, '_>, packet: &Packet<'_>) -> Result<(), TargetError> {
        self.frames += 1;
        self.bytes += packet.data().len() as u64;
        Ok(())
    }

    fn close(&mut self) {
        tracing::debug!(frames = self.frames, bytes = self.bytes, "null target closed");
    }
}
