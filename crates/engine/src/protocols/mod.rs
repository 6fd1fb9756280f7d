//! 내장 프로토콜 디코더
//!
//! 각 프로토콜은 [`Protocol`](crate::registry::Protocol)을 구현하고, 흐름 식별에
//! 참여하는 프로토콜은 [`FlowContributor`](crate::conntrack::FlowContributor)도 구현합니다.
//! 필드 ID는 모듈별 `FIELD_*` 상수입니다.

pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod udp;
pub mod vlan;

use crate::error::{IdentifyError, RegistryError};
use crate::registry::ProtocolRegistry;

pub use ethernet::Ethernet;
pub use icmp::Icmp;
pub use ipv4::Ipv4;
pub use ipv6::Ipv6;
pub use tcp::Tcp;
pub use udp::Udp;
pub use vlan::Vlan;

/// 내장 프로토콜을 모두 등록합니다.
pub fn register_builtin(registry: &ProtocolRegistry) -> Result<(), RegistryError> {
    registry.register(Box::new(Ethernet))?;
    registry.register(Box::new(Vlan))?;
    registry.register(Box::new(Ipv4))?;
    registry.register(Box::new(Ipv6))?;
    registry.register(Box::new(Tcp))?;
    registry.register(Box::new(Udp))?;
    registry.register(Box::new(Icmp))?;
    Ok(())
}

/// `data[start..start + len]`에서 최소 `need` 바이트짜리 헤더를 잘라냅니다.
pub(crate) fn header<'a>(
    proto: &'static str,
    data: &'a [u8],
    start: usize,
    len: usize,
    need: usize,
) -> Result<&'a [u8], IdentifyError> {
    let end = start.saturating_add(len).min(data.len());
    let avail = data.get(start..end).unwrap_or(&[]);
    if avail.len() < need {
        return Err(IdentifyError::Truncated {
            proto,
            need,
            have: avail.len(),
        });
    }
    Ok(avail)
}

pub(crate) fn be16(data: &[u8], off: usize) -> u16 {
    data.get(off..off + 2)
        .map_or(0, |b| u16::from_be_bytes([b[0], b[1]]))
}

pub(crate) fn be32(data: &[u8], off: usize) -> u32 {
    data.get(off..off + 4)
        .map_or(0, |b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}
