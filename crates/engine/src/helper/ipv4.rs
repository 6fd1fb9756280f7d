//! IPv4 조각 재조립
//!
//! 그룹 상태: 버퍼 없음 -> 버퍼링 -> 완성(재주입) | 만료(폐기).
//!
//! 조각 그룹은 (출발지, 목적지, ID)로 찾습니다. 어떤 조각이 도착하든(중복 포함)
//! 그룹의 만료 타이머는 `ipv4.frag_timeout`초 뒤로 다시 설정됩니다.
//! 조각 목록은 오프셋 순으로 유지되며, 같은 오프셋의 조각은 중복으로 보고 버립니다.
//!
//! 완성된 프레임은 첫 조각 도착 시 복사해 둔 바깥 헤더(IPv4 헤더 포함) 뒤에
//! 조각 페이로드를 이어 붙여 만듭니다. IPv4 헤더의 ID와 조각 필드는 0으로,
//! 전체 길이는 새 길이로 바뀝니다.

use bytes::Bytes;
use flowmatic_core::ValueKind;
use flowmatic_core::metrics as m;

use super::{HelpRequest, HelpVerdict, Helper, HelperContext, OuterLayer};
use crate::error::HelperError;
use crate::param::ParamSpec;
use crate::protocols::ipv4::{
    FLAG_DONT_FRAGMENT, FLAG_MORE_FRAGMENTS, MIN_HEADER_LEN, OFFSET_MASK, fix_checksum, header_len,
};
use crate::protocols::{be16, be32};
use crate::registry::ProtoId;
use crate::timer::TimerId;

/// 조각 그룹 만료 시간 파라미터
pub const PARAM_FRAG_TIMEOUT: &str = "ipv4.frag_timeout";
/// 체크섬 재계산 파라미터
pub const PARAM_FIX_CHECKSUM: &str = "ipv4.fix_checksum";

const DEFAULT_FRAG_TIMEOUT: u64 = 60;

const PARAMS: &[ParamSpec] = &[
    ParamSpec {
        name: PARAM_FRAG_TIMEOUT,
        kind: ValueKind::U32,
        default: "60",
        description: "Seconds an incomplete fragment group is kept",
    },
    ParamSpec {
        name: PARAM_FIX_CHECKSUM,
        kind: ValueKind::Bool,
        default: "yes",
        description: "Recompute the IPv4 header checksum of reassembled packets",
    },
];

#[derive(Debug)]
struct Fragment {
    offset: usize,
    data: Bytes,
    last: bool,
}

impl Fragment {
    fn end(&self) -> usize {
        self.offset + self.data.len()
    }
}

#[derive(Debug)]
struct FragmentGroup {
    token: u64,
    src: u32,
    dst: u32,
    id: u16,
    /// 프레임 시작부터 IPv4 헤더 끝까지
    prefix: Vec<u8>,
    ip_start: usize,
    first_proto: ProtoId,
    outer: Vec<OuterLayer>,
    fragments: Vec<Fragment>,
    timer: TimerId,
}

impl FragmentGroup {
    /// 오프셋 순서로 끼워 넣습니다. 같은 오프셋이 이미 있으면 `false`.
    fn insert(&mut self, frag: Fragment) -> bool {
        let mut pos = self.fragments.len();
        for (i, cur) in self.fragments.iter().enumerate() {
            if cur.offset == frag.offset {
                return false;
            }
            if cur.offset > frag.offset {
                pos = i;
                break;
            }
        }
        self.fragments.insert(pos, frag);
        true
    }

    fn is_complete(&self) -> bool {
        let mut expected = 0;
        for frag in &self.fragments {
            if frag.offset != expected {
                return false;
            }
            if frag.last {
                return true;
            }
            expected = frag.end();
        }
        false
    }

    /// 마지막 조각까지의 페이로드 길이
    fn payload_len(&self) -> usize {
        let mut len = 0;
        for frag in &self.fragments {
            len += frag.data.len();
            if frag.last {
                break;
            }
        }
        len
    }
}

/// IPv4 조각 재조립 헬퍼
#[derive(Debug, Default)]
pub struct Ipv4Reassembly {
    groups: Vec<FragmentGroup>,
    next_token: u64,
}

impl Ipv4Reassembly {
    pub fn new() -> Self {
        Self::default()
    }

    fn frag_timeout(cx: &HelperContext<'_>) -> u64 {
        cx.param(PARAM_FRAG_TIMEOUT)
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_FRAG_TIMEOUT)
    }

    fn fix_checksum_enabled(cx: &HelperContext<'_>) -> bool {
        cx.param(PARAM_FIX_CHECKSUM)
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }

    /// 완성된 그룹으로 프레임을 만들어 재주입합니다.
    fn reassemble(&self, group: FragmentGroup, cx: &mut HelperContext<'_>, timestamp: std::time::Duration) {
        let payload_len = group.payload_len();
        let mut buf = Vec::with_capacity(group.prefix.len() + payload_len);
        buf.extend_from_slice(&group.prefix);
        for frag in &group.fragments {
            buf.extend_from_slice(&frag.data);
            if frag.last {
                break;
            }
        }

        let ip = group.ip_start;
        let ihl = header_len(&buf[ip..]);
        let total = ihl + payload_len;
        match u16::try_from(total) {
            Ok(total) => buf[ip + 2..ip + 4].copy_from_slice(&total.to_be_bytes()),
            Err(_) => {
                tracing::warn!(src = group.src, dst = group.dst, id = group.id, total, "reassembled packet exceeds 65535 bytes, dropped");
                return;
            }
        }
        buf[ip + 4..ip + 8].fill(0);
        if Self::fix_checksum_enabled(cx) {
            fix_checksum(&mut buf[ip..ip + ihl]);
        }

        for outer in &group.outer {
            let size = buf.len() - outer.payload_start;
            cx.resize(outer.proto, &mut buf, outer.start, size);
        }

        tracing::debug!(
            id = group.id,
            fragments = group.fragments.len(),
            len = buf.len(),
            "ipv4 fragments reassembled"
        );
        metrics::counter!(m::HELPER_FRAGMENTS_REASSEMBLED_TOTAL).increment(1);
        cx.reinject(crate::frame::Frame::reinjected(buf, timestamp, group.first_proto));
    }
}

impl Helper for Ipv4Reassembly {
    fn protocol(&self) -> &'static str {
        "ipv4"
    }

    fn params(&self) -> &'static [ParamSpec] {
        PARAMS
    }

    fn need_help(
        &mut self,
        cx: &mut HelperContext<'_>,
        req: &HelpRequest<'_>,
    ) -> Result<HelpVerdict, HelperError> {
        let malformed = |reason: String| HelperError::Malformed {
            helper: "ipv4",
            reason,
        };
        let data = req.frame().data();
        let start = req.start();
        let hdr = data
            .get(start..)
            .filter(|h| h.len() >= MIN_HEADER_LEN)
            .ok_or_else(|| malformed("header truncated".to_owned()))?;

        let frag_off = be16(hdr, 6);
        if frag_off & FLAG_DONT_FRAGMENT != 0 {
            return Ok(HelpVerdict::NoHelp);
        }
        if frag_off & FLAG_MORE_FRAGMENTS == 0 && frag_off & OFFSET_MASK == 0 {
            return Ok(HelpVerdict::NoHelp);
        }

        let ihl = header_len(hdr);
        let total = usize::from(be16(hdr, 2));
        if ihl < MIN_HEADER_LEN || total < ihl || total > req.len() || start + total > data.len() {
            return Err(malformed(format!(
                "fragment length {total} exceeds parent bounds {}",
                req.len()
            )));
        }

        let src = be32(hdr, 12);
        let dst = be32(hdr, 16);
        let id = be16(hdr, 4);
        let frag = Fragment {
            offset: usize::from(frag_off & OFFSET_MASK) * 8,
            data: req.frame().bytes().slice(start + ihl..start + total),
            last: frag_off & FLAG_MORE_FRAGMENTS == 0,
        };

        let idx = match self
            .groups
            .iter()
            .position(|g| g.src == src && g.dst == dst && g.id == id)
        {
            Some(idx) => idx,
            None => {
                let token = self.next_token;
                self.next_token += 1;
                self.groups.push(FragmentGroup {
                    token,
                    src,
                    dst,
                    id,
                    prefix: data[..start + ihl].to_vec(),
                    ip_start: start,
                    first_proto: req.frame().first_proto(),
                    outer: req.outer_layers(),
                    fragments: Vec::new(),
                    timer: cx.alloc_timer(token),
                });
                self.groups.len() - 1
            }
        };

        let timeout = Self::frag_timeout(cx);
        let group = &mut self.groups[idx];
        if let Err(e) = cx.requeue_timer(group.timer, timeout) {
            tracing::warn!(error = %e, "failed to queue fragment timer");
        }

        if !group.insert(frag) {
            tracing::trace!(id, "duplicate ipv4 fragment absorbed");
            return Ok(HelpVerdict::NeedsHelp);
        }

        if group.is_complete() {
            let group = self.groups.swap_remove(idx);
            cx.free_timer(group.timer);
            self.reassemble(group, cx, req.frame().timestamp());
        }
        Ok(HelpVerdict::NeedsHelp)
    }

    fn resize(&self, buf: &mut [u8], start: usize, payload_size: usize) {
        let Some(hdr) = buf.get_mut(start..) else {
            return;
        };
        let ihl = header_len(hdr);
        if ihl < MIN_HEADER_LEN || hdr.len() < ihl {
            return;
        }
        let Ok(total) = u16::try_from(ihl + payload_size) else {
            return;
        };
        hdr[2..4].copy_from_slice(&total.to_be_bytes());
        fix_checksum(&mut hdr[..ihl]);
    }

    fn on_timer(&mut self, token: u64, cx: &mut HelperContext<'_>) {
        let Some(idx) = self.groups.iter().position(|g| g.token == token) else {
            return;
        };
        let group = self.groups.swap_remove(idx);
        cx.free_timer(group.timer);
        tracing::debug!(
            id = group.id,
            fragments = group.fragments.len(),
            "incomplete ipv4 fragment group expired"
        );
        metrics::counter!(m::HELPER_FRAGMENT_GROUPS_EXPIRED_TOTAL).increment(1);
    }

    fn cleanup(&mut self, cx: &mut HelperContext<'_>) {
        for group in self.groups.drain(..) {
            cx.free_timer(group.timer);
        }
    }

    fn pending(&self) -> usize {
        self.groups.len()
    }
}
