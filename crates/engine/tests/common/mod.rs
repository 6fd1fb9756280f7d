//! 통합 테스트 공용 도구 -- 패킷 바이트 빌더와 프레임을 모으는 타겟

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use flowmatic_engine::protocols::ipv4::fix_checksum;
use flowmatic_engine::target::TargetParams;
use flowmatic_engine::{
    Engine, EngineConfig, Frame, FrameOrigin, Packet, ProtocolRegistry, Target, TargetContext,
    TargetError, TargetRegistry, TargetSpec,
};

pub const IP_UDP: u8 = 17;
pub const IP_TCP: u8 = 6;

/// 이더넷 + IPv4 헤더를 붙입니다. `frag_off`는 16비트 원시 값입니다.
pub fn ipv4_packet(src: [u8; 4], dst: [u8; 4], proto: u8, id: u16, frag_off: u16, payload: &[u8]) -> Vec<u8> {
    let mut f = vec![0x02, 0, 0, 0, 0, 2, 0x02, 0, 0, 0, 0, 1, 0x08, 0x00];
    let total = u16::try_from(20 + payload.len()).unwrap();
    let mut ip = vec![0x45, 0];
    ip.extend_from_slice(&total.to_be_bytes());
    ip.extend_from_slice(&id.to_be_bytes());
    ip.extend_from_slice(&frag_off.to_be_bytes());
    ip.extend_from_slice(&[64, proto, 0, 0]);
    ip.extend_from_slice(&src);
    ip.extend_from_slice(&dst);
    fix_checksum(&mut ip);
    f.extend_from_slice(&ip);
    f.extend_from_slice(payload);
    f
}

pub fn udp_segment(sport: u16, dport: u16, data: &[u8]) -> Vec<u8> {
    let mut s = Vec::with_capacity(8 + data.len());
    s.extend_from_slice(&sport.to_be_bytes());
    s.extend_from_slice(&dport.to_be_bytes());
    s.extend_from_slice(&u16::try_from(8 + data.len()).unwrap().to_be_bytes());
    s.extend_from_slice(&[0, 0]);
    s.extend_from_slice(data);
    s
}

pub fn tcp_segment(sport: u16, dport: u16, flags: u8, data: &[u8]) -> Vec<u8> {
    let mut s = Vec::with_capacity(20 + data.len());
    s.extend_from_slice(&sport.to_be_bytes());
    s.extend_from_slice(&dport.to_be_bytes());
    s.extend_from_slice(&1u32.to_be_bytes());
    s.extend_from_slice(&0u32.to_be_bytes());
    s.extend_from_slice(&[0x50, flags]);
    s.extend_from_slice(&8192u16.to_be_bytes());
    s.extend_from_slice(&[0, 0, 0, 0]);
    s.extend_from_slice(data);
    s
}

pub fn udp_bytes(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, data: &[u8]) -> Vec<u8> {
    ipv4_packet(src, dst, IP_UDP, 0, 0, &udp_segment(sport, dport, data))
}

pub fn ethernet_frame(data: Vec<u8>, ts: u64) -> Frame {
    let registry = ProtocolRegistry::with_builtin().unwrap();
    Frame::new(data, Duration::from_secs(ts), registry.lookup("ethernet").unwrap())
}

/// IPv4 페이로드를 `cuts` 오프셋(8의 배수)에서 잘라 조각 프레임을 만듭니다.
pub fn fragment(src: [u8; 4], dst: [u8; 4], proto: u8, id: u16, payload: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut bounds = vec![0];
    bounds.extend_from_slice(cuts);
    bounds.push(payload.len());
    bounds
        .windows(2)
        .map(|w| {
            let (start, end) = (w[0], w[1]);
            assert_eq!(start % 8, 0, "fragment offsets must be multiples of 8");
            let more = if end < payload.len() { 0x2000 } else { 0 };
            let off = u16::try_from(start / 8).unwrap() | more;
            ipv4_packet(src, dst, proto, id, off, &payload[start..end])
        })
        .collect()
}

pub fn engine() -> Engine {
    Engine::new(EngineConfig::default()).unwrap()
}

// ─── capture 타겟 ────────────────────────────────────────────────

/// 캡처된 프레임 (출처, 바이트)
pub type Captured = Vec<(FrameOrigin, Vec<u8>)>;

static SINKS: LazyLock<Mutex<HashMap<u64, Arc<Mutex<Captured>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));
static NEXT_SINK: AtomicU64 = AtomicU64::new(1);

struct CaptureTarget {
    sink: Arc<Mutex<Captured>>,
}

impl Target for CaptureTarget {
    fn kind(&self) -> &'static str {
        "capture"
    }

    fn process(&mut self, _cx: &mut TargetContext<'_, '_>, packet: &Packet<'_>) -> Result<(), TargetError> {
        self.sink
            .lock()
            .unwrap()
            .push((packet.frame().origin(), packet.data().to_vec()));
        Ok(())
    }
}

fn create_capture(params: &TargetParams) -> Result<Box<dyn Target>, TargetError> {
    let key = params.u64_or("capture", "sink", 0)?;
    let sink = SINKS
        .lock()
        .unwrap()
        .get(&key)
        .cloned()
        .ok_or_else(|| TargetError::Failed {
            target: "capture".to_owned(),
            reason: format!("no sink {key}"),
        })?;
    Ok(Box::new(CaptureTarget { sink }))
}

/// capture 타겟이 등록된 엔진과, 그 타겟 선언을 만드는 도구
pub struct CaptureEngine {
    pub engine: Engine,
}

impl CaptureEngine {
    pub fn new(config: EngineConfig) -> Self {
        let protocols = Arc::new(ProtocolRegistry::with_builtin().unwrap());
        let targets = TargetRegistry::with_builtin();
        targets.register("capture", create_capture).unwrap();
        let engine = Engine::with_registries(config, protocols, Arc::new(targets)).unwrap();
        Self { engine }
    }

    /// 새 sink를 만들고 그 sink로 보내는 타겟 선언을 반환합니다.
    pub fn sink(&self) -> (TargetSpec, Arc<Mutex<Captured>>) {
        let key = NEXT_SINK.fetch_add(1, Ordering::Relaxed);
        let sink = Arc::new(Mutex::new(Vec::new()));
        SINKS.lock().unwrap().insert(key, Arc::clone(&sink));
        let mut spec = TargetSpec::new("capture");
        spec.params.set("sink", key);
        (spec, sink)
    }
}

/// 레거시 pcap 파일 바이트 (이더넷 링크, 마이크로초)
pub fn pcap_file(frames: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&65535u32.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    for (ts, data) in frames {
        let len = u32::try_from(data.len()).unwrap();
        out.extend_from_slice(&ts.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(data);
    }
    out
}
