//! flowmatic-engine 통합 테스트
//!
//! 공개 API만으로 프레임 처리 파이프라인 전체를 검증합니다.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use common::{CaptureEngine, IP_TCP, engine, ethernet_frame, ipv4_packet, pcap_file, tcp_segment, udp_bytes};
use flowmatic_engine::target::TargetParams;
use flowmatic_engine::{
    ConnectionState, EngineConfig, FlowContext, FrameOrigin, FrameOutcome, HelpRequest, HelpVerdict,
    Helper, HelperContext, HelperError, IdentifyError, Layer, MemoryInput, Next, Packet,
    PcapFileInput, Protocol, ProtocolRegistry, RuleDefinition, RuleLoader, Runner, Target,
    TargetContext, TargetError, TargetRegistry, TargetSpec, TargetStatus, parse_expression,
};

const CLIENT: [u8; 4] = [10, 0, 0, 1];
const SERVER: [u8; 4] = [10, 0, 0, 2];

// ─── 테스트용 프로토콜/타겟 ──────────────────────────────────────

/// 나머지 바이트를 모두 삼키고 `identify` 호출 횟수를 세는 프로토콜
struct Probe {
    calls: Arc<AtomicUsize>,
}

impl Protocol for Probe {
    fn name(&self) -> &'static str {
        "probe"
    }

    fn identify(&self, _data: &[u8], layer: &mut Layer, start: usize, len: usize) -> Result<Next, IdentifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        layer.set_payload(start + len, 0);
        Ok(Next::Undefined)
    }
}

/// 항상 식별에 실패하고 호출 횟수를 세는 프로토콜
struct Refuse {
    calls: Arc<AtomicUsize>,
}

impl Protocol for Refuse {
    fn name(&self) -> &'static str {
        "refuse"
    }

    fn identify(&self, _data: &[u8], _layer: &mut Layer, _start: usize, _len: usize) -> Result<Next, IdentifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(IdentifyError::Invalid {
            proto: "refuse",
            reason: "never matches".to_owned(),
        })
    }
}

struct Marker;

impl ConnectionState for Marker {}

/// 첫 패킷에 연결 상태를 붙이고, 다음 패킷에 떼어내는 타겟
struct Toggle;

impl Target for Toggle {
    fn kind(&self) -> &'static str {
        "toggle"
    }

    fn process(&mut self, cx: &mut TargetContext<'_, '_>, packet: &Packet<'_>) -> Result<(), TargetError> {
        if cx.has_state() {
            cx.remove_state();
        } else if cx.ensure_entry(packet).is_some() {
            cx.add_state(Box::new(Marker));
        }
        Ok(())
    }
}

/// 첫 패킷에 연결 상태를 붙이고 두 번째 패킷에서 실패하는 타겟
struct FailSecond {
    seen: u64,
}

impl Target for FailSecond {
    fn kind(&self) -> &'static str {
        "fail-second"
    }

    fn process(&mut self, cx: &mut TargetContext<'_, '_>, packet: &Packet<'_>) -> Result<(), TargetError> {
        self.seen += 1;
        if self.seen > 1 {
            return Err(TargetError::Failed {
                target: "fail-second".to_owned(),
                reason: "second packet".to_owned(),
            });
        }
        if cx.ensure_entry(packet).is_some() {
            cx.add_state(Box::new(Marker));
        }
        Ok(())
    }
}

static CLEANUPS: LazyLock<Mutex<usize>> = LazyLock::new(|| Mutex::new(0));

/// 파기될 때 횟수를 기록하는 상태
struct Counted;

impl ConnectionState for Counted {
    fn cleanup(self: Box<Self>, _entry: Option<flowmatic_engine::EntryId>) {
        *CLEANUPS.lock().unwrap() += 1;
    }
}

/// 모든 패킷에 `Counted` 상태를 보장하는 타겟
struct Attach;

impl Target for Attach {
    fn kind(&self) -> &'static str {
        "attach"
    }

    fn process(&mut self, cx: &mut TargetContext<'_, '_>, packet: &Packet<'_>) -> Result<(), TargetError> {
        if !cx.has_state() && cx.ensure_entry(packet).is_some() {
            cx.add_state(Box::new(Counted));
        }
        Ok(())
    }
}

static FLIPS: LazyLock<Mutex<Vec<String>>> = LazyLock::new(|| Mutex::new(Vec::new()));

/// `Toggle`과 같지만 붙이고 떼어낸 기록을 `label`로 남기는 타겟
struct Flip {
    label: String,
}

impl Target for Flip {
    fn kind(&self) -> &'static str {
        "flip"
    }

    fn process(&mut self, cx: &mut TargetContext<'_, '_>, packet: &Packet<'_>) -> Result<(), TargetError> {
        let action = if cx.has_state() {
            cx.remove_state();
            "remove"
        } else if cx.ensure_entry(packet).is_some() {
            cx.add_state(Box::new(Marker));
            "add"
        } else {
            return Ok(());
        };
        FLIPS.lock().unwrap().push(format!("{}:{action}", self.label));
        Ok(())
    }
}

/// 헬퍼가 연결에 붙이는 상태. `pending`이 켜져 있으면 버퍼 데이터가 남아 있음
struct Held {
    pending: Arc<AtomicBool>,
    cleanups: Arc<AtomicUsize>,
}

impl ConnectionState for Held {
    fn flush(&mut self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    fn cleanup(self: Box<Self>, _entry: Option<flowmatic_engine::EntryId>) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// udp 페이로드가 `hold`이면 연결에 상태를 붙이고 `release`이면 떼어내는 헬퍼
#[derive(Default)]
struct Hold {
    pending: Arc<AtomicBool>,
    cleanups: Arc<AtomicUsize>,
}

impl Helper for Hold {
    fn protocol(&self) -> &'static str {
        "udp"
    }

    fn need_help(&mut self, _cx: &mut HelperContext<'_>, _req: &HelpRequest<'_>) -> Result<HelpVerdict, HelperError> {
        Ok(HelpVerdict::NoHelp)
    }

    fn on_flow(&mut self, flow: &mut FlowContext<'_, '_>, packet: &Packet<'_>) {
        let Some(udp) = packet.find(flow.proto()) else {
            return;
        };
        let body = &packet.data()[udp.payload_start()..udp.payload_start() + udp.payload_size()];
        match body {
            b"hold" => {
                if flow.ensure_entry(packet).is_some() {
                    flow.add_state(Box::new(Held {
                        pending: Arc::clone(&self.pending),
                        cleanups: Arc::clone(&self.cleanups),
                    }));
                }
            }
            b"release" => {
                if let Some(state) = flow.remove_state() {
                    state.cleanup(None);
                }
            }
            _ => {}
        }
    }
}

fn create_flip(params: &TargetParams) -> Result<Box<dyn Target>, TargetError> {
    let label = params.str("flip", "label")?.unwrap_or_default();
    Ok(Box::new(Flip { label }))
}

fn create_toggle(_: &TargetParams) -> Result<Box<dyn Target>, TargetError> {
    Ok(Box::new(Toggle))
}

fn create_fail_second(_: &TargetParams) -> Result<Box<dyn Target>, TargetError> {
    Ok(Box::new(FailSecond { seen: 0 }))
}

fn create_attach(_: &TargetParams) -> Result<Box<dyn Target>, TargetError> {
    Ok(Box::new(Attach))
}

fn custom_targets() -> Arc<TargetRegistry> {
    let targets = TargetRegistry::with_builtin();
    targets.register("toggle", create_toggle).unwrap();
    targets.register("fail-second", create_fail_second).unwrap();
    targets.register("attach", create_attach).unwrap();
    targets.register("flip", create_flip).unwrap();
    Arc::new(targets)
}

fn custom_engine() -> flowmatic_engine::Engine {
    let protocols = Arc::new(ProtocolRegistry::with_builtin().unwrap());
    flowmatic_engine::Engine::with_registries(EngineConfig::default(), protocols, custom_targets()).unwrap()
}

fn log_conntrack() -> TargetSpec {
    let mut spec = TargetSpec::new("log");
    spec.params.set("conntrack", true);
    spec
}

// ─── 파이프라인 ──────────────────────────────────────────────────

#[test]
fn test_first_matching_frame_reaches_targets_in_rule_order() {
    let ce = CaptureEngine::new(EngineConfig::default());
    let (first, first_sink) = ce.sink();
    let (second, second_sink) = ce.sink();
    ce.engine
        .add_rule(&RuleDefinition::new("dns", "ethernet | ipv4 | udp.dport == 53").with_target(first))
        .unwrap();
    ce.engine
        .add_rule(&RuleDefinition::new("web", "ethernet | ipv4 | tcp.dport == 80").with_target(second))
        .unwrap();

    let dns = udp_bytes(CLIENT, SERVER, 5353, 53, b"query");
    let web = ipv4_packet(CLIENT, SERVER, IP_TCP, 7, 0, &tcp_segment(40000, 80, 0x02, &[]));
    assert_eq!(ce.engine.process_frame(ethernet_frame(dns.clone(), 1)), FrameOutcome::Processed);
    assert_eq!(ce.engine.process_frame(ethernet_frame(web.clone(), 2)), FrameOutcome::Processed);

    let first = first_sink.lock().unwrap();
    assert_eq!(first.as_slice(), &[(FrameOrigin::Input, dns)]);
    let second = second_sink.lock().unwrap();
    assert_eq!(second.as_slice(), &[(FrameOrigin::Input, web)]);
}

#[test]
fn test_frames_without_matching_rule_are_still_processed() {
    let engine = engine();
    engine
        .add_rule(&RuleDefinition::new("tcp", "ethernet | ipv4 | tcp"))
        .unwrap();
    let outcome = engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 1, 2, &[]), 1));
    assert_eq!(outcome, FrameOutcome::Processed);
    assert_eq!(engine.list_rules()[0].packets, 0);
    assert_eq!(engine.stats().frames_processed, 1);
}

#[test]
fn test_rule_with_unknown_protocol_is_rejected() {
    let engine = engine();
    assert!(engine.add_rule(&RuleDefinition::new("bad", "ethernet | sctp")).is_err());
    assert!(engine.list_rules().is_empty());
    let eth = engine.protocols().lookup("ethernet").unwrap();
    assert_eq!(engine.protocols().read().refcount(eth), 0);
}

// ─── 지연 식별 ───────────────────────────────────────────────────

#[test]
fn test_lazy_identification_runs_once_per_layer() {
    let engine = engine();
    let calls = Arc::new(AtomicUsize::new(0));
    engine
        .register_protocol(Box::new(Probe { calls: Arc::clone(&calls) }))
        .unwrap();
    engine
        .add_rule(&RuleDefinition::new("probe", "ethernet | ipv4 | udp | probe"))
        .unwrap();
    engine
        .add_rule(&RuleDefinition::new("not-probe", "ethernet | ipv4 | udp | not probe"))
        .unwrap();

    engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 1000, 9, b"opaque"), 1));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let rules = engine.list_rules();
    assert_eq!(rules[0].packets, 1);
    assert_eq!(rules[1].packets, 0);
}

#[test]
fn test_truncated_first_layer_matches_no_rule_regardless_of_order() {
    // ethernet 헤더보다 짧지만 udp 헤더로는 읽힐 수 있는 프레임
    let truncated = vec![0x30, 0x39, 0x00, 0x35, 0x00, 0x0a, 0, 0, 1, 2];

    let alone = engine();
    let udp = alone.add_rule(&RuleDefinition::new("udp", "udp")).unwrap();
    alone.process_frame(ethernet_frame(truncated.clone(), 1));

    let ordered = engine();
    let eth = ordered.add_rule(&RuleDefinition::new("eth", "ethernet")).unwrap();
    let udp_after = ordered.add_rule(&RuleDefinition::new("udp", "udp")).unwrap();
    ordered.process_frame(ethernet_frame(truncated, 1));

    assert_eq!(alone.rules().get(udp).unwrap().packets, 0);
    assert_eq!(ordered.rules().get(eth).unwrap().packets, 0);
    assert_eq!(ordered.rules().get(udp_after).unwrap().packets, 0);
}

#[test]
fn test_failed_candidate_is_identified_once_per_frame() {
    let engine = engine();
    let calls = Arc::new(AtomicUsize::new(0));
    engine
        .register_protocol(Box::new(Refuse { calls: Arc::clone(&calls) }))
        .unwrap();
    for name in ["first", "second", "third"] {
        engine
            .add_rule(&RuleDefinition::new(name, "ethernet | ipv4 | udp | refuse"))
            .unwrap();
    }

    engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 1000, 9, b"opaque"), 1));

    // 세 규칙이 같은 레이어를 보지만 실패한 후보는 한 번만 식별됨
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(engine.list_rules().iter().all(|r| r.packets == 0));
}

#[test]
fn test_branches_of_different_depth_continue_from_their_own_layer() {
    let engine = engine();
    let calls = Arc::new(AtomicUsize::new(0));
    engine
        .register_protocol(Box::new(Probe { calls: Arc::clone(&calls) }))
        .unwrap();
    let hit = engine
        .add_rule(&RuleDefinition::new("hit", "ethernet | (ipv6 or ipv4 | udp) | probe"))
        .unwrap();
    let miss = engine
        .add_rule(&RuleDefinition::new("miss", "ethernet | (ipv6 or ipv4 | udp) | udp"))
        .unwrap();
    let short = engine
        .add_rule(&RuleDefinition::new("short", "ethernet | (ipv6 or ipv4 | udp) | probe | probe"))
        .unwrap();

    engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 1000, 9, b"opaque"), 1));

    assert_eq!(engine.rules().get(hit).unwrap().packets, 1);
    assert_eq!(engine.rules().get(miss).unwrap().packets, 0);
    assert_eq!(engine.rules().get(short).unwrap().packets, 0);
}

#[test]
fn test_destroying_a_tree_releases_every_protocol() {
    let registry = ProtocolRegistry::with_builtin().unwrap();
    let protocols = registry.read();
    let tree = parse_expression("r", "ethernet | ipv4 and (tcp or udp) | not icmp", &protocols).unwrap();
    let ids = tree.protocols();
    assert!(ids.iter().all(|id| protocols.refcount(*id) > 0));

    let visited = tree.visit(|_, _| {});
    assert_eq!(tree.destroy(&protocols), visited);
    for name in ["ethernet", "ipv4", "tcp", "udp", "icmp"] {
        let id = protocols.lookup(name).unwrap();
        assert_eq!(protocols.refcount(id), 0, "{name} still referenced");
    }
}

// ─── 연결 추적 ───────────────────────────────────────────────────

#[test]
fn test_both_directions_share_one_connection() {
    let engine = engine();
    engine
        .add_rule(&RuleDefinition::new("tcp", "ethernet | ipv4 | tcp").with_target(log_conntrack()))
        .unwrap();

    let syn = ipv4_packet(CLIENT, SERVER, IP_TCP, 1, 0, &tcp_segment(40000, 80, 0x02, &[]));
    let syn_ack = ipv4_packet(SERVER, CLIENT, IP_TCP, 2, 0, &tcp_segment(80, 40000, 0x12, &[]));
    let ack = ipv4_packet(CLIENT, SERVER, IP_TCP, 3, 0, &tcp_segment(40000, 80, 0x10, b"GET /"));
    engine.process_frame(ethernet_frame(syn, 1));
    engine.process_frame(ethernet_frame(syn_ack, 2));
    engine.process_frame(ethernet_frame(ack, 3));

    let flows = engine.flows();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].packets, [2, 1]);
    assert!(flows[0].protocols.contains(&"tcp"));

    // 다른 포트는 다른 연결
    let other = ipv4_packet(CLIENT, SERVER, IP_TCP, 4, 0, &tcp_segment(40001, 80, 0x02, &[]));
    engine.process_frame(ethernet_frame(other, 4));
    assert_eq!(engine.flows().len(), 2);
}

#[test]
fn test_connection_is_destroyed_when_last_state_is_removed() {
    let engine = custom_engine();
    engine
        .add_rule(&RuleDefinition::new("udp", "ethernet | ipv4 | udp").with_target(TargetSpec::new("toggle")))
        .unwrap();

    engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 1000, 53, &[]), 1));
    assert_eq!(engine.stats().conntrack_entries, 1);

    engine.process_frame(ethernet_frame(udp_bytes(SERVER, CLIENT, 53, 1000, &[]), 2));
    assert_eq!(engine.stats().conntrack_entries, 0);

    engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 1000, 53, &[]), 3));
    assert_eq!(engine.stats().conntrack_entries, 1);
}

#[test]
fn test_state_removal_past_the_head_unlinks_only_that_state() {
    let engine = custom_engine();
    let flip = |label: &str| {
        let mut spec = TargetSpec::new("flip");
        spec.params.set("label", label);
        spec
    };
    engine
        .add_rule(
            &RuleDefinition::new("udp", "ethernet | ipv4 | udp")
                .with_target(log_conntrack())
                .with_target(flip("unlink-mid"))
                .with_target(flip("unlink-tail")),
        )
        .unwrap();

    for ts in 1..=3 {
        engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 1000, 53, &[]), ts));
    }

    // 두 번째, 세 번째 상태가 각자 정확히 떼어져야 다음 패킷에서 다시 붙음
    let flips: Vec<String> = FLIPS
        .lock()
        .unwrap()
        .iter()
        .filter(|f| f.starts_with("unlink-"))
        .cloned()
        .collect();
    assert_eq!(
        flips,
        [
            "unlink-mid:add",
            "unlink-tail:add",
            "unlink-mid:remove",
            "unlink-tail:remove",
            "unlink-mid:add",
            "unlink-tail:add",
        ]
    );
    // 로그 타겟의 상태가 남아 있으므로 연결은 유지
    assert_eq!(engine.stats().conntrack_entries, 1);
}

#[test]
fn test_helper_state_keeps_connection_after_target_state_is_removed() {
    let engine = custom_engine();
    let hold = Hold::default();
    let cleanups = Arc::clone(&hold.cleanups);
    engine.register_helper(Box::new(hold)).unwrap();
    engine
        .add_rule(
            &RuleDefinition::new("client", "ethernet | ipv4 | udp.sport == 1000")
                .with_target(TargetSpec::new("toggle")),
        )
        .unwrap();

    // 헬퍼 상태와 타겟 상태가 함께 붙음
    engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 1000, 53, b"hold"), 1));
    assert_eq!(engine.stats().conntrack_entries, 1);

    // 타겟 상태만 떨어져도 헬퍼 상태가 남아 있으므로 연결 유지
    engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 1000, 53, b"data"), 2));
    assert_eq!(engine.stats().conntrack_entries, 1);

    // 역방향 패킷은 규칙에 맞지 않음. 헬퍼 상태가 떨어지면 연결 파기
    engine.process_frame(ethernet_frame(udp_bytes(SERVER, CLIENT, 53, 1000, b"release"), 3));
    assert_eq!(engine.stats().conntrack_entries, 0);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[test]
fn test_expiry_waits_for_buffered_helper_data() {
    let engine = engine();
    let hold = Hold::default();
    let (pending, cleanups) = (Arc::clone(&hold.pending), Arc::clone(&hold.cleanups));
    pending.store(true, Ordering::SeqCst);
    engine.register_helper(Box::new(hold)).unwrap();

    engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 1000, 53, b"hold"), 1));
    let flows = engine.flows();
    assert_eq!(flows.len(), 1);
    let idle = Duration::from_secs(flows[0].timeout_secs);

    // 유휴 시간이 지났지만 버퍼가 남아 있어 닫지 않고 다시 대기
    let first_expiry = Duration::from_secs(2) + idle;
    assert_eq!(engine.process_timers(first_expiry), 1);
    assert_eq!(engine.stats().conntrack_entries, 1);
    assert_eq!(cleanups.load(Ordering::SeqCst), 0);
    assert_eq!(engine.process_timers(first_expiry + idle / 2), 0);

    pending.store(false, Ordering::SeqCst);
    assert_eq!(engine.process_timers(first_expiry + idle + Duration::from_secs(1)), 1);
    assert_eq!(engine.stats().conntrack_entries, 0);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unregistering_a_helper_drops_its_connection_state() {
    let engine = engine();
    let hold = Hold::default();
    let cleanups = Arc::clone(&hold.cleanups);
    engine.register_helper(Box::new(hold)).unwrap();

    engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 1000, 53, b"hold"), 1));
    assert_eq!(engine.stats().conntrack_entries, 1);

    engine.unregister_helper("udp").unwrap();
    assert_eq!(engine.stats().conntrack_entries, 0);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    let udp = engine.protocols().lookup("udp").unwrap();
    assert_eq!(engine.protocols().read().refcount(udp), 0);
}

#[test]
fn test_failed_target_is_closed_and_its_state_released() {
    let engine = custom_engine();
    let id = engine
        .add_rule(
            &RuleDefinition::new("udp", "ethernet | ipv4 | udp").with_target(TargetSpec::new("fail-second")),
        )
        .unwrap();

    engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 1000, 53, &[]), 1));
    assert_eq!(engine.stats().conntrack_entries, 1);

    engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 1000, 53, &[]), 2));
    let info = engine.rules().get(id).unwrap();
    assert_eq!(info.targets[0].status, TargetStatus::Failed);
    assert_eq!(info.targets[0].errors, 1);
    assert_eq!(engine.stats().conntrack_entries, 0);

    // 닫힌 타겟은 더 이상 프레임을 받지 않음
    engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 1000, 53, &[]), 3));
    assert_eq!(engine.rules().get(id).unwrap().targets[0].errors, 1);
    assert_eq!(engine.stats().conntrack_entries, 0);
}

#[test]
fn test_expired_connections_clean_up_their_state() {
    let engine = custom_engine();
    engine
        .add_rule(&RuleDefinition::new("udp", "ethernet | ipv4 | udp").with_target(TargetSpec::new("attach")))
        .unwrap();
    let before = *CLEANUPS.lock().unwrap();

    engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 1000, 53, &[]), 100));
    engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 1001, 53, &[]), 150));
    assert_eq!(engine.stats().conntrack_entries, 2);

    // 첫 연결만 유휴 시간(180초)을 넘김
    engine.process_timers(Duration::from_secs(300));
    assert_eq!(engine.stats().conntrack_entries, 1);
    assert_eq!(*CLEANUPS.lock().unwrap() - before, 1);

    engine.shutdown();
    assert_eq!(engine.stats().conntrack_entries, 0);
    assert_eq!(*CLEANUPS.lock().unwrap() - before, 2);
}

#[test]
fn test_only_the_mirrored_packet_consumes_an_expectation() {
    let engine = engine();
    let mut expect = TargetSpec::new("expect-reverse");
    expect.params.set("timeout", 30u64);
    let id = engine
        .add_rule(&RuleDefinition::new("fwd", "ethernet | ipv4.src == 10.0.0.1 | udp").with_target(expect))
        .unwrap();

    engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 4000, 69, &[]), 1));
    assert_eq!(engine.expectations().len(), 1);

    // 다른 원본 포트는 기대 연결과 맞지 않음
    engine.process_frame(ethernet_frame(udp_bytes(SERVER, CLIENT, 3000, 4000, &[]), 2));
    assert_eq!(engine.expectations().len(), 1);
    assert_eq!(engine.rules().get(id).unwrap().targets[0].processed, 1);

    engine.process_frame(ethernet_frame(udp_bytes(SERVER, CLIENT, 69, 4000, &[]), 3));
    assert!(engine.expectations().is_empty());
    assert_eq!(engine.rules().get(id).unwrap().targets[0].processed, 2);
    let flows = engine.flows();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].packets, [1, 1]);
}

#[test]
fn test_unused_expectation_times_out() {
    let engine = engine();
    let mut expect = TargetSpec::new("expect-reverse");
    expect.params.set("timeout", 5u64);
    engine
        .add_rule(&RuleDefinition::new("fwd", "ethernet | ipv4 | udp").with_target(expect))
        .unwrap();

    engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 4000, 69, &[]), 10));
    assert_eq!(engine.stats().expectations, 1);
    engine.process_timers(Duration::from_secs(12));
    assert_eq!(engine.stats().expectations, 1);
    engine.process_timers(Duration::from_secs(16));
    assert_eq!(engine.stats().expectations, 0);
}

// ─── 입력 / 규칙 파일 ────────────────────────────────────────────

#[test]
fn test_runner_replays_pcap_file() {
    let frames: Vec<(u32, Vec<u8>)> = (0..5u16)
        .map(|i| (u32::from(i) + 1, udp_bytes(CLIENT, SERVER, 2000 + i, 53, b"q")))
        .collect();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dns.pcap");
    std::fs::write(&path, pcap_file(&frames)).unwrap();

    let engine = Arc::new(engine());
    let id = engine
        .add_rule(&RuleDefinition::new("dns", "ethernet | ipv4 | udp.dport == 53"))
        .unwrap();
    let report = Runner::new(Arc::clone(&engine))
        .run(Box::new(PcapFileInput::new(&path, 65535)))
        .unwrap();

    assert_eq!(report.frames_read, 5);
    assert_eq!(report.stats.frames_processed, 5);
    assert_eq!(engine.rules().get(id).unwrap().packets, 5);
    assert_eq!(engine.now(), Duration::from_secs(5));
}

#[test]
fn test_runner_expires_connections_while_replaying() {
    let engine = Arc::new(engine());
    engine
        .add_rule(&RuleDefinition::new("udp", "ethernet | ipv4 | udp").with_target(log_conntrack()))
        .unwrap();
    let input = MemoryInput::new("ethernet")
        .with_frame(Duration::from_secs(1), udp_bytes(CLIENT, SERVER, 1, 53, &[]))
        .with_frame(Duration::from_secs(500), udp_bytes(CLIENT, SERVER, 2, 53, &[]));

    let report = Runner::new(Arc::clone(&engine)).run(Box::new(input)).unwrap();
    assert_eq!(report.frames_read, 2);
    // 재생 시각이 첫 연결의 유휴 시간을 넘겼으므로 두 번째 연결만 남음
    assert_eq!(report.stats.conntrack_entries, 1);
}

#[tokio::test]
async fn test_rules_loaded_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(
        dir.path().join("dns.yml"),
        r#"
id: dns
description: DNS queries
match: "ethernet | ipv4 | udp.dport == 53"
targets:
  - type: log
    params:
      conntrack: true
"#,
    )
    .await
    .unwrap();
    tokio::fs::write(
        dir.path().join("web.yaml"),
        r#"
id: web
enabled: false
match: "ethernet | ipv4 | tcp.dport == 80"
"#,
    )
    .await
    .unwrap();
    tokio::fs::write(dir.path().join("notes.txt"), "not a rule").await.unwrap();

    let defs = RuleLoader::load_directory(dir.path()).await.unwrap();
    assert_eq!(defs.len(), 2);

    let engine = engine();
    assert_eq!(engine.add_rules(&defs), 2);
    let dns = engine.rules().lookup("dns").unwrap();
    let web = engine.rules().lookup("web").unwrap();
    assert!(!engine.rules().get(web).unwrap().enabled);

    engine.process_frame(ethernet_frame(udp_bytes(CLIENT, SERVER, 1000, 53, &[]), 1));
    assert_eq!(engine.rules().get(dns).unwrap().packets, 1);
    assert_eq!(engine.flows().len(), 1);
}
