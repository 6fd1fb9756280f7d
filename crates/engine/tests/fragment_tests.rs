//! IPv4 조각 재조립 통합 테스트

mod common;

use std::time::Duration;

use common::{CaptureEngine, IP_UDP, ethernet_frame, fragment, ipv4_packet, udp_segment};
use flowmatic_engine::{EngineConfig, FrameOrigin, FrameOutcome, RuleDefinition};

const SRC: [u8; 4] = [192, 168, 1, 10];
const DST: [u8; 4] = [192, 168, 1, 20];
/// 이더넷 헤더 길이
const IP: usize = 14;

fn capture() -> (CaptureEngine, std::sync::Arc<std::sync::Mutex<common::Captured>>) {
    let ce = CaptureEngine::new(EngineConfig::default());
    let (spec, sink) = ce.sink();
    ce.engine
        .add_rule(&RuleDefinition::new("dns", "ethernet | ipv4 | udp.dport == 53").with_target(spec))
        .unwrap();
    (ce, sink)
}

/// 48바이트 UDP 데이터그램을 0/16/32 오프셋에서 세 조각으로 자름
fn datagram() -> Vec<u8> {
    let data: Vec<u8> = (0u8..40).collect();
    udp_segment(5353, 53, &data)
}

#[test]
fn test_out_of_order_fragments_reassemble_to_original() {
    let (ce, sink) = capture();
    let segment = datagram();
    let frags = fragment(SRC, DST, IP_UDP, 0x1234, &segment, &[16, 32]);
    let expected = ipv4_packet(SRC, DST, IP_UDP, 0, 0, &segment);

    for (i, ts) in [(2, 1), (0, 2), (0, 3), (1, 4)] {
        let outcome = ce.engine.process_frame(ethernet_frame(frags[i].clone(), ts));
        assert_eq!(outcome, FrameOutcome::Claimed, "fragment {i} at t={ts}");
    }

    let captured = sink.lock().unwrap();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].0, FrameOrigin::Reinjected);
    assert_eq!(captured[0].1, expected);

    let stats = ce.engine.stats();
    assert_eq!(stats.frames_claimed, 4);
    assert_eq!(stats.frames_reinjected, 1);
    assert_eq!(stats.helper_pending, 0);
}

#[test]
fn test_interleaved_groups_are_kept_apart() {
    let (ce, sink) = capture();
    let segment = datagram();
    let a = fragment(SRC, DST, IP_UDP, 1, &segment, &[24]);
    let b = fragment(SRC, DST, IP_UDP, 2, &segment, &[24]);

    ce.engine.process_frame(ethernet_frame(a[0].clone(), 1));
    ce.engine.process_frame(ethernet_frame(b[1].clone(), 1));
    assert_eq!(ce.engine.stats().helper_pending, 2);
    ce.engine.process_frame(ethernet_frame(b[0].clone(), 2));
    ce.engine.process_frame(ethernet_frame(a[1].clone(), 2));

    let captured = sink.lock().unwrap();
    assert_eq!(captured.len(), 2);
    assert!(captured.iter().all(|(origin, _)| *origin == FrameOrigin::Reinjected));
    assert_eq!(ce.engine.stats().helper_pending, 0);
}

#[test]
fn test_incomplete_group_expires() {
    let (ce, sink) = capture();
    let frags = fragment(SRC, DST, IP_UDP, 7, &datagram(), &[16, 32]);

    ce.engine.process_frame(ethernet_frame(frags[0].clone(), 100));
    ce.engine.process_frame(ethernet_frame(frags[2].clone(), 110));
    assert_eq!(ce.engine.stats().helper_pending, 1);

    // 마지막 조각 도착 후 60초가 지나기 전에는 유지
    ce.engine.process_timers(Duration::from_secs(165));
    assert_eq!(ce.engine.stats().helper_pending, 1);
    ce.engine.process_timers(Duration::from_secs(171));
    assert_eq!(ce.engine.stats().helper_pending, 0);

    // 늦게 온 조각은 새 그룹을 시작할 뿐 재조립되지 않음
    ce.engine.process_frame(ethernet_frame(frags[1].clone(), 172));
    assert!(sink.lock().unwrap().is_empty());
    assert_eq!(ce.engine.stats().helper_pending, 1);
}

#[test]
fn test_frag_timeout_param_is_applied() {
    let config = EngineConfig {
        ipv4_frag_timeout_secs: 5,
        ..EngineConfig::default()
    };
    let ce = CaptureEngine::new(config);
    let frags = fragment(SRC, DST, IP_UDP, 9, &datagram(), &[16]);
    ce.engine.process_frame(ethernet_frame(frags[0].clone(), 10));
    ce.engine.process_timers(Duration::from_secs(16));
    assert_eq!(ce.engine.stats().helper_pending, 0);

    ce.engine.set_param("ipv4.frag_timeout", "100").unwrap();
    ce.engine.process_frame(ethernet_frame(frags[0].clone(), 20));
    ce.engine.process_timers(Duration::from_secs(60));
    assert_eq!(ce.engine.stats().helper_pending, 1);
}

#[test]
fn test_checksum_left_alone_when_disabled() {
    let (ce, sink) = capture();
    ce.engine.set_param("ipv4.fix_checksum", "no").unwrap();
    let segment = datagram();
    let frags = fragment(SRC, DST, IP_UDP, 0x4242, &segment, &[24]);

    ce.engine.process_frame(ethernet_frame(frags[0].clone(), 1));
    ce.engine.process_frame(ethernet_frame(frags[1].clone(), 1));

    let captured = sink.lock().unwrap();
    assert_eq!(captured.len(), 1);
    let out = &captured[0].1;
    // 체크섬은 처음 도착한 조각의 값 그대로
    assert_eq!(out[IP + 10..IP + 12], frags[0][IP + 10..IP + 12]);
    assert_eq!(out[IP + 4..IP + 8], [0, 0, 0, 0]);
    assert_eq!(out.len(), IP + 20 + segment.len());
}

#[test]
fn test_dont_fragment_packets_pass_through() {
    let (ce, sink) = capture();
    let packet = ipv4_packet(SRC, DST, IP_UDP, 99, 0x4000, &datagram());
    assert_eq!(
        ce.engine.process_frame(ethernet_frame(packet.clone(), 1)),
        FrameOutcome::Processed
    );
    assert_eq!(sink.lock().unwrap().as_slice(), &[(FrameOrigin::Input, packet)]);
    assert_eq!(ce.engine.stats().helper_pending, 0);
}

#[test]
fn test_fragment_overrunning_frame_is_dropped() {
    let (ce, sink) = capture();
    let mut frags = fragment(SRC, DST, IP_UDP, 3, &datagram(), &[16]);
    // 조각의 전체 길이를 프레임보다 크게 만듦
    let new_len = frags[0].len() - 8;
    frags[0].truncate(new_len);
    assert_eq!(
        ce.engine.process_frame(ethernet_frame(frags[0].clone(), 1)),
        FrameOutcome::Dropped
    );
    assert_eq!(ce.engine.stats().helper_pending, 0);
    assert!(sink.lock().unwrap().is_empty());
}
