#![no_main]

use std::time::Duration;

use arbitrary::Arbitrary;
use flowmatic_engine::{Engine, EngineConfig, Frame, RuleDefinition, TargetSpec};
use libfuzzer_sys::fuzz_target;

/// 퍼저용 구조적 입력
#[derive(Arbitrary, Debug)]
struct FuzzInput {
    /// 프레임 목록 (최대 16개로 제한)
    frames: Vec<FuzzFrame>,
    expect_reverse: bool,
}

#[derive(Arbitrary, Debug)]
struct FuzzFrame {
    data: Vec<u8>,
    secs: u16,
}

const RULES: &[&str] = &[
    "ethernet | ipv4 | udp.dport == 53",
    "ethernet | (ipv4 or ipv6) | tcp",
    "ethernet | vlan | ipv4 | not icmp",
];

fuzz_target!(|input: FuzzInput| {
    let Ok(engine) = Engine::new(EngineConfig::default()) else {
        return;
    };
    let Some(ethernet) = engine.protocols().lookup("ethernet") else {
        return;
    };

    for (i, expr) in RULES.iter().enumerate() {
        let mut log = TargetSpec::new("log");
        log.params.set("conntrack", true);
        let mut def = RuleDefinition::new(format!("rule-{i}"), *expr).with_target(log);
        if input.expect_reverse {
            def = def.with_target(TargetSpec::new("expect-reverse"));
        }
        let _ = engine.add_rule(&def);
    }

    // 패킷 내용과 관계없이 패닉 없이 처리되어야 함
    let mut now = Duration::ZERO;
    for frame in input.frames.into_iter().take(16) {
        now += Duration::from_secs(u64::from(frame.secs));
        engine.process_frame(Frame::new(frame.data, now, ethernet));
        engine.process_timers(now);
    }

    engine.shutdown();
    let stats = engine.stats();
    assert_eq!(stats.conntrack_entries, 0);
    assert_eq!(stats.helper_pending, 0);
});
