#![no_main]

use flowmatic_engine::{Engine, EngineConfig, RuleDefinition};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(engine) = Engine::new(EngineConfig::default()) else {
        return;
    };

    let before: Vec<usize> = engine.list_protocols().iter().map(|p| p.refcount).collect();

    if let Ok(id) = engine.add_rule(&RuleDefinition::new("fuzz", text)) {
        let _ = engine.remove_rule(id);
    }

    // 성공/실패와 관계없이 프로토콜 참조가 남으면 안 됨
    for (info, before) in engine.list_protocols().iter().zip(before) {
        assert_eq!(info.refcount, before, "{} leaked by {text:?}", info.name);
    }
});
