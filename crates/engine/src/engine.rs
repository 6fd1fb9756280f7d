//! 엔진 -- 프레임 하나를 식별/규칙 평가/연결 추적/타겟 전달까지 처리합니다.
//!
//! [`Engine`]은 레지스트리(프로토콜, 타겟 종류, 파라미터)와 규칙 목록을 `Arc`로
//! 공유하고, 프레임 처리 상태(레이어 풀, conntrack, 타이머, 헬퍼, 기대 연결,
//! 재주입 큐)는 하나의 뮤텍스 안에 둡니다.
//!
//! # 잠금 규칙
//! 프레임 처리는 이 뮤텍스를 프레임 하나 동안 쥡니다. 규칙 제거, 프로토콜/헬퍼
//! 등록 해제처럼 처리 중인 구조를 무효화할 수 있는 관리 작업도 먼저 같은 뮤텍스를
//! 잡습니다. 잠금 순서는 항상 엔진 → 프로토콜 레지스트리 → 규칙 목록입니다.
//!
//! # 프레임 처리 순서
//! ```text
//! identify_chain -> rule eval (lazy identify) -> conntrack lookup
//!   -> expectations -> targets with connection state -> matched rule targets
//!   -> reinjected frames (same path)
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use flowmatic_core::metrics as m;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::conntrack::{ConntrackTable, FlowSummary};
use crate::error::EngineError;
use crate::expectation::{ExpectationSummary, ExpectationTable};
use crate::frame::{Frame, FrameOrigin};
use crate::helper::ipv4::{Ipv4Reassembly, PARAM_FIX_CHECKSUM, PARAM_FRAG_TIMEOUT};
use crate::helper::{FlowContext, Helper, HelperEnv, HelperSet};
use crate::identify::{FrameScope, Halt, identify_chain};
use crate::layer::{LayerPool, Packet};
use crate::param::{ParamInfo, ParamTable};
use crate::registry::{ProtoId, Protocol, ProtocolInfo, ProtocolRegistry, ProtocolTable};
use crate::rule::eval::evaluate;
use crate::rule::{Rule, RuleDefinition, RuleInfo, RuleList};
use crate::target::{TargetContext, TargetId, TargetRegistry, TargetSlot};
use crate::timer::{TimerOwner, TimerWheel};

/// 프레임 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// 규칙 평가와 타겟 전달까지 끝남
    Processed,
    /// 헬퍼가 흡수함 (조각 버퍼링 등)
    Claimed,
    /// 손상 패킷으로 버림
    Dropped,
}

/// 엔진 통계 스냅샷
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub frames_claimed: u64,
    pub frames_reinjected: u64,
    pub ring_overflow: u64,
    pub conntrack_entries: usize,
    pub expectations: usize,
    /// 헬퍼가 버퍼 중인 작업 수 (미완성 조각 그룹 등)
    pub helper_pending: usize,
    pub rules: usize,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    dropped: AtomicU64,
    claimed: AtomicU64,
    reinjected: AtomicU64,
    ring_overflow: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: FrameOutcome, origin: FrameOrigin) {
        if origin == FrameOrigin::Reinjected {
            self.reinjected.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(m::ENGINE_FRAMES_REINJECTED_TOTAL).increment(1);
        }
        match outcome {
            FrameOutcome::Processed => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(m::ENGINE_FRAMES_PROCESSED_TOTAL).increment(1);
            }
            FrameOutcome::Claimed => {
                self.claimed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(m::ENGINE_FRAMES_CLAIMED_TOTAL).increment(1);
            }
            FrameOutcome::Dropped => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(m::ENGINE_FRAMES_DROPPED_TOTAL, m::LABEL_REASON => "malformed")
                    .increment(1);
            }
        }
    }
}

/// 프레임 처리 동안 잠그는 상태
struct EngineCore {
    pool: LayerPool,
    conntrack: ConntrackTable,
    timers: TimerWheel<TimerOwner>,
    helpers: HelperSet,
    expectations: ExpectationTable,
    reinject: VecDeque<Frame>,
    /// 입력 기준 현재 시각 (오프라인은 마지막 프레임 타임스탬프)
    now: Duration,
}

/// 패킷 처리 엔진
///
/// # 사용 예시
/// ```ignore
/// use flowmatic_engine::{Engine, EngineConfig, RuleDefinition};
///
/// let engine = Engine::new(EngineConfig::default())?;
/// engine.add_rule(&RuleDefinition::new("dns", "ethernet | ipv4 | udp.dport == 53"))?;
/// let outcome = engine.process_frame(frame);
/// engine.process_timers(engine.now());
/// ```
pub struct Engine {
    config: EngineConfig,
    protocols: Arc<ProtocolRegistry>,
    targets: Arc<TargetRegistry>,
    params: Arc<ParamTable>,
    rules: RuleList,
    core: Mutex<EngineCore>,
    counters: Counters,
}

impl Engine {
    /// 내장 프로토콜과 내장 타겟으로 엔진을 생성합니다.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let protocols = Arc::new(ProtocolRegistry::with_builtin()?);
        let targets = Arc::new(TargetRegistry::with_builtin());
        Self::with_registries(config, protocols, targets)
    }

    /// 주어진 레지스트리로 엔진을 생성합니다.
    ///
    /// IPv4 조각 재조립 헬퍼를 등록하고 설정값으로 파라미터를 초기화합니다.
    pub fn with_registries(
        config: EngineConfig,
        protocols: Arc<ProtocolRegistry>,
        targets: Arc<TargetRegistry>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let params = Arc::new(ParamTable::new());
        let mut helpers = HelperSet::new();
        if protocols.lookup("ipv4").is_some() {
            helpers.register(Box::new(Ipv4Reassembly::new()), &protocols.read(), &params)?;
            params.set(PARAM_FRAG_TIMEOUT, &config.ipv4_frag_timeout_secs.to_string())?;
            params.set(
                PARAM_FIX_CHECKSUM,
                if config.ipv4_fix_checksum { "yes" } else { "no" },
            )?;
        }

        let core = EngineCore {
            pool: LayerPool::new(config.max_layers),
            conntrack: ConntrackTable::new(
                config.conntrack_table_size,
                config.conntrack_default_timeout_secs,
            ),
            timers: TimerWheel::new(),
            helpers,
            expectations: ExpectationTable::new(),
            reinject: VecDeque::new(),
            now: Duration::ZERO,
        };

        tracing::info!(
            max_layers = config.max_layers,
            conntrack_table_size = config.conntrack_table_size,
            helpers = ?core.helpers.names(),
            "engine initialized"
        );

        Ok(Self {
            config,
            protocols,
            targets,
            params,
            rules: RuleList::new(),
            core: Mutex::new(core),
            counters: Counters::default(),
        })
    }

    fn lock_core(&self) -> MutexGuard<'_, EngineCore> {
        self.core
            .lock()
            .unwrap_or_else(|_| panic!("engine lock poisoned"))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn protocols(&self) -> &Arc<ProtocolRegistry> {
        &self.protocols
    }

    pub fn targets(&self) -> &Arc<TargetRegistry> {
        &self.targets
    }

    pub fn params(&self) -> &Arc<ParamTable> {
        &self.params
    }

    pub fn rules(&self) -> &RuleList {
        &self.rules
    }

    /// 입력 기준 현재 시각
    pub fn now(&self) -> Duration {
        self.lock_core().now
    }

    // ─── 프레임 처리 ─────────────────────────────────────────────

    /// 프레임 하나를 처리하고, 헬퍼가 재주입한 프레임도 같은 경로로 처리합니다.
    ///
    /// 반환값은 원래 프레임의 처리 결과입니다.
    pub fn process_frame(&self, frame: Frame) -> FrameOutcome {
        let mut guard = self.lock_core();
        let core = &mut *guard;
        let protocols = self.protocols.read();
        let rules = self.rules.read();

        let outcome = self.run_frame(core, &protocols, &rules, &frame);
        self.drain_reinjected(core, &protocols, &rules);
        outcome
    }

    /// 만료 시각이 `now` 이전인 타이머를 모두 처리합니다.
    ///
    /// 시각은 뒤로 가지 않습니다. 처리한 타이머 수를 반환합니다.
    pub fn process_timers(&self, now: Duration) -> usize {
        let mut guard = self.lock_core();
        let core = &mut *guard;
        let protocols = self.protocols.read();
        let rules = self.rules.read();

        if now > core.now {
            core.now = now;
        }
        let due = core.timers.process(core.now);
        let fired = due.len();
        for owner in due {
            match owner {
                TimerOwner::Conntrack(id) => {
                    core.conntrack
                        .on_timeout(id, &protocols, &mut core.timers, core.now);
                }
                TimerOwner::Helper { proto, token } => {
                    let env = HelperEnv {
                        now: core.now,
                        timers: &mut core.timers,
                        reinject: &mut core.reinject,
                        params: &self.params,
                    };
                    core.helpers.on_timer(proto, token, env);
                }
                TimerOwner::Expectation(id) => {
                    core.expectations.expire(id, &protocols, &mut core.timers);
                }
            }
        }
        if fired > 0 {
            tracing::trace!(fired, now = ?core.now, "timers processed");
        }
        self.drain_reinjected(core, &protocols, &rules);
        fired
    }

    fn drain_reinjected(&self, core: &mut EngineCore, protocols: &ProtocolTable<'_>, rules: &[Rule]) {
        while let Some(frame) = core.reinject.pop_front() {
            tracing::trace!(len = frame.len(), "processing reinjected frame");
            self.run_frame(core, protocols, rules, &frame);
        }
    }

    fn run_frame(
        &self,
        core: &mut EngineCore,
        protocols: &ProtocolTable<'_>,
        rules: &[Rule],
        frame: &Frame,
    ) -> FrameOutcome {
        let started = Instant::now();
        let outcome = self.pipeline(core, protocols, rules, frame);
        self.counters.record(outcome, frame.origin());
        metrics::histogram!(m::ENGINE_FRAME_PROCESSING_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        outcome
    }

    fn pipeline(
        &self,
        core: &mut EngineCore,
        protocols: &ProtocolTable<'_>,
        rules: &[Rule],
        frame: &Frame,
    ) -> FrameOutcome {
        let EngineCore {
            pool,
            conntrack,
            timers,
            helpers,
            expectations,
            reinject,
            now,
        } = core;
        if frame.timestamp() > *now {
            *now = frame.timestamp();
        }
        let now = *now;

        pool.reset();
        let Some(first) = pool.alloc(frame.first_proto(), None) else {
            return FrameOutcome::Dropped;
        };

        let mut matched = Vec::new();
        let halt = {
            let mut scope = FrameScope {
                frame,
                protocols,
                pool: &mut *pool,
                helpers: &mut *helpers,
                timers: &mut *timers,
                reinject: &mut *reinject,
                params: &self.params,
                now,
                dump_invalid: self.config.dump_invalid_packets,
                halt: None,
            };
            identify_chain(&mut scope, first);
            for (i, rule) in rules.iter().enumerate() {
                if scope.halt.is_some() {
                    break;
                }
                if rule.is_enabled() && evaluate(&mut scope, rule.tree(), Some(first)) {
                    matched.push(i);
                }
            }
            scope.halt
        };
        match halt {
            Some(Halt::Claimed) => return FrameOutcome::Claimed,
            Some(Halt::Malformed) => return FrameOutcome::Dropped,
            None => {}
        }

        for &i in &matched {
            let rule = &rules[i];
            rule.record_match(frame.len());
            metrics::counter!(m::ENGINE_RULE_MATCHES_TOTAL, m::LABEL_RULE => rule.name().to_owned())
                .increment(1);
        }

        let packet = Packet::new(frame, pool, Some(first), protocols);
        let entry = conntrack.lookup(&packet);
        if let Some((id, dir)) = entry {
            conntrack.touch(id, &packet, dir, timers, now);
        }
        let entry = {
            let mut flow = FlowContext::new(&mut *conntrack, &mut *timers, protocols, entry, now);
            helpers.on_flow(&mut flow, &packet);
            flow.into_entry()
        };
        let expected = expectations.take_matches(&packet, timers);

        let mut delivery = Delivery::default();
        {
            let mut cx = TargetContext::new(
                &mut *conntrack,
                &mut *expectations,
                &mut *timers,
                protocols,
                entry,
                now,
            );

            for expt in expected {
                cx.bind(&expt.owner);
                if cx.ensure_entry(&packet).is_some() {
                    cx.set_parent(expt.parent);
                    if let Some(state) = expt.state {
                        cx.add_state(state);
                    }
                } else if let Some(state) = expt.state {
                    state.cleanup(None);
                }
                delivery.deliver(&mut cx, &expt.owner, &packet);
            }

            if let Some(id) = cx.entry() {
                for owner in cx.conntrack().target_owners(id) {
                    if let Some(slot) = find_slot(rules, owner) {
                        delivery.deliver(&mut cx, slot, &packet);
                    }
                }
            }

            for &i in &matched {
                for slot in rules[i].targets() {
                    delivery.deliver(&mut cx, slot, &packet);
                }
            }
        }

        for owner in delivery.failed {
            conntrack.remove_owner(owner, protocols, timers);
            expectations.remove_owner(owner, protocols, timers);
        }
        FrameOutcome::Processed
    }

    // ─── 규칙 관리 ───────────────────────────────────────────────

    /// 규칙을 추가합니다. 반환값은 새 규칙 ID입니다.
    pub fn add_rule(&self, def: &RuleDefinition) -> Result<u64, EngineError> {
        let _core = self.lock_core();
        let protocols = self.protocols.read();
        self.rules.add(def, &protocols, &self.targets)
    }

    /// 여러 규칙을 추가합니다. 실패한 규칙은 경고 로그를 남기고 건너뜁니다.
    pub fn add_rules(&self, defs: &[RuleDefinition]) -> usize {
        defs.iter()
            .filter(|def| match self.add_rule(def) {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(rule = %def.id, error = %e, "skipping rule");
                    false
                }
            })
            .count()
    }

    /// 규칙을 제거합니다.
    ///
    /// 타겟을 닫고, 그 타겟이 연결과 기대 연결에 남긴 상태를 정리합니다.
    pub fn remove_rule(&self, id: u64) -> Result<(), EngineError> {
        let mut guard = self.lock_core();
        let core = &mut *guard;
        let protocols = self.protocols.read();
        let rule = self.rules.remove(id)?;
        let name = rule.name().to_owned();
        for owner in rule.dispose(&protocols) {
            core.conntrack
                .remove_owner(owner, &protocols, &mut core.timers);
            core.expectations
                .remove_owner(owner, &protocols, &mut core.timers);
        }
        tracing::info!(rule_id = id, name = %name, "rule removed");
        Ok(())
    }

    pub fn set_rule_enabled(&self, id: u64, enabled: bool) -> Result<(), EngineError> {
        self.rules.set_enabled(id, enabled)
    }

    pub fn list_rules(&self) -> Vec<RuleInfo> {
        self.rules.list()
    }

    /// 모든 타겟에 재설정 신호를 전달합니다. 실패한 타겟 수를 반환합니다.
    pub fn sighup(&self) -> usize {
        let _core = self.lock_core();
        let failed = self.rules.sighup();
        if failed > 0 {
            tracing::warn!(failed, "targets failed on reload signal");
        }
        failed
    }

    // ─── 레지스트리 관리 ─────────────────────────────────────────

    pub fn register_protocol(&self, proto: Box<dyn Protocol>) -> Result<ProtoId, EngineError> {
        let _core = self.lock_core();
        Ok(self.protocols.register(proto)?)
    }

    /// 프로토콜 등록을 해제합니다. 규칙, 연결, 헬퍼가 참조 중이면 실패합니다.
    pub fn unregister_protocol(&self, name: &str) -> Result<(), EngineError> {
        let _core = self.lock_core();
        Ok(self.protocols.unregister(name)?)
    }

    pub fn list_protocols(&self) -> Vec<ProtocolInfo> {
        self.protocols.list()
    }

    pub fn register_helper(&self, helper: Box<dyn Helper>) -> Result<ProtoId, EngineError> {
        let mut core = self.lock_core();
        let protocols = self.protocols.read();
        core.helpers.register(helper, &protocols, &self.params)
    }

    /// 헬퍼 등록을 해제합니다. 버퍼 중이던 데이터는 버려집니다.
    pub fn unregister_helper(&self, name: &str) -> Result<(), EngineError> {
        let mut guard = self.lock_core();
        let core = &mut *guard;
        let protocols = self.protocols.read();
        let env = HelperEnv {
            now: core.now,
            timers: &mut core.timers,
            reinject: &mut core.reinject,
            params: &self.params,
        };
        core.helpers.unregister(name, &protocols, env)?;
        if let Some(proto) = protocols.lookup(name) {
            core.conntrack
                .remove_helper_proto(proto, &protocols, &mut core.timers);
        }
        Ok(())
    }

    pub fn helper_names(&self) -> Vec<&'static str> {
        self.lock_core().helpers.names()
    }

    pub fn set_param(&self, name: &str, value: &str) -> Result<(), EngineError> {
        self.params.set(name, value)
    }

    pub fn list_params(&self) -> Vec<ParamInfo> {
        self.params.list()
    }

    // ─── 조회 ────────────────────────────────────────────────────

    pub fn flows(&self) -> Vec<FlowSummary> {
        let core = self.lock_core();
        let protocols = self.protocols.read();
        core.conntrack.summaries(&protocols)
    }

    pub fn expectations(&self) -> Vec<ExpectationSummary> {
        let core = self.lock_core();
        let protocols = self.protocols.read();
        core.expectations.summaries(&protocols)
    }

    /// 입력 링에서 버려진 프레임 수를 더합니다.
    pub fn record_ring_overflow(&self, dropped: u64) {
        self.counters
            .ring_overflow
            .fetch_add(dropped, Ordering::Relaxed);
    }

    pub fn stats(&self) -> EngineStats {
        let core = self.lock_core();
        EngineStats {
            frames_processed: self.counters.processed.load(Ordering::Relaxed),
            frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
            frames_claimed: self.counters.claimed.load(Ordering::Relaxed),
            frames_reinjected: self.counters.reinjected.load(Ordering::Relaxed),
            ring_overflow: self.counters.ring_overflow.load(Ordering::Relaxed),
            conntrack_entries: core.conntrack.len(),
            expectations: core.expectations.len(),
            helper_pending: core.helpers.pending(),
            rules: self.rules.len(),
        }
    }

    /// 규칙, 기대 연결, 연결, 헬퍼 버퍼를 모두 정리합니다.
    ///
    /// 이후에도 엔진은 쓸 수 있지만 규칙이 비어 있습니다.
    pub fn shutdown(&self) {
        let mut guard = self.lock_core();
        let core = &mut *guard;
        let protocols = self.protocols.read();

        let rules = self.rules.drain();
        let rule_count = rules.len();
        for rule in rules {
            for owner in rule.dispose(&protocols) {
                core.conntrack
                    .remove_owner(owner, &protocols, &mut core.timers);
                core.expectations
                    .remove_owner(owner, &protocols, &mut core.timers);
            }
        }
        core.expectations.clear(&protocols, &mut core.timers);
        core.conntrack.clear(&protocols, &mut core.timers);
        let env = HelperEnv {
            now: core.now,
            timers: &mut core.timers,
            reinject: &mut core.reinject,
            params: &self.params,
        };
        core.helpers.cleanup(env);
        let discarded = core.reinject.len();
        core.reinject.clear();

        tracing::info!(rules = rule_count, discarded, "engine shut down");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("rules", &self.rules.len())
            .finish()
    }
}

/// 프레임 하나 동안 타겟 전달 기록. 타겟은 프레임당 한 번만 받습니다.
#[derive(Default)]
struct Delivery {
    done: Vec<TargetId>,
    failed: Vec<TargetId>,
}

impl Delivery {
    fn deliver(&mut self, cx: &mut TargetContext<'_, '_>, slot: &Arc<TargetSlot>, packet: &Packet<'_>) {
        let id = slot.id();
        if self.done.contains(&id) {
            return;
        }
        self.done.push(id);
        cx.bind(slot);
        if !slot.process(cx, packet) {
            self.failed.push(id);
        }
    }
}

fn find_slot(rules: &[Rule], owner: TargetId) -> Option<&Arc<TargetSlot>> {
    rules
        .iter()
        .flat_map(|r| r.targets().iter())
        .find(|t| t.id() == owner)
}
