//! 규칙 -- 매치 트리와 타겟 목록
//!
//! # 규칙 형식
//! ```yaml
//! id: dns
//! match: "ethernet | ipv4 | udp.dport == 53 or udp.sport == 53"
//! targets:
//!   - type: log
//! ```
//!
//! # 구성
//! - [`RuleList`]: 규칙 추가/제거/활성화와 카운터 관리 (RwLock)
//! - [`parser`]: 표현식 문자열을 [`RuleTree`]로 변환
//! - [`eval`]: 트리를 프레임의 레이어 체인에 대해 평가
//! - [`loader`]: YAML 파일 로딩 및 유효성 검증
//! - [`types`]: 규칙 정의와 조회 결과 구조

pub mod eval;
pub mod loader;
pub mod parser;
pub mod tree;
pub mod types;

pub use loader::RuleLoader;
pub use parser::parse_expression;
pub use tree::{BranchOp, NodeId, NodeKind, Predicate, RuleTree};
pub use types::{RuleDefinition, RuleInfo, TargetInfo};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{EngineError, RegistryError};
use crate::registry::ProtocolTable;
use crate::target::{TargetId, TargetRegistry, TargetSlot};

/// 설정된 규칙 하나
pub struct Rule {
    id: u64,
    name: String,
    description: String,
    enabled: AtomicBool,
    tree: RuleTree,
    targets: Vec<Arc<TargetSlot>>,
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl Rule {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn tree(&self) -> &RuleTree {
        &self.tree
    }

    pub fn targets(&self) -> &[Arc<TargetSlot>] {
        &self.targets
    }

    pub(crate) fn record_match(&self, len: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn info(&self) -> RuleInfo {
        RuleInfo {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            enabled: self.is_enabled(),
            expression: self.tree.text().to_owned(),
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            targets: self
                .targets
                .iter()
                .map(|t| TargetInfo {
                    id: t.id(),
                    kind: t.kind(),
                    status: t.status(),
                    processed: t.processed(),
                    errors: t.errors(),
                })
                .collect(),
        }
    }

    /// 규칙을 해체합니다. 타겟을 닫고 트리의 프로토콜 참조를 반납합니다.
    ///
    /// 연결/기대 연결에 남은 타겟 상태를 정리할 수 있도록 타겟 ID를 반환합니다.
    pub(crate) fn dispose(self, protocols: &ProtocolTable<'_>) -> Vec<TargetId> {
        let owners = self.targets.iter().map(|t| t.id()).collect();
        for target in &self.targets {
            target.close();
        }
        self.tree.destroy(protocols);
        owners
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("enabled", &self.is_enabled())
            .field("expression", &self.tree.text())
            .finish()
    }
}

/// 규칙 목록
///
/// 프레임 처리 동안에는 읽기 잠금을, 추가/제거 동안에는 쓰기 잠금을 잡습니다.
pub struct RuleList {
    rules: RwLock<Vec<Rule>>,
    next_id: AtomicU64,
}

impl RuleList {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<Rule>> {
        self.rules
            .read()
            .unwrap_or_else(|_| panic!("rule list lock poisoned"))
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Rule>> {
        self.rules
            .write()
            .unwrap_or_else(|_| panic!("rule list lock poisoned"))
    }

    /// 규칙을 파싱하고 타겟을 열어 목록 끝에 추가합니다.
    ///
    /// 실패하면 그때까지 만든 트리와 타겟을 모두 정리하고 에러를 반환합니다.
    pub fn add(
        &self,
        def: &RuleDefinition,
        protocols: &ProtocolTable<'_>,
        targets: &TargetRegistry,
    ) -> Result<u64, EngineError> {
        def.validate()?;
        let mut rules = self.write();
        if rules.iter().any(|r| r.name == def.id) {
            return Err(RegistryError::AlreadyRegistered {
                kind: "rule",
                name: def.id.clone(),
            }
            .into());
        }

        let tree = parse_expression(&def.id, &def.expression, protocols)?;
        let mut slots = Vec::with_capacity(def.targets.len());
        for spec in &def.targets {
            match targets.create(spec) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in &slots {
                        slot.close();
                    }
                    tree.destroy(protocols);
                    return Err(e);
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            rule_id = id,
            name = %def.id,
            expression = %tree.text(),
            targets = slots.len(),
            "rule added"
        );
        rules.push(Rule {
            id,
            name: def.id.clone(),
            description: def.description.clone(),
            enabled: AtomicBool::new(def.enabled),
            tree,
            targets: slots,
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        });
        Ok(id)
    }

    /// 규칙을 목록에서 떼어냅니다. 해체는 호출자가 [`Rule::dispose`]로 합니다.
    pub(crate) fn remove(&self, id: u64) -> Result<Rule, EngineError> {
        let mut rules = self.write();
        let pos = rules
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| EngineError::NotFound {
                kind: "rule",
                name: id.to_string(),
            })?;
        Ok(rules.remove(pos))
    }

    /// 모든 규칙을 떼어냅니다.
    pub(crate) fn drain(&self) -> Vec<Rule> {
        std::mem::take(&mut *self.write())
    }

    pub fn set_enabled(&self, id: u64, enabled: bool) -> Result<(), EngineError> {
        let rules = self.read();
        let rule = rules
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| EngineError::NotFound {
                kind: "rule",
                name: id.to_string(),
            })?;
        rule.enabled.store(enabled, Ordering::Release);
        tracing::info!(rule_id = id, enabled, "rule state changed");
        Ok(())
    }

    /// 이름으로 규칙 ID를 찾습니다.
    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.read().iter().find(|r| r.name == name).map(|r| r.id)
    }

    pub fn get(&self, id: u64) -> Option<RuleInfo> {
        self.read().iter().find(|r| r.id == id).map(Rule::info)
    }

    pub fn list(&self) -> Vec<RuleInfo> {
        self.read().iter().map(Rule::info).collect()
    }

    pub fn reset_counters(&self) {
        for rule in self.read().iter() {
            rule.packets.store(0, Ordering::Relaxed);
            rule.bytes.store(0, Ordering::Relaxed);
        }
    }

    /// 활성 규칙의 타겟에 SIGHUP을 전달합니다. 실패한 타겟 수를 반환합니다.
    pub fn sighup(&self) -> usize {
        self.read()
            .iter()
            .flat_map(|r| r.targets.iter())
            .filter(|t| !t.sighup())
            .count()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Default for RuleList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProtocolRegistry;
    use crate::target::{TargetSpec, TargetStatus};

    fn setup() -> (ProtocolRegistry, TargetRegistry, RuleList) {
        (
            ProtocolRegistry::with_builtin().unwrap(),
            TargetRegistry::with_builtin(),
            RuleList::new(),
        )
    }

    #[test]
    fn add_assigns_increasing_ids() {
        let (protocols, targets, list) = setup();
        let table = protocols.read();
        let a = list
            .add(&RuleDefinition::new("a", "ipv4"), &table, &targets)
            .unwrap();
        let b = list
            .add(&RuleDefinition::new("b", "ipv6"), &table, &targets)
            .unwrap();
        assert!(b > a);
        assert_eq!(list.lookup("b"), Some(b));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let (protocols, targets, list) = setup();
        let table = protocols.read();
        list.add(&RuleDefinition::new("dup", "ipv4"), &table, &targets)
            .unwrap();
        let err = list
            .add(&RuleDefinition::new("dup", "tcp"), &table, &targets)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Registry(RegistryError::AlreadyRegistered { kind: "rule", .. })
        ));
        // 두 번째 규칙의 트리는 만들어지지 않았음
        assert_eq!(table.refcount(table.lookup("tcp").unwrap()), 0);
    }

    #[test]
    fn unknown_target_rolls_back_tree() {
        let (protocols, targets, list) = setup();
        let table = protocols.read();
        let def = RuleDefinition::new("bad", "ipv4 | udp")
            .with_target(TargetSpec::new("null"))
            .with_target(TargetSpec::new("nope"));
        let err = list.add(&def, &table, &targets).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "target", .. }));
        assert_eq!(table.refcount(table.lookup("udp").unwrap()), 0);
        assert!(list.is_empty());
    }

    #[test]
    fn dispose_closes_targets_and_releases_protocols() {
        let (protocols, targets, list) = setup();
        let table = protocols.read();
        let def = RuleDefinition::new("r", "ipv4 and (tcp or udp)").with_target(TargetSpec::new("null"));
        let id = list.add(&def, &table, &targets).unwrap();
        assert_eq!(list.get(id).unwrap().targets[0].status, TargetStatus::Open);

        let rule = list.remove(id).unwrap();
        let slot = Arc::clone(&rule.targets()[0]);
        let owners = rule.dispose(&table);
        assert_eq!(owners, vec![slot.id()]);
        assert_eq!(slot.status(), TargetStatus::Closed);
        assert_eq!(table.refcount(table.lookup("ipv4").unwrap()), 0);
        assert!(matches!(list.remove(id), Err(EngineError::NotFound { .. })));
    }

    #[test]
    fn enable_disable_and_counters() {
        let (protocols, targets, list) = setup();
        let table = protocols.read();
        let id = list
            .add(&RuleDefinition::new("r", "ipv4"), &table, &targets)
            .unwrap();
        list.set_enabled(id, false).unwrap();
        assert!(!list.get(id).unwrap().enabled);
        assert!(list.set_enabled(id + 100, true).is_err());

        list.read()[0].record_match(60);
        list.read()[0].record_match(40);
        let info = list.get(id).unwrap();
        assert_eq!((info.packets, info.bytes), (2, 100));
        list.reset_counters();
        assert_eq!(list.get(id).unwrap().packets, 0);
    }
}
