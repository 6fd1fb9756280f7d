//! 규칙 정의 데이터 타입
//!
//! YAML 규칙 파일에서 역직렬화되는 구조체와 규칙 목록 조회 결과를 정의합니다.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::target::{TargetId, TargetSpec, TargetStatus};

const MAX_RULE_ID_LEN: usize = 256;

/// 규칙 정의 -- 하나의 YAML 규칙 파일에 대응합니다.
///
/// # YAML 스키마
/// ```yaml
/// id: dns_flows
/// description: DNS 질의/응답 연결 기록
/// enabled: true
/// match: "ethernet | ipv4 | udp.dport == 53"
/// targets:
///   - type: log
///     params:
///       conntrack: true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// 규칙 이름 (규칙 목록 안에서 유일해야 함)
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 매치 표현식
    #[serde(rename = "match")]
    pub expression: String,
    /// 매치된 프레임을 받는 타겟
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
}

fn default_enabled() -> bool {
    true
}

impl RuleDefinition {
    pub fn new(id: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            enabled: true,
            expression: expression.into(),
            targets: Vec::new(),
        }
    }

    pub fn with_target(mut self, target: TargetSpec) -> Self {
        self.targets.push(target);
        self
    }

    /// 규칙의 유효성을 검증합니다.
    ///
    /// 표현식 문법은 여기서 보지 않고 규칙을 추가할 때 파서가 검사합니다.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.id.is_empty() {
            return Err(EngineError::RuleParse {
                rule_id: "(empty)".to_owned(),
                reason: "rule id must not be empty".to_owned(),
            });
        }

        if self.id.len() > MAX_RULE_ID_LEN {
            return Err(EngineError::RuleParse {
                rule_id: self.id.clone(),
                reason: format!("rule id must not exceed {MAX_RULE_ID_LEN} characters"),
            });
        }

        if self.expression.trim().is_empty() {
            return Err(EngineError::RuleParse {
                rule_id: self.id.clone(),
                reason: "match expression must not be empty".to_owned(),
            });
        }

        if let Some(t) = self.targets.iter().find(|t| t.kind.is_empty()) {
            return Err(EngineError::RuleParse {
                rule_id: self.id.clone(),
                reason: format!("target type must not be empty (params: {:?})", t.params),
            });
        }

        Ok(())
    }
}

/// 규칙 목록 조회 결과
#[derive(Debug, Clone, Serialize)]
pub struct RuleInfo {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub expression: String,
    pub packets: u64,
    pub bytes: u64,
    pub targets: Vec<TargetInfo>,
}

/// 규칙에 달린 타겟 하나의 상태
#[derive(Debug, Clone, Serialize)]
pub struct TargetInfo {
    pub id: TargetId,
    pub kind: &'static str,
    pub status: TargetStatus,
    pub processed: u64,
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_defaults_apply() {
        let yaml = r#"
id: any_tcp
match: "ethernet | ipv4 | tcp"
"#;
        let rule: RuleDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(rule.enabled);
        assert!(rule.targets.is_empty());
        assert!(rule.description.is_empty());
        rule.validate().unwrap();
    }

    #[test]
    fn targets_carry_params() {
        let yaml = r#"
id: logged
match: ipv4
targets:
  - type: log
    params:
      conntrack: true
      prefix: edge
  - type: "null"
"#;
        let rule: RuleDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.targets.len(), 2);
        assert_eq!(rule.targets[0].kind, "log");
        assert_eq!(rule.targets[1].kind, "null");
        assert!(rule.targets[0].params.bool_or("log", "conntrack", false).unwrap());
    }

    #[test]
    fn empty_id_fails_validation() {
        let rule = RuleDefinition::new("", "ipv4");
        assert!(rule.validate().is_err());
    }

    #[test]
    fn too_long_id_fails_validation() {
        let rule = RuleDefinition::new("x".repeat(300), "ipv4");
        assert!(rule.validate().is_err());
    }

    #[test]
    fn blank_expression_fails_validation() {
        let rule = RuleDefinition::new("blank", "   ");
        assert!(rule.validate().is_err());
    }
}
