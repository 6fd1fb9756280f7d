//! Integration tests for `flowmatic rules`.

use std::fs;

use flowmatic_cli::commands::rules::{list_rules, validate_rules};
use flowmatic_core::FlowmaticConfig;
use tempfile::TempDir;

const GOOD_RULE: &str = r#"
id: dns
description: DNS queries
match: "ethernet | ipv4 | udp.dport == 53"
targets:
  - type: log
    params:
      prefix: dns
"#;

const SECOND_RULE: &str = r#"
id: web
enabled: false
match: "ethernet | (ipv4 or ipv6) | tcp.dport == 443"
targets:
  - type: "null"
"#;

fn rules_dir(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().expect("should create temp dir");
    for (name, body) in files {
        fs::write(dir.path().join(name), body).expect("should write rule");
    }
    dir
}

#[tokio::test]
async fn test_validate_all_good() {
    let dir = rules_dir(&[("a.yml", GOOD_RULE), ("b.yaml", SECOND_RULE), ("notes.txt", "x")]);

    let report = validate_rules(dir.path(), &FlowmaticConfig::default())
        .await
        .unwrap();

    assert_eq!(report.total_files, 2, "non-YAML files are ignored");
    assert_eq!(report.valid, 2);
    assert_eq!(report.invalid, 0);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn test_validate_reports_each_bad_file() {
    let dir = rules_dir(&[
        ("a.yml", GOOD_RULE),
        ("b.yml", "id: broken\nmatch: \"ethernet | nosuchproto\"\n"),
        ("c.yml", "id: [unclosed\n"),
        ("d.yml", "id: badfield\nmatch: \"ethernet | ipv4.nosuch == 1\"\n"),
    ]);

    let report = validate_rules(dir.path(), &FlowmaticConfig::default())
        .await
        .unwrap();

    assert_eq!(report.total_files, 4);
    assert_eq!(report.valid, 1);
    assert_eq!(report.invalid, 3);
    let files: Vec<&str> = report.errors.iter().map(|e| e.file.as_str()).collect();
    assert!(files[0].ends_with("b.yml"));
    assert!(files[1].ends_with("c.yml"));
    assert!(files[2].ends_with("d.yml"));
}

#[tokio::test]
async fn test_validate_detects_duplicate_ids() {
    let dir = rules_dir(&[("a.yml", GOOD_RULE), ("b.yml", GOOD_RULE)]);

    let report = validate_rules(dir.path(), &FlowmaticConfig::default())
        .await
        .unwrap();

    assert_eq!(report.valid, 1);
    assert_eq!(report.invalid, 1);
    assert!(report.errors[0].error.contains("duplicate rule id 'dns'"));
    assert!(report.errors[0].file.ends_with("b.yml"));
}

#[tokio::test]
async fn test_validate_single_file() {
    let dir = rules_dir(&[("a.yml", GOOD_RULE)]);

    let report = validate_rules(&dir.path().join("a.yml"), &FlowmaticConfig::default())
        .await
        .unwrap();

    assert_eq!(report.total_files, 1);
    assert_eq!(report.valid, 1);
}

#[tokio::test]
async fn test_validate_missing_path_is_error() {
    let dir = TempDir::new().unwrap();

    let result = validate_rules(&dir.path().join("missing"), &FlowmaticConfig::default()).await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_list_rules_reads_definitions() {
    let dir = rules_dir(&[("a.yml", GOOD_RULE), ("b.yml", SECOND_RULE)]);

    let report = list_rules(dir.path()).await.unwrap();

    assert_eq!(report.total, 2);
    assert_eq!(report.rules[0].id, "dns");
    assert!(report.rules[0].enabled);
    assert_eq!(report.rules[0].targets, vec!["log".to_owned()]);
    assert_eq!(report.rules[1].id, "web");
    assert!(!report.rules[1].enabled);
}
