//! `flowmatic rules` command handler

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use flowmatic_core::FlowmaticConfig;
use flowmatic_engine::{Engine, EngineConfig, RuleDefinition, RuleLoader};

use crate::cli::{RulesAction, RulesArgs};
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Execute the `rules` command.
pub async fn execute(
    args: RulesArgs,
    config: &FlowmaticConfig,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    match args.action {
        RulesAction::List { dir } => {
            let dir = dir.unwrap_or_else(|| PathBuf::from(&config.engine.rules_dir));
            let report = list_rules(&dir).await?;
            writer.render(&report)?;
            Ok(())
        }
        RulesAction::Validate { path } => {
            let report = validate_rules(&path, config).await?;
            writer.render(&report)?;
            if report.invalid > 0 {
                return Err(CliError::Rule(format!("{} invalid rule files", report.invalid)));
            }
            Ok(())
        }
        RulesAction::Check { expression } => {
            let report = check_expression(&expression, config)?;
            writer.render(&report)?;
            match &report.error {
                Some(e) => Err(CliError::Rule(e.clone())),
                None => Ok(()),
            }
        }
    }
}

/// Load every rule in `dir` without evaluating expressions.
pub async fn list_rules(dir: &Path) -> Result<RuleListReport, CliError> {
    info!(rules_dir = %dir.display(), "loading rules");

    let rules = RuleLoader::load_directory(dir).await?;
    Ok(RuleListReport {
        dir: dir.display().to_string(),
        total: rules.len(),
        rules: rules
            .into_iter()
            .map(|r| RuleEntry {
                id: r.id,
                enabled: r.enabled,
                expression: r.expression,
                description: r.description,
                targets: r.targets.into_iter().map(|t| t.kind).collect(),
            })
            .collect(),
    })
}

/// Validate a rule file, or every rule file in a directory.
///
/// Each file is parsed, then added to a scratch engine so that protocol
/// names, field names, values and target options are all checked the same
/// way the daemon checks them. Duplicate ids are reported against the
/// later file.
pub async fn validate_rules(
    path: &Path,
    config: &FlowmaticConfig,
) -> Result<RuleValidationReport, CliError> {
    info!(path = %path.display(), "validating rules");

    let files = rule_files(path).await?;
    let engine = Engine::new(EngineConfig::from_core(config))?;
    let mut seen: HashMap<String, String> = HashMap::new();
    let mut errors = Vec::new();
    let mut valid = 0;

    for file in &files {
        let name = file.display().to_string();
        let outcome = match RuleLoader::load_file(file).await {
            Ok(def) => check_definition(&engine, &def, &name, &mut seen),
            Err(e) => Err(e.to_string()),
        };
        match outcome {
            Ok(()) => valid += 1,
            Err(error) => errors.push(RuleError { file: name, error }),
        }
    }
    engine.shutdown();

    Ok(RuleValidationReport {
        path: path.display().to_string(),
        total_files: files.len(),
        valid,
        invalid: errors.len(),
        errors,
    })
}

fn check_definition(
    engine: &Engine,
    def: &RuleDefinition,
    file: &str,
    seen: &mut HashMap<String, String>,
) -> Result<(), String> {
    if let Some(first) = seen.get(&def.id) {
        return Err(format!("duplicate rule id '{}' (first defined in {first})", def.id));
    }
    let id = engine.add_rule(def).map_err(|e| e.to_string())?;
    engine.remove_rule(id).map_err(|e| e.to_string())?;
    seen.insert(def.id.clone(), file.to_owned());
    Ok(())
}

/// `path` itself when it is a file, otherwise its `.yml`/`.yaml` files in name order.
async fn rule_files(path: &Path) -> Result<Vec<PathBuf>, CliError> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| {
        CliError::Command(format!("cannot read {}: {e}", path.display()))
    })?;
    if metadata.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut entries = tokio::fs::read_dir(path).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let p = entry.path();
        if p.extension().is_some_and(|ext| ext == "yml" || ext == "yaml") {
            files.push(p);
        }
    }
    files.sort();
    Ok(files)
}

/// Parse a single match expression against the built-in protocols.
///
/// Reports the protocols the expression references.
pub fn check_expression(
    expression: &str,
    config: &FlowmaticConfig,
) -> Result<ExpressionReport, CliError> {
    let engine = Engine::new(EngineConfig::from_core(config))?;
    let before: HashMap<&'static str, usize> = engine
        .list_protocols()
        .into_iter()
        .map(|p| (p.name, p.refcount))
        .collect();

    let result = engine.add_rule(&RuleDefinition::new("expression", expression));
    let protocols = match &result {
        Ok(_) => engine
            .list_protocols()
            .into_iter()
            .filter(|p| p.refcount > before.get(p.name).copied().unwrap_or(0))
            .map(|p| p.name)
            .collect(),
        Err(_) => Vec::new(),
    };
    engine.shutdown();

    Ok(ExpressionReport {
        expression: expression.trim().to_owned(),
        valid: result.is_ok(),
        error: result.err().map(|e| e.to_string()),
        protocols,
    })
}

#[derive(Serialize)]
pub struct RuleListReport {
    pub dir: String,
    pub total: usize,
    pub rules: Vec<RuleEntry>,
}

#[derive(Serialize)]
pub struct RuleEntry {
    pub id: String,
    pub enabled: bool,
    pub expression: String,
    pub description: String,
    pub targets: Vec<String>,
}

impl Render for RuleListReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "Rules in {} ({} total)", self.dir, self.total.to_string().bold())?;
        writeln!(w)?;
        writeln!(w, "{:<20} {:<9} {:<20} Match", "ID", "Status", "Targets")?;
        writeln!(w, "{}", "-".repeat(80))?;

        for r in &self.rules {
            let status = if r.enabled {
                "enabled".green()
            } else {
                "disabled".yellow()
            };
            writeln!(
                w,
                "{:<20} {:<9} {:<20} {}",
                r.id,
                status,
                r.targets.join(","),
                r.expression
            )?;
        }

        Ok(())
    }
}

#[derive(Serialize)]
pub struct RuleValidationReport {
    pub path: String,
    pub total_files: usize,
    pub valid: usize,
    pub invalid: usize,
    pub errors: Vec<RuleError>,
}

#[derive(Serialize)]
pub struct RuleError {
    pub file: String,
    pub error: String,
}

impl Render for RuleValidationReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "Rule Validation: {}", self.path.bold())?;
        writeln!(
            w,
            "  Files: {} total, {} valid, {} invalid",
            self.total_files,
            self.valid.to_string().green(),
            if self.invalid > 0 {
                self.invalid.to_string().red()
            } else {
                self.invalid.to_string().normal()
            }
        )?;

        if !self.errors.is_empty() {
            writeln!(w)?;
            writeln!(w, "Errors:")?;
            for e in &self.errors {
                writeln!(w, "  {}: {}", e.file.red(), e.error)?;
            }
        }

        Ok(())
    }
}

#[derive(Serialize)]
pub struct ExpressionReport {
    pub expression: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub protocols: Vec<&'static str>,
}

impl Render for ExpressionReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "Expression: {}", self.expression.bold())?;
        match &self.error {
            None => {
                writeln!(w, "  Result: {}", "VALID".green().bold())?;
                writeln!(w, "  Protocols: {}", self.protocols.join(", "))?;
            }
            Some(e) => {
                writeln!(w, "  Result: {}", "INVALID".red().bold())?;
                writeln!(w, "  Error: {}", e.red())?;
            }
        }
        Ok(())
    }
}
