//! `flowmatic config` command handler

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use flowmatic_core::FlowmaticConfig;

use crate::cli::{ConfigAction, ConfigArgs};
use crate::commands::load_config;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

const SECTIONS: &[&str] = &["general", "input", "engine", "helpers", "metrics"];

/// Execute the `config` command.
pub async fn execute(
    args: ConfigArgs,
    config_path: Option<&Path>,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    match args.action {
        ConfigAction::Validate => {
            let path = config_path.ok_or_else(|| {
                CliError::Command("config validate requires --config <PATH>".to_owned())
            })?;
            let report = validate_config(path).await;
            writer.render(&report)?;
            if !report.valid {
                return Err(CliError::Config("configuration is invalid".to_owned()));
            }
            Ok(())
        }
        ConfigAction::Show { section } => {
            let config = load_config(config_path).await?;
            let source = config_path.map_or_else(
                || "(defaults)".to_owned(),
                |p| p.display().to_string(),
            );
            let report = show_config(&config, source, section.as_deref())?;
            writer.render(&report)?;
            Ok(())
        }
    }
}

/// Load and validate a configuration file, capturing the error instead of returning it.
pub async fn validate_config(path: &Path) -> ConfigValidationReport {
    info!(path = %path.display(), "validating configuration");

    let errors = match FlowmaticConfig::load(path).await {
        Ok(_) => Vec::new(),
        Err(e) => vec![e.to_string()],
    };
    ConfigValidationReport {
        source: path.display().to_string(),
        valid: errors.is_empty(),
        errors,
    }
}

/// Render the effective configuration, or one section of it.
///
/// # Errors
///
/// Returns `CliError::Command` if `section` is not a known section name.
pub fn show_config(
    config: &FlowmaticConfig,
    source: String,
    section: Option<&str>,
) -> Result<ConfigReport, CliError> {
    let (config_toml, config_json) = match section {
        None => (toml::to_string_pretty(config), serde_json::to_value(config)?),
        Some("general") => (
            toml::to_string_pretty(&config.general),
            serde_json::to_value(&config.general)?,
        ),
        Some("input") => (
            toml::to_string_pretty(&config.input),
            serde_json::to_value(&config.input)?,
        ),
        Some("engine") => (
            toml::to_string_pretty(&config.engine),
            serde_json::to_value(&config.engine)?,
        ),
        Some("helpers") => (
            toml::to_string_pretty(&config.helpers),
            serde_json::to_value(&config.helpers)?,
        ),
        Some("metrics") => (
            toml::to_string_pretty(&config.metrics),
            serde_json::to_value(&config.metrics)?,
        ),
        Some(other) => {
            return Err(CliError::Command(format!(
                "unknown section: {other} (expected: {})",
                SECTIONS.join(", ")
            )));
        }
    };

    Ok(ConfigReport {
        source,
        section: section.map(str::to_owned),
        config: config_json,
        config_toml: config_toml.unwrap_or_else(|e| format!("(serialization error: {e})")),
    })
}

/// Effective configuration for display.
#[derive(Serialize)]
pub struct ConfigReport {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub config: serde_json::Value,
    /// Text rendering only
    #[serde(skip)]
    pub config_toml: String,
}

impl Render for ConfigReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        if let Some(ref section) = self.section {
            let section_label = format!("[{section}]");
            writeln!(
                w,
                "Configuration {} (source: {})",
                section_label.bold(),
                self.source
            )?;
        } else {
            writeln!(w, "Configuration (source: {})", self.source.bold())?;
        }

        writeln!(w)?;
        write!(w, "{}", self.config_toml)?;

        Ok(())
    }
}

#[derive(Serialize)]
pub struct ConfigValidationReport {
    pub source: String,
    pub valid: bool,
    /// Empty if valid
    pub errors: Vec<String>,
}

impl Render for ConfigValidationReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "Config Validation: {}", self.source.bold())?;

        if self.valid {
            writeln!(w, "  Result: {}", "VALID".green().bold())?;
        } else {
            writeln!(w, "  Result: {}", "INVALID".red().bold())?;
            for err in &self.errors {
                writeln!(w, "  Error: {}", err.red())?;
            }
        }

        Ok(())
    }
}
