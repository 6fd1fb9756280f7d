//! Command handlers -- one module per subcommand

pub mod config;
pub mod protocols;
pub mod replay;
pub mod rules;

use std::path::Path;

use flowmatic_core::FlowmaticConfig;

use crate::error::CliError;

/// Load the configuration used by a command.
///
/// Without a path, defaults plus environment overrides are used.
pub async fn load_config(path: Option<&Path>) -> Result<FlowmaticConfig, CliError> {
    match path {
        Some(path) => Ok(FlowmaticConfig::load(path).await?),
        None => {
            let mut config = FlowmaticConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }
}
