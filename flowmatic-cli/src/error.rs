//! CLI-specific error types and exit code mapping

use flowmatic_core::error::FlowmaticError;
use flowmatic_engine::EngineError;

/// CLI-specific error type.
///
/// Each variant carries enough context for a user-friendly message.
/// The `exit_code()` method maps errors to standard Unix exit codes.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Configuration loading or validation failure.
    #[error("configuration error: {0}")]
    Config(String),

    /// A subcommand-specific operation failed.
    #[error("{0}")]
    Command(String),

    /// One or more rules failed validation.
    #[error("rule error: {0}")]
    Rule(String),

    /// The capture could not be replayed.
    #[error("replay error: {0}")]
    Replay(String),

    /// JSON serialisation failed during output rendering.
    #[error("json output error: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    /// IO error (file read, stdout write, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapped domain error from flowmatic-core.
    #[error("{0}")]
    Core(#[from] FlowmaticError),

    /// Wrapped engine error (registry, rule, parameter).
    #[error("{0}")]
    Engine(#[from] EngineError),
}

impl CliError {
    /// Map the error to a process exit code.
    ///
    /// | Code | Meaning                              |
    /// |------|--------------------------------------|
    /// | 0    | Success                              |
    /// | 1    | General / command error              |
    /// | 2    | Configuration error                  |
    /// | 3    | Invalid rules                        |
    /// | 4    | Capture could not be replayed        |
    /// | 10   | IO error                             |
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Core(_) => 2,
            Self::Rule(_) => 3,
            Self::Replay(_) => 4,
            Self::Io(_) => 10,
            Self::JsonSerialize(_) | Self::Command(_) | Self::Engine(_) => 1,
        }
    }
}
