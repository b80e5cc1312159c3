#![forbid(unsafe_code)]

use qc_core::config::ConfigError;
use qc_storage::StoreError;

/// Exit codes: 1 user/validation error, 2 not found, 3 invalid state
/// transition, 4 internal (store/io) failure.
#[derive(Debug)]
pub(crate) enum CliError {
    Usage(String),
    Validation(String),
    Config(ConfigError),
    Store(StoreError),
    Io(std::io::Error),
}

impl CliError {
    pub(crate) fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) | Self::Validation(_) | Self::Config(_) => 1,
            Self::Store(StoreError::InvalidInput(_)) => 1,
            Self::Store(StoreError::DuplicateId { .. }) => 1,
            Self::Store(StoreError::NotFound { .. }) => 2,
            Self::Store(StoreError::InvalidTransition { .. }) => 3,
            Self::Store(_) | Self::Io(_) => 4,
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Usage(message) | Self::Validation(message) => write!(f, "{message}"),
            Self::Config(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CliError {}

impl From<ConfigError> for CliError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<StoreError> for CliError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<std::io::Error> for CliError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}
