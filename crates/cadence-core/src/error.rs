use thiserror::Error;

#[derive(Debug, Error)]
pub enum CadenceError {
    /// The config sources could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The config parsed but holds settings the scheduler cannot run with.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CadenceError {
    /// Short error code string for log lines and exit diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            CadenceError::Config(_) => "CONFIG_ERROR",
            CadenceError::InvalidConfig(_) => "INVALID_CONFIG",
            CadenceError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;
