use thiserror::Error;

/// Setup failures that end the process with a non-zero exit code.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("record store unavailable: {0}")]
    Store(String),
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

impl AppError {
    pub fn logging_init<E: std::fmt::Display>(error: E) -> Self {
        Self::LoggingInit(error.to_string())
    }

    pub fn config<E: std::fmt::Display>(error: E) -> Self {
        Self::Config(error.to_string())
    }

    pub fn bind(addr: &str, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.to_string(),
            source,
        }
    }

    pub fn store<E: std::fmt::Display>(error: E) -> Self {
        Self::Store(error.to_string())
    }
}
