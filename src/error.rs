use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing or malformed configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network send/receive failed: {0}")]
    Network(String),

    #[error("Orchestrator API call failed: {0}")]
    Api(#[from] reqwest::Error),

    #[error("Malformed or unexpected frame: {0}")]
    ProtocolViolation(String),

    #[error("Execution of payload failed: {0}")]
    Execution(String),

    #[error("Unknown Class of Service id {0}")]
    UnknownCos(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
