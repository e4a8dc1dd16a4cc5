use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("network error: {0}")]
    Network(#[from] meridian_network::NetworkError),

    #[error("config error: {0}")]
    Config(String),

    #[error("logging error: {0}")]
    Logging(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("node already started")]
    AlreadyStarted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
