use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy initialization error: {0}")]
    Init(String),
    #[error("route resolution error: {0}")]
    Route(String),
    #[error("tunnel state error: {0}")]
    TunnelState(String),
    #[error("substitution fetch error: {0}")]
    SubstitutionFetch(String),
    #[error("proxy runtime error: {0}")]
    Runtime(String),
    #[error("proxy IO error: {0}")]
    Io(#[from] std::io::Error),
}
