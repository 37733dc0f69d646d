use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("chain error: {0}")]
    Chain(#[from] chain::ChainError),
    #[error("store error: {0}")]
    Store(#[from] state_store::StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

pub type NodeResult<T> = Result<T, NodeError>;
