use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("store error: {0}")]
    Store(#[from] state_store::StoreError),
    #[error("merkle error: {0}")]
    Merkle(#[from] state_merkle::MerkleError),
    #[error("exchange error: {0}")]
    Exchange(#[from] exchange::ExchangeError),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("fatal invariant violation: {0}")]
    Fatal(&'static str),
    #[error("invalid block: {0}")]
    InvalidBlock(&'static str),
    #[error("invalid transaction: {0}")]
    InvalidTx(&'static str),
    #[error("invalid data file: {0}")]
    InvalidFile(&'static str),
    #[error("shutting down")]
    Shutdown,
}

pub type ChainResult<T> = Result<T, ChainError>;
