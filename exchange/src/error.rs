use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("matching worker is not running")]
    WorkerStopped,
    #[error("request table inconsistency: {0}")]
    Inconsistent(&'static str),
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;
