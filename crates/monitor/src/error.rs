use omnibus_core::CoreError;
use omnibus_storage::StoreError;
use thiserror::Error;

use crate::chain::ChainError;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("chain client error: {0}")]
    Chain(#[from] ChainError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("memo serialization error: {0}")]
    MemoEncoding(#[from] serde_json::Error),

    #[error("stop block {stop} lies before resume point {resume}")]
    StopBeforeResume { resume: u64, stop: u64 },
}
