use thiserror::Error;

use crate::record::OpStatus;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("status is {actual}, expected {expected}")]
    StatusInvalid { expected: OpStatus, actual: OpStatus },

    #[error("completed operation is missing block coordinates")]
    MissingBlockNum,

    #[error("account could not be resolved: {0}")]
    AccountResolution(String),

    #[error("operation does not concern a pooled account: {from} -> {to}")]
    UnrelatedOperation { from: String, to: String },

    #[error("empty memo")]
    EmptyMemo,

    #[error("malformed address: {0}")]
    InvalidAddress(String),
}
