use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::CoreError;
use crate::clock::EventClock;

/// Chain-identifier prefix for transfers that never reach the chain.
pub const VIRTUAL_TRANSFER_PREFIX: &str = "virtual_transfer";

/// Lifecycle state of a stored operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    InProgress,
    Completed,
    Failed,
}

impl OpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpStatus::InProgress => "in_progress",
            OpStatus::Completed => "completed",
            OpStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "in_progress" => Ok(OpStatus::InProgress),
            "completed" => Ok(OpStatus::Completed),
            "failed" => Ok(OpStatus::Failed),
            other => Err(CoreError::InvalidOperation(format!(
                "unknown status: {other}"
            ))),
        }
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One economically relevant transfer, as persisted.
///
/// `chain_identifier` is the dedup key: `"<transaction_id>:<op_in_tx>"` for
/// on-chain operations, `"virtual_transfer:<n>"` for off-chain ones.
/// Block coordinates are present exactly on completed records.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct OperationRecord {
    pub chain_identifier: String,
    pub incident_id: String,
    pub customer_id: String,
    pub from_account: String,
    pub to_account: String,
    pub amount_value: i64,
    pub amount_asset_id: String,
    pub fee_value: i64,
    pub fee_asset_id: String,
    /// Raw on-chain memo object as JSON, kept for audit. The decoded
    /// plaintext is consumed into `customer_id`/`incident_id`.
    pub memo: String,
    pub block_num: Option<u64>,
    pub tx_in_block: Option<u32>,
    pub op_in_tx: Option<u32>,
    /// Expiration of the enclosing transaction, seconds since epoch.
    pub expiration: Option<u64>,
    /// Insertion time, milliseconds since epoch; stamped by the validator.
    pub timestamp_ms: u64,
    pub status: OpStatus,
    /// Failure reason, set on failed records.
    pub message: Option<String>,
}

impl OperationRecord {
    /// The operation's position on the chain, if completed with full
    /// coordinates.
    pub fn clock(&self) -> Option<EventClock> {
        match (self.block_num, self.tx_in_block, self.op_in_tx) {
            (Some(block_num), Some(tx_in_block), Some(op_in_tx)) => {
                Some(EventClock::new(block_num, tx_in_block, op_in_tx))
            }
            _ => None,
        }
    }

    pub fn has_block(&self) -> bool {
        self.block_num.is_some()
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// Chain identifier of the n-th virtual transfer.
pub fn virtual_chain_identifier(n: u64) -> String {
    format!("{VIRTUAL_TRANSFER_PREFIX}:{n}")
}

/// Issues chain identifiers for virtual transfers.
///
/// One issuer per process write path; injected where needed, never global.
#[derive(Debug)]
pub struct VirtualTransferIds {
    next: AtomicU64,
}

impl VirtualTransferIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Hands out the next counter value.
    pub fn next_counter(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Hands out the next `"virtual_transfer:<n>"` identifier.
    pub fn next_chain_identifier(&self) -> String {
        virtual_chain_identifier(self.next_counter())
    }
}

impl Default for VirtualTransferIds {
    fn default() -> Self {
        Self::new()
    }
}
