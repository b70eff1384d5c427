//! Chain-client seam: the block/transaction/operation shapes the monitor
//! consumes and the trait a concrete chain connection implements.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which notion of "recent" the block stream follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// The newest produced block.
    Head,
    /// The newest block confirmed as irreversible.
    Irreversible,
}

impl WatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::Irreversible => "irreversible",
        }
    }
}

/// Encrypted memo envelope as it appears on chain. Stored verbatim (as
/// JSON) alongside the decoded form, so the ciphertext survives even when
/// decryption was not possible at observation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMemo {
    #[serde(rename = "from")]
    pub from_key: String,
    #[serde(rename = "to")]
    pub to_key: String,
    pub nonce: u64,
    pub message: String,
}

/// An asset transfer as it appears inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOp {
    pub from: String,
    pub to: String,
    pub amount_value: i64,
    pub amount_asset_id: String,
    pub fee_value: i64,
    pub fee_asset_id: String,
    pub memo: Option<EncryptedMemo>,
}

/// One operation inside a transaction. Only transfers are tracked; every
/// other operation type is opaque to the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOperation {
    Transfer(TransferOp),
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub expiration: Option<u64>,
    pub operations: Vec<ChainOperation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub num: u64,
    pub timestamp_ms: u64,
    pub transactions: Vec<Transaction>,
}

/// Why a memo could not be decrypted. Each case maps to a distinct
/// sentinel in the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoDecodeError {
    #[error("decryption key not available")]
    MissingKey,

    #[error("no memo attached")]
    NoMemo,

    #[error("ciphertext could not be decrypted")]
    Undecryptable,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain connection error: {0}")]
    Connection(String),

    #[error("transaction id derivation error: {0}")]
    TransactionId(String),
}

/// A connection to the chain.
///
/// `stream_blocks` yields blocks in increasing order. `start` of `None`
/// begins at the chain's current position for the given mode; `stop` is
/// inclusive, `None` streams indefinitely. Connection failures surface as
/// `Err` items in the stream.
pub trait ChainClient: Send + Sync {
    fn stream_blocks(
        &self,
        mode: WatchMode,
        start: Option<u64>,
        stop: Option<u64>,
    ) -> Box<dyn Iterator<Item = Result<Block, ChainError>> + '_>;

    /// Derives the id of a signed transaction. Costs a signature
    /// derivation, so callers avoid it for transactions without tracked
    /// operations.
    fn transaction_id(&self, transaction: &Transaction) -> Result<String, ChainError>;

    /// Decrypts a transfer's memo. `None` fails with
    /// [`MemoDecodeError::NoMemo`].
    fn decrypt_memo(&self, memo: Option<&EncryptedMemo>) -> Result<String, MemoDecodeError>;
}
