use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Returns the current wall-clock time as milliseconds since Unix epoch.
pub fn physical_now() -> Result<u64, CoreError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|_| CoreError::InvalidOperation("system clock before epoch".into()))
}

/// Position of an operation on the chain: block number, transaction index
/// within the block, operation index within the transaction.
///
/// Ordering is lexicographic over the fields in declaration order, which is
/// exactly the order events are applied on-chain. Balance rows store the
/// clock of the last operation folded in; an update is admissible only if
/// its clock is strictly greater.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize, Default,
)]
pub struct EventClock {
    pub block_num: u64,
    pub tx_in_block: u32,
    pub op_in_tx: u32,
}

impl EventClock {
    /// The clock of a balance row no operation has been folded into yet.
    pub const ZERO: EventClock = EventClock {
        block_num: 0,
        tx_in_block: 0,
        op_in_tx: 0,
    };

    pub fn new(block_num: u64, tx_in_block: u32, op_in_tx: u32) -> Self {
        Self {
            block_num,
            tx_in_block,
            op_in_tx,
        }
    }

    /// Clock for the n-th off-chain transfer completed at `checkpoint`.
    ///
    /// Virtual transfers never appear in a block, but their balance folds
    /// still need a position: after every real operation of the checkpointed
    /// block (tx index saturated) and ordered among themselves by counter.
    pub fn virtual_at(checkpoint: u64, counter: u32) -> Self {
        Self {
            block_num: checkpoint,
            tx_in_block: u32::MAX,
            op_in_tx: counter,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for EventClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.block_num, self.tx_in_block, self.op_in_tx)
    }
}
