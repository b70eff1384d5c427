//! Balance materialization shared by both backends.
//!
//! A completed transfer maps to a [`TransferEffect`]: the one synthetic
//! address it touches, the signed per-asset deltas it applies there, and the
//! event clock that orders it. [`fold`] merges an effect into the current
//! balance row and decides whether the result is written back or the row is
//! dropped. Backends own only the surrounding I/O and the conditional write
//! that makes the fold atomic against concurrent writers.

use std::collections::BTreeMap;

use omnibus_core::{
    address::TransferKind, clock::EventClock, record::OperationRecord, AddressCodec, CoreError,
};

use crate::error::StoreError;
use crate::traits::BalanceRow;

/// What one completed transfer does to its tracking address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEffect {
    pub address: String,
    pub deltas: BTreeMap<String, i64>,
    pub clock: EventClock,
}

/// Result of folding an effect into a balance row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoldOutcome {
    /// Persist this row (insert or overwrite).
    Write(BalanceRow),
    /// Remove the row; its balances net out to zero.
    Delete,
}

/// Derives the effect of a completed record.
///
/// The sending side loses the amount, and on a withdrawal also the fee.
/// A transfer between two pooled accounts moves the amount only; its fee is
/// intentionally left out of the sub-account balance. The receiving side of
/// a deposit gains the amount.
pub fn transfer_effect(
    codec: &AddressCodec,
    record: &OperationRecord,
) -> Result<TransferEffect, StoreError> {
    let clock = record.clock().ok_or(CoreError::MissingBlockNum)?;
    let address = codec.tracking_address(
        &record.from_account,
        &record.to_account,
        &record.customer_id,
    )?;

    let mut deltas: BTreeMap<String, i64> = BTreeMap::new();
    match codec.classify(&record.from_account, &record.to_account)? {
        TransferKind::Deposit => {
            *deltas.entry(record.amount_asset_id.clone()).or_insert(0) += record.amount_value;
        }
        TransferKind::Internal => {
            *deltas.entry(record.amount_asset_id.clone()).or_insert(0) -= record.amount_value;
        }
        TransferKind::Withdraw => {
            *deltas.entry(record.amount_asset_id.clone()).or_insert(0) -= record.amount_value;
            *deltas.entry(record.fee_asset_id.clone()).or_insert(0) -= record.fee_value;
        }
    }

    Ok(TransferEffect {
        address,
        deltas,
        clock,
    })
}

/// Merges `effect` into `current`.
///
/// The effect's clock must be strictly newer than the row's; anything else
/// means the event was already folded in (or a newer one was) and the caller
/// gets `StaleUpdate` without any mutation. Asset entries that reach zero
/// are dropped, and a row whose remaining amounts sum to zero is deleted
/// rather than written.
pub fn fold(
    current: Option<&BalanceRow>,
    effect: &TransferEffect,
) -> Result<FoldOutcome, StoreError> {
    let stored_clock = current.map(|row| row.clock).unwrap_or(EventClock::ZERO);
    if effect.clock <= stored_clock {
        return Err(StoreError::StaleUpdate {
            address: effect.address.clone(),
            incoming: effect.clock,
        });
    }

    let mut amounts = current.map(|row| row.amounts.clone()).unwrap_or_default();
    for (asset_id, delta) in &effect.deltas {
        *amounts.entry(asset_id.clone()).or_insert(0) += delta;
    }
    amounts.retain(|_, value| *value != 0);

    if amounts.values().sum::<i64>() == 0 {
        return Ok(FoldOutcome::Delete);
    }
    Ok(FoldOutcome::Write(BalanceRow {
        address: effect.address.clone(),
        amounts,
        clock: effect.clock,
    }))
}
