//! Backend for table services that index by partition key and row key only.
//!
//! Multi-field lookup is emulated by writing each operation into several
//! projection tables, one per lookup. The projection set is data
//! ([`PROJECTIONS`]): adding a lookup means adding an entry, not a code
//! path. The chain-identifier projection is written first and acts as the
//! commit point; once it exists, the record exists. Secondary projections
//! follow best-effort, with compensating deletes on partial failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use omnibus_core::{
    AddressCodec, CoreError, address,
    clock::EventClock,
    record::{OpStatus, OperationRecord},
    validate::{OperationDraft, RecordValidator},
};

use crate::balance::{self, FoldOutcome, TransferEffect};
use crate::error::{StoreError, table_err};
use crate::retry::{RetryConfig, RetryError, with_retry};
use crate::traits::{
    BalancePage, BalanceRow, DeleteTarget, OperationStore, StatusFilter, TrackingUsage,
};

pub const OPERATIONS_BY_ID: &str = "operationsbyid";
pub const OPERATIONS_BY_INCIDENT: &str = "operationsbyincident";
pub const OPERATIONS_BY_STATUS: &str = "operationsbystatus";
pub const ADDRESSES_TABLE: &str = "addresses";
pub const BALANCES_TABLE: &str = "balances";
pub const SYNC_TABLE: &str = "sync";

const SYNC_PARTITION: &str = "sync";
const SYNC_ROW: &str = "head";
const BALANCE_PARTITION: &str = "balance";

/// One stored entity: the two key columns, an opaque payload, and the
/// service-assigned version token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntity {
    pub partition_key: String,
    pub row_key: String,
    pub payload: Vec<u8>,
    pub etag: u64,
}

/// One partition-scan page.
#[derive(Debug, Clone)]
pub struct TablePage {
    pub entities: Vec<TableEntity>,
    pub continuation: Option<String>,
}

/// Failures of the table service itself.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("entity already exists")]
    Conflict,

    #[error("entity not found")]
    NotFound,

    #[error("etag mismatch")]
    PreconditionFailed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl TableError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TableError::Transport(_))
    }
}

/// Minimal contract of a two-key table service.
///
/// Partition scans return entities in ascending row-key order; the
/// continuation token resumes a scan after the last returned row.
pub trait TableClient: Send + Sync {
    /// Creates an entity; fails `Conflict` when the key pair exists.
    fn insert(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        payload: &[u8],
    ) -> Result<(), TableError>;

    fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<TableEntity, TableError>;

    /// Replaces an existing entity. With `if_match`, the write only applies
    /// when the stored etag matches; fails `PreconditionFailed` otherwise.
    fn update(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        payload: &[u8],
        if_match: Option<u64>,
    ) -> Result<(), TableError>;

    /// Upserts an entity regardless of prior state.
    fn insert_or_replace(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        payload: &[u8],
    ) -> Result<(), TableError>;

    /// Deletes an entity, conditionally when `if_match` is given.
    fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        if_match: Option<u64>,
    ) -> Result<(), TableError>;

    /// Scans one partition. `take` of zero means no page limit.
    fn query_partition(
        &self,
        table: &str,
        partition_key: &str,
        take: usize,
        continuation: Option<&str>,
    ) -> Result<TablePage, TableError>;
}

/// One keyed copy of an operation, named by the lookup it serves.
struct Projection {
    table: &'static str,
    keys: fn(&OperationRecord) -> (String, String),
}

/// The chain-identifier projection comes first: its conflict is the
/// duplicate check, and a record is considered committed once it is
/// written.
const PROJECTIONS: &[Projection] = &[
    Projection {
        table: OPERATIONS_BY_ID,
        keys: |op| (op.chain_identifier.clone(), op.chain_identifier.clone()),
    },
    Projection {
        table: OPERATIONS_BY_INCIDENT,
        keys: |op| (op.incident_id.clone(), op.chain_identifier.clone()),
    },
    Projection {
        table: OPERATIONS_BY_STATUS,
        keys: |op| (op.status.as_str().to_string(), op.chain_identifier.clone()),
    },
];

#[derive(Serialize, Deserialize)]
struct BalanceBlob {
    amounts: BTreeMap<String, i64>,
    clock: EventClock,
}

/// Backend over a [`TableClient`], presenting the same contract as the
/// document-style store.
#[derive(Clone)]
pub struct TableStore {
    inner: Arc<Inner>,
}

struct Inner {
    client: Arc<dyn TableClient>,
    codec: Arc<AddressCodec>,
    validator: RecordValidator,
    retry: RetryConfig,
}

impl TableStore {
    pub fn new(
        client: Arc<dyn TableClient>,
        codec: Arc<AddressCodec>,
        validator: RecordValidator,
        retry: RetryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                codec,
                validator,
                retry,
            }),
        }
    }

    /// Runs one table call under the retry policy. Transient failures are
    /// retried; anything else goes through `on_fail` for the call site to
    /// give it meaning.
    fn call<T>(
        &self,
        op: impl FnMut() -> Result<T, TableError>,
        on_fail: impl Fn(TableError) -> StoreError,
    ) -> Result<T, StoreError> {
        with_retry(&self.inner.retry, TableError::is_transient, op).map_err(|e| match e {
            RetryError::Exhausted { attempts, last } => StoreError::Unreachable {
                attempts,
                last: last.to_string(),
            },
            RetryError::Failed(e) => on_fail(e),
        })
    }

    fn encode_record(record: &OperationRecord) -> Result<Vec<u8>, StoreError> {
        record
            .to_msgpack()
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode_record(payload: &[u8]) -> Result<OperationRecord, StoreError> {
        OperationRecord::from_msgpack(payload).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Writes all projections of a new record. The first is the commit
    /// point; if a later one fails, the ones already written are removed
    /// again so no partial fan-out is left behind for subsequent reads.
    fn insert_projections(&self, record: &OperationRecord) -> Result<(), StoreError> {
        let payload = Self::encode_record(record)?;
        let client = &self.inner.client;

        for (index, projection) in PROJECTIONS.iter().enumerate() {
            let (partition_key, row_key) = (projection.keys)(record);
            let result = self.call(
                || client.insert(projection.table, &partition_key, &row_key, &payload),
                |e| match e {
                    TableError::Conflict if index == 0 => StoreError::DuplicateOperation {
                        chain_identifier: record.chain_identifier.clone(),
                    },
                    other => table_err(other),
                },
            );
            if let Err(e) = result {
                if index > 0 {
                    warn!(
                        chain_identifier = %record.chain_identifier,
                        table = projection.table,
                        error = %e,
                        "projection fan-out failed, removing partial writes"
                    );
                    self.compensate(record, index);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Best-effort removal of the first `written` projections of `record`.
    fn compensate(&self, record: &OperationRecord, written: usize) {
        let client = &self.inner.client;
        for projection in PROJECTIONS.iter().take(written) {
            let (partition_key, row_key) = (projection.keys)(record);
            let result = self.call(
                || client.delete(projection.table, &partition_key, &row_key, None),
                table_err,
            );
            if let Err(e) = result {
                warn!(
                    chain_identifier = %record.chain_identifier,
                    table = projection.table,
                    error = %e,
                    "compensating delete failed"
                );
            }
        }
    }

    /// Rewrites every projection from `old` to `new`. Projections whose
    /// keys are unchanged are replaced in place; a key change (the status
    /// projection) moves the entity. Both legs tolerate replays of a
    /// half-applied earlier attempt.
    fn rewrite_projections(
        &self,
        old: &OperationRecord,
        new: &OperationRecord,
    ) -> Result<(), StoreError> {
        let payload = Self::encode_record(new)?;
        let client = &self.inner.client;

        for projection in PROJECTIONS {
            let old_keys = (projection.keys)(old);
            let new_keys = (projection.keys)(new);
            if old_keys != new_keys {
                let result = self.call(
                    || client.delete(projection.table, &old_keys.0, &old_keys.1, None),
                    table_err,
                );
                match result {
                    Ok(()) => {}
                    // An earlier attempt already moved this entity.
                    Err(StoreError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            self.call(
                || client.insert_or_replace(projection.table, &new_keys.0, &new_keys.1, &payload),
                table_err,
            )?;
        }
        Ok(())
    }

    fn remove_projections(&self, record: &OperationRecord) -> Result<(), StoreError> {
        let client = &self.inner.client;
        for (index, projection) in PROJECTIONS.iter().enumerate() {
            let (partition_key, row_key) = (projection.keys)(record);
            let result = self.call(
                || client.delete(projection.table, &partition_key, &row_key, None),
                table_err,
            );
            match result {
                Ok(()) => {}
                Err(StoreError::NotFound(_)) if index == 0 => {
                    return Err(StoreError::NotFound(record.chain_identifier.clone()));
                }
                // Leftover of an earlier partial write; nothing to remove.
                Err(StoreError::NotFound(_)) => {
                    debug!(
                        chain_identifier = %record.chain_identifier,
                        table = projection.table,
                        "projection already absent on delete"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Collision handling for `insert_or_update`, identical in meaning to
    /// the document backend's.
    fn reconcile(
        &self,
        stored: OperationRecord,
        draft: &OperationDraft,
    ) -> Result<OperationRecord, StoreError> {
        match stored.status {
            OpStatus::InProgress => {
                if draft.block_num.is_none() {
                    return Err(StoreError::DuplicateOperation {
                        chain_identifier: stored.chain_identifier,
                    });
                }
                self.complete(draft)
            }
            OpStatus::Completed | OpStatus::Failed => Ok(stored),
        }
    }

    fn read_balance(&self, addr: &str) -> Result<Option<(BalanceRow, u64)>, StoreError> {
        let client = &self.inner.client;
        let entity = self.call(
            || client.get(BALANCES_TABLE, BALANCE_PARTITION, addr),
            table_err,
        );
        let entity = match entity {
            Ok(entity) => entity,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let blob: BalanceBlob = rmp_serde::from_slice(&entity.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some((
            BalanceRow {
                address: addr.to_string(),
                amounts: blob.amounts,
                clock: blob.clock,
            },
            entity.etag,
        )))
    }

    /// Folds a completed record into its tracking address's balance entity,
    /// guarded by the entity's etag.
    fn materialize(&self, record: &OperationRecord) -> Result<(), StoreError> {
        let effect = balance::transfer_effect(&self.inner.codec, record)?;
        let client = &self.inner.client;

        if !self.is_tracked(&effect.address, TrackingUsage::Balance)? {
            debug!(address = %effect.address, "address untracked, dropping balance row");
            let result = self.call(
                || client.delete(BALANCES_TABLE, BALANCE_PARTITION, &effect.address, None),
                table_err,
            );
            return match result {
                Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            };
        }

        let current = self.read_balance(&effect.address)?;
        let outcome = balance::fold(current.as_ref().map(|(row, _)| row), &effect)?;
        self.write_balance(&effect, current.map(|(_, etag)| etag), outcome)
    }

    fn write_balance(
        &self,
        effect: &TransferEffect,
        etag: Option<u64>,
        outcome: FoldOutcome,
    ) -> Result<(), StoreError> {
        let client = &self.inner.client;
        let stale = |e: TableError| match e {
            TableError::Conflict | TableError::PreconditionFailed | TableError::NotFound => {
                StoreError::StaleUpdate {
                    address: effect.address.clone(),
                    incoming: effect.clock,
                }
            }
            other => table_err(other),
        };
        match (etag, outcome) {
            (None, FoldOutcome::Write(row)) => {
                let payload = rmp_serde::to_vec(&BalanceBlob {
                    amounts: row.amounts,
                    clock: row.clock,
                })
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
                self.call(
                    || client.insert(BALANCES_TABLE, BALANCE_PARTITION, &row.address, &payload),
                    stale,
                )
            }
            (Some(etag), FoldOutcome::Write(row)) => {
                let payload = rmp_serde::to_vec(&BalanceBlob {
                    amounts: row.amounts,
                    clock: row.clock,
                })
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
                self.call(
                    || {
                        client.update(
                            BALANCES_TABLE,
                            BALANCE_PARTITION,
                            &row.address,
                            &payload,
                            Some(etag),
                        )
                    },
                    stale,
                )
            }
            (Some(etag), FoldOutcome::Delete) => self.call(
                || {
                    client.delete(
                        BALANCES_TABLE,
                        BALANCE_PARTITION,
                        &effect.address,
                        Some(etag),
                    )
                },
                stale,
            ),
            (None, FoldOutcome::Delete) => Ok(()),
        }
    }

    fn read_checkpoint(&self) -> Result<Option<(u64, u64)>, StoreError> {
        let client = &self.inner.client;
        let entity = self.call(|| client.get(SYNC_TABLE, SYNC_PARTITION, SYNC_ROW), table_err);
        match entity {
            Ok(entity) => {
                let value: u64 = rmp_serde::from_slice(&entity.payload)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some((value, entity.etag)))
            }
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl OperationStore for TableStore {
    fn insert(&self, draft: &OperationDraft) -> Result<OperationRecord, StoreError> {
        let record = self.inner.validator.prepare_for_insert(draft.clone())?;
        self.insert_projections(&record)?;
        if record.status == OpStatus::Completed {
            self.materialize(&record)?;
        }
        Ok(record)
    }

    fn insert_or_update(&self, draft: &OperationDraft) -> Result<OperationRecord, StoreError> {
        match self.find_by_chain_identifier(&draft.chain_identifier)? {
            Some(stored) => self.reconcile(stored, draft),
            None => match self.insert(draft) {
                Err(StoreError::DuplicateOperation { .. }) => {
                    let stored = self
                        .find_by_chain_identifier(&draft.chain_identifier)?
                        .ok_or_else(|| StoreError::NotFound(draft.chain_identifier.clone()))?;
                    self.reconcile(stored, draft)
                }
                other => other,
            },
        }
    }

    fn complete(&self, completion: &OperationDraft) -> Result<OperationRecord, StoreError> {
        let stored = self
            .find_by_chain_identifier(&completion.chain_identifier)?
            .ok_or_else(|| StoreError::NotFound(completion.chain_identifier.clone()))?;
        let updated = self.inner.validator.prepare_for_complete(&stored, completion)?;
        self.rewrite_projections(&stored, &updated)?;
        self.materialize(&updated)?;
        Ok(updated)
    }

    fn fail(
        &self,
        chain_identifier: &str,
        message: Option<&str>,
    ) -> Result<OperationRecord, StoreError> {
        let stored = self
            .find_by_chain_identifier(chain_identifier)?
            .ok_or_else(|| StoreError::NotFound(chain_identifier.to_string()))?;
        let updated = self.inner.validator.prepare_for_fail(&stored, message)?;
        self.rewrite_projections(&stored, &updated)?;
        Ok(updated)
    }

    fn get(&self, incident_id: &str) -> Result<OperationRecord, StoreError> {
        let client = &self.inner.client;
        let page = self.call(
            || client.query_partition(OPERATIONS_BY_INCIDENT, incident_id, 1, None),
            table_err,
        )?;
        match page.entities.first() {
            Some(entity) => Self::decode_record(&entity.payload),
            None => Err(StoreError::NotFound(incident_id.to_string())),
        }
    }

    fn find_by_chain_identifier(
        &self,
        chain_identifier: &str,
    ) -> Result<Option<OperationRecord>, StoreError> {
        let client = &self.inner.client;
        let entity = self.call(
            || client.get(OPERATIONS_BY_ID, chain_identifier, chain_identifier),
            table_err,
        );
        match entity {
            Ok(entity) => Ok(Some(Self::decode_record(&entity.payload)?)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn delete(&self, target: DeleteTarget<'_>) -> Result<(), StoreError> {
        let record = match target {
            DeleteTarget::Record(record) => record.clone(),
            DeleteTarget::IncidentId(incident_id) => self.get(incident_id)?,
        };
        self.inner.validator.prepare_for_delete(&record)?;
        self.remove_projections(&record)
    }

    fn list_by_status(
        &self,
        status: OpStatus,
        filter: &StatusFilter,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        let customer = match (filter.is_empty(), filter.effective_customer()) {
            (true, _) => None,
            (false, Some(customer)) => Some(customer),
            // A filter that names no customer can match nothing.
            (false, None) => return Ok(Vec::new()),
        };
        let client = &self.inner.client;

        let mut records = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let token = continuation.take();
            let page = self.call(
                || {
                    client.query_partition(
                        OPERATIONS_BY_STATUS,
                        status.as_str(),
                        0,
                        token.as_deref(),
                    )
                },
                table_err,
            )?;
            for entity in &page.entities {
                let record = Self::decode_record(&entity.payload)?;
                if let Some(customer_id) = &customer {
                    if &record.customer_id != customer_id {
                        continue;
                    }
                }
                records.push(record);
            }
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        records.sort_by(|a, b| {
            let key_a = (a.block_num, a.tx_in_block, a.op_in_tx, &a.chain_identifier);
            let key_b = (b.block_num, b.tx_in_block, b.op_in_tx, &b.chain_identifier);
            key_a.cmp(&key_b)
        });
        Ok(records)
    }

    fn track(&self, addr: &str, usage: TrackingUsage) -> Result<(), StoreError> {
        let parts = address::parse(addr)?;
        if parts.customer_id.is_empty() {
            return Err(StoreError::Invalid(CoreError::InvalidAddress(
                addr.to_string(),
            )));
        }
        let payload =
            rmp_serde::to_vec(addr).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let client = &self.inner.client;
        self.call(
            || client.insert(ADDRESSES_TABLE, usage.as_str(), addr, &payload),
            |e| match e {
                TableError::Conflict => StoreError::AddressTracked {
                    address: addr.to_string(),
                    usage,
                },
                other => table_err(other),
            },
        )
    }

    fn untrack(&self, addr: &str, usage: TrackingUsage) -> Result<(), StoreError> {
        let client = &self.inner.client;
        self.call(
            || client.delete(ADDRESSES_TABLE, usage.as_str(), addr, None),
            |e| match e {
                TableError::NotFound => StoreError::AddressNotTracked {
                    address: addr.to_string(),
                    usage,
                },
                other => table_err(other),
            },
        )?;
        if usage == TrackingUsage::Balance {
            let result = self.call(
                || client.delete(BALANCES_TABLE, BALANCE_PARTITION, addr, None),
                table_err,
            );
            match result {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn is_tracked(&self, addr: &str, usage: TrackingUsage) -> Result<bool, StoreError> {
        let client = &self.inner.client;
        let entity = self.call(|| client.get(ADDRESSES_TABLE, usage.as_str(), addr), table_err);
        match entity {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn tracked_addresses(&self, usage: TrackingUsage) -> Result<Vec<String>, StoreError> {
        let client = &self.inner.client;
        let mut addresses = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let token = continuation.take();
            let page = self.call(
                || client.query_partition(ADDRESSES_TABLE, usage.as_str(), 0, token.as_deref()),
                table_err,
            )?;
            addresses.extend(page.entities.into_iter().map(|entity| entity.row_key));
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        Ok(addresses)
    }

    fn get_balance(&self, addr: &str) -> Result<Option<BalanceRow>, StoreError> {
        Ok(self.read_balance(addr)?.map(|(row, _)| row))
    }

    fn get_balances(
        &self,
        page_size: usize,
        continuation: Option<&str>,
    ) -> Result<BalancePage, StoreError> {
        if page_size == 0 {
            return Ok(BalancePage {
                rows: Vec::new(),
                continuation: None,
            });
        }
        let client = &self.inner.client;
        let page = self.call(
            || client.query_partition(BALANCES_TABLE, BALANCE_PARTITION, page_size, continuation),
            table_err,
        )?;
        let rows = page
            .entities
            .into_iter()
            .map(|entity| {
                let blob: BalanceBlob = rmp_serde::from_slice(&entity.payload)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(BalanceRow {
                    address: entity.row_key,
                    amounts: blob.amounts,
                    clock: blob.clock,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(BalancePage {
            rows,
            continuation: page.continuation,
        })
    }

    fn get_checkpoint(&self) -> Result<u64, StoreError> {
        Ok(self.read_checkpoint()?.map(|(value, _)| value).unwrap_or(0))
    }

    fn set_checkpoint(&self, block_num: u64) -> Result<(), StoreError> {
        let client = &self.inner.client;
        let payload =
            rmp_serde::to_vec(&block_num).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let out_of_order = |current: u64| StoreError::OutOfOrder {
            current,
            requested: block_num,
        };
        match self.read_checkpoint()? {
            Some((current, _)) if block_num <= current => Err(out_of_order(current)),
            Some((_, etag)) => {
                let result = self.call(
                    || {
                        client.update(SYNC_TABLE, SYNC_PARTITION, SYNC_ROW, &payload, Some(etag))
                    },
                    table_err,
                );
                match result {
                    Ok(()) => Ok(()),
                    // Raced with another writer; report against its value.
                    Err(StoreError::Table(_)) | Err(StoreError::NotFound(_)) => {
                        Err(out_of_order(self.get_checkpoint()?))
                    }
                    Err(e) => Err(e),
                }
            }
            None if block_num == 0 => Err(out_of_order(0)),
            None => {
                let result = self.call(
                    || client.insert(SYNC_TABLE, SYNC_PARTITION, SYNC_ROW, &payload),
                    table_err,
                );
                match result {
                    Ok(()) => Ok(()),
                    Err(StoreError::Table(_)) => Err(out_of_order(self.get_checkpoint()?)),
                    Err(e) => Err(e),
                }
            }
        }
    }
}
