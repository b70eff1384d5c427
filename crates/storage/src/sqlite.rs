use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::debug;

use omnibus_core::{
    AddressCodec, CoreError, address,
    clock::EventClock,
    record::{OpStatus, OperationRecord},
    validate::{OperationDraft, RecordValidator},
};

use crate::balance::{self, FoldOutcome, TransferEffect};
use crate::error::StoreError;
use crate::retry::{RetryConfig, RetryError, with_retry};
use crate::traits::{
    BalancePage, BalanceRow, DeleteTarget, OperationStore, StatusFilter, TrackingUsage,
};

const RECORD_COLUMNS: &str = "chain_identifier, incident_id, customer_id, from_account, \
     to_account, amount_value, amount_asset_id, fee_value, fee_asset_id, memo, block_num, \
     tx_in_block, op_in_tx, expiration, timestamp_ms, status, message";

/// Document-style backend over a single SQLite database.
///
/// Handles clone cheaply and share one connection behind a mutex; the busy
/// timeout plus the retry policy cover contention from other processes on
/// the same file.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Mutex<Connection>,
    codec: Arc<AddressCodec>,
    validator: RecordValidator,
    retry: RetryConfig,
}

impl SqliteStore {
    pub fn open(
        path: impl AsRef<Path>,
        codec: Arc<AddressCodec>,
        validator: RecordValidator,
        retry: RetryConfig,
    ) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?, codec, validator, retry)
    }

    pub fn open_in_memory(
        codec: Arc<AddressCodec>,
        validator: RecordValidator,
        retry: RetryConfig,
    ) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, codec, validator, retry)
    }

    fn from_connection(
        conn: Connection,
        codec: Arc<AddressCodec>,
        validator: RecordValidator,
        retry: RetryConfig,
    ) -> Result<Self, StoreError> {
        crate::schema::init_schema(&conn)?;
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                codec,
                validator,
                retry,
            }),
        })
    }

    /// A poisoned mutex only means another thread panicked while holding
    /// it; the connection underneath is still usable.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.inner.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Runs one statement's worth of work under the retry policy. Each
    /// attempt re-acquires the lock; work committed by earlier statements
    /// stays committed regardless of what happens here.
    fn with_conn<T>(
        &self,
        mut op: impl FnMut(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        with_retry(&self.inner.retry, StoreError::is_transient, || {
            let conn = self.conn();
            op(&conn)
        })
        .map_err(|e| match e {
            RetryError::Exhausted { attempts, last } => StoreError::Unreachable {
                attempts,
                last: last.to_string(),
            },
            RetryError::Failed(e) => e,
        })
    }

    fn insert_row(&self, record: &OperationRecord) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let result = conn.execute(
                &format!(
                    "INSERT INTO operations ({RECORD_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                rusqlite::params![
                    record.chain_identifier,
                    record.incident_id,
                    record.customer_id,
                    record.from_account,
                    record.to_account,
                    record.amount_value,
                    record.amount_asset_id,
                    record.fee_value,
                    record.fee_asset_id,
                    record.memo,
                    record.block_num,
                    record.tx_in_block,
                    record.op_in_tx,
                    record.expiration,
                    record.timestamp_ms,
                    record.status.as_str(),
                    record.message,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::DuplicateOperation {
                        chain_identifier: record.chain_identifier.clone(),
                    })
                }
                Err(e) => Err(StoreError::Sqlite(e)),
            }
        })
    }

    /// Collision handling for `insert_or_update`: an in-progress record is
    /// completed by a draft carrying block coordinates, a finalized record
    /// makes the call an idempotent no-op.
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

    /// Folds a completed record into its tracking address's balance row.
    ///
    /// The write is conditional on the version read alongside the row, so a
    /// concurrent materialization of the same read loses with `StaleUpdate`.
    fn materialize(&self, record: &OperationRecord) -> Result<(), StoreError> {
        let effect = balance::transfer_effect(&self.inner.codec, record)?;
        if !self.is_tracked(&effect.address, TrackingUsage::Balance)? {
            debug!(address = %effect.address, "address untracked, dropping balance row");
            self.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM balances WHERE address = ?1",
                    rusqlite::params![effect.address],
                )?;
                Ok(())
            })?;
            return Ok(());
        }

        let current = self.read_balance_versioned(&effect.address)?;
        let outcome = balance::fold(current.as_ref().map(|(row, _)| row), &effect)?;
        self.write_balance(&effect, current.map(|(_, version)| version), outcome)
    }

    fn read_balance_versioned(
        &self,
        address: &str,
    ) -> Result<Option<(BalanceRow, i64)>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT amounts, block_num, tx_in_block, op_in_tx, version \
                 FROM balances WHERE address = ?1",
            )?;
            let mut rows = stmt.query_map(rusqlite::params![address], |row| {
                let amounts: Vec<u8> = row.get(0)?;
                let block_num: u64 = row.get(1)?;
                let tx_in_block: u32 = row.get(2)?;
                let op_in_tx: u32 = row.get(3)?;
                let version: i64 = row.get(4)?;
                Ok((
                    amounts,
                    EventClock::new(block_num, tx_in_block, op_in_tx),
                    version,
                ))
            })?;
            match rows.next() {
                Some(Ok((amounts, clock, version))) => {
                    let amounts: BTreeMap<String, i64> = rmp_serde::from_slice(&amounts)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?;
                    Ok(Some((
                        BalanceRow {
                            address: address.to_string(),
                            amounts,
                            clock,
                        },
                        version,
                    )))
                }
                Some(Err(e)) => Err(StoreError::Sqlite(e)),
                None => Ok(None),
            }
        })
    }

    fn write_balance(
        &self,
        effect: &TransferEffect,
        version: Option<i64>,
        outcome: FoldOutcome,
    ) -> Result<(), StoreError> {
        let stale = || StoreError::StaleUpdate {
            address: effect.address.clone(),
            incoming: effect.clock,
        };
        match (version, outcome) {
            (None, FoldOutcome::Write(row)) => {
                let amounts = rmp_serde::to_vec(&row.amounts)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                self.with_conn(|conn| {
                    let result = conn.execute(
                        "INSERT INTO balances \
                         (address, amounts, block_num, tx_in_block, op_in_tx, version) \
                         VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                        rusqlite::params![
                            row.address,
                            amounts,
                            row.clock.block_num,
                            row.clock.tx_in_block,
                            row.clock.op_in_tx,
                        ],
                    );
                    match result {
                        Ok(_) => Ok(()),
                        Err(rusqlite::Error::SqliteFailure(err, _))
                            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                        {
                            Err(stale())
                        }
                        Err(e) => Err(StoreError::Sqlite(e)),
                    }
                })
            }
            (Some(version), FoldOutcome::Write(row)) => {
                let amounts = rmp_serde::to_vec(&row.amounts)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                self.with_conn(|conn| {
                    let n = conn.execute(
                        "UPDATE balances SET amounts = ?2, block_num = ?3, tx_in_block = ?4, \
                         op_in_tx = ?5, version = version + 1 \
                         WHERE address = ?1 AND version = ?6",
                        rusqlite::params![
                            row.address,
                            amounts,
                            row.clock.block_num,
                            row.clock.tx_in_block,
                            row.clock.op_in_tx,
                            version,
                        ],
                    )?;
                    if n == 0 { Err(stale()) } else { Ok(()) }
                })
            }
            (Some(version), FoldOutcome::Delete) => self.with_conn(|conn| {
                let n = conn.execute(
                    "DELETE FROM balances WHERE address = ?1 AND version = ?2",
                    rusqlite::params![effect.address, version],
                )?;
                if n == 0 { Err(stale()) } else { Ok(()) }
            }),
            // Nothing stored and nothing to store.
            (None, FoldOutcome::Delete) => Ok(()),
        }
    }
}

impl OperationStore for SqliteStore {
    fn insert(&self, draft: &OperationDraft) -> Result<OperationRecord, StoreError> {
        let record = self.inner.validator.prepare_for_insert(draft.clone())?;
        self.insert_row(&record)?;
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

        let n = self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE operations SET status = ?2, block_num = ?3, tx_in_block = ?4, \
                 op_in_tx = ?5 WHERE chain_identifier = ?1 AND status = ?6",
                rusqlite::params![
                    updated.chain_identifier,
                    OpStatus::Completed.as_str(),
                    updated.block_num,
                    updated.tx_in_block,
                    updated.op_in_tx,
                    OpStatus::InProgress.as_str(),
                ],
            )?;
            Ok(n)
        })?;
        if n == 0 {
            // Raced with another writer; report the status it left behind.
            let actual = self
                .find_by_chain_identifier(&completion.chain_identifier)?
                .ok_or_else(|| StoreError::NotFound(completion.chain_identifier.clone()))?;
            return Err(StoreError::Invalid(CoreError::StatusInvalid {
                expected: OpStatus::InProgress,
                actual: actual.status,
            }));
        }

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

        let n = self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE operations SET status = ?2, message = ?3 \
                 WHERE chain_identifier = ?1 AND status = ?4",
                rusqlite::params![
                    updated.chain_identifier,
                    OpStatus::Failed.as_str(),
                    updated.message,
                    OpStatus::InProgress.as_str(),
                ],
            )?;
            Ok(n)
        })?;
        if n == 0 {
            let actual = self
                .find_by_chain_identifier(chain_identifier)?
                .ok_or_else(|| StoreError::NotFound(chain_identifier.to_string()))?;
            return Err(StoreError::Invalid(CoreError::StatusInvalid {
                expected: OpStatus::InProgress,
                actual: actual.status,
            }));
        }
        Ok(updated)
    }

    fn get(&self, incident_id: &str) -> Result<OperationRecord, StoreError> {
        let found = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM operations WHERE incident_id = ?1 \
                 ORDER BY chain_identifier LIMIT 1"
            ))?;
            let mut rows = stmt.query_map(rusqlite::params![incident_id], |row| {
                read_record(row).map_err(tunnel)
            })?;
            match rows.next() {
                Some(Ok(record)) => Ok(Some(record)),
                Some(Err(e)) => Err(StoreError::Sqlite(e)),
                None => Ok(None),
            }
        })?;
        found.ok_or_else(|| StoreError::NotFound(incident_id.to_string()))
    }

    fn find_by_chain_identifier(
        &self,
        chain_identifier: &str,
    ) -> Result<Option<OperationRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM operations WHERE chain_identifier = ?1"
            ))?;
            let mut rows = stmt.query_map(rusqlite::params![chain_identifier], |row| {
                read_record(row).map_err(tunnel)
            })?;
            match rows.next() {
                Some(Ok(record)) => Ok(Some(record)),
                Some(Err(e)) => Err(StoreError::Sqlite(e)),
                None => Ok(None),
            }
        })
    }

    fn delete(&self, target: DeleteTarget<'_>) -> Result<(), StoreError> {
        let record = match target {
            DeleteTarget::Record(record) => record.clone(),
            DeleteTarget::IncidentId(incident_id) => self.get(incident_id)?,
        };
        self.inner.validator.prepare_for_delete(&record)?;

        let n = self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM operations WHERE chain_identifier = ?1",
                rusqlite::params![record.chain_identifier],
            )?;
            Ok(n)
        })?;
        if n == 0 {
            return Err(StoreError::NotFound(record.chain_identifier.clone()));
        }
        Ok(())
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

        self.with_conn(|conn| {
            let records = match &customer {
                Some(customer_id) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {RECORD_COLUMNS} FROM operations \
                         WHERE status = ?1 AND customer_id = ?2 \
                         ORDER BY block_num, tx_in_block, op_in_tx, chain_identifier"
                    ))?;
                    let records = stmt
                        .query_map(rusqlite::params![status.as_str(), customer_id], |row| {
                            read_record(row).map_err(tunnel)
                        })?
                        .collect::<Result<Vec<_>, _>>()?;
                    records
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {RECORD_COLUMNS} FROM operations WHERE status = ?1 \
                         ORDER BY block_num, tx_in_block, op_in_tx, chain_identifier"
                    ))?;
                    let records = stmt
                        .query_map(rusqlite::params![status.as_str()], |row| {
                            read_record(row).map_err(tunnel)
                        })?
                        .collect::<Result<Vec<_>, _>>()?;
                    records
                }
            };
            Ok(records)
        })
    }

    fn track(&self, addr: &str, usage: TrackingUsage) -> Result<(), StoreError> {
        let parts = address::parse(addr)?;
        if parts.customer_id.is_empty() {
            return Err(StoreError::Invalid(CoreError::InvalidAddress(
                addr.to_string(),
            )));
        }
        self.with_conn(|conn| {
            let result = conn.execute(
                "INSERT INTO tracked_addresses (address, usage) VALUES (?1, ?2)",
                rusqlite::params![addr, usage.as_str()],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::AddressTracked {
                        address: addr.to_string(),
                        usage,
                    })
                }
                Err(e) => Err(StoreError::Sqlite(e)),
            }
        })
    }

    fn untrack(&self, addr: &str, usage: TrackingUsage) -> Result<(), StoreError> {
        let n = self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM tracked_addresses WHERE address = ?1 AND usage = ?2",
                rusqlite::params![addr, usage.as_str()],
            )?;
            Ok(n)
        })?;
        if n == 0 {
            return Err(StoreError::AddressNotTracked {
                address: addr.to_string(),
                usage,
            });
        }
        if usage == TrackingUsage::Balance {
            self.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM balances WHERE address = ?1",
                    rusqlite::params![addr],
                )?;
                Ok(())
            })?;
        }
        Ok(())
    }

    fn is_tracked(&self, addr: &str, usage: TrackingUsage) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM tracked_addresses WHERE address = ?1 AND usage = ?2)",
                rusqlite::params![addr, usage.as_str()],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }

    fn tracked_addresses(&self, usage: TrackingUsage) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT address FROM tracked_addresses WHERE usage = ?1 ORDER BY address",
            )?;
            let addresses = stmt
                .query_map(rusqlite::params![usage.as_str()], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(addresses)
        })
    }

    fn get_balance(&self, addr: &str) -> Result<Option<BalanceRow>, StoreError> {
        Ok(self.read_balance_versioned(addr)?.map(|(row, _)| row))
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
        let cursor = continuation.unwrap_or("");
        let limit = page_size as i64 + 1;

        let mut raw = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT address, amounts, block_num, tx_in_block, op_in_tx FROM balances \
                 WHERE address > ?1 ORDER BY address LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![cursor, limit], |row| {
                    let addr: String = row.get(0)?;
                    let amounts: Vec<u8> = row.get(1)?;
                    let block_num: u64 = row.get(2)?;
                    let tx_in_block: u32 = row.get(3)?;
                    let op_in_tx: u32 = row.get(4)?;
                    Ok((addr, amounts, EventClock::new(block_num, tx_in_block, op_in_tx)))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let continuation = if raw.len() > page_size {
            raw.truncate(page_size);
            raw.last().map(|(addr, _, _)| addr.clone())
        } else {
            None
        };
        let rows = raw
            .into_iter()
            .map(|(addr, amounts, clock)| {
                let amounts = rmp_serde::from_slice(&amounts)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(BalanceRow {
                    address: addr,
                    amounts,
                    clock,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(BalancePage { rows, continuation })
    }

    fn get_checkpoint(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let value: u64 = conn.query_row(
                "SELECT last_head_block_num FROM checkpoint WHERE id = 1",
                [],
                |row| row.get(0),
            )?;
            Ok(value)
        })
    }

    fn set_checkpoint(&self, block_num: u64) -> Result<(), StoreError> {
        let n = self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE checkpoint SET last_head_block_num = ?1 \
                 WHERE id = 1 AND last_head_block_num < ?1",
                rusqlite::params![block_num],
            )?;
            Ok(n)
        })?;
        if n == 0 {
            let current = self.get_checkpoint()?;
            return Err(StoreError::OutOfOrder {
                current,
                requested: block_num,
            });
        }
        Ok(())
    }
}

fn read_record(row: &rusqlite::Row) -> Result<OperationRecord, StoreError> {
    let status_text: String = row.get(15)?;
    Ok(OperationRecord {
        chain_identifier: row.get(0)?,
        incident_id: row.get(1)?,
        customer_id: row.get(2)?,
        from_account: row.get(3)?,
        to_account: row.get(4)?,
        amount_value: row.get(5)?,
        amount_asset_id: row.get(6)?,
        fee_value: row.get(7)?,
        fee_asset_id: row.get(8)?,
        memo: row.get(9)?,
        block_num: row.get(10)?,
        tx_in_block: row.get(11)?,
        op_in_tx: row.get(12)?,
        expiration: row.get(13)?,
        timestamp_ms: row.get(14)?,
        status: OpStatus::parse(&status_text)?,
        message: row.get(16)?,
    })
}

/// Tunnels a StoreError through rusqlite's error system inside query_map
/// closures that must return rusqlite::Error.
fn tunnel(e: StoreError) -> rusqlite::Error {
    match e {
        StoreError::Sqlite(sq) => sq,
        other => rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(OpaqueStoreError(other.to_string())),
        ),
    }
}

#[derive(Debug)]
struct OpaqueStoreError(String);

impl std::fmt::Display for OpaqueStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OpaqueStoreError {}
