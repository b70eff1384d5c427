//! In-memory [`TableClient`] with the same semantics as a hosted table
//! service: per-entity etags, conditional writes, and row-key-ordered
//! partition scans. Used by the test harness; also handy as a scratch
//! backend for tooling that does not want a file on disk.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::table::{TableClient, TableEntity, TableError, TablePage};

/// What an armed fault should look like to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    /// A retryable transport failure.
    Transient,
    /// A hard backend failure, surfaced on the first attempt.
    Fatal,
}

impl InjectedFault {
    fn to_error(self) -> TableError {
        match self {
            InjectedFault::Transient => TableError::Transport("injected transport fault".into()),
            InjectedFault::Fatal => TableError::Backend("injected backend fault".into()),
        }
    }
}

struct StoredEntity {
    payload: Vec<u8>,
    etag: u64,
}

#[derive(Default)]
struct Inner {
    tables: BTreeMap<String, BTreeMap<(String, String), StoredEntity>>,
    next_etag: u64,
    insert_faults: HashMap<String, (u32, InjectedFault)>,
}

#[derive(Default)]
pub struct MemoryTableClient {
    inner: Mutex<Inner>,
}

impl MemoryTableClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the next `count` inserts into `table` to fail with `fault`.
    /// Counts do not stack; arming replaces any previous arm for the table.
    pub fn fail_next_inserts(&self, table: &str, count: u32, fault: InjectedFault) {
        let mut inner = self.lock();
        if count == 0 {
            inner.insert_faults.remove(table);
        } else {
            inner.insert_faults.insert(table.to_string(), (count, fault));
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            // A poisoned mutex only means another thread panicked while
            // holding it; the map underneath is still usable.
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Inner {
    fn take_etag(&mut self) -> u64 {
        self.next_etag += 1;
        self.next_etag
    }

    fn take_insert_fault(&mut self, table: &str) -> Option<TableError> {
        let (remaining, fault) = self.insert_faults.get_mut(table)?;
        *remaining -= 1;
        let fault = *fault;
        if *remaining == 0 {
            self.insert_faults.remove(table);
        }
        Some(fault.to_error())
    }
}

impl TableClient for MemoryTableClient {
    fn insert(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        payload: &[u8],
    ) -> Result<(), TableError> {
        let mut inner = self.lock();
        if let Some(error) = inner.take_insert_fault(table) {
            return Err(error);
        }
        let etag = inner.take_etag();
        let rows = inner.tables.entry(table.to_string()).or_default();
        let key = (partition_key.to_string(), row_key.to_string());
        if rows.contains_key(&key) {
            return Err(TableError::Conflict);
        }
        rows.insert(
            key,
            StoredEntity {
                payload: payload.to_vec(),
                etag,
            },
        );
        Ok(())
    }

    fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<TableEntity, TableError> {
        let inner = self.lock();
        let stored = inner
            .tables
            .get(table)
            .and_then(|rows| rows.get(&(partition_key.to_string(), row_key.to_string())))
            .ok_or(TableError::NotFound)?;
        Ok(TableEntity {
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
            payload: stored.payload.clone(),
            etag: stored.etag,
        })
    }

    fn update(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        payload: &[u8],
        if_match: Option<u64>,
    ) -> Result<(), TableError> {
        let mut inner = self.lock();
        let etag = inner.take_etag();
        let stored = inner
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(&(partition_key.to_string(), row_key.to_string())))
            .ok_or(TableError::NotFound)?;
        if let Some(expected) = if_match {
            if stored.etag != expected {
                return Err(TableError::PreconditionFailed);
            }
        }
        stored.payload = payload.to_vec();
        stored.etag = etag;
        Ok(())
    }

    fn insert_or_replace(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        payload: &[u8],
    ) -> Result<(), TableError> {
        let mut inner = self.lock();
        let etag = inner.take_etag();
        let rows = inner.tables.entry(table.to_string()).or_default();
        rows.insert(
            (partition_key.to_string(), row_key.to_string()),
            StoredEntity {
                payload: payload.to_vec(),
                etag,
            },
        );
        Ok(())
    }

    fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        if_match: Option<u64>,
    ) -> Result<(), TableError> {
        let mut inner = self.lock();
        let rows = inner.tables.get_mut(table).ok_or(TableError::NotFound)?;
        let key = (partition_key.to_string(), row_key.to_string());
        let stored = rows.get(&key).ok_or(TableError::NotFound)?;
        if let Some(expected) = if_match {
            if stored.etag != expected {
                return Err(TableError::PreconditionFailed);
            }
        }
        rows.remove(&key);
        Ok(())
    }

    fn query_partition(
        &self,
        table: &str,
        partition_key: &str,
        take: usize,
        continuation: Option<&str>,
    ) -> Result<TablePage, TableError> {
        let inner = self.lock();
        let cursor = continuation.unwrap_or("");
        let matching: Vec<TableEntity> = inner
            .tables
            .get(table)
            .into_iter()
            .flat_map(|rows| rows.iter())
            .filter(|((pk, rk), _)| pk == partition_key && rk.as_str() > cursor)
            .map(|((pk, rk), stored)| TableEntity {
                partition_key: pk.clone(),
                row_key: rk.clone(),
                payload: stored.payload.clone(),
                etag: stored.etag,
            })
            .collect();

        if take == 0 || matching.len() <= take {
            return Ok(TablePage {
                entities: matching,
                continuation: None,
            });
        }
        let mut entities = matching;
        entities.truncate(take);
        let continuation = entities.last().map(|entity| entity.row_key.clone());
        Ok(TablePage {
            entities,
            continuation,
        })
    }
}
