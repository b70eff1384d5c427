//! Shared wiring for integration tests: codec, validator, both store
//! backends, and record builders.

use std::path::Path;
use std::sync::Arc;

use omnibus_core::{AddressCodec, OperationDraft, PooledAccounts, RecordValidator};
use omnibus_storage::{
    MemoryTableClient, OperationStore, RetryConfig, SqliteStore, StoreError, TableStore,
};

use crate::chain::{CORE_ASSET, Directory, HOT_ID, HOT_NAME, POOL_ID, POOL_NAME};

/// Installs the test log subscriber; later calls are no-ops. Filtering
/// follows `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn pooled_accounts() -> PooledAccounts {
    PooledAccounts::new(vec![
        omnibus_core::AccountRef::new(POOL_ID, POOL_NAME),
        omnibus_core::AccountRef::new(HOT_ID, HOT_NAME),
    ])
}

/// Codec over the standard directory and pooled-account set.
pub fn codec() -> Arc<AddressCodec> {
    Arc::new(AddressCodec::new(
        Arc::new(Directory::standard()),
        pooled_accounts(),
    ))
}

pub fn sqlite_store() -> Result<SqliteStore, StoreError> {
    SqliteStore::open_in_memory(codec(), RecordValidator::new(), RetryConfig::default())
}

pub fn sqlite_store_at(path: &Path) -> Result<SqliteStore, StoreError> {
    SqliteStore::open(path, codec(), RecordValidator::new(), RetryConfig::default())
}

/// Table-backend store over a fresh in-memory table service. The client
/// handle is returned alongside for fault injection and direct inspection.
pub fn table_store() -> (TableStore, Arc<MemoryTableClient>) {
    let client = Arc::new(MemoryTableClient::new());
    (table_store_over(client.clone()), client)
}

pub fn table_store_over(client: Arc<MemoryTableClient>) -> TableStore {
    TableStore::new(client, codec(), RecordValidator::new(), RetryConfig::default())
}

/// Minimal in-progress draft; tests adjust fields per scenario.
pub fn draft(chain_identifier: &str, from: &str, to: &str, amount: i64) -> OperationDraft {
    OperationDraft {
        chain_identifier: chain_identifier.into(),
        incident_id: format!("incident-{chain_identifier}"),
        customer_id: "alice".into(),
        from_account: from.into(),
        to_account: to.into(),
        amount_value: amount,
        amount_asset_id: CORE_ASSET.into(),
        fee_value: 0,
        fee_asset_id: CORE_ASSET.into(),
        memo: "null".into(),
        block_num: None,
        tx_in_block: None,
        op_in_tx: None,
        expiration: None,
        status: None,
    }
}

/// Completed draft at the given block coordinates.
pub fn completed_draft(
    chain_identifier: &str,
    from: &str,
    to: &str,
    amount: i64,
    clock: (u64, u32, u32),
) -> OperationDraft {
    let mut completed = draft(chain_identifier, from, to, amount);
    completed.block_num = Some(clock.0);
    completed.tx_in_block = Some(clock.1);
    completed.op_in_tx = Some(clock.2);
    completed
}

/// Runs one scenario against a fresh store of each backend; a failure names
/// the backend it surfaced on.
pub fn with_each_store(
    scenario: impl Fn(&dyn OperationStore) -> Result<(), Box<dyn std::error::Error>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let sqlite = sqlite_store()?;
    scenario(&sqlite).map_err(|e| format!("sqlite backend: {e}"))?;
    let (table, _client) = table_store();
    scenario(&table).map_err(|e| format!("table backend: {e}"))?;
    Ok(())
}
