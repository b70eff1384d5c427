use std::error::Error;

use omnibus_core::OpStatus;
use omnibus_harness::chain::{CORE_ASSET, EXTERNAL_ID, POOL_ID};
use omnibus_harness::fixtures::{self, completed_draft};
use omnibus_storage::table::{BALANCES_TABLE, OPERATIONS_BY_ID, OPERATIONS_BY_INCIDENT};
use omnibus_storage::{InjectedFault, OperationStore, StoreError, TrackingUsage};

// ============================================================================
// Injected table faults (4 tests)
// ============================================================================

#[test]
fn transient_faults_below_the_budget_heal_invisibly() -> Result<(), Box<dyn Error>> {
    fixtures::init_logging();
    let (store, client) = fixtures::table_store();
    client.fail_next_inserts(OPERATIONS_BY_ID, 2, InjectedFault::Transient);

    let record = store.insert(&completed_draft("tx-a:0", EXTERNAL_ID, POOL_ID, 10, (5, 0, 0)))?;
    assert_eq!(record.status, OpStatus::Completed);
    assert!(store.find_by_chain_identifier("tx-a:0")?.is_some());
    Ok(())
}

#[test]
fn exhausted_retries_leave_no_partial_state() -> Result<(), Box<dyn Error>> {
    fixtures::init_logging();
    let (store, client) = fixtures::table_store();
    client.fail_next_inserts(OPERATIONS_BY_ID, 3, InjectedFault::Transient);

    let err = store
        .insert(&completed_draft("tx-b:0", EXTERNAL_ID, POOL_ID, 10, (6, 0, 0)))
        .unwrap_err();
    assert!(matches!(err, StoreError::Unreachable { attempts: 3, .. }));
    assert!(store.find_by_chain_identifier("tx-b:0")?.is_none());

    // The outage cleared; the same draft goes through.
    store.insert(&completed_draft("tx-b:0", EXTERNAL_ID, POOL_ID, 10, (6, 0, 0)))?;
    assert!(store.find_by_chain_identifier("tx-b:0")?.is_some());
    Ok(())
}

#[test]
fn secondary_projection_failure_rolls_back_the_commit_point() -> Result<(), Box<dyn Error>> {
    fixtures::init_logging();
    let (store, client) = fixtures::table_store();
    client.fail_next_inserts(OPERATIONS_BY_INCIDENT, 1, InjectedFault::Fatal);

    let err = store
        .insert(&completed_draft("tx-c:0", EXTERNAL_ID, POOL_ID, 10, (7, 0, 0)))
        .unwrap_err();
    assert!(matches!(err, StoreError::Table(_)));
    // The chain-identifier projection was compensated away, so a retry of
    // the same draft starts from a clean slate.
    assert!(store.find_by_chain_identifier("tx-c:0")?.is_none());

    let record = store.insert(&completed_draft("tx-c:0", EXTERNAL_ID, POOL_ID, 10, (7, 0, 0)))?;
    assert_eq!(store.get(&record.incident_id)?.chain_identifier, "tx-c:0");
    Ok(())
}

#[test]
fn balance_write_faults_surface_after_the_record_lands() -> Result<(), Box<dyn Error>> {
    fixtures::init_logging();
    let (store, client) = fixtures::table_store();
    let addr = format!("{POOL_ID}:alice");
    store.track(&addr, TrackingUsage::Balance)?;
    client.fail_next_inserts(BALANCES_TABLE, 1, InjectedFault::Fatal);

    let err = store
        .insert(&completed_draft("tx-d:0", EXTERNAL_ID, POOL_ID, 10, (8, 0, 0)))
        .unwrap_err();
    assert!(matches!(err, StoreError::Table(_)));
    // The record committed; only the balance fold was lost.
    assert!(store.find_by_chain_identifier("tx-d:0")?.is_some());
    assert!(store.get_balance(&addr)?.is_none());

    // Later transfers keep folding normally.
    store.insert(&completed_draft("tx-d:1", EXTERNAL_ID, POOL_ID, 30, (9, 0, 0)))?;
    let row = store.get_balance(&addr)?.ok_or("missing balance row")?;
    assert_eq!(row.amounts.get(CORE_ASSET), Some(&30));
    Ok(())
}
