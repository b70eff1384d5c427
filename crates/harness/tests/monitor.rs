use std::error::Error;
use std::sync::Arc;

use omnibus_core::{EventClock, OpStatus, OperationRecord};
use omnibus_harness::chain::{self, CORE_ASSET, EXTERNAL_ID, POOL_ID, POOL_MEMO_KEY, ScriptedChain};
use omnibus_harness::fixtures;
use omnibus_monitor::decode::{MEMO_ABSENT, MEMO_KEY_MISSING, MEMO_UNDECODABLE};
use omnibus_monitor::{BlockchainMonitor, ChainOperation, MonitorConfig, MonitorError, RunReport};
use omnibus_storage::{
    InjectedFault, OperationStore, StatusFilter, StoreError, TrackingUsage, table,
};

fn deposit_tx(
    amount: i64,
    memo: Option<omnibus_monitor::EncryptedMemo>,
) -> omnibus_monitor::Transaction {
    chain::tx(vec![chain::transfer(EXTERNAL_ID, POOL_ID, amount, memo)])
}

fn only_with_customer(
    store: &dyn OperationStore,
    customer: &str,
) -> Result<OperationRecord, Box<dyn Error>> {
    let mut records =
        store.list_by_status(OpStatus::Completed, &StatusFilter::by_customer(customer))?;
    if records.len() != 1 {
        return Err(format!(
            "expected one record for customer {customer:?}, got {}",
            records.len()
        )
        .into());
    }
    Ok(records.remove(0))
}

// ============================================================================
// Stream processing (4 tests)
// ============================================================================

#[test]
fn deposits_flow_from_stream_to_balances() -> Result<(), Box<dyn Error>> {
    fixtures::init_logging();
    let (store, _client) = fixtures::table_store();
    let store = Arc::new(store);
    let addr = format!("{POOL_ID}:alice");
    store.track(&addr, TrackingUsage::Balance)?;

    let deposit = deposit_tx(400, Some(chain::memo("alice:incident-7")));
    let expected_id = format!("{}:0", ScriptedChain::expected_transaction_id(&deposit));
    let scripted = Arc::new(ScriptedChain::new(vec![
        chain::block(50, vec![deposit]),
        chain::block(51, vec![]),
    ]));

    let monitor = BlockchainMonitor::new(
        scripted,
        store.clone(),
        fixtures::codec(),
        MonitorConfig::default(),
    );
    let report = monitor.listen()?;
    assert_eq!(
        report,
        RunReport {
            blocks_processed: 2,
            operations_stored: 1,
        }
    );

    let record = store
        .find_by_chain_identifier(&expected_id)?
        .ok_or("missing record")?;
    assert_eq!(record.status, OpStatus::Completed);
    assert_eq!(record.customer_id, "alice");
    assert_eq!(record.incident_id, "incident-7");
    assert_eq!(record.block_num, Some(50));

    let row = store.get_balance(&addr)?.ok_or("missing balance row")?;
    assert_eq!(row.amounts.get(CORE_ASSET), Some(&400));
    assert_eq!(row.clock, EventClock::new(50, 0, 0));
    assert_eq!(store.get_checkpoint()?, 51);
    Ok(())
}

#[test]
fn undecodable_memos_fall_back_to_sentinels() -> Result<(), Box<dyn Error>> {
    fixtures::init_logging();
    let (store, _client) = fixtures::table_store();
    let store = Arc::new(store);

    let with_memo = deposit_tx(10, Some(chain::memo("alice:incident-7")));
    let foreign_key = deposit_tx(20, Some(chain::memo_for_unknown_key("bob")));
    let no_memo = deposit_tx(30, None);
    let garbled = deposit_tx(40, Some(chain::garbled_memo()));

    let scripted = Arc::new(ScriptedChain::new(vec![chain::block(
        60,
        vec![with_memo, foreign_key.clone(), no_memo, garbled],
    )]));
    let monitor = BlockchainMonitor::new(
        scripted,
        store.clone(),
        fixtures::codec(),
        MonitorConfig::default(),
    );
    let report = monitor.listen()?;
    assert_eq!(report.operations_stored, 4);

    // Decoded plaintext is consumed into customer and incident; the raw
    // envelope stays on the record for audit.
    let decoded = only_with_customer(store.as_ref(), "alice")?;
    assert_eq!(decoded.incident_id, "incident-7");
    let envelope: serde_json::Value = serde_json::from_str(&decoded.memo)?;
    assert_eq!(envelope["to"], POOL_MEMO_KEY);
    assert_eq!(envelope["message"], "pt:alice:incident-7");

    let foreign = only_with_customer(store.as_ref(), MEMO_KEY_MISSING)?;
    let foreign_id = format!("{}:0", ScriptedChain::expected_transaction_id(&foreign_key));
    assert_eq!(foreign.chain_identifier, foreign_id);
    assert_eq!(foreign.incident_id, foreign_id);

    let silent = only_with_customer(store.as_ref(), MEMO_ABSENT)?;
    assert_eq!(silent.memo, "null");
    assert_eq!(silent.incident_id, silent.chain_identifier);

    let unreadable = only_with_customer(store.as_ref(), MEMO_UNDECODABLE)?;
    assert_eq!(unreadable.incident_id, unreadable.chain_identifier);
    Ok(())
}

#[test]
fn transaction_ids_derive_only_for_matching_transfers() -> Result<(), Box<dyn Error>> {
    fixtures::init_logging();
    let (store, _client) = fixtures::table_store();
    let store = Arc::new(store);

    let unrelated = chain::tx(vec![chain::transfer(EXTERNAL_ID, "1.2.555", 10, None)]);
    let non_transfer = chain::tx(vec![ChainOperation::Other]);
    let matched = deposit_tx(20, None);

    let scripted = Arc::new(ScriptedChain::new(vec![
        chain::block(70, vec![unrelated, non_transfer]),
        chain::block(71, vec![matched]),
    ]));
    let monitor = BlockchainMonitor::new(
        scripted.clone(),
        store.clone(),
        fixtures::codec(),
        MonitorConfig::default(),
    );
    let report = monitor.listen()?;

    assert_eq!(
        report,
        RunReport {
            blocks_processed: 2,
            operations_stored: 1,
        }
    );
    assert_eq!(scripted.id_derivations(), 1);
    Ok(())
}

#[test]
fn restart_resumes_from_the_persisted_checkpoint() -> Result<(), Box<dyn Error>> {
    fixtures::init_logging();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("omnibus.db");
    let addr = format!("{POOL_ID}:alice");

    let history = vec![
        chain::block(200, vec![deposit_tx(100, Some(chain::memo("alice")))]),
        chain::block(201, vec![]),
    ];

    {
        let store = Arc::new(fixtures::sqlite_store_at(&path)?);
        store.track(&addr, TrackingUsage::Balance)?;
        let scripted = Arc::new(ScriptedChain::new(history.clone()));
        let monitor = BlockchainMonitor::new(
            scripted,
            store.clone(),
            fixtures::codec(),
            MonitorConfig::default(),
        );
        let report = monitor.listen()?;
        assert_eq!(
            report,
            RunReport {
                blocks_processed: 2,
                operations_stored: 1,
            }
        );
        assert_eq!(store.get_checkpoint()?, 201);
    }

    // A new process sees the replayed history plus one fresh block; the
    // checkpoint skips everything already applied.
    let mut replay = history;
    replay.push(chain::block(202, vec![deposit_tx(50, Some(chain::memo("alice")))]));
    let store = Arc::new(fixtures::sqlite_store_at(&path)?);
    let scripted = Arc::new(ScriptedChain::new(replay));
    let monitor = BlockchainMonitor::new(
        scripted,
        store.clone(),
        fixtures::codec(),
        MonitorConfig::default(),
    );
    let report = monitor.listen()?;

    assert_eq!(
        report,
        RunReport {
            blocks_processed: 1,
            operations_stored: 1,
        }
    );
    assert_eq!(store.get_checkpoint()?, 202);
    let row = store.get_balance(&addr)?.ok_or("missing balance row")?;
    assert_eq!(row.amounts.get(CORE_ASSET), Some(&150));
    assert_eq!(row.clock, EventClock::new(202, 0, 0));
    Ok(())
}

// ============================================================================
// Delivery anomalies (4 tests)
// ============================================================================

#[test]
fn redelivered_checkpoint_block_is_skipped() -> Result<(), Box<dyn Error>> {
    fixtures::init_logging();
    let (store, _client) = fixtures::table_store();
    let store = Arc::new(store);
    let addr = format!("{POOL_ID}:alice");
    store.track(&addr, TrackingUsage::Balance)?;

    let deposit_block = chain::block(80, vec![deposit_tx(100, Some(chain::memo("alice")))]);
    let scripted = Arc::new(ScriptedChain::new(vec![
        deposit_block.clone(),
        deposit_block,
        chain::block(81, vec![]),
    ]));
    let monitor = BlockchainMonitor::new(
        scripted,
        store.clone(),
        fixtures::codec(),
        MonitorConfig::default(),
    );
    let report = monitor.listen()?;

    assert_eq!(
        report,
        RunReport {
            blocks_processed: 2,
            operations_stored: 1,
        }
    );
    let row = store.get_balance(&addr)?.ok_or("missing balance row")?;
    assert_eq!(row.amounts.get(CORE_ASSET), Some(&100));
    assert_eq!(store.get_checkpoint()?, 81);
    Ok(())
}

#[test]
fn gap_restarts_the_stream_from_the_checkpoint() -> Result<(), Box<dyn Error>> {
    fixtures::init_logging();
    let (store, _client) = fixtures::table_store();
    let store = Arc::new(store);
    let addr = format!("{POOL_ID}:alice");
    store.track(&addr, TrackingUsage::Balance)?;
    store.set_checkpoint(100)?;

    let b101 = chain::block(101, vec![deposit_tx(100, Some(chain::memo("alice")))]);
    let b102 = chain::block(102, vec![deposit_tx(200, Some(chain::memo("alice")))]);
    let b103 = chain::block(103, vec![deposit_tx(400, Some(chain::memo("alice")))]);

    // 102 arrives before 101; the reconnected stream replays from 101.
    let scripted = Arc::new(ScriptedChain::new(vec![b102.clone(), b101, b102, b103]));
    let monitor = BlockchainMonitor::new(
        scripted,
        store.clone(),
        fixtures::codec(),
        MonitorConfig::default(),
    );
    let report = monitor.listen()?;

    assert_eq!(
        report,
        RunReport {
            blocks_processed: 3,
            operations_stored: 3,
        }
    );
    assert_eq!(store.get_checkpoint()?, 103);
    let row = store.get_balance(&addr)?.ok_or("missing balance row")?;
    assert_eq!(row.amounts.get(CORE_ASSET), Some(&700));
    assert_eq!(row.clock, EventClock::new(103, 0, 0));
    Ok(())
}

#[test]
fn forced_start_is_honoured_for_one_jump() -> Result<(), Box<dyn Error>> {
    fixtures::init_logging();
    let (store, _client) = fixtures::table_store();
    let store = Arc::new(store);
    let addr = format!("{POOL_ID}:alice");
    store.track(&addr, TrackingUsage::Balance)?;
    store.set_checkpoint(10)?;

    let scripted = Arc::new(ScriptedChain::new(vec![
        chain::block(20, vec![deposit_tx(100, Some(chain::memo("alice")))]),
        chain::block(21, vec![]),
        chain::block(30, vec![deposit_tx(999, Some(chain::memo("alice")))]),
    ]));
    let config = MonitorConfig {
        start_block: Some(20),
        ..MonitorConfig::default()
    };
    let monitor = BlockchainMonitor::new(scripted, store.clone(), fixtures::codec(), config);
    let report = monitor.listen()?;

    // The jump to 20 is allowed once; the second gap at 30 is not forgiven
    // and leaves the stream waiting at the checkpoint.
    assert_eq!(
        report,
        RunReport {
            blocks_processed: 2,
            operations_stored: 1,
        }
    );
    assert_eq!(store.get_checkpoint()?, 21);
    let row = store.get_balance(&addr)?.ok_or("missing balance row")?;
    assert_eq!(row.amounts.get(CORE_ASSET), Some(&100));
    Ok(())
}

#[test]
fn stop_bound_inside_a_gap_fails_loudly() -> Result<(), Box<dyn Error>> {
    fixtures::init_logging();
    let (store, _client) = fixtures::table_store();
    let store = Arc::new(store);
    store.set_checkpoint(100)?;

    let scripted = Arc::new(ScriptedChain::new(vec![chain::block(99, vec![])]));
    let config = MonitorConfig {
        start_block: Some(99),
        stop_block: Some(100),
        ..MonitorConfig::default()
    };
    let monitor = BlockchainMonitor::new(scripted, store.clone(), fixtures::codec(), config);

    let err = monitor.listen().unwrap_err();
    assert!(matches!(
        err,
        MonitorError::StopBeforeResume {
            resume: 101,
            stop: 100,
        }
    ));
    assert_eq!(store.get_checkpoint()?, 100);
    Ok(())
}

// ============================================================================
// Storage trouble (1 test)
// ============================================================================

#[test]
fn persistent_transport_faults_abort_the_run() -> Result<(), Box<dyn Error>> {
    fixtures::init_logging();
    let (store, client) = fixtures::table_store();
    let store = Arc::new(store);

    let scripted = Arc::new(ScriptedChain::new(vec![chain::block(
        90,
        vec![deposit_tx(10, None)],
    )]));
    client.fail_next_inserts(table::OPERATIONS_BY_ID, 3, InjectedFault::Transient);

    let monitor = BlockchainMonitor::new(
        scripted,
        store.clone(),
        fixtures::codec(),
        MonitorConfig::default(),
    );
    let err = monitor.listen().unwrap_err();
    assert!(matches!(
        err,
        MonitorError::Store(StoreError::Unreachable { attempts: 3, .. })
    ));
    // Nothing committed: the block will be re-processed on the next run.
    assert_eq!(store.get_checkpoint()?, 0);
    assert!(
        store
            .list_by_status(OpStatus::Completed, &StatusFilter::default())?
            .is_empty()
    );
    Ok(())
}
