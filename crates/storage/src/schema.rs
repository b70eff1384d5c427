use rusqlite::Connection;

use crate::error::StoreError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS operations (
    rowid INTEGER PRIMARY KEY,
    chain_identifier TEXT NOT NULL UNIQUE CHECK (chain_identifier <> ''),
    incident_id TEXT NOT NULL CHECK (incident_id <> ''),
    customer_id TEXT NOT NULL,
    from_account TEXT NOT NULL CHECK (from_account <> ''),
    to_account TEXT NOT NULL CHECK (to_account <> ''),
    amount_value INTEGER NOT NULL CHECK (amount_value >= 0),
    amount_asset_id TEXT NOT NULL CHECK (amount_asset_id <> ''),
    fee_value INTEGER NOT NULL CHECK (fee_value >= 0),
    fee_asset_id TEXT NOT NULL CHECK (fee_asset_id <> ''),
    memo TEXT NOT NULL,
    block_num INTEGER,
    tx_in_block INTEGER,
    op_in_tx INTEGER,
    expiration INTEGER,
    timestamp_ms INTEGER NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('in_progress', 'completed', 'failed')),
    message TEXT,
    CHECK ((status = 'completed') = (block_num IS NOT NULL)),
    CHECK ((block_num IS NULL) = (tx_in_block IS NULL)),
    CHECK ((block_num IS NULL) = (op_in_tx IS NULL))
);
CREATE INDEX IF NOT EXISTS idx_operations_incident ON operations (incident_id, chain_identifier);
CREATE INDEX IF NOT EXISTS idx_operations_status_customer ON operations (status, customer_id);
CREATE INDEX IF NOT EXISTS idx_operations_coords ON operations (block_num, tx_in_block, op_in_tx);

CREATE TABLE IF NOT EXISTS tracked_addresses (
    address TEXT NOT NULL CHECK (address <> ''),
    usage TEXT NOT NULL CHECK (usage IN ('balance', 'history_from', 'history_to')),
    PRIMARY KEY (address, usage)
);

CREATE TABLE IF NOT EXISTS balances (
    address TEXT PRIMARY KEY CHECK (address <> ''),
    amounts BLOB NOT NULL,
    block_num INTEGER NOT NULL,
    tx_in_block INTEGER NOT NULL,
    op_in_tx INTEGER NOT NULL,
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoint (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_head_block_num INTEGER NOT NULL
);
INSERT OR IGNORE INTO checkpoint (id, last_head_block_num) VALUES (1, 0);
";
