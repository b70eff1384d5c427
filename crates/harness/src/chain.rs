//! Deterministic chain double.
//!
//! Blocks are scripted up front; memos are "encrypted" by prefixing the
//! plaintext and labelling the envelope with the key that can open it;
//! transaction ids are content hashes. Everything the monitor observes is
//! reproducible run over run.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use omnibus_core::{AccountRef, AccountResolver, CoreError};
use omnibus_monitor::chain::{
    Block, ChainClient, ChainError, ChainOperation, EncryptedMemo, MemoDecodeError, Transaction,
    TransferOp, WatchMode,
};

/// Pooled deposit account.
pub const POOL_ID: &str = "1.2.100";
pub const POOL_NAME: &str = "lykke";
/// Pooled hot wallet.
pub const HOT_ID: &str = "1.2.101";
pub const HOT_NAME: &str = "lykke-hot";
/// An external counterparty account.
pub const EXTERNAL_ID: &str = "1.2.999";
pub const EXTERNAL_NAME: &str = "some-customer";
/// The chain's core asset.
pub const CORE_ASSET: &str = "1.3.0";
/// Memo key the scripted chain holds.
pub const POOL_MEMO_KEY: &str = "POOL_MEMO_KEY";

const CIPHER_PREFIX: &str = "pt:";

/// Fixed account registry backing the resolver seam.
pub struct Directory {
    accounts: Vec<AccountRef>,
}

impl Directory {
    pub fn new(accounts: Vec<AccountRef>) -> Self {
        Self { accounts }
    }

    /// The accounts every scripted scenario starts from.
    pub fn standard() -> Self {
        Self::new(vec![
            AccountRef::new(POOL_ID, POOL_NAME),
            AccountRef::new(HOT_ID, HOT_NAME),
            AccountRef::new(EXTERNAL_ID, EXTERNAL_NAME),
        ])
    }
}

impl AccountResolver for Directory {
    fn resolve(&self, id_or_name: &str) -> Result<AccountRef, CoreError> {
        self.accounts
            .iter()
            .find(|account| account.id == id_or_name || account.name == id_or_name)
            .cloned()
            .ok_or_else(|| CoreError::AccountResolution(id_or_name.to_string()))
    }
}

/// Scripted memo that decrypts to `plaintext` for a pool-key holder.
pub fn memo(plaintext: &str) -> EncryptedMemo {
    EncryptedMemo {
        from_key: "SENDER_KEY".into(),
        to_key: POOL_MEMO_KEY.into(),
        nonce: 1,
        message: format!("{CIPHER_PREFIX}{plaintext}"),
    }
}

/// Scripted memo addressed to a key the chain double does not hold.
pub fn memo_for_unknown_key(plaintext: &str) -> EncryptedMemo {
    EncryptedMemo {
        to_key: "SOMEONE_ELSES_KEY".into(),
        ..memo(plaintext)
    }
}

/// Scripted memo whose ciphertext does not decode.
pub fn garbled_memo() -> EncryptedMemo {
    EncryptedMemo {
        message: "ffffffff".into(),
        ..memo("")
    }
}

/// Transfer in the core asset with no fee; callers adjust the returned op
/// for fee or asset variations.
pub fn transfer(from: &str, to: &str, amount: i64, memo: Option<EncryptedMemo>) -> ChainOperation {
    ChainOperation::Transfer(TransferOp {
        from: from.into(),
        to: to.into(),
        amount_value: amount,
        amount_asset_id: CORE_ASSET.into(),
        fee_value: 0,
        fee_asset_id: CORE_ASSET.into(),
        memo,
    })
}

pub fn tx(operations: Vec<ChainOperation>) -> Transaction {
    Transaction {
        expiration: None,
        operations,
    }
}

pub fn block(num: u64, transactions: Vec<Transaction>) -> Block {
    Block {
        num,
        timestamp_ms: 1_700_000_000_000 + num * 3_000,
        transactions,
    }
}

/// Chain double scripted from a block list.
///
/// Delivery is stateful: each stream picks up at the first block not yet
/// delivered, so a restarted stream behaves like a resubscription to a live
/// feed. Blocks below the requested start are dropped; a block past the stop
/// bound ends the stream and stays queued for the next one.
pub struct ScriptedChain {
    blocks: Vec<Block>,
    keys: Vec<String>,
    cursor: AtomicUsize,
    id_derivations: AtomicU64,
}

impl ScriptedChain {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self {
            blocks,
            keys: vec![POOL_MEMO_KEY.to_string()],
            cursor: AtomicUsize::new(0),
            id_derivations: AtomicU64::new(0),
        }
    }

    /// A chain double with no memo keys loaded.
    pub fn without_keys(blocks: Vec<Block>) -> Self {
        Self {
            keys: Vec::new(),
            ..Self::new(blocks)
        }
    }

    /// How many transaction ids have been derived so far.
    pub fn id_derivations(&self) -> u64 {
        self.id_derivations.load(Ordering::Relaxed)
    }

    /// The id the scripted chain would assign to `transaction`, without
    /// counting as a derivation.
    pub fn expected_transaction_id(transaction: &Transaction) -> String {
        content_id(transaction)
    }
}

fn content_id(transaction: &Transaction) -> String {
    let digest = blake3::hash(format!("{transaction:?}").as_bytes());
    digest.to_hex()[..16].to_string()
}

impl ChainClient for ScriptedChain {
    fn stream_blocks(
        &self,
        _mode: WatchMode,
        start: Option<u64>,
        stop: Option<u64>,
    ) -> Box<dyn Iterator<Item = Result<Block, ChainError>> + '_> {
        let start = start.unwrap_or(0);
        Box::new(std::iter::from_fn(move || {
            loop {
                let index = self.cursor.load(Ordering::SeqCst);
                let block = self.blocks.get(index)?;
                if stop.is_some_and(|s| block.num > s) {
                    return None;
                }
                self.cursor.store(index + 1, Ordering::SeqCst);
                if block.num < start {
                    continue;
                }
                return Some(Ok(block.clone()));
            }
        }))
    }

    fn transaction_id(&self, transaction: &Transaction) -> Result<String, ChainError> {
        self.id_derivations.fetch_add(1, Ordering::Relaxed);
        Ok(content_id(transaction))
    }

    fn decrypt_memo(&self, memo: Option<&EncryptedMemo>) -> Result<String, MemoDecodeError> {
        let memo = memo.ok_or(MemoDecodeError::NoMemo)?;
        if !self.keys.iter().any(|key| key == &memo.to_key) {
            return Err(MemoDecodeError::MissingKey);
        }
        memo.message
            .strip_prefix(CIPHER_PREFIX)
            .map(str::to_string)
            .ok_or(MemoDecodeError::Undecryptable)
    }
}
