pub mod chain;
pub mod decode;
pub mod error;

pub use chain::{
    Block, ChainClient, ChainError, ChainOperation, EncryptedMemo, MemoDecodeError, Transaction,
    TransferOp, WatchMode,
};
pub use error::MonitorError;

use std::sync::Arc;

use tracing::{debug, warn};

use omnibus_core::AddressCodec;
use omnibus_storage::{OperationStore, StoreError};

use crate::decode::OpSite;

/// Streaming parameters for one listen run.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// First block to request; `None` resumes from the checkpoint, or the
    /// chain's current position on a fresh store.
    pub start_block: Option<u64>,
    /// Last block to process (inclusive); `None` follows indefinitely.
    pub stop_block: Option<u64>,
    pub mode: WatchMode,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            start_block: None,
            stop_block: None,
            mode: WatchMode::Irreversible,
        }
    }
}

/// Counters reported by [`BlockchainMonitor::listen`] once the stream ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub blocks_processed: u64,
    pub operations_stored: u64,
}

/// Sequential consumer of the block stream.
///
/// Walks blocks in order, extracts transfers that touch a pooled account,
/// and journals them through the store. The checkpoint is re-read before
/// every block so a concurrent writer (or an earlier crashed run) is
/// detected as a duplicate delivery or a gap rather than double-applied.
pub struct BlockchainMonitor {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn OperationStore>,
    codec: Arc<AddressCodec>,
    config: MonitorConfig,
}

impl BlockchainMonitor {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn OperationStore>,
        codec: Arc<AddressCodec>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            chain,
            store,
            codec,
            config,
        }
    }

    /// Streams blocks until the stop block is reached or the stream ends.
    ///
    /// Delivery anomalies are handled per block: a re-delivered checkpoint
    /// block is skipped, a gap restarts the stream at `checkpoint + 1`, and
    /// an operator-forced start away from the checkpoint is honoured once.
    pub fn listen(&self) -> Result<RunReport, MonitorError> {
        let checkpoint = self.store.get_checkpoint()?;
        let mut start = self.config.start_block;
        let mut allowed_jump = false;
        match start {
            None => {
                if checkpoint > 0 {
                    start = Some(checkpoint + 1);
                }
            }
            Some(requested) => {
                if requested != checkpoint + 1 {
                    allowed_jump = true;
                    warn!(
                        checkpoint,
                        requested, "forced start away from checkpoint, allowing one jump"
                    );
                }
            }
        }
        debug!(?start, stop = ?self.config.stop_block, checkpoint, "starting block stream");

        let mut report = RunReport::default();
        let mut retry = true;
        while retry {
            retry = false;
            for block in self
                .chain
                .stream_blocks(self.config.mode, start, self.config.stop_block)
            {
                let block = block?;
                let checkpoint = self.store.get_checkpoint()?;

                if checkpoint == 0
                    || block.num == checkpoint + 1
                    || (allowed_jump && block.num > checkpoint)
                {
                    allowed_jump = false;
                    report.operations_stored += self.process_block(&block)?;
                    self.store.set_checkpoint(block.num)?;
                    report.blocks_processed += 1;
                } else if block.num == checkpoint {
                    // Re-delivery after a reconnect; already applied.
                    debug!(block = block.num, "duplicate block delivery, skipping");
                } else {
                    let resume = checkpoint + 1;
                    if let Some(stop) = self.config.stop_block {
                        if resume > stop {
                            return Err(MonitorError::StopBeforeResume { resume, stop });
                        }
                    }
                    warn!(
                        block = block.num,
                        checkpoint, resume, "gap in block stream, restarting from checkpoint"
                    );
                    start = Some(resume);
                    retry = true;
                    break;
                }
            }
        }
        Ok(report)
    }

    fn process_block(&self, block: &Block) -> Result<u64, MonitorError> {
        debug!(block = block.num, "processing block");
        let mut stored = 0;
        for (tx_in_block, transaction) in block.transactions.iter().enumerate() {
            stored += self.process_transaction(block.num, tx_in_block as u32, transaction)?;
        }
        Ok(stored)
    }

    fn process_transaction(
        &self,
        block_num: u64,
        tx_in_block: u32,
        transaction: &Transaction,
    ) -> Result<u64, MonitorError> {
        let matched: Vec<(u32, &TransferOp)> = transaction
            .operations
            .iter()
            .enumerate()
            .filter_map(|(op_in_tx, operation)| match operation {
                ChainOperation::Transfer(transfer)
                    if self.codec.classify(&transfer.from, &transfer.to).is_ok() =>
                {
                    Some((op_in_tx as u32, transfer))
                }
                _ => None,
            })
            .collect();
        if matched.is_empty() {
            return Ok(0);
        }

        // Id derivation costs a signature pass, so it runs only for
        // transactions with at least one tracked transfer, once.
        let transaction_id = self.chain.transaction_id(transaction)?;

        let mut stored = 0;
        for (op_in_tx, transfer) in matched {
            let site = OpSite {
                transaction_id: &transaction_id,
                block_num,
                tx_in_block,
                op_in_tx,
                expiration: transaction.expiration,
            };
            let decrypted = self.chain.decrypt_memo(transfer.memo.as_ref());
            let draft = decode::decode_transfer(&self.codec, transfer, site, decrypted)?;

            match self.store.insert_or_update(&draft) {
                Ok(record) => {
                    debug!(
                        chain_identifier = %record.chain_identifier,
                        status = %record.status,
                        "stored transfer"
                    );
                    stored += 1;
                }
                Err(StoreError::DuplicateOperation { chain_identifier }) => {
                    debug!(%chain_identifier, "transfer already stored, skipping");
                }
                Err(StoreError::StaleUpdate { address, incoming }) => {
                    // The record itself landed; a newer event already
                    // advanced this balance.
                    debug!(%address, ?incoming, "balance ahead of this transfer, fold skipped");
                    stored += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(stored)
    }
}
