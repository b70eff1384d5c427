use crate::CoreError;
use crate::clock::physical_now;
use crate::record::{OpStatus, OperationRecord};

/// Raw operation data as handed to the store, before validation.
///
/// `status: None` means "infer from block coordinates" (completed when
/// present, in progress when not). Lifecycle fields the store owns
/// (timestamp, failure message) are absent here.
#[derive(Clone, Debug)]
pub struct OperationDraft {
    pub chain_identifier: String,
    pub incident_id: String,
    pub customer_id: String,
    pub from_account: String,
    pub to_account: String,
    pub amount_value: i64,
    pub amount_asset_id: String,
    pub fee_value: i64,
    pub fee_asset_id: String,
    pub memo: String,
    pub block_num: Option<u64>,
    pub tx_in_block: Option<u32>,
    pub op_in_tx: Option<u32>,
    pub expiration: Option<u64>,
    pub status: Option<OpStatus>,
}

/// Gatekeeper for every status transition. Constructed once and handed to
/// each store backend; no storage mutation happens on data that has not
/// passed through one of the `prepare_for_*` hooks.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecordValidator;

impl RecordValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validates a draft for insertion and turns it into a record.
    ///
    /// Status is inferred from block-coordinate presence when the draft
    /// leaves it unset; an explicit status must agree with the coordinates.
    /// Stamps the insertion timestamp.
    pub fn prepare_for_insert(&self, draft: OperationDraft) -> Result<OperationRecord, CoreError> {
        let status = match draft.status {
            None => {
                if draft.block_num.is_some() {
                    OpStatus::Completed
                } else {
                    OpStatus::InProgress
                }
            }
            Some(OpStatus::Completed) => {
                if draft.block_num.is_none() {
                    return Err(CoreError::InvalidOperation(
                        "completed record without block coordinates".into(),
                    ));
                }
                OpStatus::Completed
            }
            Some(OpStatus::InProgress) => {
                if draft.block_num.is_some() {
                    return Err(CoreError::InvalidOperation(
                        "in_progress record cannot carry block coordinates".into(),
                    ));
                }
                OpStatus::InProgress
            }
            Some(OpStatus::Failed) => {
                return Err(CoreError::InvalidOperation(
                    "cannot insert a failed record".into(),
                ));
            }
        };

        let record = build_record(draft, status, physical_now()?, None);
        self.check_schema(&record)?;
        Ok(record)
    }

    /// Validates the completion of a stored record and returns the updated
    /// record. Only status and block coordinates change; the stored
    /// incident id and business fields win over the incoming draft.
    pub fn prepare_for_complete(
        &self,
        stored: &OperationRecord,
        completion: &OperationDraft,
    ) -> Result<OperationRecord, CoreError> {
        if stored.status != OpStatus::InProgress {
            return Err(CoreError::StatusInvalid {
                expected: OpStatus::InProgress,
                actual: stored.status,
            });
        }
        if completion.chain_identifier.is_empty()
            || completion.chain_identifier != stored.chain_identifier
        {
            return Err(CoreError::InvalidOperation(format!(
                "completion targets chain identifier {:?}, record has {:?}",
                completion.chain_identifier, stored.chain_identifier
            )));
        }
        let (Some(block_num), Some(tx_in_block), Some(op_in_tx)) = (
            completion.block_num,
            completion.tx_in_block,
            completion.op_in_tx,
        ) else {
            return Err(CoreError::MissingBlockNum);
        };

        let mut updated = stored.clone();
        updated.status = OpStatus::Completed;
        updated.block_num = Some(block_num);
        updated.tx_in_block = Some(tx_in_block);
        updated.op_in_tx = Some(op_in_tx);
        self.check_schema(&updated)?;
        Ok(updated)
    }

    /// Validates failing a stored record and returns the updated record.
    pub fn prepare_for_fail(
        &self,
        stored: &OperationRecord,
        message: Option<&str>,
    ) -> Result<OperationRecord, CoreError> {
        if stored.status != OpStatus::InProgress {
            return Err(CoreError::StatusInvalid {
                expected: OpStatus::InProgress,
                actual: stored.status,
            });
        }
        let mut updated = stored.clone();
        updated.status = OpStatus::Failed;
        updated.message = message.map(str::to_string);
        Ok(updated)
    }

    /// Checks that a stored record may be deleted. In-progress records are
    /// not deletable through this path.
    pub fn prepare_for_delete(&self, stored: &OperationRecord) -> Result<(), CoreError> {
        if stored.status == OpStatus::InProgress {
            return Err(CoreError::InvalidOperation(
                "cannot delete an in_progress record".into(),
            ));
        }
        Ok(())
    }

    /// Value-level schema checks on a fully shaped record.
    fn check_schema(&self, record: &OperationRecord) -> Result<(), CoreError> {
        for (field, value) in [
            ("chain_identifier", &record.chain_identifier),
            ("incident_id", &record.incident_id),
            ("from", &record.from_account),
            ("to", &record.to_account),
            ("amount_asset_id", &record.amount_asset_id),
            ("fee_asset_id", &record.fee_asset_id),
        ] {
            if value.is_empty() {
                return Err(CoreError::SchemaValidation(format!("{field} is required")));
            }
        }
        if record.amount_value < 0 {
            return Err(CoreError::SchemaValidation("amount_value is negative".into()));
        }
        if record.fee_value < 0 {
            return Err(CoreError::SchemaValidation("fee_value is negative".into()));
        }
        let coords = [
            record.block_num.is_some(),
            record.tx_in_block.is_some(),
            record.op_in_tx.is_some(),
        ];
        if coords.iter().any(|c| *c) && !coords.iter().all(|c| *c) {
            return Err(CoreError::SchemaValidation(
                "incomplete block coordinates".into(),
            ));
        }
        match record.status {
            OpStatus::Completed if record.block_num.is_none() => Err(CoreError::InvalidOperation(
                "completed record without block coordinates".into(),
            )),
            OpStatus::InProgress if record.block_num.is_some() => Err(CoreError::InvalidOperation(
                "in_progress record cannot carry block coordinates".into(),
            )),
            _ => Ok(()),
        }
    }
}

fn build_record(
    draft: OperationDraft,
    status: OpStatus,
    timestamp_ms: u64,
    message: Option<String>,
) -> OperationRecord {
    OperationRecord {
        chain_identifier: draft.chain_identifier,
        incident_id: draft.incident_id,
        customer_id: draft.customer_id,
        from_account: draft.from_account,
        to_account: draft.to_account,
        amount_value: draft.amount_value,
        amount_asset_id: draft.amount_asset_id,
        fee_value: draft.fee_value,
        fee_asset_id: draft.fee_asset_id,
        memo: draft.memo,
        block_num: draft.block_num,
        tx_in_block: draft.tx_in_block,
        op_in_tx: draft.op_in_tx,
        expiration: draft.expiration,
        timestamp_ms,
        status,
        message,
    }
}
