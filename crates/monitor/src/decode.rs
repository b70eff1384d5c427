//! Turns a matched chain transfer into a storable draft.
//!
//! Decoding never fails on memo problems: each undecryptable case becomes
//! a sentinel customer token, and a missing incident id falls back to the
//! chain identifier so re-delivery reproduces the identical record.

use omnibus_core::{AddressCodec, MemoParts, OperationDraft};

use crate::chain::{MemoDecodeError, TransferOp};
use crate::error::MonitorError;

/// Sentinel customer token for a memo whose decryption key is not loaded.
pub const MEMO_KEY_MISSING: &str = "memo_key_missing";
/// Sentinel customer token for a transfer that carried no memo at all.
pub const MEMO_ABSENT: &str = "";
/// Sentinel customer token for a memo that failed to decrypt.
pub const MEMO_UNDECODABLE: &str = "decoding_not_possible";

/// Where in the chain a matched transfer sits.
#[derive(Debug, Clone, Copy)]
pub struct OpSite<'a> {
    pub transaction_id: &'a str,
    pub block_num: u64,
    pub tx_in_block: u32,
    pub op_in_tx: u32,
    pub expiration: Option<u64>,
}

/// Maps a decryption outcome to the plaintext used for memo splitting.
pub fn plaintext_or_sentinel(decrypted: Result<String, MemoDecodeError>) -> String {
    match decrypted {
        Ok(text) => text,
        Err(MemoDecodeError::MissingKey) => MEMO_KEY_MISSING.to_string(),
        Err(MemoDecodeError::NoMemo) => MEMO_ABSENT.to_string(),
        Err(MemoDecodeError::Undecryptable) => MEMO_UNDECODABLE.to_string(),
    }
}

/// Builds the draft for one matched transfer.
///
/// The chain identifier is `transaction_id:op_in_tx`. The raw memo
/// envelope is stored as JSON next to the decoded customer/incident pair.
/// Status is left for the validator to infer from the block coordinates.
pub fn decode_transfer(
    codec: &AddressCodec,
    transfer: &TransferOp,
    site: OpSite<'_>,
    decrypted: Result<String, MemoDecodeError>,
) -> Result<OperationDraft, MonitorError> {
    let chain_identifier = format!("{}:{}", site.transaction_id, site.op_in_tx);
    let raw_memo = serde_json::to_string(&transfer.memo)?;

    let plaintext = plaintext_or_sentinel(decrypted);
    let memo_parts = codec.split_memo(&plaintext).unwrap_or_else(|_| MemoParts {
        customer_id: String::new(),
        incident_id: None,
    });
    let incident_id = memo_parts
        .incident_id
        .unwrap_or_else(|| chain_identifier.clone());

    Ok(OperationDraft {
        chain_identifier,
        incident_id,
        customer_id: memo_parts.customer_id,
        from_account: transfer.from.clone(),
        to_account: transfer.to.clone(),
        amount_value: transfer.amount_value,
        amount_asset_id: transfer.amount_asset_id.clone(),
        fee_value: transfer.fee_value,
        fee_asset_id: transfer.fee_asset_id.clone(),
        memo: raw_memo,
        block_num: Some(site.block_num),
        tx_in_block: Some(site.tx_in_block),
        op_in_tx: Some(site.op_in_tx),
        expiration: site.expiration,
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use omnibus_core::{AccountRef, AccountResolver, CoreError, PooledAccounts};

    use crate::chain::EncryptedMemo;

    struct Directory;

    impl AccountResolver for Directory {
        fn resolve(&self, id_or_name: &str) -> Result<AccountRef, CoreError> {
            match id_or_name {
                "1.2.100" | "lykke" => Ok(AccountRef::new("1.2.100", "lykke")),
                other => Err(CoreError::AccountResolution(other.to_string())),
            }
        }
    }

    fn codec() -> AddressCodec {
        AddressCodec::new(
            Arc::new(Directory),
            PooledAccounts::new(vec![AccountRef::new("1.2.100", "lykke")]),
        )
    }

    fn deposit() -> TransferOp {
        TransferOp {
            from: "1.2.999".into(),
            to: "1.2.100".into(),
            amount_value: 500,
            amount_asset_id: "1.3.0".into(),
            fee_value: 2,
            fee_asset_id: "1.3.0".into(),
            memo: Some(EncryptedMemo {
                from_key: "SENDER_KEY".into(),
                to_key: "POOL_KEY".into(),
                nonce: 42,
                message: "abcd".into(),
            }),
        }
    }

    fn site() -> OpSite<'static> {
        OpSite {
            transaction_id: "deadbeef",
            block_num: 77,
            tx_in_block: 3,
            op_in_tx: 1,
            expiration: Some(1_234_567),
        }
    }

    #[test]
    fn decoded_memo_fills_customer_and_incident() {
        let draft =
            decode_transfer(&codec(), &deposit(), site(), Ok("alice:inc-1".into())).unwrap();
        assert_eq!(draft.chain_identifier, "deadbeef:1");
        assert_eq!(draft.customer_id, "alice");
        assert_eq!(draft.incident_id, "inc-1");
        assert_eq!(draft.block_num, Some(77));
        assert_eq!(draft.tx_in_block, Some(3));
        assert_eq!(draft.op_in_tx, Some(1));
        assert_eq!(draft.expiration, Some(1_234_567));
        assert!(draft.status.is_none());
    }

    #[test]
    fn memo_without_incident_falls_back_to_chain_identifier() {
        let draft = decode_transfer(&codec(), &deposit(), site(), Ok("alice".into())).unwrap();
        assert_eq!(draft.customer_id, "alice");
        assert_eq!(draft.incident_id, "deadbeef:1");
    }

    #[test]
    fn missing_key_yields_sentinel_customer() {
        let draft = decode_transfer(
            &codec(),
            &deposit(),
            site(),
            Err(MemoDecodeError::MissingKey),
        )
        .unwrap();
        assert_eq!(draft.customer_id, MEMO_KEY_MISSING);
        assert_eq!(draft.incident_id, "deadbeef:1");
    }

    #[test]
    fn absent_memo_yields_empty_customer() {
        let mut transfer = deposit();
        transfer.memo = None;
        let draft = decode_transfer(&codec(), &transfer, site(), Err(MemoDecodeError::NoMemo))
            .unwrap();
        assert_eq!(draft.customer_id, "");
        assert_eq!(draft.incident_id, "deadbeef:1");
        assert_eq!(draft.memo, "null");
    }

    #[test]
    fn undecryptable_memo_yields_sentinel_customer() {
        let draft = decode_transfer(
            &codec(),
            &deposit(),
            site(),
            Err(MemoDecodeError::Undecryptable),
        )
        .unwrap();
        assert_eq!(draft.customer_id, MEMO_UNDECODABLE);
    }

    #[test]
    fn raw_memo_envelope_round_trips_through_json() {
        let draft = decode_transfer(&codec(), &deposit(), site(), Ok("alice".into())).unwrap();
        let envelope: EncryptedMemo = serde_json::from_str(&draft.memo).unwrap();
        assert_eq!(envelope.nonce, 42);
        assert_eq!(envelope.from_key, "SENDER_KEY");
    }
}
