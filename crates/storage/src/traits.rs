use std::collections::BTreeMap;

use omnibus_core::{
    address,
    clock::EventClock,
    record::{OpStatus, OperationRecord},
    validate::OperationDraft,
};

use crate::error::StoreError;

/// What a tracked address is tracked *for*. An address may be enrolled for
/// balance observation and for either direction of transfer history
/// independently; each enrollment is keyed by `(address, usage)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingUsage {
    Balance,
    HistoryFrom,
    HistoryTo,
}

impl TrackingUsage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Balance => "balance",
            Self::HistoryFrom => "history_from",
            Self::HistoryTo => "history_to",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "balance" => Ok(Self::Balance),
            "history_from" => Ok(Self::HistoryFrom),
            "history_to" => Ok(Self::HistoryTo),
            _ => Err(StoreError::Serialization(format!(
                "unknown tracking usage: {s}"
            ))),
        }
    }
}

impl std::fmt::Display for TrackingUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Narrows a status listing to one customer. At most one field is honored,
/// in declaration order; setting several is not an error, the first
/// resolvable one wins.
#[derive(Debug, Clone, Default)]
pub struct StatusFilter {
    pub customer_id: Option<String>,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
}

impl StatusFilter {
    pub fn by_customer(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: Some(customer_id.into()),
            ..Self::default()
        }
    }

    pub fn by_from_address(addr: impl Into<String>) -> Self {
        Self {
            from_address: Some(addr.into()),
            ..Self::default()
        }
    }

    pub fn by_to_address(addr: impl Into<String>) -> Self {
        Self {
            to_address: Some(addr.into()),
            ..Self::default()
        }
    }

    /// The customer the filter narrows to, extracted from whichever field is
    /// set. Address fields carry the customer in their second segment; an
    /// address without one yields `None`, which matches nothing.
    pub fn effective_customer(&self) -> Option<String> {
        if let Some(customer) = &self.customer_id {
            return Some(customer.clone());
        }
        for addr in [&self.from_address, &self.to_address].into_iter().flatten() {
            return address::parse(addr).ok().map(|parts| parts.customer_id);
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.customer_id.is_none() && self.from_address.is_none() && self.to_address.is_none()
    }
}

/// Deletion addresses a record either exactly (by the caller's in-hand copy)
/// or by incident id lookup.
#[derive(Debug, Clone, Copy)]
pub enum DeleteTarget<'a> {
    Record(&'a OperationRecord),
    IncidentId(&'a str),
}

/// One tracked address with its per-asset balances and the event clock of
/// the transfer that last touched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceRow {
    pub address: String,
    pub amounts: BTreeMap<String, i64>,
    pub clock: EventClock,
}

/// A page of balance rows. `continuation` is an opaque cursor; feed it back
/// into `get_balances` to fetch the next page, `None` means exhausted.
#[derive(Debug, Clone)]
pub struct BalancePage {
    pub rows: Vec<BalanceRow>,
    pub continuation: Option<String>,
}

/// Persistence contract shared by every backend. Implementations are safe
/// to share across threads; all mutation goes through `&self`.
pub trait OperationStore: Send + Sync {
    /// Journals a new transfer. Fails with `DuplicateOperation` when the
    /// chain identifier is already present.
    fn insert(&self, draft: &OperationDraft) -> Result<OperationRecord, StoreError>;

    /// Journals a transfer, replacing any stored record under the same
    /// chain identifier.
    fn insert_or_update(&self, draft: &OperationDraft) -> Result<OperationRecord, StoreError>;

    /// Moves an in-progress record to completed, stamping the block
    /// coordinates carried by `completion`.
    fn complete(&self, completion: &OperationDraft) -> Result<OperationRecord, StoreError>;

    /// Moves an in-progress record to failed, with an optional diagnostic
    /// message.
    fn fail(
        &self,
        chain_identifier: &str,
        message: Option<&str>,
    ) -> Result<OperationRecord, StoreError>;

    /// Looks a record up by incident id. When several stored records share
    /// the incident id, the one with the lexicographically least chain
    /// identifier is returned.
    fn get(&self, incident_id: &str) -> Result<OperationRecord, StoreError>;

    fn find_by_chain_identifier(
        &self,
        chain_identifier: &str,
    ) -> Result<Option<OperationRecord>, StoreError>;

    /// Removes a finalized record. In-progress records cannot be deleted.
    fn delete(&self, target: DeleteTarget<'_>) -> Result<(), StoreError>;

    /// All records in `status`, optionally narrowed by a filter, ordered by
    /// block coordinates then chain identifier.
    fn list_by_status(
        &self,
        status: OpStatus,
        filter: &StatusFilter,
    ) -> Result<Vec<OperationRecord>, StoreError>;

    /// Enrolls an address for a usage. Enrolling twice for the same usage
    /// fails with `AddressTracked`.
    fn track(&self, address: &str, usage: TrackingUsage) -> Result<(), StoreError>;

    /// Withdraws an enrollment. Fails with `AddressNotTracked` when the
    /// pair is absent.
    fn untrack(&self, address: &str, usage: TrackingUsage) -> Result<(), StoreError>;

    fn is_tracked(&self, address: &str, usage: TrackingUsage) -> Result<bool, StoreError>;

    fn tracked_addresses(&self, usage: TrackingUsage) -> Result<Vec<String>, StoreError>;

    fn get_balance(&self, address: &str) -> Result<Option<BalanceRow>, StoreError>;

    fn get_balances(
        &self,
        page_size: usize,
        continuation: Option<&str>,
    ) -> Result<BalancePage, StoreError>;

    /// Highest fully processed block, 0 when nothing has been processed.
    fn get_checkpoint(&self) -> Result<u64, StoreError>;

    /// Advances the checkpoint. Values not strictly greater than the stored
    /// one fail with `OutOfOrder`; the checkpoint never moves backwards.
    fn set_checkpoint(&self, block_num: u64) -> Result<(), StoreError>;
}
