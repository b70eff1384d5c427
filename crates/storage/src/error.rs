use thiserror::Error;

use omnibus_core::{CoreError, EventClock};

use crate::table::TableError;
use crate::traits::TrackingUsage;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation error: {0}")]
    Invalid(#[from] CoreError),

    #[error("duplicate operation: {chain_identifier}")]
    DuplicateOperation { chain_identifier: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("address already tracked for {usage}: {address}")]
    AddressTracked {
        address: String,
        usage: TrackingUsage,
    },

    #[error("address not tracked for {usage}: {address}")]
    AddressNotTracked {
        address: String,
        usage: TrackingUsage,
    },

    #[error("stale balance update for {address}: clock {incoming} is not newer")]
    StaleUpdate {
        address: String,
        incoming: EventClock,
    },

    #[error("checkpoint regression: current {current}, requested {requested}")]
    OutOfOrder { current: u64, requested: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage unreachable after {attempts} attempts: {last}")]
    Unreachable { attempts: u32, last: String },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("table service error: {0}")]
    Table(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Coarse error category the boundary layer dispatches on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorClass {
    /// Malformed caller data; never retried.
    Validation,
    /// Expected under re-delivery; conflict to an API caller.
    Collision,
    NotFound,
    /// A concurrent writer won; the losing delta is dropped.
    Concurrency,
    /// Connectivity trouble, retryable up to the policy's budget.
    Transport,
    /// Checkpoint regression; always fatal.
    Ordering,
    Internal,
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Invalid(_) => ErrorClass::Validation,
            StoreError::DuplicateOperation { .. } | StoreError::AddressTracked { .. } => {
                ErrorClass::Collision
            }
            StoreError::NotFound(_) | StoreError::AddressNotTracked { .. } => ErrorClass::NotFound,
            StoreError::StaleUpdate { .. } => ErrorClass::Concurrency,
            StoreError::Transport(_) | StoreError::Unreachable { .. } => ErrorClass::Transport,
            StoreError::OutOfOrder { .. } => ErrorClass::Ordering,
            StoreError::Sqlite(e) if is_sqlite_transient(e) => ErrorClass::Transport,
            StoreError::Sqlite(_) | StoreError::Table(_) | StoreError::Serialization(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// True for failures worth another attempt under the retry policy.
    /// `Unreachable` is the policy's own terminal error and is excluded.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transport(_) => true,
            StoreError::Sqlite(e) => is_sqlite_transient(e),
            _ => false,
        }
    }
}

fn is_sqlite_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::DatabaseBusy
                || err.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// Maps table-service failures the call site did not consume semantically.
/// Conflict/precondition outcomes are handled where the call is made; what
/// remains is transport or backend trouble.
pub(crate) fn table_err(e: TableError) -> StoreError {
    match e {
        TableError::Transport(msg) => StoreError::Transport(msg),
        TableError::NotFound => StoreError::NotFound("table entity".into()),
        other => StoreError::Table(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_the_taxonomy() {
        let cases: Vec<(StoreError, ErrorClass)> = vec![
            (
                StoreError::Invalid(CoreError::EmptyMemo),
                ErrorClass::Validation,
            ),
            (
                StoreError::DuplicateOperation {
                    chain_identifier: "tx:0".into(),
                },
                ErrorClass::Collision,
            ),
            (StoreError::NotFound("x".into()), ErrorClass::NotFound),
            (
                StoreError::StaleUpdate {
                    address: "a:b".into(),
                    incoming: EventClock::new(1, 0, 0),
                },
                ErrorClass::Concurrency,
            ),
            (
                StoreError::Unreachable {
                    attempts: 3,
                    last: "timeout".into(),
                },
                ErrorClass::Transport,
            ),
            (
                StoreError::OutOfOrder {
                    current: 10,
                    requested: 9,
                },
                ErrorClass::Ordering,
            ),
        ];
        for (err, class) in cases {
            assert_eq!(err.class(), class, "{err}");
        }
    }

    #[test]
    fn transiency_covers_transport_only() {
        assert!(StoreError::Transport("reset".into()).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
        assert!(
            !StoreError::Unreachable {
                attempts: 3,
                last: "reset".into()
            }
            .is_transient()
        );
    }
}
