pub mod address;
pub mod clock;
pub mod error;
pub mod record;
pub mod validate;

pub use address::{
    AccountRef, AccountResolver, AddressCodec, AddressParts, CachedResolver, MemoParts,
    PooledAccounts, TransferKind,
};
pub use clock::EventClock;
pub use error::CoreError;
pub use record::{OpStatus, OperationRecord, VirtualTransferIds, virtual_chain_identifier};
pub use validate::{OperationDraft, RecordValidator};
