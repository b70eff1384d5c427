pub mod balance;
pub mod error;
pub mod memory_table;
pub mod retry;
pub mod schema;
pub mod sqlite;
pub mod table;
pub mod traits;

pub use error::{ErrorClass, StoreError};
pub use memory_table::{InjectedFault, MemoryTableClient};
pub use retry::RetryConfig;
pub use sqlite::SqliteStore;
pub use table::{TableClient, TableEntity, TableError, TablePage, TableStore};
pub use traits::*;
