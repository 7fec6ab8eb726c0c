pub mod error;
pub mod sqlite;
pub mod store;

pub use error::{Constraint, StoreError, StoreResult};
pub use sqlite::SqliteStore;
pub use store::*;
