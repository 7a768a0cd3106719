//! SQLite-backed persistence.

pub mod pool;
pub mod store;

pub use pool::DatabasePool;
pub use store::SqliteStateStore;
