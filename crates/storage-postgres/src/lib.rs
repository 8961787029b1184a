//! PostgreSQL state storage for the Capstan engines.

pub mod pool;
pub mod store;

pub use pool::{create_pool, health_check, DbPool};
pub use store::PostgresStateStorage;
