pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod pg_token_store;
pub mod redpanda;
pub mod schema;
pub mod token_store;
pub mod types;

pub use config::Config;
pub use context::RelayContext;
pub use db::DbPool;
pub use error::StorageError;
pub use pg_token_store::PgTokenStore;
pub use redpanda::RedpandaConsumer;
pub use token_store::{MemoryTokenStore, TokenStore};
pub use types::{DeliveryOutcome, DeviceToken, DispatchSummary, Message, Platform};
