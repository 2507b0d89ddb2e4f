pub mod database;
pub mod error;
pub mod events;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod store;

pub use database::Database;
pub use error::StoreError;
pub use sessions::{SessionFilter, SessionRow};
pub use store::{EventStore, SqliteEventStore};
