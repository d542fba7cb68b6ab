pub mod entities;
pub mod error;
pub mod memory;
pub mod redb_store;
pub mod store;
mod validate;

pub use entities::EntityStore;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use redb_store::RedbStore;
pub use store::{DocumentStore, NewEvent, MAX_EVENTS, MAX_EVENT_BYTES};
