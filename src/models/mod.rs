//! # Data Models
//!
//! SeaORM entities of the SQL key-value backend.

pub mod kv_change;
pub mod kv_entry;
pub mod kv_meta;

pub use kv_change::Entity as KvChange;
pub use kv_entry::Entity as KvEntry;
pub use kv_meta::Entity as KvMeta;
