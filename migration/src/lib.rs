//! Database migrations for the stream ingestion service.
//!
//! The service persists its definition store in a revisioned key-value layout,
//! so a single migration owns the whole schema.

pub use sea_orm_migration::prelude::*;

mod m2026_10_01_000001_create_kv_store;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m2026_10_01_000001_create_kv_store::Migration)]
    }
}
