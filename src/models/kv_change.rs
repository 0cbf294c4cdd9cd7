//! Append-only change log of the SQL-backed store.
//!
//! Every committed transaction appends one row per touched key. Watchers poll
//! rows above their last seen revision; compaction trims old rows.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;

pub const KIND_PUT: &str = "put";
pub const KIND_DELETE: &str = "delete";

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "kv_changes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub revision: i64,

    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,

    /// `put` or `delete`
    pub kind: String,

    /// New value; absent for deletes
    pub value: Option<Vec<u8>>,

    pub create_revision: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
