//! Store-wide revision counter (single row).

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;

pub const META_ROW_ID: i32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "kv_meta")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i32,

    /// Revision of the last committed writing transaction
    pub revision: i64,

    /// Change log rows at or below this revision were removed
    pub compacted_revision: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
