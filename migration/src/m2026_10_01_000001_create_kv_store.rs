//! Migration to create the revisioned key-value store tables.
//!
//! `kv_entries` holds the current value of every key, `kv_changes` is the
//! append-only change log consumed by watchers and `kv_meta` carries the single
//! store-wide revision counter row.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(KvEntries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(KvEntries::Key)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(KvEntries::Value).blob().not_null())
                    .col(
                        ColumnDef::new(KvEntries::CreateRevision)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(KvEntries::ModRevision).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(KvChanges::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(KvChanges::Revision).big_integer().not_null())
                    .col(ColumnDef::new(KvChanges::Key).text().not_null())
                    .col(ColumnDef::new(KvChanges::Kind).text().not_null())
                    .col(ColumnDef::new(KvChanges::Value).blob().null())
                    .col(
                        ColumnDef::new(KvChanges::CreateRevision)
                            .big_integer()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(KvChanges::Revision)
                            .col(KvChanges::Key),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(KvMeta::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(KvMeta::Id).integer().not_null().primary_key())
                    .col(ColumnDef::new(KvMeta::Revision).big_integer().not_null())
                    .col(
                        ColumnDef::new(KvMeta::CompactedRevision)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // The counter row is locked by every writing transaction.
        let seed = Query::insert()
            .into_table(KvMeta::Table)
            .columns([KvMeta::Id, KvMeta::Revision, KvMeta::CompactedRevision])
            .values([1.into(), 0i64.into(), 0i64.into()])
            .map_err(|err| DbErr::Migration(err.to_string()))?
            .to_owned();
        manager.exec_stmt(seed).await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(KvMeta::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(KvChanges::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(KvEntries::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum KvEntries {
    Table,
    Key,
    Value,
    CreateRevision,
    ModRevision,
}

#[derive(DeriveIden)]
enum KvChanges {
    Table,
    Revision,
    Key,
    Kind,
    Value,
    CreateRevision,
}

#[derive(DeriveIden)]
enum KvMeta {
    Table,
    Id,
    Revision,
    CompactedRevision,
}
