//! Migration to create the datetime_records table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DatetimeRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DatetimeRecords::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(DatetimeRecords::BeginDatetime)
                            .timestamp()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DatetimeRecords::EndDatetime)
                            .timestamp()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DatetimeRecords::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DatetimeRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DatetimeRecords {
    Table,
    Id,
    BeginDatetime,
    EndDatetime,
    CreatedAt,
}
