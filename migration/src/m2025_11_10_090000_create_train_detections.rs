//! Migration to create the train_detections table.
//!
//! Detections are append-only. Reads order by `observed_at DESC, id ASC`, and
//! `dedupe_key` carries the relay's idempotency key so retried forwards
//! collapse onto a single row.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TrainDetections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TrainDetections::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(TrainDetections::State).text().not_null())
                    .col(ColumnDef::new(TrainDetections::Rounds).integer().not_null())
                    .col(ColumnDef::new(TrainDetections::Relay).text().not_null())
                    .col(
                        ColumnDef::new(TrainDetections::ObservedAt)
                            .timestamp()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TrainDetections::RecordedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(TrainDetections::DedupeKey).text().null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_train_detections_observed_at")
                    .table(TrainDetections::Table)
                    .col(TrainDetections::ObservedAt)
                    .col(TrainDetections::Id)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_train_detections_dedupe_key")
                    .table(TrainDetections::Table)
                    .col(TrainDetections::DedupeKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_train_detections_dedupe_key")
                    .table(TrainDetections::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_train_detections_observed_at")
                    .table(TrainDetections::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(TrainDetections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TrainDetections {
    Table,
    Id,
    State,
    Rounds,
    Relay,
    ObservedAt,
    RecordedAt,
    DedupeKey,
}
