//! Train detection entity model
//!
//! This module contains the SeaORM entity model for the train_detections
//! table, the append-only log behind the collector's event store.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

/// Stored detection event
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "train_detections")]
pub struct Model {
    /// Store-assigned identifier (primary key)
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Detection classification (e.g., approaching, clear)
    pub state: String,

    /// Detection cycle counter
    pub rounds: i32,

    /// Relay state reported by the device
    pub relay: String,

    /// Device-supplied observation time
    pub observed_at: DateTime,

    /// Time the row was inserted
    pub recorded_at: DateTimeWithTimeZone,

    /// Relay idempotency key
    pub dedupe_key: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
