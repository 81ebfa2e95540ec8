//! DateTime record entity model
//!
//! This module contains the SeaORM entity model for the datetime_records
//! table, which stores operator-defined time windows.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

/// Time window record
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "datetime_records")]
pub struct Model {
    /// Unique identifier (primary key)
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Start of the window
    pub begin_datetime: DateTime,

    /// End of the window
    pub end_datetime: DateTime,

    /// Timestamp when the record was created
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
