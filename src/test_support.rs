//! Shared fixtures for unit tests.

use chrono::{NaiveDate, NaiveDateTime};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};

/// In-memory SQLite with all migrations applied.
///
/// Pinned to one connection: every new SQLite memory connection would open
/// an empty database.
pub(crate) async fn memory_db() -> DatabaseConnection {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);

    let db = Database::connect(options)
        .await
        .expect("failed to open in-memory sqlite");
    Migrator::up(&db, None)
        .await
        .expect("failed to apply migrations");
    db
}

/// 2024-01-01 at 00:`minute`:00.
pub(crate) fn at(minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .and_then(|date| date.and_hms_opt(0, minute, 0))
        .expect("valid fixture time")
}
