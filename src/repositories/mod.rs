//! # Repository Layer
//!
//! SeaORM-backed data access for the collector's record tables. Detection
//! events live behind [`crate::store::EventStore`] instead.

pub mod datetime_record;

pub use datetime_record::DateTimeRecordRepository;
