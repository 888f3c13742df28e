//! dbtier - multi-engine database queue subsystem.
//!
//! The data tier of the device-control server: four database engines
//! (PostgreSQL, MySQL, SQLite, DB2) behind one interface, per-database
//! Lead/child work queues with heartbeat supervision, and a versioned
//! migration runner.

pub mod config;
pub mod engine;
pub mod error;
pub mod migrate;
pub mod models;
pub mod queue;
pub mod subsystem;

pub use config::{DatabaseEntry, DatabasesConfig};
pub use error::{DbError, DbResult};
pub use subsystem::{DatabaseSubsystem, ReadinessReport, subsystem_dependencies};
