pub mod checksum;
pub mod config;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod scheduler;
pub mod store;
pub mod wal;

#[cfg(test)]
mod tmpfs;

pub use config::{CompactionConfig, DatabaseConfig, EnvConfig, LogConfig, SchedulerConfig};
pub use encoding::{Datum, FieldType, Schema};
pub use error::{Error, Result};
pub use store::{Cursor, Database, Environment, Order, Status, Transaction, TxState};
