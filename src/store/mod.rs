//! The storage engine.
//!
//! An [`Environment`] owns one repository directory with a [`Database`] per
//! registered name. Each database is a [`tree`](tree) of nodes partitioning
//! its key space; a node pairs one immutable node file with in-memory
//! indexes holding the writes committed since that file was written.
//! Compaction merges a node's memory into a new file, splitting it when it
//! grows too large. Every commit goes through the transaction manager and
//! is appended to the write-ahead log before it reaches memory.

pub mod backup;
pub mod compaction;
pub mod compression;
pub mod cursor;
pub mod database;
pub mod environment;
pub mod iterator;
pub mod memtable;
pub mod metrics;
pub mod node;
pub mod recovery;
pub mod scheme;
pub mod sequence;
pub mod sstable;
pub mod state;
pub mod tasks;
pub mod transaction;
pub mod tree;
pub mod txn;
pub mod value;

pub use cursor::Cursor;
pub use database::Database;
pub use environment::{Environment, Metrics, VERSION};
pub use iterator::Order;
pub use state::Status;
pub use tasks::register_tasks;
pub use transaction::Transaction;
pub use txn::TxState;
