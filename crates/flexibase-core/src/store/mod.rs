//! Object persistence: records, overflow attributes, indexes and
//! atomic write batches.

pub mod adapter;
pub mod config;
pub mod key;
pub mod record;
pub mod transaction;

pub use adapter::ObjectStore;
pub use config::StoreConfig;
pub use key::{current_timestamp, ObjectId};
pub use record::{ObjectData, ObjectRecord};
pub use transaction::{Transaction, TxOp};
