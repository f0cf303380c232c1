//! Storage layer for fieldshift.
//!
//! A sled-backed document store with a key-containment index, a value
//! uniqueness index, and buffered multi-tree transactions.

mod config;
mod engine;
mod record;
mod transaction;

pub mod key;

pub use config::StorageConfig;
pub use engine::StorageEngine;
pub use record::{Record, WriteOrigin};
pub use transaction::Transaction;

pub(crate) use record::{decode_doc, encode_doc};
