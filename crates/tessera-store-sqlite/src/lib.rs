//! SQLite backend for the Tessera fragment store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Every mutation that changes sketch
//! associations runs in one transaction together with the collection of the
//! fragments it orphaned.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;
