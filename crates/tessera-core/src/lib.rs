//! Core types and trait definitions for the Tessera fragment engine.
//!
//! This crate is deliberately free of HTTP and database dependencies. It owns
//! the domain vocabulary (sketches, geographies, envelopes, fragments), the
//! error taxonomy, envelope indexing, and the content hash that makes
//! fragments shareable. Storage backends implement [`store::FragmentStore`];
//! the geometric arrangement lives in `tessera-overlay`.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod auth;
pub mod envelope;
pub mod error;
pub mod fragment;
pub mod hash;
pub mod sketch;
pub mod store;

pub use error::{Error, Result};
