//! Error type for `tessera-store-sqlite`.

use tessera_core::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] tessera_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A stored column could not be decoded.
  #[error("corrupt row: {0}")]
  Decode(String),

  /// A commit tried to retain a hash with no fragment row.
  #[error("fragment not found: {0}")]
  FragmentNotFound(String),
}

impl StoreError for Error {
  fn into_domain(self) -> Result<tessera_core::Error, Self> {
    match self {
      Error::Core(e) => Ok(e),
      other => Err(other),
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
