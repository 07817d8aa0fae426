//! Caller identity extractor.
//!
//! Authentication is done upstream; the gateway forwards the authenticated
//! user id in the `x-tessera-user` header. Requests without it are rejected
//! before any handler runs.

use axum::{extract::FromRequestParts, http::request::Parts};
use tessera_core::sketch::UserId;

use crate::error::Error;

pub const USER_HEADER: &str = "x-tessera-user";

/// The user on whose behalf a request is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub UserId);

impl<St> FromRequestParts<St> for Caller
where
  St: Send + Sync,
{
  type Rejection = Error;

  async fn from_request_parts(parts: &mut Parts, _state: &St) -> Result<Self, Self::Rejection> {
    let raw = parts
      .headers
      .get(USER_HEADER)
      .ok_or_else(|| Error::Unauthorized(format!("missing {USER_HEADER} header")))?;

    raw
      .to_str()
      .ok()
      .and_then(|s| s.trim().parse::<UserId>().ok())
      .map(Caller)
      .ok_or_else(|| Error::Unauthorized(format!("malformed {USER_HEADER} header")))
  }
}
