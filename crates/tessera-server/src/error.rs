//! Error type for the service layer and its [`IntoResponse`] mapping.

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde_json::json;
use tessera_core::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Domain(#[from] tessera_core::Error),

  #[error("unauthorized: {0}")]
  Unauthorized(String),

  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("conflict: {0}")]
  Conflict(String),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  /// The blocking resolver task panicked or was cancelled.
  #[error("resolver task failed: {0}")]
  Task(String),
}

impl Error {
  /// Classify a backend error: domain failures keep their meaning, anything
  /// else is an opaque storage failure.
  pub fn from_store<E: StoreError>(e: E) -> Self {
    match e.into_domain() {
      Ok(domain) => Error::Domain(domain),
      Err(other) => Error::Store(Box::new(other)),
    }
  }

  pub fn status(&self) -> StatusCode {
    use tessera_core::Error as D;
    match self {
      Error::Domain(D::InvalidGeometry(_))
      | Error::Domain(D::AntimeridianViolation(_))
      | Error::Domain(D::MissingIntersectLayer(_))
      | Error::Domain(D::CrossProject(..)) => StatusCode::UNPROCESSABLE_ENTITY,
      Error::Domain(D::PermissionDenied { .. }) => StatusCode::FORBIDDEN,
      Error::Domain(D::SketchNotFound(_)) => StatusCode::NOT_FOUND,
      Error::Domain(D::TooComplex(_)) => StatusCode::PAYLOAD_TOO_LARGE,
      Error::Domain(D::ConcurrentCreateConflict(_)) | Error::Conflict(_) => StatusCode::CONFLICT,
      Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
      Error::BadRequest(_) => StatusCode::BAD_REQUEST,
      Error::Store(_) | Error::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    let status = self.status();
    if status.is_server_error() {
      tracing::error!(error = %self, "request failed");
    }
    (status, Json(json!({ "error": self.to_string() }))).into_response()
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn domain_errors_map_to_client_statuses() {
    let cases = [
      (tessera_core::Error::antimeridian("x"), StatusCode::UNPROCESSABLE_ENTITY),
      (tessera_core::Error::PermissionDenied { sketch_id: 1, caller_id: 2 }, StatusCode::FORBIDDEN),
      (tessera_core::Error::SketchNotFound(1), StatusCode::NOT_FOUND),
      (tessera_core::Error::TooComplex("x".into()), StatusCode::PAYLOAD_TOO_LARGE),
    ];
    for (err, status) in cases {
      assert_eq!(Error::from(err).status(), status);
    }
  }

  #[test]
  fn domain_message_is_passed_through() {
    let err = Error::from(tessera_core::Error::antimeridian("ring too wide"));
    assert!(err.to_string().contains("antimeridian"));
  }
}
