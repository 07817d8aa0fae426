//! Error types for `tessera-core`.
//!
//! These are the domain failures every layer agrees on. Storage backends wrap
//! them in their own error type and hand them back through
//! [`crate::store::StoreError::into_domain`].

use thiserror::Error;

use crate::sketch::{GeographyId, SketchId, UserId};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
  /// Malformed or degenerate geometry. Not retried.
  #[error("invalid geometry: {0}")]
  InvalidGeometry(String),

  /// The geometry crosses the date line as a single unsplit ring.
  #[error("geometry spans the antimeridian: {0}")]
  AntimeridianViolation(String),

  #[error("user {caller_id} is not the owner of sketch {sketch_id}")]
  PermissionDenied { sketch_id: SketchId, caller_id: UserId },

  /// The arrangement exceeded its complexity or time budget.
  #[error("arrangement too complex: {0}")]
  TooComplex(String),

  /// Two writers raced to create the same fragment and the retry also lost.
  #[error("concurrent creation of fragment {0} could not be resolved")]
  ConcurrentCreateConflict(String),

  #[error("sketch not found: {0}")]
  SketchNotFound(SketchId),

  #[error("sketches {0} and {1} belong to different projects")]
  CrossProject(SketchId, SketchId),

  #[error("geography {0} has no INTERSECT clipping layer")]
  MissingIntersectLayer(GeographyId),
}

impl Error {
  /// Shorthand for [`Error::InvalidGeometry`].
  pub fn invalid(msg: impl Into<String>) -> Self {
    Self::InvalidGeometry(msg.into())
  }

  /// Shorthand for [`Error::AntimeridianViolation`].
  pub fn antimeridian(msg: impl Into<String>) -> Self {
    Self::AntimeridianViolation(msg.into())
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
