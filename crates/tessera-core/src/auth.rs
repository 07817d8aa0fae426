//! The authorisation collaborator.
//!
//! Authentication happens elsewhere; by the time a call reaches the engine
//! the caller is an opaque [`UserId`]. These checks decide whether that user
//! may mutate a particular sketch.

use std::future::Future;

use crate::{
  sketch::{SketchId, UserId},
  store::StoreError,
};

pub trait Authorizer: Send + Sync {
  type Error: StoreError;

  /// Fails with [`crate::Error::PermissionDenied`] unless `caller_id` owns
  /// the sketch, or [`crate::Error::SketchNotFound`] if it does not exist.
  fn assert_owner(
    &self,
    sketch_id: SketchId,
    caller_id: UserId,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Fails with [`crate::Error::CrossProject`] unless both sketches belong
  /// to the same project.
  fn assert_same_project(
    &self,
    a: SketchId,
    b: SketchId,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}
