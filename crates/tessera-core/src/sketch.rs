//! Sketch: the user-owned planning geometry that fragments are attributed to.
//!
//! Sketches live in an external system. The fragment engine only needs their
//! ownership, project and collection membership, so that is all this record
//! holds; the geometry itself is supplied at update time.

use serde::{Deserialize, Serialize};

/// Opaque id of a sketch.
pub type SketchId = i64;

/// Opaque id of a sketch collection.
pub type CollectionId = i64;

/// Opaque id of a geography (a named analysis region, used only as a tag).
pub type GeographyId = i64;

/// Opaque id of the user calling into the engine.
pub type UserId = i64;

/// Opaque id of the project a sketch belongs to.
pub type ProjectId = i64;

/// The ownership and membership facts about a sketch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sketch {
  pub sketch_id:     SketchId,
  pub owner_id:      UserId,
  pub project_id:    ProjectId,
  /// A sketch belongs to at most one collection.
  pub collection_id: Option<CollectionId>,
}

impl Sketch {
  pub fn new(sketch_id: SketchId, owner_id: UserId, project_id: ProjectId) -> Self {
    Self { sketch_id, owner_id, project_id, collection_id: None }
  }

  pub fn in_collection(mut self, collection_id: CollectionId) -> Self {
    self.collection_id = Some(collection_id);
    self
  }
}
