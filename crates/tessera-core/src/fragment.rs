//! Fragment types: the content-addressed unit of the overlap engine.
//!
//! A fragment is a single non-overlapping piece of geometry tagged with the
//! geographies that contain it. Its identity is the hash of its canonical
//! geometry plus its sorted geography ids, so identical pieces produced by
//! different sketches are stored once and shared.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use geo_types::Geometry;
use serde::{Deserialize, Serialize};

use crate::{
  envelope::Envelope,
  sketch::{GeographyId, SketchId},
};

// ─── Hash ────────────────────────────────────────────────────────────────────

/// Lowercase hex SHA-256 digest identifying a fragment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentHash(String);

impl FragmentHash {
  pub(crate) fn from_digest(bytes: &[u8]) -> Self { Self(hex::encode(bytes)) }

  /// Wrap a hash read back from storage. No validation is performed.
  pub fn from_stored(hex: impl Into<String>) -> Self { Self(hex.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for FragmentHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

// ─── Inputs ──────────────────────────────────────────────────────────────────

/// Sort and deduplicate an id list. Every id list that reaches a hash or a
/// caller goes through here.
pub fn normalize_ids<I>(ids: I) -> Vec<I::Item>
where
  I: IntoIterator,
  I::Item: Ord,
{
  let mut ids: Vec<_> = ids.into_iter().collect();
  ids.sort_unstable();
  ids.dedup();
  ids
}

/// A geometry piece and the geographies it belongs to, as handed to
/// [`crate::store::FragmentStore::get_or_create_fragment`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentInput {
  pub geometry:      Geometry<f64>,
  pub geography_ids: Vec<GeographyId>,
}

impl FragmentInput {
  pub fn new(geometry: Geometry<f64>, geography_ids: impl IntoIterator<Item = GeographyId>) -> Self {
    Self { geometry, geography_ids: normalize_ids(geography_ids) }
  }
}

/// One piece a sketch is associated with.
///
/// `own_geography_ids` are the tags the sketch itself brings to the piece.
/// The fragment's tags (`input.geography_ids`) can be wider when other
/// sketches covering the same piece bring theirs; re-resolving the sketch
/// later starts from its own tags only.
#[derive(Debug, Clone, PartialEq)]
pub struct SketchPiece {
  pub input:             FragmentInput,
  /// Sorted, distinct, a subset of `input.geography_ids`.
  pub own_geography_ids: Vec<GeographyId>,
}

impl SketchPiece {
  pub fn new(input: FragmentInput, own_geography_ids: impl IntoIterator<Item = GeographyId>) -> Self {
    Self { input, own_geography_ids: normalize_ids(own_geography_ids) }
  }
}

impl From<FragmentInput> for SketchPiece {
  /// A piece the sketch covers alone: it contributes every tag.
  fn from(input: FragmentInput) -> Self {
    let own_geography_ids = input.geography_ids.clone();
    Self { input, own_geography_ids }
  }
}

/// The full replacement fragment set for one sketch: new pieces to hash and
/// store, plus existing fragments the sketch keeps unchanged.
#[derive(Debug, Clone, Default)]
pub struct SketchFragments {
  pub sketch_id: SketchId,
  pub pieces:    Vec<SketchPiece>,
  /// Existing hashes carried over as-is, own tags included. Must already
  /// exist in the store.
  pub retain:    Vec<FragmentHash>,
}

impl SketchFragments {
  /// Pieces the sketch covers alone.
  pub fn new(sketch_id: SketchId, inputs: Vec<FragmentInput>) -> Self {
    Self::with_pieces(sketch_id, inputs.into_iter().map(SketchPiece::from).collect())
  }

  pub fn with_pieces(sketch_id: SketchId, pieces: Vec<SketchPiece>) -> Self {
    Self { sketch_id, pieces, retain: Vec::new() }
  }

  pub fn retaining(mut self, hashes: impl IntoIterator<Item = FragmentHash>) -> Self {
    self.retain.extend(hashes);
    self
  }
}

// ─── Stored fragment ─────────────────────────────────────────────────────────

/// A persisted fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
  pub hash:          FragmentHash,
  /// Canonical (quantised, oriented) geometry; rehashing it reproduces `hash`.
  pub geometry:      Geometry<f64>,
  pub envelope:      Envelope,
  /// Sorted, distinct.
  pub geography_ids: Vec<GeographyId>,
  pub created_at:    DateTime<Utc>,
}

/// A fragment together with every sketch currently associated with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributedFragment {
  #[serde(flatten)]
  pub fragment:      Fragment,
  /// Sorted, distinct, never empty for a live fragment.
  pub sketch_ids:    Vec<SketchId>,
  /// The tags each of `sketch_ids` contributes to the fragment.
  #[serde(skip)]
  pub contributions: BTreeMap<SketchId, Vec<GeographyId>>,
}

// ─── Resolver output ─────────────────────────────────────────────────────────

/// One maximal region of an arrangement, labelled with the sketches and
/// geographies covering it. Not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentCandidate {
  pub geometry:      Geometry<f64>,
  /// Sorted ascending, at least one entry.
  pub sketch_ids:    Vec<SketchId>,
  /// Sorted ascending, union of the contributing inputs' tags.
  pub geography_ids: Vec<GeographyId>,
  /// Per covering sketch, the tags its own inputs brought. Keys equal
  /// `sketch_ids`.
  pub contributions: BTreeMap<SketchId, Vec<GeographyId>>,
}

impl FragmentCandidate {
  pub fn covers(&self, sketch_id: SketchId) -> bool {
    self.sketch_ids.binary_search(&sketch_id).is_ok()
  }

  /// This candidate as a piece of `sketch_id`, or `None` if it does not
  /// cover that sketch.
  pub fn piece_for(&self, sketch_id: SketchId) -> Option<SketchPiece> {
    let own = self.contributions.get(&sketch_id)?;
    Some(SketchPiece::new(self.to_input(), own.iter().copied()))
  }

  /// Drop the sketch attribution, keeping geometry and geography tags.
  pub fn to_input(&self) -> FragmentInput {
    FragmentInput {
      geometry:      self.geometry.clone(),
      geography_ids: self.geography_ids.clone(),
    }
  }
}
