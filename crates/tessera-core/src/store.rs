//! The `FragmentStore` trait and supporting types.
//!
//! The trait is implemented by storage backends (e.g. `tessera-store-sqlite`).
//! The orchestration layer (`tessera-server`) depends on this abstraction, not
//! on any concrete backend.
//!
//! Invariant every implementation must uphold: a fragment row exists if and
//! only if at least one sketch association references it. Orphans are
//! collected inside the same transaction that orphaned them.

use std::{collections::BTreeMap, future::Future};

use crate::{
  envelope::Envelope,
  fragment::{AttributedFragment, Fragment, FragmentHash, FragmentInput, SketchFragments},
  sketch::{CollectionId, Sketch, SketchId},
};

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Implemented by backend error types so callers can recover the domain
/// failure (antimeridian, permission, ...) from a storage error without
/// downcasting.
pub trait StoreError: std::error::Error + Send + Sync + Sized + 'static {
  /// Return the wrapped domain error, or `self` if this is a storage failure.
  fn into_domain(self) -> Result<crate::Error, Self>;
}

// ─── Commit outcome ──────────────────────────────────────────────────────────

/// What a [`FragmentStore::commit_sketch_fragments`] call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
  /// The new association set of every sketch in the commit.
  pub fragments: BTreeMap<SketchId, Vec<FragmentHash>>,
  /// Fragment rows inserted by this commit.
  pub created:   usize,
  /// Orphaned fragment rows deleted by this commit.
  pub collected: usize,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a content-addressed fragment store.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes (e.g. tokio with `axum`).
pub trait FragmentStore: Send + Sync {
  type Error: StoreError;

  // ── Sketches ──────────────────────────────────────────────────────────

  /// Insert or update the ownership/membership record of a sketch.
  fn put_sketch(
    &self,
    sketch: Sketch,
  ) -> impl Future<Output = Result<Sketch, Self::Error>> + Send + '_;

  /// Retrieve a sketch by id. Returns `None` if not found.
  fn get_sketch(
    &self,
    sketch_id: SketchId,
  ) -> impl Future<Output = Result<Option<Sketch>, Self::Error>> + Send + '_;

  /// All sketches in a collection, ordered by id.
  fn list_collection_sketches(
    &self,
    collection_id: CollectionId,
  ) -> impl Future<Output = Result<Vec<Sketch>, Self::Error>> + Send + '_;

  /// Move a sketch into (or out of) a collection. Fragments are untouched.
  fn set_sketch_collection(
    &self,
    sketch_id: SketchId,
    collection_id: Option<CollectionId>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  // ── Fragment writes ─────────────────────────────────────────────────

  /// Return the fragment with this content, creating it if absent.
  ///
  /// Idempotent and safe against concurrent creators: the first writer wins
  /// and everyone else observes the winner. A fragment created here and never
  /// associated is not live; backends may sweep it.
  fn get_or_create_fragment(
    &self,
    input: FragmentInput,
  ) -> impl Future<Output = Result<Fragment, Self::Error>> + Send + '_;

  /// Atomically replace a sketch's associations with `hashes` and collect any
  /// fragment that the replacement orphaned.
  fn replace_sketch_fragments(
    &self,
    sketch_id: SketchId,
    hashes: Vec<FragmentHash>,
  ) -> impl Future<Output = Result<CommitOutcome, Self::Error>> + Send + '_;

  /// Create any missing fragments and replace the associations of every
  /// listed sketch, all in one transaction.
  fn commit_sketch_fragments(
    &self,
    changes: Vec<SketchFragments>,
  ) -> impl Future<Output = Result<CommitOutcome, Self::Error>> + Send + '_;

  /// Remove a sketch, its associations, and any fragment left unreferenced.
  /// Returns the number of fragments collected.
  fn delete_sketch(
    &self,
    sketch_id: SketchId,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  /// Point `to` at exactly the fragments `from` references. Never touches
  /// geometry. Returns the number of associations written.
  fn copy_sketch_fragments(
    &self,
    from: SketchId,
    to: SketchId,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  // ── Fragment reads ───────────────────────────────────────────────────

  fn get_fragment(
    &self,
    hash: FragmentHash,
  ) -> impl Future<Output = Result<Option<Fragment>, Self::Error>> + Send + '_;

  /// The current association set of a sketch, ordered by hash.
  fn fragments_of_sketch(
    &self,
    sketch_id: SketchId,
  ) -> impl Future<Output = Result<Vec<Fragment>, Self::Error>> + Send + '_;

  /// The sketch's pieces, ordered by hash, each tagged with only the
  /// geographies the sketch itself contributes.
  fn contributions_of_sketch(
    &self,
    sketch_id: SketchId,
  ) -> impl Future<Output = Result<Vec<FragmentInput>, Self::Error>> + Send + '_;

  /// Every fragment referenced by a sketch in the collection, attributed to
  /// the sketches of that collection that reference it.
  fn fragments_for_collection(
    &self,
    collection_id: CollectionId,
  ) -> impl Future<Output = Result<Vec<AttributedFragment>, Self::Error>> + Send + '_;

  /// Candidate fragments for re-resolution: fragments associated with a
  /// sketch of `collection_id` other than `exclude` whose envelope intersects
  /// any of `envelopes`. Envelope intersection only; no geometry test.
  /// `sketch_ids` and `contributions` cover every sketch of the collection
  /// referencing the fragment, `exclude` included.
  fn overlapping_fragments(
    &self,
    collection_id: CollectionId,
    envelopes: Vec<Envelope>,
    exclude: Option<SketchId>,
  ) -> impl Future<Output = Result<Vec<AttributedFragment>, Self::Error>> + Send + '_;
}
