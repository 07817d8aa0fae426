//! [`FragmentService`]: the orchestration layer.
//!
//! Ties the envelope indexer, collection overlap query, overlap resolver and
//! fragment store together into the operations callers actually make:
//! updating a sketch, reading fragments, deleting, copying and moving.
//!
//! Mutations that can change fragments inside a collection are serialised per
//! collection; sketches outside any collection are serialised per sketch. The
//! resolver runs on the blocking pool under a wall-clock budget.

use std::{
  collections::{BTreeMap, BTreeSet, HashMap},
  sync::{Arc, Mutex},
  time::{Duration, Instant},
};

use geo_types::Geometry;
use serde::Serialize;
use tessera_core::{
  auth::Authorizer,
  envelope::{Envelope, check_bounds, envelopes_of},
  fragment::{
    AttributedFragment, Fragment, FragmentCandidate, FragmentHash, FragmentInput, SketchFragments,
    SketchPiece,
  },
  sketch::{CollectionId, GeographyId, ProjectId, Sketch, SketchId, UserId},
  store::FragmentStore,
};
use tessera_overlay::{GeographySettings, OverlapResolver, ResolverInput, prepare_sketch};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

// ─── Backend bound ───────────────────────────────────────────────────────────

/// A store that also answers authorisation questions, with one error type.
pub trait Backend:
  FragmentStore + Authorizer<Error = <Self as FragmentStore>::Error> + 'static
{
}

impl<T> Backend for T where
  T: FragmentStore + Authorizer<Error = <T as FragmentStore>::Error> + 'static
{
}

// ─── Inputs and outputs ──────────────────────────────────────────────────────

/// How a new sketch geometry is tagged with geographies.
#[derive(Debug, Clone)]
pub enum Geographies {
  /// Tag the whole geometry with these ids.
  Tags(Vec<GeographyId>),
  /// Clip the geometry to each geography and tag each piece.
  Clip(Vec<GeographySettings>),
}

/// Result of a fragment update.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSummary {
  pub sketch_id: SketchId,
  /// The sketch's new fragment set, ordered by hash.
  pub fragments: Vec<Fragment>,
  /// Sibling sketches whose fragments were re-resolved.
  pub siblings:  Vec<SketchId>,
  pub created:   usize,
  pub collected: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LockKey {
  Collection(CollectionId),
  Sketch(SketchId),
}

impl LockKey {
  fn of(sketch: &Sketch) -> Self {
    match sketch.collection_id {
      Some(c) => LockKey::Collection(c),
      None => LockKey::Sketch(sketch.sketch_id),
    }
  }
}

// ─── Service ─────────────────────────────────────────────────────────────────

pub struct FragmentService<S> {
  store:    Arc<S>,
  resolver: Arc<OverlapResolver>,
  timeout:  Duration,
  locks:    Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S: Backend> FragmentService<S> {
  pub fn new(store: Arc<S>, resolver: OverlapResolver, timeout: Duration) -> Self {
    Self { store, resolver: Arc::new(resolver), timeout, locks: Mutex::new(HashMap::new()) }
  }

  pub fn store(&self) -> &Arc<S> { &self.store }

  // ── Plumbing ──────────────────────────────────────────────────────────────

  async fn lock(&self, key: LockKey) -> OwnedMutexGuard<()> {
    let mutex = {
      let mut table = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
      table.retain(|_, m| Arc::strong_count(m) > 1);
      table.entry(key).or_default().clone()
    };
    mutex.lock_owned().await
  }

  /// Take the serialisation lock of `sketch`, then re-read the record under
  /// it. A sketch moved while we waited is locked again under its new key.
  async fn lock_sketch(&self, sketch: Sketch) -> Result<(Sketch, OwnedMutexGuard<()>)> {
    let mut key = LockKey::of(&sketch);
    loop {
      let guard = self.lock(key).await;
      let current = self.sketch(sketch.sketch_id).await?;
      if LockKey::of(&current) == key {
        return Ok((current, guard));
      }
      debug!(sketch_id = sketch.sketch_id, "sketch moved while waiting for its lock; retrying");
      key = LockKey::of(&current);
    }
  }

  async fn sketch(&self, sketch_id: SketchId) -> Result<Sketch> {
    self
      .store
      .get_sketch(sketch_id)
      .await
      .map_err(Error::from_store)?
      .ok_or(Error::Domain(tessera_core::Error::SketchNotFound(sketch_id)))
  }

  async fn owned_sketch(&self, sketch_id: SketchId, caller: UserId) -> Result<Sketch> {
    if let Err(e) = self.store.assert_owner(sketch_id, caller).await {
      let err = Error::from_store(e);
      warn!(sketch_id, caller, error = %err, "rejected mutation");
      return Err(err);
    }
    self.sketch(sketch_id).await
  }

  /// Run `job` on the blocking pool, mapping budget expiry to `TooComplex`.
  async fn blocking<T, F>(&self, job: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&OverlapResolver) -> tessera_core::Result<T> + Send + 'static,
  {
    let resolver = self.resolver.clone();
    let task = tokio::task::spawn_blocking(move || job(&resolver));
    match tokio::time::timeout(self.timeout, task).await {
      Err(_) => Err(Error::Domain(tessera_core::Error::TooComplex(format!(
        "overlap resolution exceeded {} ms",
        self.timeout.as_millis()
      )))),
      Ok(Err(join)) => Err(Error::Task(join.to_string())),
      Ok(Ok(result)) => Ok(result?),
    }
  }

  async fn resolve(&self, inputs: Vec<ResolverInput>) -> Result<Vec<FragmentCandidate>> {
    if inputs.is_empty() {
      return Ok(Vec::new());
    }
    self.blocking(move |r| r.eliminate_overlap(&inputs)).await
  }

  fn envelopes_of_inputs(inputs: &[FragmentInput]) -> Result<Vec<Envelope>> {
    let mut out = Vec::new();
    for input in inputs {
      out.extend(envelopes_of(&input.geometry)?);
    }
    Ok(out)
  }

  // ── Sketch records ────────────────────────────────────────────────────────

  /// Record a sketch owned by `caller`. Re-registering with identical
  /// membership is a no-op; changing membership goes through
  /// [`Self::move_sketch`].
  pub async fn register_sketch(
    &self,
    caller: UserId,
    sketch_id: SketchId,
    project_id: ProjectId,
    collection_id: Option<CollectionId>,
  ) -> Result<Sketch> {
    let sketch = Sketch { sketch_id, owner_id: caller, project_id, collection_id };
    if let Some(existing) = self.store.get_sketch(sketch_id).await.map_err(Error::from_store)? {
      if existing == sketch {
        return Ok(existing);
      }
      if existing.owner_id != caller {
        return Err(tessera_core::Error::PermissionDenied { sketch_id, caller_id: caller }.into());
      }
      return Err(Error::Conflict(format!(
        "sketch {sketch_id} is already registered with different membership"
      )));
    }
    let sketch = self.store.put_sketch(sketch).await.map_err(Error::from_store)?;
    info!(sketch_id, project_id, ?collection_id, "registered sketch");
    Ok(sketch)
  }

  // ── Updates ───────────────────────────────────────────────────────────────

  /// Replace a sketch's geometry: prepare it, derive its fragment inputs
  /// and re-resolve it against overlapping siblings.
  pub async fn update_sketch(
    &self,
    sketch_id: SketchId,
    caller: UserId,
    geometry: Geometry<f64>,
    geographies: Geographies,
  ) -> Result<UpdateSummary> {
    let sketch = self.owned_sketch(sketch_id, caller).await?;

    let inputs = self
      .blocking(move |r| {
        let prepared = prepare_sketch(r.kernel(), &geometry)?;
        match geographies {
          Geographies::Tags(ids) => Ok(vec![FragmentInput::new(prepared.geometry, ids)]),
          Geographies::Clip(settings) => r.create_fragments(sketch_id, &prepared, &settings),
        }
      })
      .await?;

    self.apply(sketch, inputs).await
  }

  /// Replace a sketch's fragments from explicit, already-split inputs.
  pub async fn update_sketch_fragments(
    &self,
    sketch_id: SketchId,
    caller: UserId,
    inputs: Vec<FragmentInput>,
  ) -> Result<UpdateSummary> {
    let sketch = self.owned_sketch(sketch_id, caller).await?;
    for input in &inputs {
      check_bounds(&input.geometry)?;
    }
    self.apply(sketch, inputs).await
  }

  /// The shared read-resolve-commit path. `sketch` may be stale; the
  /// record is re-read under the lock.
  async fn apply(&self, sketch: Sketch, inputs: Vec<FragmentInput>) -> Result<UpdateSummary> {
    let started = Instant::now();
    let (sketch, _guard) = self.lock_sketch(sketch).await?;
    let sketch_id = sketch.sketch_id;

    // Candidates are looked up around both the new geometry and the pieces
    // the sketch is about to give up, so siblings that shared those pieces
    // are re-resolved too.
    let prior = self.store.fragments_of_sketch(sketch_id).await.map_err(Error::from_store)?;
    let mut envelopes = Self::envelopes_of_inputs(&inputs)?;
    envelopes.extend(prior.iter().map(|f| f.envelope));

    let candidates = match sketch.collection_id {
      Some(c) if !envelopes.is_empty() => self
        .store
        .overlapping_fragments(c, envelopes, Some(sketch_id))
        .await
        .map_err(Error::from_store)?,
      _ => Vec::new(),
    };

    let mut resolver_inputs: Vec<ResolverInput> = inputs
      .into_iter()
      .map(|i| ResolverInput::sketch(sketch_id, i.geometry, i.geography_ids))
      .collect();
    // Each sibling re-enters with only the tags it contributed, so a piece
    // this sketch leaves sheds this sketch's tags too.
    let mut siblings = BTreeSet::new();
    let mut replaced = BTreeSet::new();
    for candidate in candidates {
      replaced.insert(candidate.fragment.hash.clone());
      for (&other, own) in &candidate.contributions {
        if other == sketch_id {
          continue;
        }
        siblings.insert(other);
        resolver_inputs.push(ResolverInput::sketch(
          other,
          candidate.fragment.geometry.clone(),
          own.iter().copied(),
        ));
      }
    }
    let input_count = resolver_inputs.len();

    let outputs = self.resolve(resolver_inputs).await?;

    let mut changes = vec![SketchFragments::with_pieces(sketch_id, covering(&outputs, sketch_id))];
    for &sibling in &siblings {
      let keep: Vec<FragmentHash> = self
        .store
        .fragments_of_sketch(sibling)
        .await
        .map_err(Error::from_store)?
        .into_iter()
        .map(|f| f.hash)
        .filter(|h| !replaced.contains(h))
        .collect();
      changes.push(SketchFragments::with_pieces(sibling, covering(&outputs, sibling)).retaining(keep));
    }

    let outcome = self.store.commit_sketch_fragments(changes).await.map_err(Error::from_store)?;
    let fragments = self.store.fragments_of_sketch(sketch_id).await.map_err(Error::from_store)?;

    info!(
      sketch_id,
      inputs = input_count,
      siblings = siblings.len(),
      fragments = fragments.len(),
      created = outcome.created,
      collected = outcome.collected,
      elapsed_ms = started.elapsed().as_millis() as u64,
      "updated sketch fragments"
    );

    Ok(UpdateSummary {
      sketch_id,
      fragments,
      siblings: siblings.into_iter().collect(),
      created: outcome.created,
      collected: outcome.collected,
    })
  }

  // ── Reads ─────────────────────────────────────────────────────────────────

  pub async fn fragments_for_sketch(&self, sketch_id: SketchId) -> Result<Vec<Fragment>> {
    self.sketch(sketch_id).await?;
    self.store.fragments_of_sketch(sketch_id).await.map_err(Error::from_store)
  }

  pub async fn fragments_for_collection(
    &self,
    collection_id: CollectionId,
  ) -> Result<Vec<AttributedFragment>> {
    self.store.fragments_for_collection(collection_id).await.map_err(Error::from_store)
  }

  pub async fn overlapping_fragments(
    &self,
    collection_id: CollectionId,
    envelopes: Vec<Envelope>,
    exclude: Option<SketchId>,
  ) -> Result<Vec<AttributedFragment>> {
    self
      .store
      .overlapping_fragments(collection_id, envelopes, exclude)
      .await
      .map_err(Error::from_store)
  }

  // ── Delete / copy / move ──────────────────────────────────────────────────

  /// Remove a sketch and its associations, collecting orphaned fragments.
  /// Siblings keep their current fragments. Returns the number collected.
  pub async fn delete_sketch(&self, sketch_id: SketchId, caller: UserId) -> Result<usize> {
    let sketch = self.owned_sketch(sketch_id, caller).await?;
    let (_, _guard) = self.lock_sketch(sketch).await?;
    let collected = self.store.delete_sketch(sketch_id).await.map_err(Error::from_store)?;
    info!(sketch_id, collected, "deleted sketch");
    Ok(collected)
  }

  /// Point `copy_id` at exactly the fragments of `source`, registering the
  /// copy for `caller` if it does not exist yet. Never resolves geometry.
  pub async fn copy_sketch(
    &self,
    source: SketchId,
    copy_id: SketchId,
    collection_id: Option<CollectionId>,
    caller: UserId,
  ) -> Result<Vec<Fragment>> {
    let original = self.sketch(source).await?;
    let copy = match self.store.get_sketch(copy_id).await.map_err(Error::from_store)? {
      Some(existing) => {
        self.store.assert_owner(copy_id, caller).await.map_err(Error::from_store)?;
        existing
      }
      None => {
        let mut copy = Sketch::new(copy_id, caller, original.project_id);
        copy.collection_id = collection_id;
        self.store.put_sketch(copy).await.map_err(Error::from_store)?
      }
    };
    self.store.assert_same_project(source, copy_id).await.map_err(Error::from_store)?;

    let (_, _guard) = self.lock_sketch(copy).await?;
    let copied = self.store.copy_sketch_fragments(source, copy_id).await.map_err(Error::from_store)?;
    debug!(source, copy_id, copied, "copied sketch fragments");
    self.store.fragments_of_sketch(copy_id).await.map_err(Error::from_store)
  }

  /// Copy every sketch of `source` into `target`, using `ids` to map each
  /// source sketch id to its copy's id.
  pub async fn copy_collection(
    &self,
    source: CollectionId,
    target: CollectionId,
    ids: BTreeMap<SketchId, SketchId>,
    caller: UserId,
  ) -> Result<Vec<Sketch>> {
    let sketches = self.store.list_collection_sketches(source).await.map_err(Error::from_store)?;
    if let Some(missing) = sketches.iter().find(|s| !ids.contains_key(&s.sketch_id)) {
      return Err(Error::BadRequest(format!("no copy id given for sketch {}", missing.sketch_id)));
    }

    let mut copies = Vec::with_capacity(sketches.len());
    for sketch in sketches {
      let copy_id = ids[&sketch.sketch_id];
      self.copy_sketch(sketch.sketch_id, copy_id, Some(target), caller).await?;
      copies.push(self.sketch(copy_id).await?);
    }
    info!(source, target, sketches = copies.len(), "copied collection");
    Ok(copies)
  }

  /// Move a sketch into another collection (or out of any).
  ///
  /// Leaving a collection dissolves the sketch's fragments back into its own
  /// maximal pieces; the old siblings keep theirs. Entering a collection
  /// resolves the sketch against its new siblings.
  pub async fn move_sketch(
    &self,
    sketch_id: SketchId,
    caller: UserId,
    target: Option<CollectionId>,
  ) -> Result<UpdateSummary> {
    let sketch = self.owned_sketch(sketch_id, caller).await?;

    let (from, own) = {
      let (sketch, guard) = self.lock_sketch(sketch).await?;
      if sketch.collection_id == target {
        drop(guard);
        let fragments = self.fragments_for_sketch(sketch_id).await?;
        return Ok(UpdateSummary { sketch_id, fragments, siblings: Vec::new(), created: 0, collected: 0 });
      }

      // Shared pieces carry the old siblings' tags; dissolve from the
      // sketch's own.
      let inputs: Vec<ResolverInput> = self
        .store
        .contributions_of_sketch(sketch_id)
        .await
        .map_err(Error::from_store)?
        .into_iter()
        .map(|i| ResolverInput::sketch(sketch_id, i.geometry, i.geography_ids))
        .collect();
      let dissolved: Vec<FragmentInput> =
        self.resolve(inputs).await?.iter().map(FragmentCandidate::to_input).collect();

      self
        .store
        .commit_sketch_fragments(vec![SketchFragments::new(sketch_id, dissolved.clone())])
        .await
        .map_err(Error::from_store)?;
      self.store.set_sketch_collection(sketch_id, None).await.map_err(Error::from_store)?;
      (sketch.collection_id, dissolved)
    };
    info!(sketch_id, ?from, to = ?target, "moved sketch");

    match target {
      None => {
        let fragments = self.fragments_for_sketch(sketch_id).await?;
        Ok(UpdateSummary { sketch_id, fragments, siblings: Vec::new(), created: 0, collected: 0 })
      }
      Some(c) => {
        self.store.set_sketch_collection(sketch_id, Some(c)).await.map_err(Error::from_store)?;
        self.apply(Sketch { collection_id: Some(c), ..sketch }, own).await
      }
    }
  }
}

/// The candidates covering `sketch_id`, as that sketch's pieces.
fn covering(outputs: &[FragmentCandidate], sketch_id: SketchId) -> Vec<SketchPiece> {
  outputs.iter().filter_map(|c| c.piece_for(sketch_id)).collect()
}

#[cfg(test)]
mod tests;
