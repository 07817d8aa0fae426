use std::{collections::BTreeSet, sync::Arc, time::Duration};

use geo_types::{Geometry, MultiPolygon, Polygon, polygon};
use tessera_core::{
  envelope::Envelope,
  fragment::{FragmentHash, FragmentInput},
};
use tessera_overlay::{ClippingLayer, GeographySettings, OverlapResolver, ResolverConfig};
use tessera_store_sqlite::SqliteStore;

use super::*;

const OWNER: UserId = 10;
const STRANGER: UserId = 11;
const PROJECT: ProjectId = 100;
const COLLECTION: CollectionId = 7;

const A: SketchId = 1;
const B: SketchId = 2;

async fn service_with(config: ResolverConfig) -> FragmentService<SqliteStore> {
  let store = SqliteStore::open_in_memory().await.expect("in-memory store");
  FragmentService::new(Arc::new(store), OverlapResolver::new(config), Duration::from_secs(30))
}

async fn service() -> FragmentService<SqliteStore> { service_with(ResolverConfig::default()).await }

/// `A` and `B` registered by [`OWNER`] in [`COLLECTION`].
async fn seeded() -> FragmentService<SqliteStore> {
  let svc = service().await;
  svc.register_sketch(OWNER, A, PROJECT, Some(COLLECTION)).await.unwrap();
  svc.register_sketch(OWNER, B, PROJECT, Some(COLLECTION)).await.unwrap();
  svc
}

fn rect_polygon(x0: f64, y0: f64, x1: f64, y1: f64) -> Polygon<f64> {
  polygon![(x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1)]
}

fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Geometry<f64> {
  Geometry::Polygon(rect_polygon(x0, y0, x1, y1))
}

/// Sketch A spans [0, 0.003], sketch B spans [0.002, 0.005]: they overlap in
/// A's right third and B's left third.
fn geometry_a() -> Geometry<f64> { rect(0.0, 0.0, 0.003, 0.001) }

fn geometry_b() -> Geometry<f64> { rect(0.002, 0.0, 0.005, 0.001) }

fn tags(ids: &[i64]) -> Geographies { Geographies::Tags(ids.to_vec()) }

async fn hashes_of(svc: &FragmentService<SqliteStore>, id: SketchId) -> Vec<FragmentHash> {
  svc.fragments_for_sketch(id).await.unwrap().into_iter().map(|f| f.hash).collect()
}

async fn fragment_count(svc: &FragmentService<SqliteStore>) -> usize {
  svc.store().fragment_count().await.unwrap()
}

async fn overlap_pair() -> FragmentService<SqliteStore> {
  let svc = seeded().await;
  svc.update_sketch(A, OWNER, geometry_a(), tags(&[1])).await.unwrap();
  svc.update_sketch(B, OWNER, geometry_b(), tags(&[1])).await.unwrap();
  svc
}

// ─── Overlap ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn overlapping_sketches_yield_three_fragments() {
  let svc = overlap_pair().await;

  let fragments = svc.fragments_for_collection(COLLECTION).await.unwrap();
  assert_eq!(fragments.len(), 3);
  assert_eq!(fragment_count(&svc).await, 3);

  let shared: Vec<_> = fragments.iter().filter(|f| f.sketch_ids == vec![A, B]).collect();
  assert_eq!(shared.len(), 1);
  assert_eq!(shared[0].fragment.geography_ids, vec![1]);

  let mut widths: Vec<f64> =
    fragments.iter().map(|f| f.fragment.envelope.width() / 0.003).collect();
  widths.sort_by(f64::total_cmp);
  let expected = [1.0 / 3.0, 2.0 / 3.0, 2.0 / 3.0];
  for (w, e) in widths.iter().zip(expected) {
    assert!((w - e).abs() < 1e-6, "relative widths {widths:?}");
  }

  assert_eq!(hashes_of(&svc, A).await.len(), 2);
  assert_eq!(hashes_of(&svc, B).await.len(), 2);
}

#[tokio::test]
async fn second_update_reports_resolved_siblings() {
  let svc = seeded().await;
  svc.update_sketch(A, OWNER, geometry_a(), tags(&[1])).await.unwrap();
  let summary = svc.update_sketch(B, OWNER, geometry_b(), tags(&[1])).await.unwrap();
  assert_eq!(summary.siblings, vec![A]);
  assert_eq!(summary.fragments.len(), 2);
  // A's single piece was split in two.
  assert_eq!(summary.collected, 1);
}

#[tokio::test]
async fn updating_twice_is_idempotent() {
  let svc = seeded().await;
  let first = svc.update_sketch(A, OWNER, geometry_a(), tags(&[1, 2])).await.unwrap();
  let second = svc.update_sketch(A, OWNER, geometry_a(), tags(&[2, 1])).await.unwrap();

  assert_eq!(first.fragments.len(), 1);
  assert_eq!(first.fragments[0].hash, second.fragments[0].hash);
  assert_eq!(second.created, 0);
  assert_eq!(fragment_count(&svc).await, 1);
}

#[tokio::test]
async fn identical_sketches_share_fragment_hashes() {
  let svc = service().await;
  svc.register_sketch(OWNER, A, PROJECT, None).await.unwrap();
  svc.register_sketch(OWNER, B, PROJECT, Some(99)).await.unwrap();

  svc.update_sketch(A, OWNER, geometry_a(), tags(&[4])).await.unwrap();
  svc.update_sketch(B, OWNER, geometry_a(), tags(&[4])).await.unwrap();

  assert_eq!(hashes_of(&svc, A).await, hashes_of(&svc, B).await);
  assert_eq!(fragment_count(&svc).await, 1);
}

#[tokio::test]
async fn interior_edit_keeps_overlap_candidates_stable() {
  let svc = overlap_pair().await;
  let around = envelopes_of(&geometry_b()).unwrap();

  let before: BTreeSet<_> = svc
    .overlapping_fragments(COLLECTION, around.clone(), Some(B))
    .await
    .unwrap()
    .into_iter()
    .map(|f| f.fragment.hash)
    .collect();

  // Notch in B's right edge, away from A; the envelope is unchanged.
  let notched = Geometry::Polygon(polygon![
    (x: 0.002, y: 0.0), (x: 0.005, y: 0.0), (x: 0.005, y: 0.0004), (x: 0.0045, y: 0.0005),
    (x: 0.005, y: 0.0006), (x: 0.005, y: 0.001), (x: 0.002, y: 0.001)
  ]);
  assert_eq!(envelopes_of(&notched).unwrap(), around);
  svc.update_sketch(B, OWNER, notched, tags(&[1])).await.unwrap();

  let after: BTreeSet<_> = svc
    .overlapping_fragments(COLLECTION, around, Some(B))
    .await
    .unwrap()
    .into_iter()
    .map(|f| f.fragment.hash)
    .collect();

  assert_eq!(before.len(), 2);
  assert_eq!(before, after);
}

#[tokio::test]
async fn moving_a_sketch_away_dissolves_its_sibling() {
  let svc = overlap_pair().await;
  svc.update_sketch(A, OWNER, rect(1.0, 0.0, 1.003, 0.001), tags(&[1])).await.unwrap();

  let b = svc.fragments_for_sketch(B).await.unwrap();
  assert_eq!(b.len(), 1);
  assert!((b[0].envelope.width() - 0.003).abs() < 1e-9);
  assert_eq!(svc.fragments_for_collection(COLLECTION).await.unwrap().len(), 2);
  assert_eq!(fragment_count(&svc).await, 2);
}

#[tokio::test]
async fn moving_away_drops_the_departed_sketch_tags() {
  let svc = seeded().await;
  svc.update_sketch(A, OWNER, geometry_a(), tags(&[1])).await.unwrap();
  svc.update_sketch(B, OWNER, geometry_b(), tags(&[2])).await.unwrap();
  let shared = svc.fragments_for_collection(COLLECTION).await.unwrap();
  let shared = shared.iter().find(|f| f.sketch_ids == vec![A, B]).unwrap();
  assert_eq!(shared.fragment.geography_ids, vec![1, 2]);

  svc.update_sketch(A, OWNER, rect(1.0, 0.0, 1.003, 0.001), tags(&[1])).await.unwrap();

  let b = svc.fragments_for_sketch(B).await.unwrap();
  assert_eq!(b.len(), 1);
  assert_eq!(b[0].geography_ids, vec![2]);
  assert!((b[0].envelope.width() - 0.003).abs() < 1e-9);
  assert_eq!(fragment_count(&svc).await, 2);
}

#[tokio::test]
async fn concurrent_updates_in_one_collection_are_serialised() {
  let svc = Arc::new(seeded().await);
  let spawn_update = |id: SketchId, geometry: Geometry<f64>| {
    let svc = svc.clone();
    tokio::spawn(async move { svc.update_sketch(id, OWNER, geometry, tags(&[1])).await })
  };
  let a = spawn_update(A, geometry_a());
  let b = spawn_update(B, geometry_b());
  a.await.unwrap().unwrap();
  b.await.unwrap().unwrap();

  let fragments = svc.fragments_for_collection(COLLECTION).await.unwrap();
  assert_eq!(fragments.len(), 3);
  assert_eq!(fragments.iter().filter(|f| f.sketch_ids == vec![A, B]).count(), 1);
  assert_eq!(fragment_count(&svc).await, 3);
}

#[tokio::test]
async fn update_relocks_a_sketch_that_moved_while_waiting() {
  let svc = seeded().await;
  svc.update_sketch(A, OWNER, geometry_a(), tags(&[1])).await.unwrap();

  // A record read before B left the collection.
  let stale = svc.store().get_sketch(B).await.unwrap().unwrap();
  svc.store().set_sketch_collection(B, None).await.unwrap();

  let summary = svc.apply(stale, vec![FragmentInput::new(geometry_b(), [1])]).await.unwrap();
  assert!(summary.siblings.is_empty());
  assert_eq!(summary.fragments.len(), 1);
  assert_eq!(hashes_of(&svc, A).await.len(), 1);
}

#[tokio::test]
async fn geography_clipping_tags_each_piece() {
  let svc = seeded().await;
  let world = GeographySettings {
    id:     1,
    layers: vec![ClippingLayer::intersect(MultiPolygon(vec![rect_polygon(-180.0, -90.0, 180.0, 90.0)]))],
  };
  let east = GeographySettings {
    id:     2,
    layers: vec![ClippingLayer::intersect(MultiPolygon(vec![rect_polygon(0.001, -1.0, 1.0, 1.0)]))],
  };

  let summary = svc
    .update_sketch(A, OWNER, rect(0.0, 0.0, 0.002, 0.001), Geographies::Clip(vec![world, east]))
    .await
    .unwrap();

  let tags: BTreeSet<_> = summary.fragments.iter().map(|f| f.geography_ids.clone()).collect();
  assert_eq!(tags, BTreeSet::from([vec![1], vec![1, 2]]));
}

#[tokio::test]
async fn continuous_dateline_sketch_is_split() {
  let svc = seeded().await;
  let fiji = rect(178.0, -17.0, 182.0, -16.0);
  let summary = svc.update_sketch(A, OWNER, fiji, tags(&[])).await.unwrap();

  assert_eq!(summary.fragments.len(), 2);
  assert!(summary.fragments.iter().any(|f| f.envelope.max_x <= -178.0 + 1e-9));
  assert!(summary.fragments.iter().any(|f| f.envelope.min_x >= 178.0 - 1e-9));
}

// ─── Explicit inputs ─────────────────────────────────────────────────────────

#[tokio::test]
async fn explicit_inputs_are_resolved_like_geometry() {
  let svc = seeded().await;
  svc
    .update_sketch_fragments(A, OWNER, vec![FragmentInput::new(geometry_a(), [1])])
    .await
    .unwrap();
  let summary = svc
    .update_sketch_fragments(B, OWNER, vec![FragmentInput::new(geometry_b(), [1])])
    .await
    .unwrap();
  assert_eq!(summary.fragments.len(), 2);
  assert_eq!(svc.fragments_for_collection(COLLECTION).await.unwrap().len(), 3);
}

// ─── Rejections leave state intact ───────────────────────────────────────────

#[tokio::test]
async fn antimeridian_jump_is_rejected_without_changes() {
  let svc = seeded().await;
  svc.update_sketch(A, OWNER, geometry_a(), tags(&[1])).await.unwrap();
  let before = hashes_of(&svc, A).await;

  let jump = Geometry::Polygon(polygon![
    (x: 179.9, y: 0.0), (x: -179.8, y: 0.0), (x: -179.8, y: 1.0), (x: 179.9, y: 1.0)
  ]);
  let err = svc.update_sketch(A, OWNER, jump.clone(), tags(&[1])).await.unwrap_err();
  assert!(err.to_string().contains("antimeridian"), "{err}");
  assert!(matches!(err, Error::Domain(tessera_core::Error::AntimeridianViolation(_))));

  let err = svc
    .update_sketch_fragments(A, OWNER, vec![FragmentInput::new(jump, [1])])
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Domain(tessera_core::Error::AntimeridianViolation(_))));

  assert_eq!(hashes_of(&svc, A).await, before);
  assert_eq!(fragment_count(&svc).await, 1);
}

#[tokio::test]
async fn out_of_range_latitude_is_rejected_without_changes() {
  let svc = seeded().await;
  svc.update_sketch(A, OWNER, geometry_a(), tags(&[1])).await.unwrap();
  let before = hashes_of(&svc, A).await;

  let err = svc
    .update_sketch_fragments(A, OWNER, vec![FragmentInput::new(rect(0.0, 0.0, 0.001, 1e9), [1])])
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Domain(tessera_core::Error::InvalidGeometry(_))));

  assert_eq!(hashes_of(&svc, A).await, before);
  assert_eq!(fragment_count(&svc).await, 1);
}

#[tokio::test]
async fn non_owner_cannot_update_or_delete() {
  let svc = seeded().await;
  svc.update_sketch(A, OWNER, geometry_a(), tags(&[1])).await.unwrap();
  let before = hashes_of(&svc, A).await;

  let err = svc.update_sketch(A, STRANGER, geometry_b(), tags(&[1])).await.unwrap_err();
  assert!(matches!(
    err,
    Error::Domain(tessera_core::Error::PermissionDenied { sketch_id: A, caller_id: STRANGER })
  ));
  let err = svc.delete_sketch(A, STRANGER).await.unwrap_err();
  assert!(matches!(err, Error::Domain(tessera_core::Error::PermissionDenied { .. })));

  assert_eq!(hashes_of(&svc, A).await, before);
}

#[tokio::test]
async fn too_complex_update_leaves_state_intact() {
  let cfg = ResolverConfig { max_vertices: 8, ..ResolverConfig::default() };
  let svc = service_with(cfg).await;
  svc.register_sketch(OWNER, A, PROJECT, Some(COLLECTION)).await.unwrap();
  svc.register_sketch(OWNER, B, PROJECT, Some(COLLECTION)).await.unwrap();
  svc.update_sketch(A, OWNER, geometry_a(), tags(&[1])).await.unwrap();
  let before = hashes_of(&svc, A).await;

  // B plus A's candidate fragment exceed the vertex cap.
  let err = svc.update_sketch(B, OWNER, geometry_b(), tags(&[1])).await.unwrap_err();
  assert!(matches!(err, Error::Domain(tessera_core::Error::TooComplex(_))));
  assert_eq!(hashes_of(&svc, A).await, before);
  assert!(hashes_of(&svc, B).await.is_empty());
}

// ─── Delete ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn deletion_collects_only_unshared_fragments() {
  let svc = overlap_pair().await;

  // B-only goes; A∩B survives through A.
  assert_eq!(svc.delete_sketch(B, OWNER).await.unwrap(), 1);
  assert_eq!(fragment_count(&svc).await, 2);
  assert_eq!(hashes_of(&svc, A).await.len(), 2);

  assert_eq!(svc.delete_sketch(A, OWNER).await.unwrap(), 2);
  assert_eq!(fragment_count(&svc).await, 0);

  let err = svc.fragments_for_sketch(A).await.unwrap_err();
  assert!(matches!(err, Error::Domain(tessera_core::Error::SketchNotFound(A))));
}

// ─── Copy ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn copy_points_at_the_same_hashes() {
  let svc = overlap_pair().await;
  let copied = svc.copy_sketch(A, 30, Some(8), OWNER).await.unwrap();

  let copied: Vec<_> = copied.into_iter().map(|f| f.hash).collect();
  assert_eq!(copied, hashes_of(&svc, A).await);
  assert_eq!(fragment_count(&svc).await, 3);

  let copy = svc.store().get_sketch(30).await.unwrap().unwrap();
  assert_eq!((copy.owner_id, copy.project_id, copy.collection_id), (OWNER, PROJECT, Some(8)));
}

#[tokio::test]
async fn copy_across_projects_is_rejected() {
  let svc = overlap_pair().await;
  svc.register_sketch(OWNER, 40, 200, None).await.unwrap();
  let err = svc.copy_sketch(A, 40, None, OWNER).await.unwrap_err();
  assert!(matches!(err, Error::Domain(tessera_core::Error::CrossProject(A, 40))));
}

#[tokio::test]
async fn copy_collection_duplicates_every_sketch() {
  let svc = overlap_pair().await;
  let ids = BTreeMap::from([(A, 31), (B, 32)]);
  let copies = svc.copy_collection(COLLECTION, 8, ids, OWNER).await.unwrap();

  assert_eq!(copies.iter().map(|s| s.sketch_id).collect::<Vec<_>>(), vec![31, 32]);
  assert_eq!(hashes_of(&svc, 31).await, hashes_of(&svc, A).await);
  assert_eq!(hashes_of(&svc, 32).await, hashes_of(&svc, B).await);

  let copied = svc.fragments_for_collection(8).await.unwrap();
  assert_eq!(copied.len(), 3);
  assert!(copied.iter().any(|f| f.sketch_ids == vec![31, 32]));
  assert_eq!(fragment_count(&svc).await, 3);

  let err = svc.copy_collection(COLLECTION, 9, BTreeMap::from([(A, 50)]), OWNER).await.unwrap_err();
  assert!(matches!(err, Error::BadRequest(_)));
}

// ─── Move ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn moving_out_and_back_in() {
  let svc = overlap_pair().await;

  let out = svc.move_sketch(B, OWNER, None).await.unwrap();
  assert_eq!(out.fragments.len(), 1);
  assert!((out.fragments[0].envelope.width() - 0.003).abs() < 1e-9);
  assert_eq!(svc.store().get_sketch(B).await.unwrap().unwrap().collection_id, None);

  // A keeps its two pieces, now attributed to A alone.
  let left = svc.fragments_for_collection(COLLECTION).await.unwrap();
  assert_eq!(left.len(), 2);
  assert!(left.iter().all(|f| f.sketch_ids == vec![A]));

  let back = svc.move_sketch(B, OWNER, Some(COLLECTION)).await.unwrap();
  assert_eq!(back.siblings, vec![A]);
  assert_eq!(svc.fragments_for_collection(COLLECTION).await.unwrap().len(), 3);
}

#[tokio::test]
async fn moving_out_keeps_only_the_sketch_own_tags() {
  let svc = seeded().await;
  svc.update_sketch(A, OWNER, geometry_a(), tags(&[1])).await.unwrap();
  svc.update_sketch(B, OWNER, geometry_b(), tags(&[2])).await.unwrap();

  let out = svc.move_sketch(A, OWNER, None).await.unwrap();
  assert_eq!(out.fragments.len(), 1);
  assert_eq!(out.fragments[0].geography_ids, vec![1]);
  assert!((out.fragments[0].envelope.width() - 0.003).abs() < 1e-9);
}

#[tokio::test]
async fn moving_to_the_same_collection_is_a_no_op() {
  let svc = overlap_pair().await;
  let before = hashes_of(&svc, B).await;
  let summary = svc.move_sketch(B, OWNER, Some(COLLECTION)).await.unwrap();
  assert_eq!(summary.fragments.into_iter().map(|f| f.hash).collect::<Vec<_>>(), before);
}

// ─── Registration ────────────────────────────────────────────────────────────

#[tokio::test]
async fn registration_is_idempotent_but_guards_membership() {
  let svc = seeded().await;
  svc.register_sketch(OWNER, A, PROJECT, Some(COLLECTION)).await.unwrap();

  let err = svc.register_sketch(OWNER, A, PROJECT, Some(8)).await.unwrap_err();
  assert!(matches!(err, Error::Conflict(_)));

  let err = svc.register_sketch(STRANGER, A, PROJECT, Some(COLLECTION)).await.unwrap_err();
  assert!(matches!(err, Error::Domain(tessera_core::Error::PermissionDenied { .. })));
}

#[tokio::test]
async fn overlap_query_with_empty_envelopes_is_empty() {
  let svc = overlap_pair().await;
  let none: Vec<Envelope> = Vec::new();
  assert!(svc.overlapping_fragments(COLLECTION, none, None).await.unwrap().is_empty());
}
