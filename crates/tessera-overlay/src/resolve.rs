//! Overlap elimination.
//!
//! Given labelled geometry, build the planar arrangement of all areal inputs
//! and return one candidate per maximal region with a distinct label, where a
//! label maps each covering sketch to the geography tags it brings. Regions
//! are grown incrementally: each input is split against the regions already
//! placed, so the work per input is proportional to the regions whose
//! envelopes it touches.
//!
//! Lines and points are not arranged. Each part is emitted on its own, and
//! identical parts coming from several inputs are merged into one candidate
//! carrying all their sketches.

use std::collections::{BTreeMap, BTreeSet};

use geo::MapCoords;
use geo_types::{Coord, Geometry, LineString, MultiPolygon, Point, Polygon};
use tessera_core::{
  Error, Result,
  envelope::Envelope,
  fragment::{FragmentCandidate, normalize_ids},
  hash::canonical_bytes,
  sketch::{GeographyId, SketchId},
};
use tracing::debug;

use crate::{
  config::ResolverConfig,
  kernel::{GeoKernel, GeometryKernel},
};

// ─── Input ───────────────────────────────────────────────────────────────────

/// One labelled geometry fed to [`OverlapResolver::eliminate_overlap`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverInput {
  /// Sorted, distinct, non-empty.
  pub sketch_ids:    Vec<SketchId>,
  pub geometry:      Geometry<f64>,
  /// Sorted, distinct.
  pub geography_ids: Vec<GeographyId>,
}

impl ResolverInput {
  /// Geometry drawn by a single sketch.
  pub fn sketch(
    sketch_id: SketchId,
    geometry: Geometry<f64>,
    geography_ids: impl IntoIterator<Item = GeographyId>,
  ) -> Self {
    Self::attributed([sketch_id], geometry, geography_ids)
  }

  /// Geometry already shared by several sketches, typically an existing
  /// fragment.
  pub fn attributed(
    sketch_ids: impl IntoIterator<Item = SketchId>,
    geometry: Geometry<f64>,
    geography_ids: impl IntoIterator<Item = GeographyId>,
  ) -> Self {
    Self {
      sketch_ids: normalize_ids(sketch_ids),
      geometry,
      geography_ids: normalize_ids(geography_ids),
    }
  }
}

// ─── Labels and regions ──────────────────────────────────────────────────────

/// The sketches covering a region, each with the tags its own inputs bring.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Label(BTreeMap<SketchId, BTreeSet<GeographyId>>);

impl Label {
  fn of(input: &ResolverInput) -> Self {
    let tags: BTreeSet<GeographyId> = input.geography_ids.iter().copied().collect();
    Self(input.sketch_ids.iter().map(|&s| (s, tags.clone())).collect())
  }

  fn merge(&self, other: &Label) -> Label {
    let mut merged = self.0.clone();
    for (sketch, tags) in &other.0 {
      merged.entry(*sketch).or_default().extend(tags.iter().copied());
    }
    Label(merged)
  }

  fn into_candidate(self, geometry: Geometry<f64>) -> FragmentCandidate {
    let geography_ids: BTreeSet<GeographyId> = self.0.values().flatten().copied().collect();
    FragmentCandidate {
      geometry,
      sketch_ids: self.0.keys().copied().collect(),
      geography_ids: geography_ids.into_iter().collect(),
      contributions: self
        .0
        .into_iter()
        .map(|(sketch, tags)| (sketch, tags.into_iter().collect()))
        .collect(),
    }
  }
}

#[derive(Debug, Clone)]
struct Region {
  shape:    MultiPolygon<f64>,
  envelope: Envelope,
  label:    Label,
}

#[derive(Default)]
struct Parts {
  polygons: Vec<Polygon<f64>>,
  lines:    Vec<LineString<f64>>,
  points:   Vec<Point<f64>>,
}

impl Parts {
  fn vertex_count(&self) -> usize {
    let rings: usize = self
      .polygons
      .iter()
      .map(|p| p.exterior().0.len() + p.interiors().iter().map(|r| r.0.len()).sum::<usize>())
      .sum();
    rings + self.lines.iter().map(|l| l.0.len()).sum::<usize>() + self.points.len()
  }
}

fn collect_parts(geom: &Geometry<f64>, parts: &mut Parts) {
  match geom {
    Geometry::Point(p) => parts.points.push(*p),
    Geometry::MultiPoint(mp) => parts.points.extend(mp.iter().copied()),
    Geometry::Line(l) => parts.lines.push(LineString::from(vec![l.start, l.end])),
    Geometry::LineString(ls) => parts.lines.push(ls.clone()),
    Geometry::MultiLineString(mls) => parts.lines.extend(mls.iter().cloned()),
    Geometry::Polygon(p) => parts.polygons.push(p.clone()),
    Geometry::MultiPolygon(mp) => parts.polygons.extend(mp.iter().cloned()),
    Geometry::Rect(r) => parts.polygons.push(r.to_polygon()),
    Geometry::Triangle(t) => parts.polygons.push(t.to_polygon()),
    Geometry::GeometryCollection(gc) => {
      for g in gc.iter() {
        collect_parts(g, parts);
      }
    }
  }
}

fn total_cmp(a: &FragmentCandidate, b: &FragmentCandidate) -> std::cmp::Ordering {
  let corner = |c: &FragmentCandidate| {
    Envelope::from_coords(first_path(&c.geometry).iter())
      .map(|e| (e.min_x, e.min_y))
      .unwrap_or((0.0, 0.0))
  };
  let (ax, ay) = corner(a);
  let (bx, by) = corner(b);
  a.sketch_ids
    .cmp(&b.sketch_ids)
    .then_with(|| a.geography_ids.cmp(&b.geography_ids))
    .then_with(|| a.contributions.cmp(&b.contributions))
    .then_with(|| ax.total_cmp(&bx))
    .then_with(|| ay.total_cmp(&by))
}

fn first_path(geom: &Geometry<f64>) -> Vec<Coord<f64>> {
  match geom {
    Geometry::Point(p) => vec![p.0],
    Geometry::LineString(ls) => ls.0.clone(),
    Geometry::Polygon(p) => p.exterior().0.clone(),
    _ => Vec::new(),
  }
}

// ─── Resolver ────────────────────────────────────────────────────────────────

/// Splits labelled geometry into non-overlapping, attributed candidates.
#[derive(Debug, Clone)]
pub struct OverlapResolver<K = GeoKernel> {
  kernel: K,
  config: ResolverConfig,
}

impl OverlapResolver<GeoKernel> {
  pub fn new(config: ResolverConfig) -> Self { Self { kernel: GeoKernel, config } }
}

impl<K: GeometryKernel> OverlapResolver<K> {
  pub fn with_kernel(kernel: K, config: ResolverConfig) -> Self { Self { kernel, config } }

  pub fn kernel(&self) -> &K { &self.kernel }

  pub fn config(&self) -> &ResolverConfig { &self.config }

  /// Partition `inputs` into non-overlapping candidates.
  ///
  /// The union of areal candidates equals the union of areal inputs, less any
  /// slivers below the configured area floor. Each candidate carries every
  /// sketch whose input covers it, the tags each of those sketches brings,
  /// and the union of those tags.
  /// Output order is deterministic for a given input.
  ///
  /// Fails with [`Error::InvalidGeometry`] on empty, non-finite or collapsed
  /// input and with [`Error::TooComplex`] when the configured vertex or region
  /// caps are exceeded.
  pub fn eliminate_overlap(&self, inputs: &[ResolverInput]) -> Result<Vec<FragmentCandidate>> {
    let mut areal = Vec::new();
    let mut lineal = Vec::new();
    let mut puntal = Vec::new();
    let mut vertices = 0usize;

    for input in inputs {
      if input.sketch_ids.is_empty() {
        return Err(Error::invalid("resolver input carries no sketch ids"));
      }
      let label = Label::of(input);
      let parts = self.snap_parts(&input.geometry)?;
      vertices += parts.vertex_count();
      if vertices > self.config.max_vertices {
        return Err(Error::TooComplex(format!(
          "inputs exceed {} vertices",
          self.config.max_vertices
        )));
      }

      if !parts.polygons.is_empty() {
        let shape = self.kernel.repair(&MultiPolygon(parts.polygons));
        if self.kernel.area(&shape) <= 0.0 {
          return Err(Error::invalid("polygon input has no area"));
        }
        areal.push((label.clone(), shape));
      }
      lineal.extend(parts.lines.into_iter().map(|l| (label.clone(), Geometry::LineString(l))));
      puntal.extend(parts.points.into_iter().map(|p| (label.clone(), Geometry::Point(p))));
    }

    let total_area: f64 = areal.iter().map(|(_, s)| self.kernel.area(s)).sum();
    let floor = total_area * self.config.sliver_ratio;

    let regions = self.arrange(areal, floor)?;
    let region_count = regions.len();
    let mut candidates = self.dissolve(regions, floor);
    candidates.extend(merge_identical(lineal)?);
    candidates.extend(merge_identical(puntal)?);
    candidates.sort_by(total_cmp);

    debug!(
      inputs = inputs.len(),
      vertices,
      regions = region_count,
      candidates = candidates.len(),
      "overlap resolved"
    );
    Ok(candidates)
  }

  fn snap(&self, c: Coord<f64>) -> Coord<f64> {
    let p = self.config.precision;
    Coord { x: (c.x / p).round() * p, y: (c.y / p).round() * p }
  }

  fn snap_parts(&self, geom: &Geometry<f64>) -> Result<Parts> {
    let mut raw = Parts::default();
    collect_parts(geom, &mut raw);

    let mut parts = Parts::default();
    for polygon in &raw.polygons {
      let polygon = polygon.map_coords(|c| self.snap(c));
      ensure_finite(polygon.exterior())?;
      let mut exterior = polygon.exterior().clone();
      exterior.0.dedup();
      if exterior.0.len() < 4 {
        return Err(Error::invalid("polygon exterior collapses to fewer than three vertices"));
      }
      let mut holes = Vec::new();
      for ring in polygon.interiors() {
        ensure_finite(ring)?;
        let mut ring = ring.clone();
        ring.0.dedup();
        if ring.0.len() >= 4 {
          holes.push(ring);
        }
      }
      parts.polygons.push(Polygon::new(exterior, holes));
    }
    for line in &raw.lines {
      let mut line = line.map_coords(|c| self.snap(c));
      ensure_finite(&line)?;
      line.0.dedup();
      if line.0.len() < 2 {
        return Err(Error::invalid("line collapses to a single vertex"));
      }
      parts.lines.push(line);
    }
    for point in &raw.points {
      let point = Point(self.snap(point.0));
      ensure_finite(&LineString(vec![point.0]))?;
      parts.points.push(point);
    }

    if parts.polygons.is_empty() && parts.lines.is_empty() && parts.points.is_empty() {
      return Err(Error::invalid("empty geometry"));
    }
    Ok(parts)
  }

  /// Incrementally build the labelled arrangement of `inputs`.
  fn arrange(&self, inputs: Vec<(Label, MultiPolygon<f64>)>, floor: f64) -> Result<Vec<Region>> {
    let mut regions: Vec<Region> = Vec::new();

    for (label, shape) in inputs {
      let Some(envelope) = self.kernel.envelope(&shape) else {
        continue;
      };
      let mut remaining = shape;
      let mut next = Vec::with_capacity(regions.len() + 1);

      for region in regions {
        if remaining.0.is_empty() || !region.envelope.intersects(&envelope) {
          next.push(region);
          continue;
        }
        let shared = self.kernel.intersection(&region.shape, &remaining);
        if self.negligible(&shared, floor) {
          // The region keeps a sliver overlap whole; `remaining` still gives
          // it up so no area is covered twice.
          remaining = self.kernel.difference(&remaining, &region.shape);
          next.push(region);
          continue;
        }
        let outside = self.kernel.difference(&region.shape, &remaining);
        remaining = self.kernel.difference(&remaining, &region.shape);

        if !self.negligible(&outside, floor) {
          self.push_region(&mut next, outside, region.label.clone());
        }
        self.push_region(&mut next, shared, region.label.merge(&label));
      }

      if !self.negligible(&remaining, floor) {
        self.push_region(&mut next, remaining, label);
      }
      if next.len() > self.config.max_regions {
        return Err(Error::TooComplex(format!(
          "arrangement exceeds {} regions",
          self.config.max_regions
        )));
      }
      regions = next;
    }
    Ok(regions)
  }

  fn push_region(&self, regions: &mut Vec<Region>, shape: MultiPolygon<f64>, label: Label) {
    if let Some(envelope) = self.kernel.envelope(&shape) {
      regions.push(Region { shape, envelope, label });
    }
  }

  fn negligible(&self, shape: &MultiPolygon<f64>, floor: f64) -> bool {
    shape.0.is_empty() || self.kernel.area(shape) <= floor
  }

  /// Merge same-label regions into maximal pieces and emit one candidate per
  /// connected polygon.
  fn dissolve(&self, regions: Vec<Region>, floor: f64) -> Vec<FragmentCandidate> {
    let mut groups: BTreeMap<Label, Vec<MultiPolygon<f64>>> = BTreeMap::new();
    for region in regions {
      groups.entry(region.label).or_default().push(region.shape);
    }

    let mut out = Vec::new();
    let mut dropped = 0usize;
    for (label, shapes) in groups {
      let merged = if shapes.len() == 1 {
        shapes.into_iter().next().unwrap_or_else(|| MultiPolygon(Vec::new()))
      } else {
        shapes
          .iter()
          .fold(MultiPolygon(Vec::new()), |acc, s| self.kernel.union(&acc, s))
      };
      for polygon in merged {
        let piece = MultiPolygon(vec![polygon]);
        if self.negligible(&piece, floor)
          || self.kernel.geodesic_area(&piece) < self.config.min_area_m2
        {
          dropped += 1;
          continue;
        }
        let polygon = piece.0.into_iter().next();
        if let Some(polygon) = polygon {
          out.push(label.clone().into_candidate(Geometry::Polygon(polygon)));
        }
      }
    }
    if dropped > 0 {
      debug!(dropped, "dropped sliver pieces");
    }
    out
  }
}

fn ensure_finite(ls: &LineString<f64>) -> Result<()> {
  match ls.0.iter().find(|c| !c.x.is_finite() || !c.y.is_finite()) {
    Some(c) => Err(Error::invalid(format!("non-finite coordinate ({}, {})", c.x, c.y))),
    None => Ok(()),
  }
}

/// Merge lines or points with identical canonical form, unioning labels.
fn merge_identical(parts: Vec<(Label, Geometry<f64>)>) -> Result<Vec<FragmentCandidate>> {
  let mut merged: BTreeMap<Vec<u8>, (Label, Geometry<f64>)> = BTreeMap::new();
  for (label, geometry) in parts {
    let key = canonical_bytes(&geometry, &[])?;
    match merged.get_mut(&key) {
      Some((existing, _)) => *existing = existing.merge(&label),
      None => {
        merged.insert(key, (label, geometry));
      }
    }
  }
  Ok(merged.into_values().map(|(label, geometry)| label.into_candidate(geometry)).collect())
}
