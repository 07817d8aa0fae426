//! Envelope indexing.
//!
//! An [`Envelope`] is an axis-aligned longitude/latitude box used as a cheap
//! pre-filter for overlap candidates. A sketch whose parts sit on both sides
//! of the antimeridian gets one envelope per side instead of a single box
//! stretching across the whole globe.

use geo_types::{Coord, Geometry};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Widest longitudinal span a single envelope (or a single ring) may cover.
pub const MAX_LONGITUDE_SPAN: f64 = 180.0;

// ─── Envelope ────────────────────────────────────────────────────────────────

/// An axis-aligned bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
  pub min_x: f64,
  pub min_y: f64,
  pub max_x: f64,
  pub max_y: f64,
}

impl Envelope {
  pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
    Self { min_x, min_y, max_x, max_y }
  }

  /// Bound a sequence of coordinates. Returns `None` for an empty sequence.
  pub fn from_coords<'a>(coords: impl IntoIterator<Item = &'a Coord<f64>>) -> Option<Self> {
    let mut coords = coords.into_iter();
    let first = coords.next()?;
    let seed = Self::new(first.x, first.y, first.x, first.y);
    Some(coords.fold(seed, |env, c| env.expand_to(c)))
  }

  /// Closed-interval intersection test; touching boxes intersect.
  pub fn intersects(&self, other: &Envelope) -> bool {
    self.min_x <= other.max_x
      && self.max_x >= other.min_x
      && self.min_y <= other.max_y
      && self.max_y >= other.min_y
  }

  pub fn contains(&self, other: &Envelope) -> bool {
    self.min_x <= other.min_x
      && self.max_x >= other.max_x
      && self.min_y <= other.min_y
      && self.max_y >= other.max_y
  }

  pub fn width(&self) -> f64 { self.max_x - self.min_x }

  pub fn center_x(&self) -> f64 { (self.min_x + self.max_x) / 2.0 }

  /// The smallest envelope covering both `self` and `other`.
  pub fn union(&self, other: &Envelope) -> Envelope {
    Envelope {
      min_x: self.min_x.min(other.min_x),
      min_y: self.min_y.min(other.min_y),
      max_x: self.max_x.max(other.max_x),
      max_y: self.max_y.max(other.max_y),
    }
  }

  fn expand_to(self, c: &Coord<f64>) -> Envelope {
    Envelope {
      min_x: self.min_x.min(c.x),
      min_y: self.min_y.min(c.y),
      max_x: self.max_x.max(c.x),
      max_y: self.max_y.max(c.y),
    }
  }
}

// ─── Geometry walking ────────────────────────────────────────────────────────

/// Collect the coordinates of every part of `geom`. A polygon contributes its
/// exterior ring only; holes cannot widen its extent.
pub(crate) fn part_coords(geom: &Geometry<f64>, out: &mut Vec<Vec<Coord<f64>>>) {
  match geom {
    Geometry::Point(p) => out.push(vec![p.0]),
    Geometry::Line(l) => out.push(vec![l.start, l.end]),
    Geometry::LineString(ls) => out.push(ls.0.clone()),
    Geometry::Polygon(p) => out.push(p.exterior().0.clone()),
    Geometry::MultiPoint(mp) => out.extend(mp.iter().map(|p| vec![p.0])),
    Geometry::MultiLineString(mls) => out.extend(mls.iter().map(|ls| ls.0.clone())),
    Geometry::MultiPolygon(mp) => {
      out.extend(mp.iter().map(|p| p.exterior().0.clone()))
    }
    Geometry::GeometryCollection(gc) => {
      for g in gc.iter() {
        part_coords(g, out);
      }
    }
    Geometry::Rect(r) => out.push(vec![r.min(), r.max()]),
    Geometry::Triangle(t) => out.push(t.to_array().to_vec()),
  }
}

/// Collect every coordinate path of `geom`: each ring, line and point.
pub(crate) fn path_coords(geom: &Geometry<f64>, out: &mut Vec<Vec<Coord<f64>>>) {
  match geom {
    Geometry::Polygon(p) => {
      out.push(p.exterior().0.clone());
      out.extend(p.interiors().iter().map(|r| r.0.clone()));
    }
    Geometry::MultiPolygon(mp) => {
      for p in mp.iter() {
        out.push(p.exterior().0.clone());
        out.extend(p.interiors().iter().map(|r| r.0.clone()));
      }
    }
    Geometry::GeometryCollection(gc) => {
      for g in gc.iter() {
        path_coords(g, out);
      }
    }
    other => part_coords(other, out),
  }
}

fn ensure_finite(paths: &[Vec<Coord<f64>>]) -> Result<()> {
  let bad = paths
    .iter()
    .flatten()
    .find(|c| !c.x.is_finite() || !c.y.is_finite());
  match bad {
    Some(c) => Err(Error::invalid(format!("non-finite coordinate ({}, {})", c.x, c.y))),
    None => Ok(()),
  }
}

// ─── Public operations ───────────────────────────────────────────────────────

/// Compute the envelopes of `geom`.
///
/// - One envelope when the naive bounding box is at most 180° wide.
/// - Otherwise the parts are grouped by hemisphere (west/east of the prime
///   meridian by part centre) and one envelope per group is returned.
/// - Empty geometry yields an empty list.
pub fn envelopes_of(geom: &Geometry<f64>) -> Result<Vec<Envelope>> {
  let mut parts = Vec::new();
  part_coords(geom, &mut parts);
  ensure_finite(&parts)?;

  let boxes: Vec<Envelope> = parts.iter().filter_map(|p| Envelope::from_coords(p)).collect();
  let Some(whole) = boxes.iter().copied().reduce(|a, b| a.union(&b)) else {
    return Ok(Vec::new());
  };

  if whole.width() <= MAX_LONGITUDE_SPAN {
    return Ok(vec![whole]);
  }

  let (west, east): (Vec<Envelope>, Vec<Envelope>) =
    boxes.into_iter().partition(|b| b.center_x() < 0.0);

  Ok(
    [west, east]
      .into_iter()
      .filter_map(|side| side.into_iter().reduce(|a, b| a.union(&b)))
      .collect(),
  )
}

/// Reject geometry that crosses the antimeridian as a single unsplit ring.
///
/// A ring, line or point fails when any longitude lies outside [-180, 180] or
/// when a single path spans more than 180° of longitude (for example a ring
/// with vertices at 179.9 and -179.8).
pub fn check_antimeridian(geom: &Geometry<f64>) -> Result<()> {
  let mut paths = Vec::new();
  path_coords(geom, &mut paths);
  ensure_finite(&paths)?;

  for path in &paths {
    if let Some(c) = path.iter().find(|c| c.x.abs() > 180.0) {
      return Err(Error::antimeridian(format!(
        "longitude {} lies outside [-180, 180]; split the geometry at the antimeridian",
        c.x
      )));
    }
    if let Some(env) = Envelope::from_coords(path)
      && env.width() > MAX_LONGITUDE_SPAN
    {
      return Err(Error::antimeridian(format!(
        "a single ring spans {:.3} degrees of longitude ({} to {}); split it at the antimeridian",
        env.width(),
        env.min_x,
        env.max_x
      )));
    }
  }
  Ok(())
}

/// Reject coordinates no stored fragment may carry: non-finite values,
/// latitudes outside [-90, 90], and anything [`check_antimeridian`] rejects.
pub fn check_bounds(geom: &Geometry<f64>) -> Result<()> {
  let mut paths = Vec::new();
  path_coords(geom, &mut paths);
  ensure_finite(&paths)?;
  if let Some(c) = paths.iter().flatten().find(|c| c.y.abs() > 90.0) {
    return Err(Error::invalid(format!("latitude {} lies outside [-90, 90]", c.y)));
  }
  check_antimeridian(geom)
}
