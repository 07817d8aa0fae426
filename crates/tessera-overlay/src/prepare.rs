//! Sketch preparation: cleaning, antimeridian splitting and envelopes.
//!
//! Sketch geometry arrives as drawn. A shape drawn across the antimeridian
//! keeps continuous longitudes (e.g. 178 to 182) and is split here into one
//! piece per side, with every longitude brought back into [-180, 180]. A
//! single ring whose vertices jump from 179.9 to -179.8 cannot be told apart
//! from a ring spanning the globe the long way round and is rejected.

use geo::Translate;
use geo_types::{
  Coord, Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon, Rect,
};
use tessera_core::{
  Error, Result,
  envelope::{Envelope, MAX_LONGITUDE_SPAN, envelopes_of},
};

use crate::kernel::GeometryKernel;

/// Longitudes beyond this are not a continuation across the antimeridian.
const MAX_UNWRAPPED_LONGITUDE: f64 = 540.0;

/// Offsets of the three world copies a continuous sketch can touch.
const WORLD_SHIFTS: [f64; 3] = [-360.0, 0.0, 360.0];

/// A sketch ready for clipping and overlap resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSketch {
  /// A `MultiPolygon`, `MultiLineString` or `MultiPoint` with every
  /// longitude in [-180, 180].
  pub geometry:  Geometry<f64>,
  /// One envelope, or two when the pieces sit on both sides of the
  /// antimeridian.
  pub envelopes: Vec<Envelope>,
}

impl PreparedSketch {
  pub fn polygons(&self) -> Option<&MultiPolygon<f64>> {
    match &self.geometry {
      Geometry::MultiPolygon(mp) => Some(mp),
      _ => None,
    }
  }
}

#[derive(Default)]
struct Parts {
  polygons: Vec<Polygon<f64>>,
  lines:    Vec<LineString<f64>>,
  points:   Vec<Point<f64>>,
}

fn flatten(geom: &Geometry<f64>, parts: &mut Parts) {
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
        flatten(g, parts);
      }
    }
  }
}

fn dedup(ls: &LineString<f64>) -> LineString<f64> {
  let mut coords = ls.0.clone();
  coords.dedup();
  LineString(coords)
}

fn check_path(coords: &[Coord<f64>]) -> Result<()> {
  for c in coords {
    if !c.x.is_finite() || !c.y.is_finite() {
      return Err(Error::invalid(format!("non-finite coordinate ({}, {})", c.x, c.y)));
    }
    if c.y.abs() > 90.0 {
      return Err(Error::invalid(format!("latitude {} lies outside [-90, 90]", c.y)));
    }
    if c.x.abs() > MAX_UNWRAPPED_LONGITUDE {
      return Err(Error::invalid(format!("longitude {} is out of range", c.x)));
    }
  }
  if let Some(env) = Envelope::from_coords(coords)
    && env.width() > MAX_LONGITUDE_SPAN
  {
    return Err(Error::antimeridian(format!(
      "a single ring spans {:.3} degrees of longitude ({} to {}); draw it with continuous \
       longitudes or split it at the antimeridian",
      env.width(),
      env.min_x,
      env.max_x
    )));
  }
  Ok(())
}

fn clean_polygon(polygon: &Polygon<f64>) -> Result<Polygon<f64>> {
  let exterior = dedup(polygon.exterior());
  check_path(&exterior.0)?;
  if exterior.0.len() < 4 {
    return Err(Error::invalid("polygon exterior has fewer than three distinct vertices"));
  }
  let mut holes = Vec::with_capacity(polygon.interiors().len());
  for ring in polygon.interiors() {
    let ring = dedup(ring);
    check_path(&ring.0)?;
    if ring.0.len() >= 4 {
      holes.push(ring);
    }
  }
  Ok(Polygon::new(exterior, holes))
}

fn clean_line(line: &LineString<f64>) -> Result<LineString<f64>> {
  let line = dedup(line);
  check_path(&line.0)?;
  if line.0.len() < 2 {
    return Err(Error::invalid("line has fewer than two distinct vertices"));
  }
  Ok(line)
}

fn world_strip(shift: f64) -> MultiPolygon<f64> {
  let rect = Rect::new(
    Coord { x: -180.0 + shift, y: -90.0 },
    Coord { x: 180.0 + shift, y: 90.0 },
  );
  MultiPolygon(vec![rect.to_polygon()])
}

fn wrap_longitude(x: f64) -> f64 {
  if x > 180.0 {
    x - 360.0
  } else if x < -180.0 {
    x + 360.0
  } else {
    x
  }
}

fn all_in_range<'a>(mut coords: impl Iterator<Item = &'a Coord<f64>>) -> bool {
  coords.all(|c| c.x.abs() <= 180.0)
}

fn split_polygons<K: GeometryKernel>(kernel: &K, mp: MultiPolygon<f64>) -> MultiPolygon<f64> {
  let in_range = mp.iter().all(|p| all_in_range(p.exterior().coords()));
  if in_range {
    return mp;
  }
  let mut out = Vec::new();
  for shift in WORLD_SHIFTS {
    let piece = kernel.intersection(&mp, &world_strip(shift));
    out.extend(piece.translate(-shift, 0.0).0);
  }
  MultiPolygon(out)
}

fn split_lines<K: GeometryKernel>(kernel: &K, mls: MultiLineString<f64>) -> MultiLineString<f64> {
  let in_range = mls.iter().all(|ls| all_in_range(ls.coords()));
  if in_range {
    return mls;
  }
  let mut out = Vec::new();
  for shift in WORLD_SHIFTS {
    let piece = kernel.clip_lines(&world_strip(shift), &mls, false);
    out.extend(piece.translate(-shift, 0.0).0.into_iter().filter(|ls| ls.0.len() >= 2));
  }
  MultiLineString(out)
}

/// Clean `geom`, split it at the antimeridian and compute its envelopes.
///
/// Accepts any single-dimension geometry (collections included). Mixed
/// polygon/line/point input, collapsed rings and out-of-range latitudes are
/// [`Error::InvalidGeometry`]; a ring wider than 180° is
/// [`Error::AntimeridianViolation`].
pub fn prepare_sketch<K: GeometryKernel>(kernel: &K, geom: &Geometry<f64>) -> Result<PreparedSketch> {
  let mut parts = Parts::default();
  flatten(geom, &mut parts);

  let kinds = [!parts.polygons.is_empty(), !parts.lines.is_empty(), !parts.points.is_empty()]
    .into_iter()
    .filter(|k| *k)
    .count();
  if kinds == 0 {
    return Err(Error::invalid("empty geometry"));
  }
  if kinds > 1 {
    return Err(Error::invalid("sketch mixes polygons, lines and points"));
  }

  let geometry = if !parts.polygons.is_empty() {
    let polygons = parts.polygons.iter().map(clean_polygon).collect::<Result<Vec<_>>>()?;
    let split = split_polygons(kernel, MultiPolygon(polygons));
    if split.0.is_empty() {
      return Err(Error::invalid("polygon has no area"));
    }
    Geometry::MultiPolygon(split)
  } else if !parts.lines.is_empty() {
    let lines = parts.lines.iter().map(clean_line).collect::<Result<Vec<_>>>()?;
    Geometry::MultiLineString(split_lines(kernel, MultiLineString(lines)))
  } else {
    for p in &parts.points {
      check_path(&[p.0])?;
    }
    Geometry::MultiPoint(MultiPoint(
      parts
        .points
        .iter()
        .map(|p| Point::new(wrap_longitude(p.x()), p.y()))
        .collect(),
    ))
  };

  let envelopes = envelopes_of(&geometry)?;
  Ok(PreparedSketch { geometry, envelopes })
}
