//! Fragment hashing and geometry canonicalisation.
//!
//! The hash must be a pure function of (geometry, geography ids) that any
//! producer reproduces bit for bit, otherwise deduplication silently breaks.
//! Canonical form:
//!
//! - coordinates quantised to integer nano-degrees ([`HASH_PRECISION`]);
//! - consecutive duplicate vertices removed;
//! - polygon exterior counter-clockwise, holes clockwise, every ring rotated
//!   to start at its smallest vertex, holes sorted;
//! - geography ids sorted and deduplicated.
//!
//! The digest is SHA-256 over a tagged little-endian encoding of the above.

use geo_types::{Coord, Geometry, LineString, Point, Polygon};
use sha2::{Digest, Sha256};

use crate::{
  Error, Result,
  envelope::check_bounds,
  fragment::{FragmentHash, normalize_ids},
  sketch::GeographyId,
};

/// Coordinate precision of the canonical form, in degrees.
pub const HASH_PRECISION: f64 = 1e-9;

const SCALE: f64 = 1e9;
const DOMAIN_TAG: &[u8] = b"tessera-fragment-v1";

const TYPE_POINT: u8 = 1;
const TYPE_LINESTRING: u8 = 2;
const TYPE_POLYGON: u8 = 3;

type QCoord = (i64, i64);

// ─── Quantisation ────────────────────────────────────────────────────────────

fn quantize(c: &Coord<f64>) -> QCoord { ((c.x * SCALE).round() as i64, (c.y * SCALE).round() as i64) }

fn dequantize((x, y): QCoord) -> Coord<f64> { Coord { x: x as f64 / SCALE, y: y as f64 / SCALE } }

fn quantize_path(coords: &[Coord<f64>]) -> Vec<QCoord> {
  let mut out: Vec<QCoord> = coords.iter().map(quantize).collect();
  out.dedup();
  out
}

/// Twice the signed area of a closed ring, exact in integer arithmetic.
fn signed_area2(ring: &[QCoord]) -> i128 {
  ring
    .windows(2)
    .map(|w| {
      let (x0, y0) = (w[0].0 as i128, w[0].1 as i128);
      let (x1, y1) = (w[1].0 as i128, w[1].1 as i128);
      x0 * y1 - x1 * y0
    })
    .sum()
}

/// Canonicalise a ring: closed, oriented, starting at its smallest vertex.
fn canonical_ring(ring: &LineString<f64>, counter_clockwise: bool) -> Result<Vec<QCoord>> {
  let mut open = quantize_path(&ring.0);
  if open.len() > 1 && open.first() == open.last() {
    open.pop();
  }
  if open.len() < 3 {
    return Err(Error::invalid("polygon ring has fewer than three distinct vertices"));
  }

  let mut closed = open.clone();
  closed.push(open[0]);
  let area = signed_area2(&closed);
  if area == 0 {
    return Err(Error::invalid("polygon ring has zero area"));
  }
  if (area > 0) != counter_clockwise {
    open.reverse();
  }

  let start = open
    .iter()
    .enumerate()
    .min_by_key(|(_, c)| **c)
    .map(|(i, _)| i)
    .unwrap_or(0);
  open.rotate_left(start);
  open.push(open[0]);
  Ok(open)
}

// ─── Canonical geometry ──────────────────────────────────────────────────────

enum Canonical {
  Point(QCoord),
  LineString(Vec<QCoord>),
  Polygon(Vec<Vec<QCoord>>),
}

fn canonicalize(geom: &Geometry<f64>) -> Result<Canonical> {
  check_bounds(geom)?;
  match geom {
    Geometry::Point(p) => Ok(Canonical::Point(quantize(&p.0))),
    Geometry::LineString(ls) => {
      let path = quantize_path(&ls.0);
      if path.len() < 2 {
        return Err(Error::invalid("line has fewer than two distinct vertices"));
      }
      Ok(Canonical::LineString(path))
    }
    Geometry::Polygon(p) => {
      let mut rings = vec![canonical_ring(p.exterior(), true)?];
      let mut holes = p
        .interiors()
        .iter()
        .map(|r| canonical_ring(r, false))
        .collect::<Result<Vec<_>>>()?;
      holes.sort();
      rings.extend(holes);
      Ok(Canonical::Polygon(rings))
    }
    other => Err(Error::invalid(format!(
      "fragments must be a single point, line or polygon, got {}",
      geometry_kind(other)
    ))),
  }
}

fn geometry_kind(geom: &Geometry<f64>) -> &'static str {
  match geom {
    Geometry::Point(_) => "Point",
    Geometry::Line(_) => "Line",
    Geometry::LineString(_) => "LineString",
    Geometry::Polygon(_) => "Polygon",
    Geometry::MultiPoint(_) => "MultiPoint",
    Geometry::MultiLineString(_) => "MultiLineString",
    Geometry::MultiPolygon(_) => "MultiPolygon",
    Geometry::GeometryCollection(_) => "GeometryCollection",
    Geometry::Rect(_) => "Rect",
    Geometry::Triangle(_) => "Triangle",
  }
}

fn to_linestring(path: &[QCoord]) -> LineString<f64> {
  LineString(path.iter().copied().map(dequantize).collect())
}

impl Canonical {
  fn to_geometry(&self) -> Geometry<f64> {
    match self {
      Canonical::Point(c) => Geometry::Point(Point(dequantize(*c))),
      Canonical::LineString(path) => Geometry::LineString(to_linestring(path)),
      Canonical::Polygon(rings) => Geometry::Polygon(Polygon::new(
        to_linestring(&rings[0]),
        rings[1..].iter().map(|r| to_linestring(r)).collect(),
      )),
    }
  }

  fn encode(&self, buf: &mut Vec<u8>) {
    fn put_path(buf: &mut Vec<u8>, path: &[QCoord]) {
      buf.extend_from_slice(&(path.len() as u32).to_le_bytes());
      for (x, y) in path {
        buf.extend_from_slice(&x.to_le_bytes());
        buf.extend_from_slice(&y.to_le_bytes());
      }
    }

    match self {
      Canonical::Point(c) => {
        buf.push(TYPE_POINT);
        put_path(buf, std::slice::from_ref(c));
      }
      Canonical::LineString(path) => {
        buf.push(TYPE_LINESTRING);
        put_path(buf, path);
      }
      Canonical::Polygon(rings) => {
        buf.push(TYPE_POLYGON);
        buf.extend_from_slice(&(rings.len() as u32).to_le_bytes());
        for ring in rings {
          put_path(buf, ring);
        }
      }
    }
  }
}

// ─── Public API ──────────────────────────────────────────────────────────────

/// The canonical form of a single-piece fragment geometry.
///
/// Fails with [`Error::AntimeridianViolation`] for date-line crossings and
/// [`Error::InvalidGeometry`] for multi-part or degenerate input.
pub fn canonical_geometry(geom: &Geometry<f64>) -> Result<Geometry<f64>> {
  Ok(canonicalize(geom)?.to_geometry())
}

/// The exact byte string that is hashed for `(geom, geography_ids)`.
pub fn canonical_bytes(geom: &Geometry<f64>, geography_ids: &[GeographyId]) -> Result<Vec<u8>> {
  let canonical = canonicalize(geom)?;
  let ids = normalize_ids(geography_ids.iter().copied());

  let mut buf = Vec::with_capacity(64);
  buf.extend_from_slice(DOMAIN_TAG);
  canonical.encode(&mut buf);
  buf.extend_from_slice(&(ids.len() as u32).to_le_bytes());
  for id in ids {
    buf.extend_from_slice(&id.to_le_bytes());
  }
  Ok(buf)
}

/// Compute the content hash of a fragment.
pub fn compute_hash(geom: &Geometry<f64>, geography_ids: &[GeographyId]) -> Result<FragmentHash> {
  let bytes = canonical_bytes(geom, geography_ids)?;
  Ok(FragmentHash::from_digest(&Sha256::digest(&bytes)))
}

/// Recompute the hash of a stored fragment and compare.
pub fn verify_hash(
  hash: &FragmentHash,
  geom: &Geometry<f64>,
  geography_ids: &[GeographyId],
) -> Result<bool> {
  Ok(compute_hash(geom, geography_ids)? == *hash)
}

#[cfg(test)]
mod tests {
  use geo_types::{line_string, point, polygon};

  use super::*;

  fn unit_square() -> Geometry<f64> {
    Geometry::Polygon(polygon![
      (x: 0.0, y: 0.0),
      (x: 1.0, y: 0.0),
      (x: 1.0, y: 1.0),
      (x: 0.0, y: 1.0),
      (x: 0.0, y: 0.0),
    ])
  }

  #[test]
  fn digest_is_256_bit_hex() {
    let hash = compute_hash(&unit_square(), &[1]).unwrap();
    assert_eq!(hash.as_str().len(), 64);
    assert!(hash.as_str().chars().all(|c| c.is_ascii_hexdigit()));
  }

  #[test]
  fn winding_and_start_vertex_do_not_matter() {
    let reversed_and_rotated = Geometry::Polygon(polygon![
      (x: 1.0, y: 1.0),
      (x: 1.0, y: 0.0),
      (x: 0.0, y: 0.0),
      (x: 0.0, y: 1.0),
      (x: 1.0, y: 1.0),
    ]);
    assert_eq!(
      compute_hash(&unit_square(), &[2, 1]).unwrap(),
      compute_hash(&reversed_and_rotated, &[1, 2, 2]).unwrap(),
    );
  }

  #[test]
  fn sub_precision_noise_is_absorbed() {
    let noisy = Geometry::Polygon(polygon![
      (x: 0.0, y: 0.0),
      (x: 1.0 + 1e-12, y: 0.0),
      (x: 1.0, y: 1.0 - 1e-12),
      (x: 0.0, y: 1.0),
      (x: 0.0, y: 0.0),
    ]);
    assert_eq!(compute_hash(&unit_square(), &[]).unwrap(), compute_hash(&noisy, &[]).unwrap());
  }

  #[test]
  fn geography_tags_change_the_hash() {
    assert_ne!(
      compute_hash(&unit_square(), &[1]).unwrap(),
      compute_hash(&unit_square(), &[1, 2]).unwrap(),
    );
  }

  #[test]
  fn canonical_geometry_rehashes_identically() {
    let geom = Geometry::Polygon(polygon![
      (x: -119.68574523925781, y: 34.39246231021496),
      (x: -119.73896026611328, y: 34.37772911466851),
      (x: -119.69158172607422, y: 34.345987273972916),
      (x: -119.6586227416992, y: 34.36781108107208),
      (x: -119.68574523925781, y: 34.39246231021496),
    ]);
    let hash = compute_hash(&geom, &[4]).unwrap();
    let canonical = canonical_geometry(&geom).unwrap();
    assert!(verify_hash(&hash, &canonical, &[4]).unwrap());
  }

  #[test]
  fn line_direction_is_significant() {
    let forward = Geometry::LineString(line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0)]);
    let backward = Geometry::LineString(line_string![(x: 1.0, y: 1.0), (x: 0.0, y: 0.0)]);
    assert_ne!(compute_hash(&forward, &[]).unwrap(), compute_hash(&backward, &[]).unwrap());
  }

  #[test]
  fn multi_part_geometry_is_not_a_fragment() {
    let geom = Geometry::MultiPoint(vec![point!(x: 0.0, y: 0.0), point!(x: 1.0, y: 1.0)].into());
    assert!(matches!(compute_hash(&geom, &[]), Err(Error::InvalidGeometry(_))));
  }

  #[test]
  fn antimeridian_ring_is_rejected_before_hashing() {
    let geom = Geometry::Polygon(polygon![
      (x: 179.9, y: 34.39),
      (x: -179.8, y: 34.37),
      (x: 179.8, y: 34.34),
      (x: 179.9, y: 34.39),
    ]);
    assert!(matches!(compute_hash(&geom, &[1]), Err(Error::AntimeridianViolation(_))));
  }

  #[test]
  fn collapsed_ring_is_invalid() {
    let geom = Geometry::Polygon(polygon![
      (x: 0.0, y: 0.0),
      (x: 1.0, y: 0.0),
      (x: 2.0, y: 0.0),
      (x: 0.0, y: 0.0),
    ]);
    assert!(matches!(compute_hash(&geom, &[]), Err(Error::InvalidGeometry(_))));
  }
}
