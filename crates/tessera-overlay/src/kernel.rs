//! The geometry kernel seam.
//!
//! Everything the resolver needs from a geometry library, and nothing more.
//! [`GeoKernel`] implements it with the `geo` crate's boolean operations.

use geo::{
  Area, BooleanOps, BoundingRect, ChamberlainDuquetteArea, Intersects,
};
use geo_types::{MultiLineString, MultiPolygon, Point};
use tessera_core::envelope::Envelope;

/// Planar operations over longitude/latitude polygons.
pub trait GeometryKernel: Send + Sync {
  fn union(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64>;

  fn intersection(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64>;

  fn difference(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64>;

  /// Resolve self-touching rings, overlapping parts and winding.
  fn repair(&self, shape: &MultiPolygon<f64>) -> MultiPolygon<f64>;

  /// Planar area in square degrees.
  fn area(&self, shape: &MultiPolygon<f64>) -> f64;

  /// Approximate area on the sphere, in square metres.
  fn geodesic_area(&self, shape: &MultiPolygon<f64>) -> f64;

  fn envelope(&self, shape: &MultiPolygon<f64>) -> Option<Envelope>;

  /// Point-in-polygon test; boundary points count as inside.
  fn covers_point(&self, shape: &MultiPolygon<f64>, point: &Point<f64>) -> bool;

  /// The parts of `lines` inside `shape`, or outside it when `invert`.
  fn clip_lines(
    &self,
    shape: &MultiPolygon<f64>,
    lines: &MultiLineString<f64>,
    invert: bool,
  ) -> MultiLineString<f64>;
}

/// [`GeometryKernel`] backed by the `geo` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoKernel;

impl GeometryKernel for GeoKernel {
  fn union(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    BooleanOps::union(a, b)
  }

  fn intersection(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    BooleanOps::intersection(a, b)
  }

  fn difference(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    BooleanOps::difference(a, b)
  }

  fn repair(&self, shape: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    BooleanOps::union(shape, &MultiPolygon::<f64>(Vec::new()))
  }

  fn area(&self, shape: &MultiPolygon<f64>) -> f64 { shape.unsigned_area() }

  fn geodesic_area(&self, shape: &MultiPolygon<f64>) -> f64 {
    shape.chamberlain_duquette_unsigned_area()
  }

  fn envelope(&self, shape: &MultiPolygon<f64>) -> Option<Envelope> {
    let rect = shape.bounding_rect()?;
    Some(Envelope::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y))
  }

  fn covers_point(&self, shape: &MultiPolygon<f64>, point: &Point<f64>) -> bool {
    shape.intersects(point)
  }

  fn clip_lines(
    &self,
    shape: &MultiPolygon<f64>,
    lines: &MultiLineString<f64>,
    invert: bool,
  ) -> MultiLineString<f64> {
    BooleanOps::clip(shape, lines, invert)
  }
}
