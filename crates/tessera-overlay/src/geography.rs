//! Geography clipping.
//!
//! A geography is a named analysis region defined by clipping layers: its
//! extent is the intersection of every `Intersect` layer minus every
//! `Difference` layer. Clipping a sketch to each geography and resolving the
//! pieces produces the sketch's own fragment inputs, tagged with the
//! geographies that contain them.

use geo_types::{Geometry, MultiLineString, MultiPoint, MultiPolygon};
use serde::{Deserialize, Serialize};
use tessera_core::{
  Error, Result,
  fragment::FragmentInput,
  sketch::{GeographyId, SketchId},
};

use crate::{
  kernel::GeometryKernel,
  prepare::PreparedSketch,
  resolve::{OverlapResolver, ResolverInput},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClippingOp {
  Intersect,
  Difference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClippingLayer {
  pub op:    ClippingOp,
  pub shape: MultiPolygon<f64>,
}

impl ClippingLayer {
  pub fn intersect(shape: MultiPolygon<f64>) -> Self { Self { op: ClippingOp::Intersect, shape } }

  pub fn difference(shape: MultiPolygon<f64>) -> Self { Self { op: ClippingOp::Difference, shape } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeographySettings {
  pub id:     GeographyId,
  pub layers: Vec<ClippingLayer>,
}

impl GeographySettings {
  fn layers(&self, op: ClippingOp) -> impl Iterator<Item = &MultiPolygon<f64>> {
    self.layers.iter().filter(move |l| l.op == op).map(|l| &l.shape)
  }
}

impl<K: GeometryKernel> OverlapResolver<K> {
  /// Clip a prepared sketch to one geography.
  ///
  /// Returns `None` when nothing of the sketch lies inside the geography. A
  /// geography without any `Intersect` layer has no extent and is reported as
  /// [`Error::MissingIntersectLayer`].
  pub fn clip_to_geography(
    &self,
    sketch: &Geometry<f64>,
    geography: &GeographySettings,
  ) -> Result<Option<Geometry<f64>>> {
    if geography.layers(ClippingOp::Intersect).next().is_none() {
      return Err(Error::MissingIntersectLayer(geography.id));
    }
    let k = self.kernel();

    let clipped = match sketch {
      Geometry::MultiPolygon(mp) => {
        let mut out = mp.clone();
        for layer in geography.layers(ClippingOp::Intersect) {
          out = k.intersection(&out, layer);
          if out.0.is_empty() {
            return Ok(None);
          }
        }
        for layer in geography.layers(ClippingOp::Difference) {
          out = k.difference(&out, layer);
          if out.0.is_empty() {
            return Ok(None);
          }
        }
        if k.area(&out) <= 0.0 {
          return Ok(None);
        }
        Geometry::MultiPolygon(out)
      }
      Geometry::MultiLineString(mls) => {
        let mut out = mls.clone();
        for layer in geography.layers(ClippingOp::Intersect) {
          out = k.clip_lines(layer, &out, false);
        }
        for layer in geography.layers(ClippingOp::Difference) {
          out = k.clip_lines(layer, &out, true);
        }
        let lines: Vec<_> = out.0.into_iter().filter(|ls| ls.0.len() >= 2).collect();
        if lines.is_empty() {
          return Ok(None);
        }
        Geometry::MultiLineString(MultiLineString(lines))
      }
      Geometry::MultiPoint(points) => {
        let kept: Vec<_> = points
          .iter()
          .filter(|p| {
            geography.layers(ClippingOp::Intersect).all(|l| k.covers_point(l, p))
              && !geography.layers(ClippingOp::Difference).any(|l| k.covers_point(l, p))
          })
          .copied()
          .collect();
        if kept.is_empty() {
          return Ok(None);
        }
        Geometry::MultiPoint(MultiPoint(kept))
      }
      _ => return Err(Error::invalid("clip expects a prepared sketch")),
    };
    Ok(Some(clipped))
  }

  /// Build a sketch's own fragment inputs from its geography clips.
  ///
  /// Each geography contributes the part of the sketch it contains, tagged
  /// with its id; the pieces are then resolved against each other so that
  /// regions inside several geographies carry all their ids. Parts of the
  /// sketch outside every geography produce nothing.
  pub fn create_fragments(
    &self,
    sketch_id: SketchId,
    prepared: &PreparedSketch,
    geographies: &[GeographySettings],
  ) -> Result<Vec<FragmentInput>> {
    let mut pieces = Vec::new();
    for geography in geographies {
      if let Some(clipped) = self.clip_to_geography(&prepared.geometry, geography)? {
        pieces.push(ResolverInput::sketch(sketch_id, clipped, [geography.id]));
      }
    }
    if pieces.is_empty() {
      return Ok(Vec::new());
    }
    let candidates = self.eliminate_overlap(&pieces)?;
    Ok(candidates.iter().map(|c| c.to_input()).collect())
  }
}
