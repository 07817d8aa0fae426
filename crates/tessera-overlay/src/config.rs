//! Resolver tuning knobs.

use serde::{Deserialize, Serialize};

/// Numerical and complexity policy of the [`crate::OverlapResolver`].
///
/// Deserialised from the `[resolver]` table of the server configuration;
/// every field falls back to its default when omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
  /// Grid, in degrees, that input coordinates are snapped to before the
  /// arrangement is built.
  pub precision:    f64,

  /// Pieces whose planar area is below this fraction of the total input area
  /// are treated as slivers and dropped.
  pub sliver_ratio: f64,

  /// Pieces with a geodesic area below this many square metres are dropped.
  pub min_area_m2:  f64,

  /// Upper bound on the total vertex count of one resolver call.
  pub max_vertices: usize,

  /// Upper bound on the number of live regions while the arrangement grows.
  pub max_regions:  usize,
}

impl Default for ResolverConfig {
  fn default() -> Self {
    Self {
      precision:    1e-9,
      sliver_ratio: 1e-9,
      min_area_m2:  1.0,
      max_vertices: 250_000,
      max_regions:  20_000,
    }
  }
}
