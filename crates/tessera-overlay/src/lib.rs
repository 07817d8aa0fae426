//! Geometry side of the Tessera fragment engine.
//!
//! Turns sketch geometry into non-overlapping, attributed fragments. Pure
//! synchronous computation; no HTTP or database dependencies. All planar
//! boolean work goes through the [`kernel::GeometryKernel`] seam so the
//! labelling logic does not care which geometry library sits underneath.
//!
//! # Quick start
//!
//! ```no_run
//! use geo_types::{Geometry, polygon};
//! use tessera_overlay::{OverlapResolver, ResolverConfig, ResolverInput};
//!
//! let a = Geometry::Polygon(polygon![(x: 0., y: 0.), (x: 3., y: 0.), (x: 3., y: 1.), (x: 0., y: 1.)]);
//! let b = Geometry::Polygon(polygon![(x: 2., y: 0.), (x: 5., y: 0.), (x: 5., y: 1.), (x: 2., y: 1.)]);
//!
//! let resolver = OverlapResolver::new(ResolverConfig::default());
//! let fragments = resolver
//!   .eliminate_overlap(&[ResolverInput::sketch(1, a, [1]), ResolverInput::sketch(2, b, [1])])
//!   .unwrap();
//! assert_eq!(fragments.len(), 3);
//! ```

pub mod config;
pub mod geography;
pub mod kernel;
pub mod prepare;
pub mod resolve;

pub use config::ResolverConfig;
pub use geography::{ClippingLayer, ClippingOp, GeographySettings};
pub use kernel::{GeoKernel, GeometryKernel};
pub use prepare::{PreparedSketch, prepare_sketch};
pub use resolve::{OverlapResolver, ResolverInput};
