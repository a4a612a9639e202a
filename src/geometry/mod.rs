//! Coordinate types and projections.

pub mod projection;

pub use projection::{BoundingBox, CoordTransformer, WEB_MERCATOR, WGS84};
