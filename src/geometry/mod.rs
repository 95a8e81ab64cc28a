//! Shared polygon-intersection primitives.
//!
//! Every overlay-like computation in the crate (source×target overlay,
//! dasymetric masking, grid-cell resampling) funnels through these
//! intersection primitives rather than duplicating boolean-op logic per
//! estimator.

mod bbox;

pub(crate) use bbox::BoundingBox;

use geo::{Area, BooleanOps, MultiPolygon};

/// Area of the intersection of two MultiPolygons. Touching-only pairs
/// yield 0.0 (a degenerate intersection has no area).
#[inline]
pub(crate) fn intersection_area(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> f64 {
    a.intersection(b).unsigned_area()
}

/// Restrict `geom` to the part inside `mask`.
#[inline]
pub(crate) fn clip(geom: &MultiPolygon<f64>, mask: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    geom.intersection(mask)
}

/// Remove from `geom` the part inside `mask`.
#[inline]
pub(crate) fn erase(geom: &MultiPolygon<f64>, mask: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    geom.difference(mask)
}

/// Union a sequence of MultiPolygons into one. May be slow for large
/// numbers of complex polygons.
pub(crate) fn union_all<'a, I>(geoms: I) -> Option<MultiPolygon<f64>>
where
    I: IntoIterator<Item = &'a MultiPolygon<f64>>,
{
    geoms.into_iter().cloned().reduce(|a, b| a.union(&b))
}
