use geo::{BoundingRect, MultiPolygon, Rect};

use crate::error::{Error, Result};
use crate::geometry;
use crate::layer::Layer;

/// An ancillary mask narrowing which sub-area of a source polygon is
/// eligible to carry the interpolated variable (e.g. populated land within
/// a census tract).
///
/// A mask is a set of zones, each a MultiPolygon with an indicator value.
/// A binary mask has a single zone with value 1; a continuous mask (land-use
/// intensity, imperviousness) is binarized against a threshold before use.
///
/// The mask must be spatially co-registered with the source layer: the
/// extent over which the mask is *defined* has to cover the source extent.
/// Area outside the eligible zones but inside that extent is known-ineligible;
/// area outside the extent is simply unknown, which is the misalignment the
/// check rejects. By default the defined extent is the bounding box of all
/// zones; [`AncillaryMask::with_extent`] declares it explicitly (the usual
/// case for a binary mask whose single zone covers only part of the domain).
#[derive(Debug, Clone)]
pub struct AncillaryMask {
    zones: Vec<(MultiPolygon<f64>, f64)>,
    extent: Option<Rect<f64>>,
}

impl AncillaryMask {
    /// Binary mask from a single eligible-area geometry.
    pub fn binary(geometry: MultiPolygon<f64>) -> Self {
        Self { zones: vec![(geometry, 1.0)], extent: None }
    }

    /// Continuous mask from (geometry, indicator value) zones.
    pub fn continuous(zones: Vec<(MultiPolygon<f64>, f64)>) -> Self {
        Self { zones, extent: None }
    }

    /// Declare the extent the mask is defined over (builder style).
    pub fn with_extent(mut self, extent: Rect<f64>) -> Self {
        self.extent = Some(extent);
        self
    }

    /// Rectangle the mask is defined over: the declared extent, or the
    /// bounding rectangle of all zones.
    pub fn bounds(&self) -> Option<Rect<f64>> {
        self.extent.or_else(|| {
            self.zones.iter()
                .filter_map(|(g, _)| g.bounding_rect())
                .reduce(|a, b| Rect::new(
                    geo::Coord { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
                    geo::Coord { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
                ))
        })
    }

    /// Verify the mask extent covers the source layer extent.
    /// Fails with [`Error::MaskAlignment`] otherwise — a mask that misses
    /// part of the sources would silently zero out their values.
    pub fn check_covers(&self, sources: &Layer) -> Result<()> {
        let Some(mask_bounds) = self.bounds() else {
            return Err(Error::MaskAlignment { detail: "mask has no extent".into() });
        };
        let Some(source_bounds) = sources.bounds() else {
            return Err(Error::MaskAlignment { detail: "source layer has no extent".into() });
        };

        let eps = 1e-9;
        let inside = mask_bounds.min().x <= source_bounds.min().x + eps
            && mask_bounds.min().y <= source_bounds.min().y + eps
            && mask_bounds.max().x >= source_bounds.max().x - eps
            && mask_bounds.max().y >= source_bounds.max().y - eps;
        if !inside {
            return Err(Error::MaskAlignment {
                detail: format!(
                    "mask bounds [{:.3}, {:.3}]–[{:.3}, {:.3}] do not contain source bounds [{:.3}, {:.3}]–[{:.3}, {:.3}]",
                    mask_bounds.min().x, mask_bounds.min().y, mask_bounds.max().x, mask_bounds.max().y,
                    source_bounds.min().x, source_bounds.min().y, source_bounds.max().x, source_bounds.max().y,
                ),
            });
        }
        Ok(())
    }

    /// Collapse the mask to the eligible-area geometry: the union of all
    /// zones whose indicator value is at least `threshold`.
    pub fn binarize(&self, threshold: f64) -> Option<MultiPolygon<f64>> {
        geometry::union_all(
            self.zones.iter()
                .filter(|&&(_, value)| value >= threshold)
                .map(|(geom, _)| geom),
        )
    }
}
