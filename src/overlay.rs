use geo::BoundingRect;
use rayon::prelude::*;
use rstar::AABB;
use smallvec::SmallVec;

use crate::error::Result;
use crate::geometry;
use crate::layer::Layer;

/// Absolute area floor below which an intersection is treated as a numerical
/// sliver and dropped, so boundary noise cannot leak into downstream weights.
pub const DEFAULT_SLIVER_AREA: f64 = 1e-9;

/// One positive-area intersection between a source and a target feature,
/// by positional index into the respective layers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayEntry {
    pub source: usize,
    pub target: usize,
    pub area: f64,
}

/// The sparse pairwise-intersection relation between a source and a target
/// layer, with cached per-feature total areas.
///
/// Computed once per layer pair and reused across estimators. Entries are
/// ordered by (target, source), so recomputing on identical inputs yields an
/// identical sequence. Touching-only pairs are excluded (zero-area
/// intersection), multi-part features contribute the sum of their parts, and
/// slivers below the epsilon are dropped.
///
/// Geometry validity is enforced when the [`Layer`]s are constructed, which
/// is what makes the overlay a safe substrate for every estimator.
#[derive(Debug, Clone)]
pub struct Overlay {
    entries: Vec<OverlayEntry>,
    by_source: Vec<SmallVec<[u32; 4]>>,
    by_target: Vec<SmallVec<[u32; 4]>>,
    source_areas: Vec<f64>,
    target_areas: Vec<f64>,
}

impl Overlay {
    /// Compute the overlay with the default sliver epsilon.
    pub fn compute(sources: &Layer, targets: &Layer) -> Result<Self> {
        Self::compute_with_epsilon(sources, targets, DEFAULT_SLIVER_AREA)
    }

    /// Compute the overlay, dropping intersections with area below `epsilon`.
    ///
    /// Per-target computations are independent and run in parallel; results
    /// are collected in target order, so the output is deterministic.
    pub fn compute_with_epsilon(sources: &Layer, targets: &Layer, epsilon: f64) -> Result<Self> {
        let rows: Vec<SmallVec<[(usize, f64); 4]>> = (0..targets.len())
            .into_par_iter()
            .map(|t| {
                let geom = &targets.feature(t).geometry;
                let Some(rect) = geom.bounding_rect() else { return SmallVec::new() };
                let envelope = AABB::from_corners(rect.min().into(), rect.max().into());

                let mut row: SmallVec<[(usize, f64); 4]> = sources.query(&envelope)
                    .filter_map(|s| {
                        let area = geometry::intersection_area(&sources.feature(s).geometry, geom);
                        (area > epsilon).then_some((s, area))
                    })
                    .collect();
                // R-tree iteration order is unspecified; sort for determinism.
                row.sort_unstable_by_key(|&(s, _)| s);
                row
            })
            .collect();

        let mut entries = Vec::new();
        let mut by_source: Vec<SmallVec<[u32; 4]>> = vec![SmallVec::new(); sources.len()];
        let mut by_target: Vec<SmallVec<[u32; 4]>> = vec![SmallVec::new(); targets.len()];
        for (t, row) in rows.into_iter().enumerate() {
            for (s, area) in row {
                let idx = entries.len() as u32;
                entries.push(OverlayEntry { source: s, target: t, area });
                by_source[s].push(idx);
                by_target[t].push(idx);
            }
        }

        Ok(Self {
            entries,
            by_source,
            by_target,
            source_areas: (0..sources.len()).map(|s| sources.area(s)).collect(),
            target_areas: (0..targets.len()).map(|t| targets.area(t)).collect(),
        })
    }

    /// Number of positive-area entries.
    #[inline] pub fn len(&self) -> usize { self.entries.len() }

    /// Check if no source/target pair intersects.
    #[inline] pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// All entries, ordered by (target, source).
    #[inline] pub fn entries(&self) -> &[OverlayEntry] { &self.entries }

    /// Number of source features in the underlying layer.
    #[inline] pub fn num_sources(&self) -> usize { self.source_areas.len() }

    /// Number of target features in the underlying layer.
    #[inline] pub fn num_targets(&self) -> usize { self.target_areas.len() }

    /// Total area of source feature `s`.
    #[inline] pub fn source_area(&self, s: usize) -> f64 { self.source_areas[s] }

    /// Total area of target feature `t`.
    #[inline] pub fn target_area(&self, t: usize) -> f64 { self.target_areas[t] }

    /// Entries intersecting source feature `s`.
    #[inline]
    pub fn entries_for_source(&self, s: usize) -> impl Iterator<Item = &OverlayEntry> + '_ {
        self.by_source[s].iter().map(|&i| &self.entries[i as usize])
    }

    /// Entries intersecting target feature `t`.
    #[inline]
    pub fn entries_for_target(&self, t: usize) -> impl Iterator<Item = &OverlayEntry> + '_ {
        self.by_target[t].iter().map(|&i| &self.entries[i as usize])
    }

    /// Intersected area of source `s` summed over all targets.
    /// Never exceeds the source area (equality when targets tile the source).
    pub fn covered_source_area(&self, s: usize) -> f64 {
        self.entries_for_source(s).map(|e| e.area).sum()
    }

    /// Intersected area of target `t` summed over all sources.
    pub fn covered_target_area(&self, t: usize) -> f64 {
        self.entries_for_target(t).map(|e| e.area).sum()
    }

    /// Fraction of target `t` covered by sources, in [0, 1].
    pub fn coverage(&self, t: usize) -> f64 {
        let area = self.target_areas[t];
        if area > 0.0 { (self.covered_target_area(t) / area).min(1.0) } else { 0.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::PolygonFeature;
    use geo::polygon;

    fn square(id: &str, x0: f64, y0: f64, size: f64) -> PolygonFeature {
        PolygonFeature::from_polygon(id, polygon![
            (x: x0, y: y0),
            (x: x0 + size, y: y0),
            (x: x0 + size, y: y0 + size),
            (x: x0, y: y0 + size),
        ])
    }

    fn two_by_two() -> (Layer, Layer) {
        // One 2x2 source, four 1x1 targets tiling it exactly.
        let sources = Layer::new(vec![square("s", 0.0, 0.0, 2.0)]).unwrap();
        let targets = Layer::new(vec![
            square("t00", 0.0, 0.0, 1.0),
            square("t10", 1.0, 0.0, 1.0),
            square("t01", 0.0, 1.0, 1.0),
            square("t11", 1.0, 1.0, 1.0),
        ]).unwrap();
        (sources, targets)
    }

    #[test]
    fn tiling_targets_cover_source_exactly() {
        let (sources, targets) = two_by_two();
        let overlay = Overlay::compute(&sources, &targets).unwrap();

        assert_eq!(overlay.len(), 4);
        for entry in overlay.entries() {
            assert!((entry.area - 1.0).abs() < 1e-9);
        }
        assert!((overlay.covered_source_area(0) - overlay.source_area(0)).abs() < 1e-9);
    }

    #[test]
    fn additivity_never_exceeds_source_area() {
        let sources = Layer::new(vec![square("s", 0.0, 0.0, 2.0)]).unwrap();
        // Only one quarter of the source is covered.
        let targets = Layer::new(vec![square("t", 1.0, 1.0, 1.0)]).unwrap();
        let overlay = Overlay::compute(&sources, &targets).unwrap();

        assert!(overlay.covered_source_area(0) <= overlay.source_area(0) + 1e-9);
        assert!((overlay.covered_source_area(0) - 1.0).abs() < 1e-9);
        assert!((overlay.coverage(0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn touching_only_pairs_are_excluded() {
        let sources = Layer::new(vec![square("s", 0.0, 0.0, 1.0)]).unwrap();
        let targets = Layer::new(vec![square("t", 1.0, 0.0, 1.0)]).unwrap();
        let overlay = Overlay::compute(&sources, &targets).unwrap();
        assert!(overlay.is_empty());
    }

    #[test]
    fn recomputation_is_identical() {
        let (sources, targets) = two_by_two();
        let a = Overlay::compute(&sources, &targets).unwrap();
        let b = Overlay::compute(&sources, &targets).unwrap();
        assert_eq!(a.entries(), b.entries());
    }

    #[test]
    fn slivers_below_epsilon_are_dropped() {
        let sources = Layer::new(vec![square("s", 0.0, 0.0, 1.0)]).unwrap();
        // Overlaps the source in a 1e-7 wide strip.
        let targets = Layer::new(vec![square("t", 1.0 - 1e-7, 0.0, 1.0)]).unwrap();

        let strict = Overlay::compute_with_epsilon(&sources, &targets, 1e-6).unwrap();
        assert!(strict.is_empty());

        let loose = Overlay::compute_with_epsilon(&sources, &targets, 1e-9).unwrap();
        assert_eq!(loose.len(), 1);
    }
}
