use smallvec::SmallVec;
use tracing::warn;

use crate::error::Result;
use crate::layer::Layer;
use crate::overlay::Overlay;

/// A sparse source→target redistribution weight matrix derived from an
/// [`Overlay`]. Each weight lies in [0, 1].
///
/// Two derivations exist, matching the two variable kinds:
///
/// * [`WeightMatrix::extensive`] — `w(s,t) = area(s∩t) / area(s)`, the
///   fraction of the source falling inside the target. Redistribution with
///   these weights conserves mass for sources fully covered by targets
///   (uniform-density assumption within each source).
/// * [`WeightMatrix::intensive`] — `w(s,t) = area(s∩t) / area(t)`, the
///   fraction of the target covered by the source. Redistribution computes an
///   area-weighted mean, appropriate for densities and rates.
///
/// Per-target incoming weights need not sum to 1: partial coverage shows up
/// as a deficit and is reported as a coverage gap, never papered over.
#[derive(Debug, Clone)]
pub struct WeightMatrix {
    /// (source, target, weight), aligned with the overlay entry order.
    entries: Vec<(usize, usize, f64)>,
    by_target: Vec<SmallVec<[u32; 4]>>,
    num_sources: usize,
}

impl WeightMatrix {
    /// Area-proportional weights for extensive variables (counts, masses).
    pub fn extensive(overlay: &Overlay) -> Self {
        Self::build(overlay, |entry| entry.area / overlay.source_area(entry.source))
    }

    /// Target-share weights for intensive variables (densities, rates).
    pub fn intensive(overlay: &Overlay) -> Self {
        Self::build(overlay, |entry| entry.area / overlay.target_area(entry.target))
    }

    fn build(overlay: &Overlay, weight: impl Fn(&crate::overlay::OverlayEntry) -> f64) -> Self {
        let mut entries = Vec::with_capacity(overlay.len());
        let mut by_target: Vec<SmallVec<[u32; 4]>> = vec![SmallVec::new(); overlay.num_targets()];
        for entry in overlay.entries() {
            let idx = entries.len() as u32;
            entries.push((entry.source, entry.target, weight(entry)));
            by_target[entry.target].push(idx);
        }
        Self { entries, by_target, num_sources: overlay.num_sources() }
    }

    /// Number of nonzero weights.
    #[inline] pub fn len(&self) -> usize { self.entries.len() }

    /// Check if the matrix has no nonzero weights.
    #[inline] pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Weight from source `s` to target `t` (0.0 if the pair is absent).
    pub fn weight(&self, s: usize, t: usize) -> f64 {
        self.incoming(t).find(|&(source, _)| source == s).map_or(0.0, |(_, w)| w)
    }

    /// Incoming (source, weight) pairs for target `t`.
    #[inline]
    pub fn incoming(&self, t: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.by_target[t].iter().map(|&i| {
            let (s, _, w) = self.entries[i as usize];
            (s, w)
        })
    }

    /// Sum of outgoing weights of source `s` over all targets. Equals 1 when
    /// the targets fully tile the source, less under partial coverage.
    pub fn outgoing_total(&self, s: usize) -> f64 {
        self.entries.iter()
            .filter(|&&(source, _, _)| source == s)
            .map(|&(_, _, w)| w)
            .sum()
    }

    /// Redistribute per-source `values` onto targets:
    /// `out[t] = Σ_s w(s,t)·values[s]`. Targets with no incoming weight get 0.
    pub fn redistribute(&self, values: &[f64]) -> Vec<f64> {
        assert_eq!(values.len(), self.num_sources, "one value per source required");
        (0..self.by_target.len())
            .map(|t| self.incoming(t).map(|(s, w)| w * values[s]).sum())
            .collect()
    }
}

/// Overlay-area-weighted average of source-side covariate columns at each
/// target: the covariate surface a fitted model is evaluated on.
///
/// Returns one row per target in layer order. Rows for targets with no
/// overlap are filled with NaN; callers must consult the overlay's coverage
/// before evaluating a model there (estimators mark such targets uncovered
/// and never read the NaN row).
pub fn aggregate_covariates(
    overlay: &Overlay,
    sources: &Layer,
    columns: &[String],
) -> Result<Vec<Vec<f64>>> {
    let series: Vec<Vec<f64>> = columns.iter()
        .map(|c| sources.column(c))
        .collect::<Result<_>>()?;

    let mut rows = Vec::with_capacity(overlay.num_targets());
    for t in 0..overlay.num_targets() {
        let total: f64 = overlay.entries_for_target(t).map(|e| e.area).sum();
        if total <= 0.0 {
            warn!(target_index = t, "no overlap: covariates undefined for target");
            rows.push(vec![f64::NAN; columns.len()]);
            continue;
        }
        let row = series.iter()
            .map(|values| {
                overlay.entries_for_target(t)
                    .map(|e| e.area * values[e.source])
                    .sum::<f64>() / total
            })
            .collect();
        rows.push(row);
    }
    Ok(rows)
}
