use geo::Area;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::geometry;
use crate::layer::{Layer, PolygonFeature};
use crate::mask::AncillaryMask;
use crate::overlay::{Overlay, DEFAULT_SLIVER_AREA};
use crate::weights::WeightMatrix;

use super::{EstimateSet, EstimateStatus, TargetEstimate};

/// How the binary mask selects the eligible sub-area of each source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskMode {
    /// The mask marks where the variable exists: keep the masked-in part.
    Clip,
    /// The mask marks where the variable cannot exist: keep the complement.
    Difference,
}

/// Configuration for the binary dasymetric estimator.
#[derive(Debug, Clone)]
pub struct DasymetricConfig {
    /// Source attribute column to interpolate (extensive).
    pub column: String,
    pub mask: AncillaryMask,
    pub mode: MaskMode,
    /// Indicator threshold at which a continuous mask zone counts as
    /// eligible. Binary masks use 1.0 zones, so any threshold ≤ 1 works.
    pub threshold: f64,
    /// Rescale estimates so their total matches the source total (on by
    /// default, compensating mask-edge loss).
    pub rescale_total: bool,
}

impl DasymetricConfig {
    pub fn new(column: impl Into<String>, mask: AncillaryMask) -> Self {
        Self {
            column: column.into(),
            mask,
            mode: MaskMode::Clip,
            threshold: 0.5,
            rescale_total: true,
        }
    }

    /// Use difference-mode masking (builder style).
    pub fn with_mode(mut self, mode: MaskMode) -> Self {
        self.mode = mode;
        self
    }

    /// Binarization threshold for continuous masks (builder style).
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

/// Binary dasymetric redistribution: the same proportional formula as areal
/// weighting, but weights come from the mask-restricted overlay and each
/// source's density is `value / masked_area` instead of `value / area`,
/// concentrating the value into the eligible sub-area.
///
/// Masking reuses the shared overlay engine against clipped source
/// geometries rather than duplicating intersection logic. Sources whose
/// eligible area is empty contribute nothing; that is a logged coverage gap,
/// not an error. A mask that does not cover the source extent is
/// [`Error::MaskAlignment`] (fatal).
pub(super) fn estimate(
    sources: &Layer,
    targets: &Layer,
    overlay: &Overlay,
    config: &DasymetricConfig,
) -> Result<EstimateSet> {
    let values = sources.column(&config.column)?;
    config.mask.check_covers(sources)?;

    let eligible = config.mask.binarize(config.threshold).ok_or_else(|| Error::MaskAlignment {
        detail: format!("no mask zone reaches threshold {}", config.threshold),
    })?;

    // Restrict each source to its eligible sub-area.
    let mut kept = Vec::with_capacity(sources.len());
    let mut kept_values = Vec::with_capacity(sources.len());
    for (s, feature) in sources.features().iter().enumerate() {
        let masked = match config.mode {
            MaskMode::Clip => geometry::clip(&feature.geometry, &eligible),
            MaskMode::Difference => geometry::erase(&feature.geometry, &eligible),
        };
        if masked.unsigned_area() <= DEFAULT_SLIVER_AREA {
            warn!(source = %feature.id, "source has no eligible area under mask; value excluded");
            continue;
        }
        kept.push(PolygonFeature::new(feature.id.clone(), masked));
        kept_values.push(values[s]);
    }

    // Boolean-op output is structurally sound; skip revalidation.
    let masked_sources = Layer::from_validated(kept);
    let masked_overlay = Overlay::compute(&masked_sources, targets)?;
    let weights = WeightMatrix::extensive(&masked_overlay);
    let mut out = weights.redistribute(&kept_values);

    if config.rescale_total {
        let estimated: f64 = out.iter().sum();
        if estimated > 0.0 {
            let factor = values.iter().sum::<f64>() / estimated;
            for v in &mut out {
                *v *= factor;
            }
        }
    }

    let estimates = out.into_iter().enumerate()
        .map(|(t, value)| {
            let covered = masked_overlay.entries_for_target(t).next().is_some();
            if !covered {
                warn!(target = %targets.id(t), "target has no overlap with any eligible source area");
            }
            TargetEstimate {
                id: targets.id(t).clone(),
                value,
                coverage: overlay.coverage(t),
                uncertainty: None,
                status: if covered { EstimateStatus::Estimated } else { EstimateStatus::Uncovered },
            }
        })
        .collect();

    Ok(EstimateSet { column: config.column.clone(), estimates, convergence: None })
}
