use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::layer::Layer;
use crate::overlay::Overlay;
use crate::weights::WeightMatrix;

use super::{EstimateSet, EstimateStatus, TargetEstimate};

/// Whether a variable scales with area (counts, totals) or is a per-area
/// rate (densities). Decides which weight derivation applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Variable {
    Extensive,
    Intensive,
}

/// Configuration for the areal weighting estimator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArealConfig {
    /// Source attribute column to interpolate.
    pub column: String,
    pub variable: Variable,
    /// Rescale estimates so their total equals the source total. Compensates
    /// for edge loss when targets do not fully tile the source extent; only
    /// meaningful for extensive variables.
    pub rescale_total: bool,
}

impl ArealConfig {
    /// Extensive variable, no total rescaling.
    pub fn extensive(column: impl Into<String>) -> Self {
        Self { column: column.into(), variable: Variable::Extensive, rescale_total: false }
    }

    /// Intensive variable (area-weighted mean into targets).
    pub fn intensive(column: impl Into<String>) -> Self {
        Self { column: column.into(), variable: Variable::Intensive, rescale_total: false }
    }

    /// Enable total-sum rescaling (builder style).
    pub fn with_total_rescale(mut self) -> Self {
        self.rescale_total = true;
        self
    }
}

/// Proportional-area redistribution: `value(t) = Σ_s w(s,t)·value(s)`,
/// assuming uniform density inside each source polygon. Deterministic, no
/// fitting step. Targets with no overlap get value 0 and an `Uncovered` flag.
pub(super) fn estimate(
    sources: &Layer,
    targets: &Layer,
    overlay: &Overlay,
    config: &ArealConfig,
) -> Result<EstimateSet> {
    let values = sources.column(&config.column)?;
    let weights = match config.variable {
        Variable::Extensive => WeightMatrix::extensive(overlay),
        Variable::Intensive => WeightMatrix::intensive(overlay),
    };
    let mut out = weights.redistribute(&values);

    if config.rescale_total && config.variable == Variable::Extensive {
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
            let covered = overlay.entries_for_target(t).next().is_some();
            if !covered {
                warn!(target = %targets.id(t), "target has no overlap with any source");
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
