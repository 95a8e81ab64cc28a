//! Estimator strategies and their shared result types.
//!
//! Every estimator consumes the same substrate — a source [`Layer`], a
//! target [`Layer`] and a precomputed [`Overlay`] — and produces an
//! [`EstimateSet`]: one estimate per target feature plus per-target metadata
//! (coverage fraction, uncertainty where the method supports it) and a
//! convergence report for the iterative methods. The [`Estimator`] enum lets
//! callers swap methods without touching the overlay/weight substrate.

mod areal;
mod dasymetric;
mod geobootstrap;
mod pycno;
mod regression;

pub use areal::{ArealConfig, Variable};
pub use dasymetric::{DasymetricConfig, MaskMode};
pub use geobootstrap::{DecayKernel, GeobootstrapConfig, Spread, Statistic};
pub use pycno::PycnoConfig;
pub use regression::{fit as fit_regression, Family, FittedModel, RegressionConfig};

use crate::error::{Error, Result};
use crate::layer::{FeatureId, Layer};
use crate::overlay::Overlay;

/// Outcome classification for a single target feature.
#[derive(Debug, Clone)]
pub enum EstimateStatus {
    /// The estimator produced a value.
    Estimated,
    /// The target has no overlap with any source; its value is 0 by
    /// convention and should be read together with this flag.
    Uncovered,
    /// The estimator failed for this target only (the batch proceeded).
    /// The value is NaN so it cannot be consumed unnoticed.
    Failed(Error),
}

impl EstimateStatus {
    /// True for targets that received a usable estimate.
    #[inline]
    pub fn is_estimated(&self) -> bool {
        matches!(self, EstimateStatus::Estimated)
    }
}

/// One interpolated value with its per-target metadata record.
#[derive(Debug, Clone)]
pub struct TargetEstimate {
    pub id: FeatureId,
    pub value: f64,
    /// Fraction of the target area covered by sources, in [0, 1].
    pub coverage: f64,
    /// Method-dependent uncertainty (prediction standard error, bootstrap
    /// spread). None for the deterministic area-based methods.
    pub uncertainty: Option<f64>,
    pub status: EstimateStatus,
}

/// Convergence diagnostics for the iterative methods (regression IRLS,
/// pycnophylactic smoothing).
#[derive(Debug, Clone, Copy)]
pub struct ConvergenceReport {
    pub converged: bool,
    pub iterations: usize,
    /// Maximum change observed in the final iteration.
    pub delta: f64,
}

/// The result of one estimator invocation: per-target estimates in target
/// layer order, under the attribute column name they belong to.
#[derive(Debug, Clone)]
pub struct EstimateSet {
    pub column: String,
    pub estimates: Vec<TargetEstimate>,
    pub convergence: Option<ConvergenceReport>,
}

impl EstimateSet {
    /// Estimated values in target layer order (NaN for failed targets).
    pub fn values(&self) -> Vec<f64> {
        self.estimates.iter().map(|e| e.value).collect()
    }

    /// Sum of values over targets with a usable estimate.
    pub fn total(&self) -> f64 {
        self.estimates.iter()
            .filter(|e| e.status.is_estimated())
            .map(|e| e.value)
            .sum()
    }

    /// Targets flagged as uncovered or failed.
    pub fn flagged(&self) -> impl Iterator<Item = &TargetEstimate> + '_ {
        self.estimates.iter().filter(|e| !e.status.is_estimated())
    }

    /// Copy of the target layer with this estimate attached as a column.
    pub fn apply_to(&self, targets: &Layer) -> Layer {
        assert_eq!(self.estimates.len(), targets.len(), "estimate/layer length mismatch");
        targets.with_column(&self.column, &self.values())
    }
}

/// An areal interpolation strategy with its configuration.
///
/// All variants redistribute source values onto targets through the shared
/// overlay substrate; they differ in how weights are derived and what
/// numerical model sits on top.
#[derive(Debug, Clone)]
pub enum Estimator {
    /// Proportional-area redistribution (uniform density per source).
    ArealWeighting(ArealConfig),
    /// Binary-mask-refined redistribution.
    Dasymetric(DasymetricConfig),
    /// OLS/GLM fit on source covariates, prediction at targets.
    Regression(RegressionConfig),
    /// Tobler's mass-preserving grid smoother.
    Pycnophylactic(PycnoConfig),
    /// Distance-decay bootstrap simulation (point estimate + spread).
    Geobootstrap(GeobootstrapConfig),
}

impl Estimator {
    /// Run the estimator against a source/target pair and their overlay.
    ///
    /// The overlay is computed once per layer pair (see [`Overlay::compute`])
    /// and can be reused across estimator invocations.
    pub fn estimate(
        &self,
        sources: &Layer,
        targets: &Layer,
        overlay: &Overlay,
    ) -> Result<EstimateSet> {
        match self {
            Estimator::ArealWeighting(config) => areal::estimate(sources, targets, overlay, config),
            Estimator::Dasymetric(config) => dasymetric::estimate(sources, targets, overlay, config),
            Estimator::Regression(config) => regression::estimate(sources, targets, overlay, config),
            Estimator::Pycnophylactic(config) => pycno::estimate(sources, targets, overlay, config),
            Estimator::Geobootstrap(config) => geobootstrap::estimate(sources, targets, overlay, config),
        }
    }
}
