use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::layer::Layer;
use crate::overlay::Overlay;
use crate::weights::aggregate_covariates;

use super::{ConvergenceReport, EstimateSet, EstimateStatus, TargetEstimate};

/// Model family. Gaussian with identity link is ordinary least squares;
/// Poisson (log link) and Binomial (logit link) are fitted by iteratively
/// reweighted least squares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    Gaussian,
    Poisson,
    Binomial,
}

/// Configuration for the regression estimator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionConfig {
    /// Source attribute column the model is fitted against.
    pub response: String,
    /// Covariate columns. Sources must carry them; targets may carry them
    /// too, otherwise they are aggregated through the overlay.
    pub covariates: Vec<String>,
    pub family: Family,
    pub intercept: bool,
    /// IRLS iteration budget (hard bound; ignored for plain OLS).
    pub max_iterations: usize,
    /// IRLS coefficient-change tolerance.
    pub tolerance: f64,
    /// Rescale predictions so their total matches the source response total
    /// (appropriate for extensive responses).
    pub rescale_total: bool,
}

impl RegressionConfig {
    /// Ordinary least squares with an intercept.
    pub fn ols(response: impl Into<String>, covariates: Vec<String>) -> Self {
        Self {
            response: response.into(),
            covariates,
            family: Family::Gaussian,
            intercept: true,
            max_iterations: 25,
            tolerance: 1e-8,
            rescale_total: false,
        }
    }

    /// Generalized linear model of the given family. Poisson responses are
    /// counts, so total rescaling defaults on for that family.
    pub fn glm(response: impl Into<String>, covariates: Vec<String>, family: Family) -> Self {
        Self {
            rescale_total: family == Family::Poisson,
            family,
            ..Self::ols(response, covariates)
        }
    }

    /// Drop the intercept term (builder style).
    pub fn without_intercept(mut self) -> Self {
        self.intercept = false;
        self
    }
}

/// A fitted regression model: coefficients, link (via family), and residual
/// diagnostics. Ephemeral per interpolation run.
#[derive(Debug, Clone)]
pub struct FittedModel {
    pub family: Family,
    /// Coefficients, intercept first when present.
    pub coefficients: Vec<f64>,
    pub intercept: bool,
    /// Response-scale coefficient of determination.
    pub r_squared: f64,
    /// Dispersion: residual variance for Gaussian, 1.0 for the canonical
    /// Poisson/Binomial families.
    pub dispersion: f64,
    /// IRLS iterations used (0 for the closed-form Gaussian fit).
    pub iterations: usize,
    /// Scaled inverse of the weighted normal matrix, for standard errors.
    covariance: Option<DMatrix<f64>>,
}

impl FittedModel {
    fn design_row(&self, covariates: &[f64]) -> Vec<f64> {
        let mut row = Vec::with_capacity(covariates.len() + 1);
        if self.intercept {
            row.push(1.0);
        }
        row.extend_from_slice(covariates);
        row
    }

    fn linear_predictor(&self, covariates: &[f64]) -> f64 {
        self.design_row(covariates).iter()
            .zip(&self.coefficients)
            .map(|(x, b)| x * b)
            .sum()
    }

    /// Evaluate the fitted model at a covariate vector (response scale).
    pub fn predict(&self, covariates: &[f64]) -> f64 {
        self.family.inverse_link(self.linear_predictor(covariates))
    }

    /// Standard error of the mean prediction at a covariate vector, via the
    /// delta method on the linear predictor. None if the covariance of the
    /// fit is unavailable.
    pub fn prediction_std_error(&self, covariates: &[f64]) -> Option<f64> {
        let cov = self.covariance.as_ref()?;
        let x = DVector::from_vec(self.design_row(covariates));
        let var_eta = (x.transpose() * cov * &x)[(0, 0)].max(0.0);
        let eta = self.linear_predictor(covariates);
        Some(self.family.mean_derivative(eta).abs() * var_eta.sqrt())
    }
}

impl Family {
    /// Inverse link: linear predictor → mean response.
    fn inverse_link(self, eta: f64) -> f64 {
        match self {
            Family::Gaussian => eta,
            Family::Poisson => eta.exp(),
            Family::Binomial => 1.0 / (1.0 + (-eta).exp()),
        }
    }

    /// dμ/dη at a linear predictor value.
    fn mean_derivative(self, eta: f64) -> f64 {
        match self {
            Family::Gaussian => 1.0,
            Family::Poisson => eta.exp(),
            Family::Binomial => {
                let mu = 1.0 / (1.0 + (-eta).exp());
                mu * (1.0 - mu)
            }
        }
    }

    /// Variance function V(μ).
    fn variance(self, mu: f64) -> f64 {
        match self {
            Family::Gaussian => 1.0,
            Family::Poisson => mu.max(1e-10),
            Family::Binomial => (mu * (1.0 - mu)).max(1e-10),
        }
    }

    /// Starting mean for IRLS, nudged into the family domain.
    fn initial_mean(self, y: f64) -> f64 {
        match self {
            Family::Gaussian => y,
            Family::Poisson => y + 0.5,
            Family::Binomial => (y + 0.5) / 2.0,
        }
    }

    fn link(self, mu: f64) -> f64 {
        match self {
            Family::Gaussian => mu,
            Family::Poisson => mu.max(1e-10).ln(),
            Family::Binomial => {
                let m = mu.clamp(1e-10, 1.0 - 1e-10);
                (m / (1.0 - m)).ln()
            }
        }
    }
}

/// Solve the (possibly weighted) normal equations by QR decomposition,
/// failing with [`Error::SingularDesign`] on rank deficiency instead of
/// returning NaN coefficients.
fn solve_normal(xtwx: DMatrix<f64>, xtwy: &DVector<f64>) -> Result<DVector<f64>> {
    let columns = xtwx.ncols();
    let qr = xtwx.qr();
    let r = qr.r();

    let mut diag_max: f64 = 0.0;
    let mut diag_min = f64::INFINITY;
    for i in 0..columns {
        let d = r[(i, i)].abs();
        diag_max = diag_max.max(d);
        diag_min = diag_min.min(d);
    }
    // Near-collinear covariates make R's diagonal collapse.
    if diag_max <= 0.0 || diag_min < diag_max * 1e-12 {
        return Err(Error::SingularDesign { columns });
    }

    qr.solve(xtwy).ok_or(Error::SingularDesign { columns })
}

fn design_matrix(rows: &[Vec<f64>], intercept: bool) -> DMatrix<f64> {
    let n = rows.len();
    let p = rows.first().map_or(0, |r| r.len()) + usize::from(intercept);
    DMatrix::from_fn(n, p, |i, j| {
        if intercept {
            if j == 0 { 1.0 } else { rows[i][j - 1] }
        } else {
            rows[i][j]
        }
    })
}

fn response_r_squared(y: &[f64], fitted: &[f64]) -> f64 {
    let n = y.len() as f64;
    let mean = y.iter().sum::<f64>() / n;
    let tss: f64 = y.iter().map(|&v| (v - mean) * (v - mean)).sum();
    let rss: f64 = y.iter().zip(fitted).map(|(&v, &f)| (v - f) * (v - f)).sum();
    if tss > 0.0 { 1.0 - rss / tss } else { 1.0 }
}

/// Fit the configured model on source-level covariates and response.
pub fn fit(sources: &Layer, config: &RegressionConfig) -> Result<FittedModel> {
    let y = sources.column(&config.response)?;
    let rows: Vec<Vec<f64>> = (0..sources.len())
        .map(|s| {
            config.covariates.iter()
                .map(|c| sources.feature(s).value(c).ok_or_else(|| Error::MissingAttribute {
                    id: sources.id(s).to_string(),
                    column: c.clone(),
                }))
                .collect()
        })
        .collect::<Result<_>>()?;

    let x = design_matrix(&rows, config.intercept);
    match config.family {
        Family::Gaussian => fit_ols(&x, &y, config),
        Family::Poisson | Family::Binomial => fit_irls(&x, &y, config),
    }
}

fn fit_ols(x: &DMatrix<f64>, y: &[f64], config: &RegressionConfig) -> Result<FittedModel> {
    let n = x.nrows();
    let p = x.ncols();
    let yv = DVector::from_column_slice(y);

    let xtx = x.transpose() * x;
    let xty = x.transpose() * &yv;
    let beta = solve_normal(xtx.clone(), &xty)?;

    let fitted: Vec<f64> = (x * &beta).iter().copied().collect();
    let rss: f64 = y.iter().zip(&fitted).map(|(&v, &f)| (v - f) * (v - f)).sum();
    let dof = n.saturating_sub(p).max(1) as f64;
    let dispersion = rss / dof;

    let covariance = xtx.try_inverse().map(|inv| inv * dispersion);

    Ok(FittedModel {
        family: Family::Gaussian,
        coefficients: beta.iter().copied().collect(),
        intercept: config.intercept,
        r_squared: response_r_squared(y, &fitted),
        dispersion,
        iterations: 0,
        covariance,
    })
}

fn fit_irls(x: &DMatrix<f64>, y: &[f64], config: &RegressionConfig) -> Result<FittedModel> {
    let family = config.family;
    let n = x.nrows();
    let p = x.ncols();

    let mut mu: Vec<f64> = y.iter().map(|&v| family.initial_mean(v)).collect();
    let mut eta: Vec<f64> = mu.iter().map(|&m| family.link(m)).collect();
    let mut beta = DVector::zeros(p);
    let mut last_xtwx: Option<DMatrix<f64>> = None;
    let mut delta = f64::INFINITY;

    for iteration in 1..=config.max_iterations {
        // Working weights and adjusted response for the current mean.
        let mut w = Vec::with_capacity(n);
        let mut z = Vec::with_capacity(n);
        for i in 0..n {
            let d = family.mean_derivative(eta[i]).max(1e-10);
            w.push(d * d / family.variance(mu[i]));
            z.push(eta[i] + (y[i] - mu[i]) / d);
        }

        let wx = DMatrix::from_fn(n, p, |i, j| w[i] * x[(i, j)]);
        let xtwx = x.transpose() * &wx;
        let xtwz = x.transpose() * DVector::from_fn(n, |i, _| w[i] * z[i]);

        let next = solve_normal(xtwx.clone(), &xtwz)?;
        delta = (&next - &beta).amax();
        let scale = 1.0 + beta.amax();
        beta = next;
        last_xtwx = Some(xtwx);

        let etav = x * &beta;
        for i in 0..n {
            eta[i] = etav[i];
            mu[i] = family.inverse_link(eta[i]);
        }

        debug!(iteration, delta, "irls step");
        if delta < config.tolerance * scale {
            let covariance = last_xtwx.and_then(|m| m.try_inverse());
            let fitted: Vec<f64> = mu.clone();
            return Ok(FittedModel {
                family,
                coefficients: beta.iter().copied().collect(),
                intercept: config.intercept,
                r_squared: response_r_squared(y, &fitted),
                dispersion: 1.0,
                iterations: iteration,
                covariance,
            });
        }
    }

    Err(Error::Convergence {
        iterations: config.max_iterations,
        delta,
        last_iterate: beta.iter().copied().collect(),
    })
}

/// Two-phase regression estimator: fit at sources, predict at targets.
///
/// Target covariates come from the targets' own attribute columns when all
/// of them are present, otherwise from overlay-area-weighted aggregation of
/// the source covariates (the weight-derivation covariate output).
pub(super) fn estimate(
    sources: &Layer,
    targets: &Layer,
    overlay: &Overlay,
    config: &RegressionConfig,
) -> Result<EstimateSet> {
    let model = fit(sources, config)?;

    let own_covariates = (0..targets.len()).all(|t| {
        config.covariates.iter().all(|c| targets.feature(t).value(c).is_some())
    });
    let rows: Vec<Vec<f64>> = if own_covariates && !targets.is_empty() {
        (0..targets.len())
            .map(|t| config.covariates.iter()
                .map(|c| targets.feature(t).value(c).unwrap_or(f64::NAN))
                .collect())
            .collect()
    } else {
        aggregate_covariates(overlay, sources, &config.covariates)?
    };

    let mut predictions = Vec::with_capacity(targets.len());
    let mut errors = Vec::with_capacity(targets.len());
    for (t, row) in rows.iter().enumerate() {
        let covered = own_covariates || overlay.entries_for_target(t).next().is_some();
        if covered {
            predictions.push(model.predict(row));
            errors.push(model.prediction_std_error(row));
        } else {
            predictions.push(0.0);
            errors.push(None);
        }
    }

    if config.rescale_total {
        let predicted: f64 = predictions.iter().sum();
        if predicted > 0.0 {
            let factor = sources.column(&config.response)?.iter().sum::<f64>() / predicted;
            for v in &mut predictions {
                *v *= factor;
            }
        }
    }

    let estimates = predictions.into_iter().zip(errors).enumerate()
        .map(|(t, (value, uncertainty))| {
            let covered = own_covariates || overlay.entries_for_target(t).next().is_some();
            TargetEstimate {
                id: targets.id(t).clone(),
                value,
                coverage: overlay.coverage(t),
                uncertainty,
                status: if covered { EstimateStatus::Estimated } else { EstimateStatus::Uncovered },
            }
        })
        .collect();

    let convergence = (model.iterations > 0).then_some(ConvergenceReport {
        converged: true,
        iterations: model.iterations,
        delta: 0.0,
    });

    Ok(EstimateSet { column: config.response.clone(), estimates, convergence })
}
