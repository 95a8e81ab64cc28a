//! Error types for the openareal engine.

/// Error type for all fallible operations in the crate.
///
/// Structural input errors (`Geometry`, `MaskAlignment`, `MissingAttribute`)
/// abort a run outright, since they invalidate every downstream result.
/// Numerical errors (`SingularDesign`, `Convergence`) are fatal to a single
/// estimator call. `InsufficientNeighbors` is per-target: batch estimators
/// record it in that target's status and keep going.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// An input polygon is invalid (self-intersecting, unclosed, or has
    /// zero total area). Overlay completeness is a precondition for every
    /// estimator, so this is never skipped silently.
    #[error("invalid geometry for feature '{id}': {reason}")]
    Geometry {
        /// Identifier of the offending feature.
        id: String,
        /// Human-readable description of the defect.
        reason: String,
    },

    /// The ancillary mask does not cover the source layer extent.
    #[error("ancillary mask does not cover the source extent ({detail})")]
    MaskAlignment {
        /// Which part of the source extent falls outside the mask.
        detail: String,
    },

    /// A feature is missing an attribute column required by the estimator.
    #[error("feature '{id}' has no attribute column '{column}'")]
    MissingAttribute {
        /// Identifier of the feature.
        id: String,
        /// Name of the missing column.
        column: String,
    },

    /// The regression design matrix is rank-deficient (near-collinear
    /// covariates). Raised instead of returning NaN coefficients.
    #[error("design matrix with {columns} columns is rank-deficient")]
    SingularDesign {
        /// Number of columns in the design matrix.
        columns: usize,
    },

    /// An iterative fit or smoother exhausted its iteration budget.
    ///
    /// `last_iterate` carries the final state reached — model coefficients
    /// for regression fits, per-target values for the smoother — so the
    /// caller may decide to accept a partial answer.
    #[error("did not converge within {iterations} iterations (last max change {delta:.3e})")]
    Convergence {
        /// Iterations performed before giving up.
        iterations: usize,
        /// Maximum change observed in the final iteration.
        delta: f64,
        /// The last iterate reached before the budget ran out.
        last_iterate: Vec<f64>,
    },

    /// A geobootstrap target has fewer candidate sources than the configured
    /// minimum. Per-target: the batch marks this target failed and proceeds.
    #[error("target '{id}' has {found} candidate sources within radius, needs at least {required}")]
    InsufficientNeighbors {
        /// Identifier of the target feature.
        id: String,
        /// Candidates found within the neighborhood radius.
        found: usize,
        /// Configured minimum candidate count.
        required: usize,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
