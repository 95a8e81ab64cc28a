#![doc = "Areal interpolation: transfer attribute data between incompatible polygon layers"]
mod error;
mod estimate;
mod geometry;
mod layer;
mod mask;
mod overlay;
mod weights;

#[doc(inline)]
pub use error::{Error, Result};

#[doc(inline)]
pub use layer::{FeatureId, Layer, PolygonFeature};

#[doc(inline)]
pub use overlay::{Overlay, OverlayEntry, DEFAULT_SLIVER_AREA};

#[doc(inline)]
pub use weights::{aggregate_covariates, WeightMatrix};

#[doc(inline)]
pub use mask::AncillaryMask;

#[doc(inline)]
pub use estimate::{
    fit_regression, ArealConfig, ConvergenceReport, DasymetricConfig, DecayKernel, EstimateSet,
    EstimateStatus, Estimator, Family, FittedModel, GeobootstrapConfig, MaskMode, PycnoConfig,
    RegressionConfig, Spread, Statistic, TargetEstimate, Variable,
};
