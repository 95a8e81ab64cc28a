use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rstar::AABB;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::layer::Layer;
use crate::overlay::Overlay;

use super::{EstimateSet, EstimateStatus, TargetEstimate};

/// Distance-decay kernel: a monotonically decreasing weight in distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DecayKernel {
    /// `exp(-d² / 2b²)`
    Gaussian,
    /// `exp(-d / b)`
    Exponential,
    /// `1 / (1 + (d/b)^p)`
    InversePower { exponent: f64 },
}

impl DecayKernel {
    fn weight(self, distance: f64, bandwidth: f64) -> f64 {
        match self {
            DecayKernel::Gaussian => (-distance * distance / (2.0 * bandwidth * bandwidth)).exp(),
            DecayKernel::Exponential => (-distance / bandwidth).exp(),
            DecayKernel::InversePower { exponent } => 1.0 / (1.0 + (distance / bandwidth).powf(exponent)),
        }
    }
}

/// Per-replicate summary statistic over the resampled source values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Statistic {
    /// Unweighted mean of the sample (intensive variables).
    Mean,
    /// Median of the sample.
    Median,
    /// Decay-weighted sum of the sampled values (extensive-style).
    WeightedSum,
}

/// Uncertainty measure aggregated over the replicate statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Spread {
    /// Sample standard deviation (N−1).
    StdDev,
    /// Width of the [lower, upper] quantile interval.
    Quantiles { lower: f64, upper: f64 },
}

/// Configuration for the geobootstrap simulator.
///
/// The only non-deterministic estimator: `seed` makes results exactly
/// reproducible, including under parallel execution (one RNG stream is
/// derived per target from the run seed and target index).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeobootstrapConfig {
    /// Source attribute column to interpolate.
    pub column: String,
    /// Neighborhood radius for candidate sources (centroid distance).
    pub radius: f64,
    pub decay: DecayKernel,
    /// Decay bandwidth, in the layers' linear unit.
    pub bandwidth: f64,
    /// Bootstrap replicate count B.
    pub replicates: usize,
    /// Minimum candidate count below which a target is marked failed.
    pub min_neighbors: usize,
    pub seed: u64,
    pub statistic: Statistic,
    pub spread: Spread,
}

impl GeobootstrapConfig {
    pub fn new(column: impl Into<String>, radius: f64) -> Self {
        Self {
            column: column.into(),
            radius,
            decay: DecayKernel::Gaussian,
            bandwidth: 1000.0,
            replicates: 100,
            min_neighbors: 1,
            seed: 0,
            statistic: Statistic::Mean,
            spread: Spread::StdDev,
        }
    }

    /// Set the decay kernel and bandwidth (builder style).
    pub fn with_decay(mut self, decay: DecayKernel, bandwidth: f64) -> Self {
        self.decay = decay;
        self.bandwidth = bandwidth;
        self
    }

    /// Set the replicate count (builder style).
    pub fn with_replicates(mut self, replicates: usize) -> Self {
        self.replicates = replicates;
        self
    }

    /// Set the random seed (builder style).
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Source indices within `radius` of the target centroid, sorted by index,
/// with their centroid distances. Increasing the radius never removes a
/// candidate.
fn candidates_within(sources: &Layer, targets: &Layer, t: usize, radius: f64) -> Vec<(usize, f64)> {
    let center = targets.centroid(t);
    let envelope = AABB::from_corners(
        [center.x() - radius, center.y() - radius],
        [center.x() + radius, center.y() + radius],
    );
    let mut found: Vec<(usize, f64)> = sources.query(&envelope)
        .filter_map(|s| {
            let c = sources.centroid(s);
            let distance = (c.x() - center.x()).hypot(c.y() - center.y());
            (distance <= radius).then_some((s, distance))
        })
        .collect();
    found.sort_unstable_by_key(|&(s, _)| s);
    found
}

/// Normalized sampling probabilities from decay weights. If the kernel
/// underflows for every candidate (bandwidth → 0), the nearest candidate
/// takes all the mass, which is the nearest-neighbor limit of the method.
fn sampling_probs(candidates: &[(usize, f64)], decay: DecayKernel, bandwidth: f64) -> Vec<f64> {
    let raw: Vec<f64> = candidates.iter()
        .map(|&(_, d)| decay.weight(d, bandwidth))
        .collect();
    let total: f64 = raw.iter().sum();
    if total > 0.0 && total.is_finite() {
        raw.iter().map(|w| w / total).collect()
    } else {
        // Lowest index wins ties, matching the candidate ordering.
        let mut nearest = 0;
        for (i, &(_, d)) in candidates.iter().enumerate() {
            if d < candidates[nearest].1 {
                nearest = i;
            }
        }
        let mut probs = vec![0.0; candidates.len()];
        probs[nearest] = 1.0;
        probs
    }
}

/// Draw one index from the CDF with a uniform variate.
fn draw(cdf: &[f64], rng: &mut impl Rng) -> usize {
    let u: f64 = rng.random();
    cdf.partition_point(|&c| c < u).min(cdf.len() - 1)
}

fn replicate_statistic(sample: &[usize], values: &[f64], probs: &[f64], statistic: Statistic) -> f64 {
    match statistic {
        Statistic::Mean => {
            sample.iter().map(|&i| values[i]).sum::<f64>() / sample.len() as f64
        }
        Statistic::Median => {
            let mut drawn: Vec<f64> = sample.iter().map(|&i| values[i]).collect();
            drawn.sort_unstable_by(|a, b| a.total_cmp(b));
            let n = drawn.len();
            if n % 2 == 1 { drawn[n / 2] } else { (drawn[n / 2 - 1] + drawn[n / 2]) / 2.0 }
        }
        Statistic::WeightedSum => {
            sample.iter().map(|&i| values[i] * probs[i]).sum()
        }
    }
}

fn sample_std_dev(stats: &[f64]) -> f64 {
    let n = stats.len();
    if n < 2 {
        return 0.0;
    }
    let mean = stats.iter().sum::<f64>() / n as f64;
    (stats.iter().map(|&x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1) as f64).sqrt()
}

/// Linear-interpolation quantile over pre-sorted data.
fn quantile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    let h = (n - 1) as f64 * p;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    sorted[lo] + (h - h.floor()) * (sorted[hi] - sorted[lo])
}

/// One target's bootstrap: candidates, decay weights, B replicates of
/// with-replacement sampling, point estimate and spread.
fn estimate_target(
    sources: &Layer,
    targets: &Layer,
    t: usize,
    values: &[f64],
    config: &GeobootstrapConfig,
) -> Result<(f64, f64)> {
    let candidates = candidates_within(sources, targets, t, config.radius);
    if candidates.len() < config.min_neighbors.max(1) {
        return Err(Error::InsufficientNeighbors {
            id: targets.id(t).to_string(),
            found: candidates.len(),
            required: config.min_neighbors.max(1),
        });
    }

    let probs = sampling_probs(&candidates, config.decay, config.bandwidth);
    let mut cdf = Vec::with_capacity(probs.len());
    let mut acc = 0.0;
    for &p in &probs {
        acc += p;
        cdf.push(acc);
    }
    if let Some(last) = cdf.last_mut() {
        *last = 1.0;
    }

    // One independent, reproducible stream per target.
    let mut rng = StdRng::seed_from_u64(
        config.seed ^ (t as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15),
    );

    let candidate_values: Vec<f64> = candidates.iter().map(|&(s, _)| values[s]).collect();
    let mut stats = Vec::with_capacity(config.replicates);
    let mut sample = Vec::with_capacity(candidates.len());
    for _ in 0..config.replicates {
        sample.clear();
        for _ in 0..candidates.len() {
            sample.push(draw(&cdf, &mut rng));
        }
        stats.push(replicate_statistic(&sample, &candidate_values, &probs, config.statistic));
    }

    let point = stats.iter().sum::<f64>() / stats.len() as f64;
    let spread = match config.spread {
        Spread::StdDev => sample_std_dev(&stats),
        Spread::Quantiles { lower, upper } => {
            let mut sorted = stats.clone();
            sorted.sort_unstable_by(|a, b| a.total_cmp(b));
            quantile(&sorted, upper) - quantile(&sorted, lower)
        }
    };
    Ok((point, spread))
}

/// Simulation-based estimator: for each target, resample neighboring source
/// observations proportional to a distance-decay weight, B times, and
/// aggregate the replicate statistics into a point estimate and spread.
///
/// Targets with fewer than `min_neighbors` candidates are marked failed
/// (value NaN, status carrying [`Error::InsufficientNeighbors`]) while the
/// rest of the batch proceeds.
pub(super) fn estimate(
    sources: &Layer,
    targets: &Layer,
    overlay: &Overlay,
    config: &GeobootstrapConfig,
) -> Result<EstimateSet> {
    let values = sources.column(&config.column)?;

    let results: Vec<Result<(f64, f64)>> = (0..targets.len())
        .into_par_iter()
        .map(|t| estimate_target(sources, targets, t, &values, config))
        .collect();

    let estimates = results.into_iter().enumerate()
        .map(|(t, result)| match result {
            Ok((value, spread)) => TargetEstimate {
                id: targets.id(t).clone(),
                value,
                coverage: overlay.coverage(t),
                uncertainty: Some(spread),
                status: EstimateStatus::Estimated,
            },
            Err(error) => {
                warn!(target = %targets.id(t), %error, "geobootstrap target failed");
                TargetEstimate {
                    id: targets.id(t).clone(),
                    value: f64::NAN,
                    coverage: overlay.coverage(t),
                    uncertainty: None,
                    status: EstimateStatus::Failed(error),
                }
            }
        })
        .collect();

    Ok(EstimateSet { column: config.column.clone(), estimates, convergence: None })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::Estimator;
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

    fn fixture() -> (Layer, Layer, Overlay) {
        let sources = Layer::new(vec![
            square("s0", 0.0, 0.0, 1.0).with_value("income", 10.0),
            square("s1", 1.0, 0.0, 1.0).with_value("income", 20.0),
            square("s2", 2.0, 0.0, 1.0).with_value("income", 30.0),
            square("s3", 3.0, 0.0, 1.0).with_value("income", 40.0),
        ]).unwrap();
        let targets = Layer::new(vec![
            square("t0", 0.5, 0.0, 1.0),
            square("t1", 2.2, 0.0, 1.0),
        ]).unwrap();
        let overlay = Overlay::compute(&sources, &targets).unwrap();
        (sources, targets, overlay)
    }

    #[test]
    fn identical_seed_reproduces_results_exactly() {
        let (sources, targets, overlay) = fixture();
        let config = GeobootstrapConfig::new("income", 3.0)
            .with_decay(DecayKernel::Gaussian, 1.0)
            .with_replicates(50)
            .with_seed(42);

        let a = Estimator::Geobootstrap(config.clone())
            .estimate(&sources, &targets, &overlay).unwrap();
        let b = Estimator::Geobootstrap(config)
            .estimate(&sources, &targets, &overlay).unwrap();

        for (x, y) in a.estimates.iter().zip(&b.estimates) {
            assert_eq!(x.value.to_bits(), y.value.to_bits());
            assert_eq!(
                x.uncertainty.unwrap().to_bits(),
                y.uncertainty.unwrap().to_bits(),
            );
        }
    }

    #[test]
    fn wider_radius_never_loses_candidates() {
        let (sources, targets, _) = fixture();
        let mut previous = 0;
        for radius in [0.3, 1.0, 2.0, 5.0, 10.0] {
            let count = candidates_within(&sources, &targets, 0, radius).len();
            assert!(count >= previous, "radius {radius} lost candidates");
            previous = count;
        }
        assert_eq!(previous, 4);
    }

    #[test]
    fn vanishing_bandwidth_approaches_nearest_neighbor() {
        let (sources, targets, overlay) = fixture();
        // Target t0 centroid (1.0, 0.5): s0 and s1 centroids are equidistant,
        // so use t1 (2.7, 0.5) whose nearest source centroid is s2 (2.5, 0.5).
        let config = GeobootstrapConfig::new("income", 3.0)
            .with_decay(DecayKernel::Gaussian, 1e-9)
            .with_replicates(20)
            .with_seed(7);

        let set = Estimator::Geobootstrap(config)
            .estimate(&sources, &targets, &overlay).unwrap();
        // All draws collapse onto the nearest neighbor.
        assert_eq!(set.estimates[1].value, 30.0);
        assert_eq!(set.estimates[1].uncertainty, Some(0.0));
    }

    #[test]
    fn starved_target_fails_without_aborting_the_batch() {
        let sources = Layer::new(vec![
            square("s0", 0.0, 0.0, 1.0).with_value("income", 10.0),
        ]).unwrap();
        let targets = Layer::new(vec![
            square("near", 0.0, 0.0, 1.0),
            square("far", 100.0, 0.0, 1.0),
        ]).unwrap();
        let overlay = Overlay::compute(&sources, &targets).unwrap();

        let set = Estimator::Geobootstrap(
            GeobootstrapConfig::new("income", 2.0).with_decay(DecayKernel::Exponential, 1.0),
        ).estimate(&sources, &targets, &overlay).unwrap();

        assert!(set.estimates[0].status.is_estimated());
        assert!(set.estimates[1].value.is_nan());
        assert!(matches!(
            set.estimates[1].status,
            EstimateStatus::Failed(Error::InsufficientNeighbors { .. })
        ));
    }

    #[test]
    fn kernels_decrease_with_distance() {
        for kernel in [
            DecayKernel::Gaussian,
            DecayKernel::Exponential,
            DecayKernel::InversePower { exponent: 2.0 },
        ] {
            let near = kernel.weight(1.0, 2.0);
            let far = kernel.weight(5.0, 2.0);
            assert!(near > far, "{kernel:?} is not decreasing");
        }
    }
}
