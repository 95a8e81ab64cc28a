//! End-to-end interpolation scenarios through the public API.

use approx::assert_relative_eq;
use geo::{polygon, MultiPolygon};
use openareal::{
    AncillaryMask, ArealConfig, DasymetricConfig, DecayKernel, EstimateStatus, Estimator,
    GeobootstrapConfig, Layer, Overlay, PolygonFeature, PycnoConfig, RegressionConfig,
};

fn square(id: &str, x0: f64, y0: f64, size: f64) -> PolygonFeature {
    PolygonFeature::from_polygon(id, polygon![
        (x: x0, y: y0),
        (x: x0 + size, y: y0),
        (x: x0 + size, y: y0 + size),
        (x: x0, y: y0 + size),
    ])
}

fn square_geom(x0: f64, y0: f64, w: f64, h: f64) -> MultiPolygon<f64> {
    MultiPolygon::new(vec![polygon![
        (x: x0, y: y0),
        (x: x0 + w, y: y0),
        (x: x0 + w, y: y0 + h),
        (x: x0, y: y0 + h),
    ]])
}

/// Two adjacent 10x10 sources (values 100 and 200), four 5x10 targets that
/// each cover half of one source. Proportional redistribution must split each
/// source value exactly in half.
#[test]
fn areal_weighting_splits_adjacent_squares_exactly() {
    let sources = Layer::new(vec![
        square("a", 0.0, 0.0, 10.0).with_value("pop", 100.0),
        square("b", 10.0, 0.0, 10.0).with_value("pop", 200.0),
    ])
    .unwrap();
    let targets = Layer::new(vec![
        PolygonFeature::new("t0", square_geom(0.0, 0.0, 5.0, 10.0)),
        PolygonFeature::new("t1", square_geom(5.0, 0.0, 5.0, 10.0)),
        PolygonFeature::new("t2", square_geom(10.0, 0.0, 5.0, 10.0)),
        PolygonFeature::new("t3", square_geom(15.0, 0.0, 5.0, 10.0)),
    ])
    .unwrap();
    let overlay = Overlay::compute(&sources, &targets).unwrap();

    let set = Estimator::ArealWeighting(ArealConfig::extensive("pop"))
        .estimate(&sources, &targets, &overlay)
        .unwrap();

    let expected = [50.0, 50.0, 100.0, 100.0];
    for (estimate, want) in set.estimates.iter().zip(expected) {
        assert_relative_eq!(estimate.value, want, max_relative = 1e-12);
        assert!(estimate.status.is_estimated());
    }
    assert_relative_eq!(set.total(), 300.0, max_relative = 1e-12);
}

/// A mask covering half of a source doubles the density inside the eligible
/// half and zeroes the excluded half.
#[test]
fn dasymetric_mask_concentrates_density() {
    let sources = Layer::new(vec![square("s", 0.0, 0.0, 10.0).with_value("pop", 100.0)]).unwrap();
    let targets = Layer::new(vec![
        PolygonFeature::new("west", square_geom(0.0, 0.0, 5.0, 10.0)),
        PolygonFeature::new("east", square_geom(5.0, 0.0, 5.0, 10.0)),
    ])
    .unwrap();
    let overlay = Overlay::compute(&sources, &targets).unwrap();

    let mask = AncillaryMask::binary(square_geom(0.0, 0.0, 5.0, 10.0)).with_extent(geo::Rect::new(
        geo::Coord { x: 0.0, y: 0.0 },
        geo::Coord { x: 10.0, y: 10.0 },
    ));
    let set = Estimator::Dasymetric(DasymetricConfig::new("pop", mask))
        .estimate(&sources, &targets, &overlay)
        .unwrap();

    assert_relative_eq!(set.estimates[0].value, 100.0, max_relative = 1e-9);
    assert_relative_eq!(set.estimates[1].value, 0.0);
    assert!(matches!(set.estimates[1].status, EstimateStatus::Uncovered));
}

/// A target outside every source is reported with value 0 and an explicit
/// uncovered flag rather than silently dropped.
#[test]
fn uncovered_target_is_flagged_not_dropped() {
    let sources = Layer::new(vec![square("s", 0.0, 0.0, 1.0).with_value("pop", 10.0)]).unwrap();
    let targets = Layer::new(vec![
        square("in", 0.0, 0.0, 1.0),
        square("out", 5.0, 5.0, 1.0),
    ])
    .unwrap();
    let overlay = Overlay::compute(&sources, &targets).unwrap();

    let set = Estimator::ArealWeighting(ArealConfig::extensive("pop"))
        .estimate(&sources, &targets, &overlay)
        .unwrap();

    assert_eq!(set.estimates.len(), 2);
    assert_eq!(set.estimates[1].value, 0.0);
    assert!(matches!(set.estimates[1].status, EstimateStatus::Uncovered));
    assert_eq!(set.flagged().count(), 1);
}

/// Regression on a covariate that perfectly explains the response reproduces
/// the source totals on a compatible target grid.
#[test]
fn regression_recovers_a_linear_response() {
    let mut features = Vec::new();
    for i in 0..8 {
        let x = i as f64;
        features.push(
            square(&format!("s{i}"), x, 0.0, 1.0)
                .with_value("pop", 10.0 + 5.0 * x)
                .with_value("housing", x),
        );
    }
    let sources = Layer::new(features).unwrap();
    let targets = Layer::new(vec![
        square("t0", 0.0, 0.0, 4.0),
        square("t1", 4.0, 0.0, 4.0),
    ])
    .unwrap();
    let overlay = Overlay::compute(&sources, &targets).unwrap();

    let mut config = RegressionConfig::ols("pop", vec!["housing".into()]);
    config.rescale_total = true;
    let set = Estimator::Regression(config)
        .estimate(&sources, &targets, &overlay)
        .unwrap();

    // Total rescaling ties the estimates back to the source total.
    let source_total: f64 = (0..8).map(|i| 10.0 + 5.0 * i as f64).sum();
    assert_relative_eq!(set.total(), source_total, max_relative = 1e-9);
}

/// Pycnophylactic smoothing preserves total mass on a tiling target layer.
#[test]
fn pycnophylactic_conserves_mass() {
    let sources = Layer::new(vec![
        square("a", 0.0, 0.0, 8.0).with_value("pop", 640.0),
        square("b", 8.0, 0.0, 8.0).with_value("pop", 64.0),
    ])
    .unwrap();
    let targets = Layer::new(vec![
        square("t0", 0.0, 0.0, 4.0),
        square("t1", 4.0, 0.0, 4.0),
        square("t2", 8.0, 0.0, 4.0),
        square("t3", 12.0, 0.0, 4.0),
        PolygonFeature::new("t4", square_geom(0.0, 4.0, 16.0, 4.0)),
    ])
    .unwrap();
    let overlay = Overlay::compute(&sources, &targets).unwrap();

    let mut config = PycnoConfig::new("pop", 1.0);
    config.max_iterations = 5000;
    let set = Estimator::Pycnophylactic(config)
        .estimate(&sources, &targets, &overlay)
        .unwrap();

    assert_relative_eq!(set.total(), 704.0, max_relative = 1e-6);
    // Smoothing moves mass across the shared boundary, toward the light side.
    assert!(set.estimates[2].value > 16.0);
}

/// The geobootstrap is reproducible under a fixed seed and reports a spread
/// for every estimated target.
#[test]
fn geobootstrap_is_seeded_and_reports_spread() {
    let mut features = Vec::new();
    for i in 0..6 {
        features.push(square(&format!("s{i}"), i as f64 * 2.0, 0.0, 2.0).with_value("rate", 10.0 * (i + 1) as f64));
    }
    let sources = Layer::new(features).unwrap();
    let targets = Layer::new(vec![square("t", 4.0, 0.0, 4.0)]).unwrap();
    let overlay = Overlay::compute(&sources, &targets).unwrap();

    let config = GeobootstrapConfig::new("rate", 6.0)
        .with_decay(DecayKernel::Exponential, 2.0)
        .with_replicates(200)
        .with_seed(99);

    let a = Estimator::Geobootstrap(config.clone())
        .estimate(&sources, &targets, &overlay)
        .unwrap();
    let b = Estimator::Geobootstrap(config)
        .estimate(&sources, &targets, &overlay)
        .unwrap();

    assert_eq!(a.estimates[0].value.to_bits(), b.estimates[0].value.to_bits());
    let spread = a.estimates[0].uncertainty.unwrap();
    assert!(spread.is_finite() && spread > 0.0);
}
