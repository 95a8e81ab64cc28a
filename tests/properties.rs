//! Cross-method invariants: mass conservation, overlay reuse, determinism.

use approx::assert_relative_eq;
use geo::polygon;
use openareal::{
    ArealConfig, DecayKernel, Estimator, GeobootstrapConfig, Layer, Overlay, PolygonFeature,
};

fn square(id: &str, x0: f64, y0: f64, size: f64) -> PolygonFeature {
    PolygonFeature::from_polygon(id, polygon![
        (x: x0, y: y0),
        (x: x0 + size, y: y0),
        (x: x0 + size, y: y0 + size),
        (x: x0, y: y0 + size),
    ])
}

/// An irregular source grid and a rotated-support target tiling of the same
/// extent: extensive redistribution must conserve the source total.
#[test]
fn extensive_redistribution_conserves_mass_on_tiling_targets() {
    let mut features = Vec::new();
    let mut total = 0.0;
    for i in 0..3 {
        for j in 0..3 {
            let value = (i * 3 + j + 1) as f64 * 7.0;
            total += value;
            features.push(square(&format!("s{i}{j}"), i as f64 * 2.0, j as f64 * 2.0, 2.0).with_value("pop", value));
        }
    }
    let sources = Layer::new(features).unwrap();

    // 4 uneven strips covering the same 6x6 extent.
    let targets = Layer::new(vec![
        PolygonFeature::from_polygon("w", polygon![(x: 0.0, y: 0.0), (x: 1.5, y: 0.0), (x: 1.5, y: 6.0), (x: 0.0, y: 6.0)]),
        PolygonFeature::from_polygon("c", polygon![(x: 1.5, y: 0.0), (x: 3.0, y: 0.0), (x: 3.0, y: 6.0), (x: 1.5, y: 6.0)]),
        PolygonFeature::from_polygon("e", polygon![(x: 3.0, y: 0.0), (x: 5.0, y: 0.0), (x: 5.0, y: 6.0), (x: 3.0, y: 6.0)]),
        PolygonFeature::from_polygon("f", polygon![(x: 5.0, y: 0.0), (x: 6.0, y: 0.0), (x: 6.0, y: 6.0), (x: 5.0, y: 6.0)]),
    ])
    .unwrap();
    let overlay = Overlay::compute(&sources, &targets).unwrap();

    let set = Estimator::ArealWeighting(ArealConfig::extensive("pop"))
        .estimate(&sources, &targets, &overlay)
        .unwrap();
    assert_relative_eq!(set.total(), total, max_relative = 1e-12);
}

/// Overlay intersection areas partition each source among the targets that
/// tile it: per-source outgoing areas sum to the source area.
#[test]
fn overlay_areas_are_additive_per_source() {
    let sources = Layer::new(vec![square("s", 0.0, 0.0, 4.0).with_value("pop", 1.0)]).unwrap();
    let targets = Layer::new(vec![
        square("a", 0.0, 0.0, 2.0),
        square("b", 2.0, 0.0, 2.0),
        square("c", 0.0, 2.0, 2.0),
        square("d", 2.0, 2.0, 2.0),
    ])
    .unwrap();
    let overlay = Overlay::compute(&sources, &targets).unwrap();

    let covered: f64 = overlay.entries_for_source(0).map(|e| e.area).sum();
    assert_relative_eq!(covered, 16.0, max_relative = 1e-12);
    assert_relative_eq!(overlay.covered_source_area(0), 16.0, max_relative = 1e-12);
}

/// One overlay serves every estimator; coverage metadata is identical across
/// methods because it derives from the overlay, not the estimator.
#[test]
fn coverage_is_a_property_of_the_overlay() {
    let sources = Layer::new(vec![square("s", 0.0, 0.0, 2.0).with_value("pop", 12.0)]).unwrap();
    let targets = Layer::new(vec![square("t", 1.0, 0.0, 2.0)]).unwrap();
    let overlay = Overlay::compute(&sources, &targets).unwrap();

    let areal = Estimator::ArealWeighting(ArealConfig::extensive("pop"))
        .estimate(&sources, &targets, &overlay)
        .unwrap();
    let boot = Estimator::Geobootstrap(
        GeobootstrapConfig::new("pop", 10.0).with_decay(DecayKernel::Gaussian, 1.0),
    )
    .estimate(&sources, &targets, &overlay)
    .unwrap();

    // Half the target lies outside the source.
    assert_relative_eq!(areal.estimates[0].coverage, 0.5, max_relative = 1e-12);
    assert_relative_eq!(boot.estimates[0].coverage, 0.5, max_relative = 1e-12);
}

/// Different seeds produce different bootstrap draws (the estimator is
/// genuinely stochastic, not collapsing to a deterministic value).
#[test]
fn distinct_seeds_vary_the_bootstrap() {
    let mut features = Vec::new();
    for i in 0..5 {
        features.push(square(&format!("s{i}"), i as f64, 0.0, 1.0).with_value("rate", (i * i) as f64));
    }
    let sources = Layer::new(features).unwrap();
    let targets = Layer::new(vec![square("t", 1.5, 0.0, 2.0)]).unwrap();
    let overlay = Overlay::compute(&sources, &targets).unwrap();

    let run = |seed: u64| {
        Estimator::Geobootstrap(
            GeobootstrapConfig::new("rate", 10.0)
                .with_decay(DecayKernel::Exponential, 2.0)
                .with_replicates(30)
                .with_seed(seed),
        )
        .estimate(&sources, &targets, &overlay)
        .unwrap()
        .estimates[0]
            .value
    };
    assert_ne!(run(1).to_bits(), run(2).to_bits());
}
