use std::sync::Arc;

use ahash::AHashMap;
use geo::{Area, BoundingRect, Centroid, Coord, MultiPolygon, Point, Polygon, Rect, Validation};
use rstar::{RTree, AABB};

use crate::error::{Error, Result};
use crate::geometry::BoundingBox;

/// Cheap clonable feature identifier.
pub type FeatureId = Arc<str>;

/// A polygon feature: an identifier, a planar (multi-)polygon geometry, and
/// named numeric attributes. Source features carry the values to interpolate;
/// target features initially carry none.
#[derive(Debug, Clone)]
pub struct PolygonFeature {
    pub id: FeatureId,
    pub geometry: MultiPolygon<f64>,
    pub values: AHashMap<String, f64>,
}

impl PolygonFeature {
    pub fn new(id: impl Into<FeatureId>, geometry: MultiPolygon<f64>) -> Self {
        Self { id: id.into(), geometry, values: AHashMap::new() }
    }

    /// Convenience constructor for single-polygon features.
    pub fn from_polygon(id: impl Into<FeatureId>, polygon: Polygon<f64>) -> Self {
        Self::new(id, MultiPolygon::new(vec![polygon]))
    }

    /// Attach a named attribute value (builder style).
    pub fn with_value(mut self, column: impl Into<String>, value: f64) -> Self {
        self.values.insert(column.into(), value);
        self
    }

    /// Look up a named attribute value.
    #[inline]
    pub fn value(&self, column: &str) -> Option<f64> {
        self.values.get(column).copied()
    }
}

/// An ordered collection of polygon features sharing one planar coordinate
/// reference, with an R-tree over bounding boxes and cached areas/centroids.
///
/// Used for both the source and the target role of an interpolation. All
/// geometries are validated at construction: closed, non-self-intersecting
/// rings with positive total area. Invalid input fails with
/// [`Error::Geometry`] rather than silently skipping, since overlay
/// completeness is a correctness precondition for every estimator.
#[derive(Debug, Clone)]
pub struct Layer {
    features: Vec<PolygonFeature>,
    index: AHashMap<FeatureId, usize>,
    areas: Vec<f64>,
    centroids: Vec<Point<f64>>,
    rtree: RTree<BoundingBox>,
}

impl Layer {
    /// Build a layer from features, validating every geometry.
    pub fn new(features: Vec<PolygonFeature>) -> Result<Self> {
        for feature in &features {
            validate_geometry(&feature.id, &feature.geometry)?;
        }
        Ok(Self::from_validated(features))
    }

    /// Build without re-running validation. Callers must guarantee that all
    /// geometries already passed [`validate_geometry`].
    pub(crate) fn from_validated(features: Vec<PolygonFeature>) -> Self {
        let areas: Vec<f64> = features.iter().map(|f| f.geometry.unsigned_area()).collect();
        let centroids: Vec<Point<f64>> = features.iter()
            .map(|f| f.geometry.centroid().unwrap_or(Point::new(f64::NAN, f64::NAN)))
            .collect();
        let index = features.iter().enumerate()
            .map(|(i, f)| (f.id.clone(), i))
            .collect();
        let rtree = RTree::bulk_load(
            features.iter().enumerate()
                .filter_map(|(i, f)| f.geometry.bounding_rect().map(|r| BoundingBox::new(i, r)))
                .collect(),
        );
        Self { features, index, areas, centroids, rtree }
    }

    /// Number of features.
    #[inline] pub fn len(&self) -> usize { self.features.len() }

    /// Check if the layer has no features.
    #[inline] pub fn is_empty(&self) -> bool { self.features.is_empty() }

    /// Feature at positional index.
    #[inline] pub fn feature(&self, idx: usize) -> &PolygonFeature { &self.features[idx] }

    /// All features in layer order.
    #[inline] pub fn features(&self) -> &[PolygonFeature] { &self.features }

    /// Identifier of the feature at `idx`.
    #[inline] pub fn id(&self, idx: usize) -> &FeatureId { &self.features[idx].id }

    /// Positional index of a feature id, if present.
    #[inline] pub fn index_of(&self, id: &str) -> Option<usize> { self.index.get(id).copied() }

    /// Cached unsigned area of the feature at `idx` (sum over parts).
    #[inline] pub fn area(&self, idx: usize) -> f64 { self.areas[idx] }

    /// Cached centroid of the feature at `idx`.
    #[inline] pub fn centroid(&self, idx: usize) -> Point<f64> { self.centroids[idx] }

    /// Query the R-tree for feature indices whose bounding boxes intersect
    /// the given envelope.
    #[inline]
    pub(crate) fn query(&self, envelope: &AABB<[f64; 2]>) -> impl Iterator<Item = usize> + '_ {
        self.rtree.locate_in_envelope_intersecting(envelope).map(|bb| bb.idx())
    }

    /// Bounding rectangle of the whole layer.
    pub fn bounds(&self) -> Option<Rect<f64>> {
        self.features.iter()
            .filter_map(|f| f.geometry.bounding_rect())
            .reduce(|a, b| Rect::new(
                Coord { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
                Coord { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
            ))
    }

    /// Attribute values of `column` for every feature, in layer order.
    /// Fails with [`Error::MissingAttribute`] on the first feature lacking it.
    pub fn column(&self, column: &str) -> Result<Vec<f64>> {
        self.features.iter()
            .map(|f| f.value(column).ok_or_else(|| Error::MissingAttribute {
                id: f.id.to_string(),
                column: column.to_string(),
            }))
            .collect()
    }

    /// Copy of this layer with an additional attribute column, one value per
    /// feature in layer order.
    pub fn with_column(&self, column: &str, values: &[f64]) -> Self {
        assert_eq!(values.len(), self.len(), "column length must match layer length");
        let mut features = self.features.clone();
        for (feature, &value) in features.iter_mut().zip(values) {
            feature.values.insert(column.to_string(), value);
        }
        Self::from_validated(features)
    }
}

/// Check a feature geometry: non-empty, OGC-valid rings, positive total area.
pub(crate) fn validate_geometry(id: &FeatureId, geometry: &MultiPolygon<f64>) -> Result<()> {
    if geometry.0.is_empty() {
        return Err(Error::Geometry { id: id.to_string(), reason: "empty geometry".into() });
    }
    if !geometry.is_valid() {
        let reason = geometry.validation_errors().first()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "invalid geometry".into());
        return Err(Error::Geometry { id: id.to_string(), reason });
    }
    if geometry.unsigned_area() <= 0.0 {
        return Err(Error::Geometry { id: id.to_string(), reason: "zero total area".into() });
    }
    Ok(())
}
