//! GeoJSON-shaped features.
//!
//! Features carry geometry plus a flat property bag. Rendering is expected to
//! be a pure function of the properties, so anything visual (marker color,
//! dimming, heat weight) is precomputed into the bag by the transformer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Flat property bag attached to every feature.
pub type Properties = serde_json::Map<String, Value>;

/// Feature geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    /// A single position.
    Point {
        /// `[lng, lat]`
        coordinates: [f64; 2],
    },
    /// An ordered path.
    LineString {
        /// `[[lng, lat], ...]`
        coordinates: Vec<[f64; 2]>,
    },
}

impl Geometry {
    /// Check that the geometry contains only finite, in-range coordinates.
    pub fn is_valid(&self) -> bool {
        fn ok(c: &[f64; 2]) -> bool {
            super::LngLat::new(c[0], c[1]).is_valid()
        }
        match self {
            Geometry::Point { coordinates } => ok(coordinates),
            Geometry::LineString { coordinates } => {
                coordinates.len() >= 2 && coordinates.iter().all(ok)
            }
        }
    }
}

/// A single feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "Feature")]
pub struct Feature {
    /// Stable entity identifier.
    pub id: String,
    /// Geometry (always valid once inside a collection).
    pub geometry: Geometry,
    /// Flat property bag.
    pub properties: Properties,
}

impl Feature {
    /// Create a feature with an empty property bag.
    pub fn new(id: impl Into<String>, geometry: Geometry) -> Self {
        Self {
            id: id.into(),
            geometry,
            properties: Properties::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    /// Read a property.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

/// An ordered set of features with unique ids.
///
/// Insertion order is preserved; upserting an existing id replaces the
/// feature in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename = "FeatureCollection")]
pub struct FeatureCollection {
    features: Vec<Feature>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl PartialEq for FeatureCollection {
    fn eq(&self, other: &Self) -> bool {
        self.features == other.features
    }
}

impl FeatureCollection {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a collection, dropping features with invalid geometry.
    ///
    /// Duplicate ids keep the last occurrence at the first occurrence's position.
    pub fn from_features(features: impl IntoIterator<Item = Feature>) -> Self {
        let mut collection = Self::new();
        for feature in features {
            collection.upsert(feature);
        }
        collection
    }

    /// Insert or replace a feature by id.
    ///
    /// Returns `false` (and leaves the collection untouched) if the geometry
    /// is invalid.
    pub fn upsert(&mut self, feature: Feature) -> bool {
        if !feature.geometry.is_valid() {
            return false;
        }
        match self.index.get(&feature.id) {
            Some(&i) => self.features[i] = feature,
            None => {
                self.index.insert(feature.id.clone(), self.features.len());
                self.features.push(feature);
            }
        }
        true
    }

    /// Remove a feature by id.
    pub fn remove(&mut self, id: &str) -> Option<Feature> {
        let i = self.index.remove(id)?;
        let removed = self.features.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(removed)
    }

    /// Look up a feature by id.
    pub fn get(&self, id: &str) -> Option<&Feature> {
        self.index.get(id).map(|&i| &self.features[i])
    }

    /// Features in insertion order.
    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    /// Iterate features in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter()
    }

    /// Number of features.
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// True if there are no features.
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Union of several collections. Later collections win on id clashes.
    pub fn merge<'a>(collections: impl IntoIterator<Item = &'a FeatureCollection>) -> Self {
        let mut merged = Self::new();
        for collection in collections {
            for feature in collection.iter() {
                merged.upsert(feature.clone());
            }
        }
        merged
    }

    /// Subset of features matching a predicate.
    pub fn filter(&self, predicate: impl Fn(&Feature) -> bool) -> Self {
        Self::from_features(self.features.iter().filter(|f| predicate(f)).cloned())
    }

    /// Copy with a property set on every feature, true where the predicate
    /// matches and false elsewhere.
    ///
    /// Used for focus mode: unfocused features are flagged, never removed.
    pub fn flag_where(&self, key: &str, predicate: impl Fn(&Feature) -> bool) -> Self {
        let mut flagged = self.clone();
        for feature in &mut flagged.features {
            let hit = predicate(feature);
            feature.properties.insert(key.to_string(), Value::Bool(hit));
        }
        flagged
    }

    /// Rebuild the id index after deserialization.
    pub fn reindex(&mut self) {
        self.index = self
            .features
            .iter()
            .enumerate()
            .map(|(i, f)| (f.id.clone(), i))
            .collect();
    }
}

impl FromIterator<Feature> for FeatureCollection {
    fn from_iter<T: IntoIterator<Item = Feature>>(iter: T) -> Self {
        Self::from_features(iter)
    }
}
