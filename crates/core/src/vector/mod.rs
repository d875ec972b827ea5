//! Polygon layers read from GeoJSON

use crate::error::{Error, Result};
use crate::raster::{GeoTransform, Raster, RasterElement};
use geo::{BoundingRect, Contains};
use geo_types::{Geometry, MultiPolygon, Point};
use geojson::GeoJson;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Attribute value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl AttributeValue {
    /// Integer view of the value, accepting integral floats and numeric strings
    pub fn as_key(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(i) => Some(*i),
            AttributeValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            AttributeValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<&geojson::JsonValue> for AttributeValue {
    fn from(value: &geojson::JsonValue) -> Self {
        use geojson::JsonValue as J;
        match value {
            J::Null => AttributeValue::Null,
            J::Bool(b) => AttributeValue::Bool(*b),
            J::Number(n) => match n.as_i64() {
                Some(i) => AttributeValue::Int(i),
                None => AttributeValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            J::String(s) => AttributeValue::String(s.clone()),
            other => AttributeValue::String(other.to_string()),
        }
    }
}

/// A geographic feature with geometry and attributes
#[derive(Debug, Clone)]
pub struct Feature {
    pub geometry: Option<Geometry<f64>>,
    pub properties: HashMap<String, AttributeValue>,
}

impl Feature {
    pub fn new(geometry: Geometry<f64>) -> Self {
        Self {
            geometry: Some(geometry),
            properties: HashMap::new(),
        }
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: AttributeValue) {
        self.properties.insert(key.into(), value);
    }

    pub fn get_property(&self, key: &str) -> Option<&AttributeValue> {
        self.properties.get(key)
    }

    /// The polygonal part of the geometry, if any
    pub fn polygons(&self) -> Option<MultiPolygon<f64>> {
        match self.geometry.as_ref()? {
            Geometry::Polygon(p) => Some(MultiPolygon(vec![p.clone()])),
            Geometry::MultiPolygon(mp) => Some(mp.clone()),
            _ => None,
        }
    }
}

/// Collection of features
#[derive(Debug, Clone, Default)]
pub struct FeatureCollection {
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new() -> Self {
        Self { features: Vec::new() }
    }

    pub fn push(&mut self, feature: Feature) {
        self.features.push(feature);
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter()
    }

    /// Parse a GeoJSON document. `path` is only used in error messages.
    pub fn from_geojson_str(text: &str, path: &Path) -> Result<Self> {
        let gj: GeoJson = text.parse().map_err(|e| Error::raster_io(path, e))?;
        let features = match gj {
            GeoJson::FeatureCollection(fc) => fc.features,
            GeoJson::Feature(f) => vec![f],
            GeoJson::Geometry(g) => vec![geojson::Feature {
                bbox: None,
                geometry: Some(g),
                id: None,
                properties: None,
                foreign_members: None,
            }],
        };

        let mut collection = Self::new();
        for feature in features {
            let geometry = match feature.geometry {
                Some(g) => Some(Geometry::<f64>::try_from(g).map_err(|e| Error::raster_io(path, e))?),
                None => None,
            };
            let properties = feature
                .properties
                .iter()
                .flat_map(|props| props.iter())
                .map(|(k, v)| (k.clone(), AttributeValue::from(v)))
                .collect();
            collection.push(Feature { geometry, properties });
        }
        Ok(collection)
    }

    /// Read a GeoJSON file.
    pub fn read_geojson<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::raster_io(path, e))?;
        Self::from_geojson_str(&text, path)
    }

    /// 1 where a cell center lies inside any polygon, 0 elsewhere
    pub fn mask(&self, transform: &GeoTransform, rows: usize, cols: usize) -> Raster<u8> {
        let mut mask = Raster::filled(rows, cols, 0u8);
        mask.set_transform(*transform);
        for poly in self.features.iter().filter_map(Feature::polygons) {
            burn(&poly, transform, rows, cols, |r, c| unsafe { mask.set_unchecked(r, c, 1) });
        }
        mask
    }
}

impl IntoIterator for FeatureCollection {
    type Item = Feature;
    type IntoIter = std::vec::IntoIter<Feature>;

    fn into_iter(self) -> Self::IntoIter {
        self.features.into_iter()
    }
}

/// Call `hit` for every cell of the grid whose center lies inside `poly`.
fn burn<F>(poly: &MultiPolygon<f64>, transform: &GeoTransform, rows: usize, cols: usize, mut hit: F)
where
    F: FnMut(usize, usize),
{
    let Some(rect) = poly.bounding_rect() else {
        return;
    };
    let (c0, r0) = transform.geo_to_pixel(rect.min().x, rect.max().y);
    let (c1, r1) = transform.geo_to_pixel(rect.max().x, rect.min().y);
    let clamp = |v: f64, n: usize| -> usize {
        if v.is_nan() || v < 0.0 {
            0
        } else {
            (v as usize).min(n)
        }
    };
    let (row_lo, row_hi) = (clamp(r0.min(r1).floor(), rows), clamp(r0.max(r1).ceil(), rows));
    let (col_lo, col_hi) = (clamp(c0.min(c1).floor(), cols), clamp(c0.max(c1).ceil(), cols));

    for row in row_lo..row_hi {
        for col in col_lo..col_hi {
            let (x, y) = transform.pixel_to_geo(col, row);
            if poly.contains(&Point::new(x, y)) {
                hit(row, col);
            }
        }
    }
}

/// Polygons keyed by an integer attribute, as used for per-zone aggregation
#[derive(Debug, Clone)]
pub struct PolygonLayer {
    pub path: PathBuf,
    pub key_field: String,
    zones: Vec<(i64, MultiPolygon<f64>)>,
}

impl PolygonLayer {
    /// Nodata key for cells outside every polygon
    pub const NO_ZONE: i64 = i64::MIN;

    /// Key every polygonal feature of `collection` by `key_field`.
    ///
    /// Features without a polygon geometry are skipped. A polygon feature
    /// missing the key, or holding a non-integer key, is an error.
    pub fn from_collection(collection: &FeatureCollection, key_field: &str, path: &Path) -> Result<Self> {
        let mut zones = Vec::new();
        for feature in collection.iter() {
            let Some(poly) = feature.polygons() else {
                tracing::debug!(path = %path.display(), "skipping non-polygon feature");
                continue;
            };
            let value = feature.get_property(key_field).ok_or_else(|| Error::MissingField {
                field: key_field.to_string(),
                path: path.to_path_buf(),
            })?;
            let key = value
                .as_key()
                .ok_or_else(|| Error::Data(format!("{} value {:?} is not an integer", key_field, value)))?;
            zones.push((key, poly));
        }
        Ok(Self {
            path: path.to_path_buf(),
            key_field: key_field.to_string(),
            zones,
        })
    }

    pub fn read<P: AsRef<Path>>(path: P, key_field: &str) -> Result<Self> {
        let path = path.as_ref();
        let collection = FeatureCollection::read_geojson(path)?;
        Self::from_collection(&collection, key_field, path)
    }

    /// Distinct keys in ascending order
    pub fn keys(&self) -> Vec<i64> {
        let mut keys: Vec<i64> = self.zones.iter().map(|(k, _)| *k).collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Burn polygon keys onto the grid of `grid` by cell-center containment.
    /// Where polygons overlap the later feature wins.
    pub fn rasterize<T: RasterElement>(&self, grid: &Raster<T>) -> Raster<i64> {
        let (rows, cols) = grid.shape();
        let mut zones = grid.derive(Self::NO_ZONE, Some(Self::NO_ZONE));
        for (key, poly) in &self.zones {
            burn(poly, grid.transform(), rows, cols, |r, c| unsafe {
                zones.set_unchecked(r, c, *key)
            });
        }
        zones
    }
}
