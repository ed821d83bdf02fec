use std::path::PathBuf;

use geo::{Coord, LineString, MultiPolygon, Point, Polygon};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shellcast_core::{SpatialUnit, Threshold, UnitGeometry, UnitKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("reading layer {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing layer {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("layer {layer} feature {feature}: {message}")]
    Feature {
        layer: String,
        feature: usize,
        message: String,
    },
    #[error("layer {0} is not a GeoJSON FeatureCollection")]
    NotFeatureCollection(String),
}

/// Where a unit layer lives and which properties name its units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub path: PathBuf,
    pub kind: UnitKind,
    #[serde(default = "default_id_property")]
    pub id_property: String,
    #[serde(default = "default_cmu_property")]
    pub cmu_property: String,
    /// Property holding the per-unit rainfall threshold in inches.
    #[serde(default)]
    pub threshold_property: Option<String>,
}

fn default_id_property() -> String {
    "cmu_name".to_string()
}

fn default_cmu_property() -> String {
    "cmu_name".to_string()
}

impl LayerSpec {
    pub fn load(&self) -> Result<Vec<SpatialUnit>, LayerError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| LayerError::Io {
            path: self.path.clone(),
            source,
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|source| LayerError::Json {
            path: self.path.clone(),
            source,
        })?;
        self.units_from_geojson(&value)
    }

    pub fn units_from_geojson(&self, value: &Value) -> Result<Vec<SpatialUnit>, LayerError> {
        let features = value
            .get("features")
            .and_then(Value::as_array)
            .filter(|_| value.get("type").and_then(Value::as_str) == Some("FeatureCollection"))
            .ok_or_else(|| LayerError::NotFeatureCollection(self.name.clone()))?;

        features
            .iter()
            .enumerate()
            .map(|(idx, feature)| {
                self.unit_from_feature(feature)
                    .map_err(|message| LayerError::Feature {
                        layer: self.name.clone(),
                        feature: idx,
                        message,
                    })
            })
            .collect()
    }

    fn unit_from_feature(&self, feature: &Value) -> Result<SpatialUnit, String> {
        let empty = Map::new();
        let props = feature
            .get("properties")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let id = property_text(props, &self.id_property)
            .ok_or_else(|| format!("missing property {}", self.id_property))?;
        let cmu_name = property_text(props, &self.cmu_property)
            .ok_or_else(|| format!("missing property {}", self.cmu_property))?;
        let threshold = match &self.threshold_property {
            Some(key) => {
                let inches = property_number(props, key)
                    .ok_or_else(|| format!("missing or non-numeric property {key}"))?;
                Some(
                    Threshold::from_inches(inches)
                        .ok_or_else(|| format!("invalid threshold {inches}"))?,
                )
            }
            None => None,
        };
        let geometry = feature
            .get("geometry")
            .filter(|g| !g.is_null())
            .ok_or_else(|| "feature has no geometry".to_string())
            .and_then(parse_geometry)?;

        Ok(SpatialUnit {
            id,
            cmu_name,
            threshold,
            geometry,
        })
    }
}

fn property_text(props: &Map<String, Value>, key: &str) -> Option<String> {
    match props.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn property_number(props: &Map<String, Value>, key: &str) -> Option<f64> {
    match props.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_geometry(geometry: &Value) -> Result<UnitGeometry, String> {
    let kind = geometry
        .get("type")
        .and_then(Value::as_str)
        .ok_or("geometry without type")?;
    let coords = geometry
        .get("coordinates")
        .ok_or("geometry without coordinates")?;

    match kind {
        "Point" => parse_position(coords).map(|c| UnitGeometry::Point(Point::from(c))),
        "MultiPoint" => {
            let points = as_array(coords)?;
            match points.as_slice() {
                [single] => parse_position(single).map(|c| UnitGeometry::Point(Point::from(c))),
                _ => Err(format!("MultiPoint with {} members", points.len())),
            }
        }
        "Polygon" => parse_polygon(coords).map(|p| UnitGeometry::Area(MultiPolygon(vec![p]))),
        "MultiPolygon" => as_array(coords)?
            .iter()
            .map(parse_polygon)
            .collect::<Result<Vec<_>, _>>()
            .map(|polys| UnitGeometry::Area(MultiPolygon(polys))),
        other => Err(format!("unsupported geometry type {other}")),
    }
}

fn as_array(value: &Value) -> Result<&Vec<Value>, String> {
    value.as_array().ok_or_else(|| "coordinates are not an array".to_string())
}

fn parse_position(value: &Value) -> Result<Coord<f64>, String> {
    let pos = as_array(value)?;
    match (pos.first().and_then(Value::as_f64), pos.get(1).and_then(Value::as_f64)) {
        (Some(x), Some(y)) => Ok(Coord { x, y }),
        _ => Err("position is not [x, y]".to_string()),
    }
}

fn parse_ring(value: &Value) -> Result<LineString<f64>, String> {
    as_array(value)?
        .iter()
        .map(parse_position)
        .collect::<Result<Vec<_>, _>>()
        .map(LineString::from)
}

fn parse_polygon(value: &Value) -> Result<Polygon<f64>, String> {
    let mut rings = as_array(value)?.iter().map(parse_ring);
    let exterior = rings.next().ok_or("polygon without rings")??;
    let interiors = rings.collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

/// Load every layer in priority order.
pub fn load_layers(specs: &[LayerSpec]) -> Result<Vec<(LayerSpec, Vec<SpatialUnit>)>, LayerError> {
    specs
        .iter()
        .map(|spec| spec.load().map(|units| (spec.clone(), units)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lease_spec() -> LayerSpec {
        LayerSpec {
            name: "lease".to_string(),
            path: PathBuf::from("leases.geojson"),
            kind: UnitKind::Lease,
            id_property: "lease_id".to_string(),
            cmu_property: "cmu_name".to_string(),
            threshold_property: Some("rain_in".to_string()),
        }
    }

    #[test]
    fn lease_points_carry_threshold_and_group() {
        let doc = json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "properties": {"lease_id": "1-C-89", "cmu_name": "U001", "rain_in": 1.5},
                    "geometry": {"type": "Point", "coordinates": [-76.5, 34.7]}
                },
                {
                    "type": "Feature",
                    "properties": {"lease_id": 42, "cmu_name": "U002", "rain_in": "2.0"},
                    "geometry": {"type": "MultiPoint", "coordinates": [[-76.4, 34.8]]}
                }
            ]
        });
        let units = lease_spec().units_from_geojson(&doc).expect("units");
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id, "1-C-89");
        assert_eq!(units[0].threshold, Threshold::from_inches(1.5));
        assert_eq!(units[1].id, "42");
        assert_eq!(units[1].threshold, Threshold::from_inches(2.0));
        assert!(matches!(units[1].geometry, UnitGeometry::Point(_)));
    }

    #[test]
    fn polygons_become_areas() {
        let spec = LayerSpec {
            name: "lease_bounds".to_string(),
            path: PathBuf::from("bounds.geojson"),
            kind: UnitKind::Cmu,
            id_property: "cmu_name".to_string(),
            cmu_property: "cmu_name".to_string(),
            threshold_property: None,
        };
        let doc = json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": {"cmu_name": "SC-07"},
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]
                }
            }]
        });
        let units = spec.units_from_geojson(&doc).expect("units");
        match &units[0].geometry {
            UnitGeometry::Area(mp) => assert_eq!(mp.0.len(), 1),
            other => panic!("expected area, got {other:?}"),
        }
        assert_eq!(units[0].threshold, None);
    }

    #[test]
    fn missing_properties_name_the_feature() {
        let doc = json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": {"cmu_name": "U001"},
                "geometry": {"type": "Point", "coordinates": [0.0, 0.0]}
            }]
        });
        let err = lease_spec().units_from_geojson(&doc).expect_err("no lease_id");
        assert!(err.to_string().contains("feature 0"));
        assert!(err.to_string().contains("lease_id"));
    }

    #[test]
    fn non_collections_are_rejected() {
        let err = lease_spec()
            .units_from_geojson(&json!({"type": "Feature"}))
            .expect_err("not a collection");
        assert!(matches!(err, LayerError::NotFeatureCollection(_)));
    }
}
