//! Kaartbladversnijdingen: the map sheets each DHMV raster pair covers.

use geo::{Intersects, MultiPolygon, Point};
use geojson::{feature::Id, Feature, GeoJson};
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::RTree;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::process::Command;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::error::{DhmvError, Result};
use crate::geo_core::BoundingBox;

/// Code of one zone, as used in the DHMV file names (`..._k01.tif`).
/// Numeric codes are kept with two digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId(String);

impl TileId {
    /// Normalise a zone code: `"1"`, `"01"` and `"1.0"` all become `"01"`.
    /// Non-numeric codes are kept as given.
    pub fn new(code: impl AsRef<str>) -> Result<Self> {
        let code = code.as_ref().trim();
        if code.is_empty() {
            return Err(DhmvError::InvalidInput("empty zone code".to_string()));
        }
        if let Ok(n) = code.parse::<u32>() {
            return Ok(TileId(format!("{:02}", n)));
        }
        // shapefile attributes sometimes come back as reals ("15.0")
        if let Ok(f) = code.parse::<f64>() {
            if f >= 0.0 && f.fract() == 0.0 && f <= u32::MAX as f64 {
                return Ok(TileId(format!("{:02}", f as u32)));
            }
        }
        Ok(TileId(code.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TileId {
    type Err = DhmvError;

    fn from_str(s: &str) -> Result<Self> {
        TileId::new(s)
    }
}

type ZoneEnvelope = GeomWithData<Rectangle<[f64; 2]>, usize>;

/// Immutable set of zone polygons, queried by point.
pub struct ZoneIndex {
    /// Zones in source order
    zones: Vec<(TileId, MultiPolygon<f64>)>,
    /// Zone envelopes, pointing back into `zones`
    tree: RTree<ZoneEnvelope>,
}

impl fmt::Debug for ZoneIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZoneIndex")
            .field("zones", &self.zones.len())
            .finish()
    }
}

impl ZoneIndex {
    /// Build an index from zones; ties on shared borders go to the first zone
    pub fn from_zones(zones: Vec<(TileId, MultiPolygon<f64>)>) -> Result<Self> {
        if zones.is_empty() {
            return Err(DhmvError::InvalidInput(
                "zone index contains no zones".to_string(),
            ));
        }
        let envelopes: Vec<ZoneEnvelope> = zones
            .iter()
            .enumerate()
            .filter_map(|(i, (_, polygons))| {
                BoundingBox::of(polygons).map(|b| {
                    GeomWithData::new(
                        Rectangle::from_corners([b.min_x, b.min_y], [b.max_x, b.max_y]),
                        i,
                    )
                })
            })
            .collect();
        debug!(zones = zones.len(), "Zone index built");
        Ok(ZoneIndex {
            zones,
            tree: RTree::bulk_load(envelopes),
        })
    }

    /// Parse a GeoJSON FeatureCollection of (Multi)Polygon zones.
    /// The code is read from `id_property`, or from the feature id when absent.
    pub fn from_geojson_str(text: &str, id_property: &str) -> Result<Self> {
        let geojson: GeoJson = text
            .parse()
            .map_err(|e| DhmvError::InvalidInput(format!("Invalid zone index GeoJSON: {}", e)))?;
        let features: Vec<Feature> = match geojson {
            GeoJson::FeatureCollection(fc) => fc.features,
            GeoJson::Feature(feature) => vec![feature],
            GeoJson::Geometry(_) => {
                return Err(DhmvError::InvalidInput(
                    "zone index must contain features".to_string(),
                ))
            }
        };

        let mut zones = Vec::with_capacity(features.len());
        for feature in features {
            let Some(code) = zone_code(&feature, id_property) else {
                warn!(property = id_property, "Zone without code skipped");
                continue;
            };
            let Some(geometry) = feature.geometry else {
                warn!(zone = %code, "Zone without geometry skipped");
                continue;
            };
            let polygons = match geo::Geometry::<f64>::try_from(geometry.value) {
                Ok(geo::Geometry::Polygon(p)) => MultiPolygon(vec![p]),
                Ok(geo::Geometry::MultiPolygon(mp)) => mp,
                _ => {
                    warn!(zone = %code, "Zone geometry is not a polygon, skipped");
                    continue;
                }
            };
            zones.push((TileId::new(&code)?, polygons));
        }
        Self::from_zones(zones)
    }

    /// Load the index from a `.geojson`/`.json` file, a `.shp` file, or a
    /// `.zip` archive holding either.
    /// Shapefiles are converted with the GDAL `ogr2ogr` tool.
    pub fn from_path<P: AsRef<Path>>(path: P, id_property: &str) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading zone index");
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match extension.as_deref() {
            Some("geojson") | Some("json") => {
                let text = std::fs::read_to_string(path)?;
                Self::from_geojson_str(&text, id_property)
            }
            Some("shp") => {
                let text = ogr_to_geojson(&path.to_string_lossy())?;
                Self::from_geojson_str(&text, id_property)
            }
            Some("zip") => {
                let mut archive = zip::ZipArchive::new(std::fs::File::open(path)?)?;
                let names: Vec<String> = archive.file_names().map(String::from).collect();

                if let Some(name) = names.iter().find(|n| {
                    let n = n.to_ascii_lowercase();
                    n.ends_with(".geojson") || n.ends_with(".json")
                }) {
                    let mut text = String::new();
                    archive.by_name(name)?.read_to_string(&mut text)?;
                    return Self::from_geojson_str(&text, id_property);
                }
                if let Some(name) = names
                    .iter()
                    .find(|n| n.to_ascii_lowercase().ends_with(".shp"))
                {
                    let source = format!("/vsizip/{}/{}", path.display(), name);
                    let text = ogr_to_geojson(&source)?;
                    return Self::from_geojson_str(&text, id_property);
                }
                Err(DhmvError::InvalidInput(format!(
                    "{} holds neither GeoJSON nor a shapefile",
                    path.display()
                )))
            }
            _ => Err(DhmvError::InvalidInput(format!(
                "Unsupported zone index format: {}",
                path.display()
            ))),
        }
    }

    /// Zone containing the point (boundary included), else `OutOfCoverage`
    pub fn locate(&self, x: f64, y: f64) -> Result<TileId> {
        let point = Point::new(x, y);
        let mut candidates: Vec<usize> = self
            .tree
            .locate_all_at_point(&[x, y])
            .map(|envelope| envelope.data)
            .collect();
        candidates.sort_unstable();

        candidates
            .into_iter()
            .find(|&i| self.zones[i].1.intersects(&point))
            .map(|i| self.zones[i].0.clone())
            .ok_or(DhmvError::OutOfCoverage { x, y })
    }

    /// Number of zones
    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Zone codes in source order
    pub fn tile_ids(&self) -> impl Iterator<Item = &TileId> {
        self.zones.iter().map(|(id, _)| id)
    }

    /// Polygon(s) of a zone
    pub fn zone(&self, tile: &TileId) -> Option<&MultiPolygon<f64>> {
        self.zones
            .iter()
            .find(|(id, _)| id == tile)
            .map(|(_, polygons)| polygons)
    }
}

fn zone_code(feature: &Feature, id_property: &str) -> Option<String> {
    match feature.property(id_property) {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => match &feature.id {
            Some(Id::String(s)) => Some(s.clone()),
            Some(Id::Number(n)) => Some(n.to_string()),
            None => None,
        },
    }
}

/// Convert an OGR data source to GeoJSON text with ogr2ogr
fn ogr_to_geojson(source: &str) -> Result<String> {
    let dir = tempfile::tempdir()?;
    let output = dir.path().join("zones.geojson");

    debug!(source, "Converting zone index with ogr2ogr");
    let status = Command::new("ogr2ogr")
        .arg("-f")
        .arg("GeoJSON")
        .arg(&output)
        .arg(source)
        .status()
        .map_err(|e| {
            DhmvError::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to execute ogr2ogr ({}). Make sure GDAL is installed and ogr2ogr is in PATH",
                    e
                ),
            ))
        })?;
    if !status.success() {
        return Err(DhmvError::InvalidInput(format!(
            "ogr2ogr failed to convert {} to GeoJSON",
            source
        )));
    }
    Ok(std::fs::read_to_string(&output)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn square(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> MultiPolygon<f64> {
        MultiPolygon(vec![BoundingBox::new(min_x, min_y, max_x, max_y).to_polygon()])
    }

    fn fixture_index() -> ZoneIndex {
        ZoneIndex::from_zones(vec![
            (TileId::new("14").unwrap(), square(120_000.0, 200_000.0, 152_000.0, 220_000.0)),
            (TileId::new("15").unwrap(), square(152_000.0, 200_000.0, 184_000.0, 220_000.0)),
        ])
        .unwrap()
    }

    #[test]
    fn test_tile_id_normalisation() {
        assert_eq!(TileId::new("1").unwrap().as_str(), "01");
        assert_eq!(TileId::new(" 15 ").unwrap().to_string(), "15");
        assert_eq!(TileId::new("7.0").unwrap().as_str(), "07");
        assert_eq!("43".parse::<TileId>().unwrap().as_str(), "43");
        assert!(TileId::new("").is_err());
    }

    #[test]
    fn test_locate() {
        let index = fixture_index();
        assert_eq!(index.locate(152_284.8, 212_205.6).unwrap().as_str(), "15");
        assert_eq!(index.locate(130_000.0, 210_000.0).unwrap().as_str(), "14");
        // shared border goes to the first zone
        assert_eq!(index.locate(152_000.0, 210_000.0).unwrap().as_str(), "14");
        assert!(matches!(
            index.locate(0.0, 0.0),
            Err(DhmvError::OutOfCoverage { .. })
        ));
    }

    #[test]
    fn test_from_geojson_str() {
        let text = r#"{"type": "FeatureCollection", "features": [
            {"type": "Feature", "properties": {"CODE": 1},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[10,0],[10,10],[0,10],[0,0]]]}},
            {"type": "Feature", "id": "2", "properties": {},
             "geometry": {"type": "MultiPolygon", "coordinates": [[[[10,0],[20,0],[20,10],[10,10],[10,0]]]]}},
            {"type": "Feature", "properties": {"CODE": 3},
             "geometry": {"type": "Point", "coordinates": [5, 5]}}
        ]}"#;
        let index = ZoneIndex::from_geojson_str(text, "CODE").unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.locate(5.0, 5.0).unwrap().as_str(), "01");
        assert_eq!(index.locate(15.0, 5.0).unwrap().as_str(), "02");
        assert!(index.zone(&TileId::new("02").unwrap()).is_some());
    }

    #[test]
    fn test_empty_index_is_rejected() {
        let text = r#"{"type": "FeatureCollection", "features": []}"#;
        assert!(matches!(
            ZoneIndex::from_geojson_str(text, "CODE"),
            Err(DhmvError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_from_zipped_geojson() {
        let text = r#"{"type": "FeatureCollection", "features": [
            {"type": "Feature", "properties": {"CODE": "43"},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[10,0],[10,10],[0,10],[0,0]]]}}
        ]}"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zones.zip");
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        writer
            .start_file("Kblo.geojson", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(text.as_bytes()).unwrap();
        writer.finish().unwrap();

        let index = ZoneIndex::from_path(&path, "CODE").unwrap();
        assert_eq!(index.locate(1.0, 1.0).unwrap().as_str(), "43");
        assert!(ZoneIndex::from_path(dir.path().join("zones.csv"), "CODE").is_err());
    }
}
