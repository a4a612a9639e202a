//! Vector normalization: GeoJSON, shapefiles and zipped shapefiles in,
//! EPSG:4326 GeoJSON (plus an optional PMTiles companion) out.

pub mod archive;
pub mod crs;
pub mod ellipse;
pub mod tiling;

use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use geo::MapCoords;
use geojson::{Feature, FeatureCollection, GeoJson, JsonObject};
use serde_json::{json, Value};
use shapefile::dbase::{FieldValue, Record};
use shapefile::Shape;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::format::{classify, extension, FileKind};
use crate::geometry::{CoordTransformer, WGS84};

/// Filename fragments marking a change-detection result, matched
/// case-insensitively as substrings.
pub const CHANGE_KEYWORDS: [&str; 9] = [
    "change", "result", "diff", "変化", "結果", "变化", "结果", "cambio", "resultado",
];

/// True if `filename` looks like a change-detection layer.
#[must_use]
pub fn is_change_layer(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    CHANGE_KEYWORDS.iter().any(|k| lower.contains(k))
}

#[derive(Debug, Clone)]
pub struct VectorOptions {
    /// Vertices per ellipse for change layers.
    pub ellipse_points: usize,
    /// External tiler; `None` skips packaging.
    pub tiling_tool: Option<String>,
}

impl Default for VectorOptions {
    fn default() -> Self {
        Self {
            ellipse_points: ellipse::DEFAULT_ELLIPSE_POINTS,
            tiling_tool: Some(tiling::DEFAULT_TILING_TOOL.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VectorOutcome {
    pub features: usize,
    pub source_epsg: i32,
    pub ellipsized: bool,
    /// Present when packaging succeeded.
    pub pmtiles: Option<PathBuf>,
    pub warnings: Vec<String>,
}

/// Normalize the vector dataset at `input` into GeoJSON at `output`.
///
/// `declared_name` is the user-facing filename; it decides archive handling
/// and the change-layer heuristic. The PMTiles companion is written next to
/// `output` with the same stem.
///
/// # Errors
/// Returns [`Error::Conversion`] if the input cannot be read or reprojected.
/// Packaging failures are reported in [`VectorOutcome::warnings`] instead.
pub fn normalize_vector(
    input: &Path,
    declared_name: &str,
    output: &Path,
    options: &VectorOptions,
) -> Result<VectorOutcome> {
    normalize(input, declared_name, output, options).map_err(Error::into_conversion)
}

fn normalize(input: &Path, declared_name: &str, output: &Path, options: &VectorOptions) -> Result<VectorOutcome> {
    // keeps the extraction directory alive until the features are loaded
    let extracted;
    let source = if classify(declared_name) == FileKind::VectorArchive {
        extracted = tempfile::tempdir()?;
        archive::extract_shapefile(input, extracted.path())?
    } else {
        input.to_path_buf()
    };

    let (mut features, declared_epsg) = match extension(&source.to_string_lossy()).as_deref() {
        Some("shp") => read_shapefile(&source)?,
        _ => read_geojson(&source)?,
    };
    let source_epsg = declared_epsg.unwrap_or(WGS84);
    let ellipsize = is_change_layer(declared_name);

    let transformer = CoordTransformer::new(source_epsg, WGS84).map_err(Error::conversion)?;
    if !transformer.is_identity() || ellipsize {
        for feature in &mut features {
            if let Some(geometry) = feature.geometry.take() {
                feature.geometry = Some(transform_geometry(geometry, &transformer, ellipsize.then_some(options.ellipse_points))?);
            }
        }
    }
    debug!(features = features.len(), source_epsg, ellipsize, "Loaded vector features");

    let count = features.len();
    write_geojson(features, output)?;
    info!(output = %output.display(), features = count, source_epsg, "Vector normalized");

    let mut warnings = Vec::new();
    let mut pmtiles = None;
    if let Some(tool) = &options.tiling_tool {
        let target = output.with_extension("pmtiles");
        match tiling::package(output, &target, tool) {
            Ok(()) => pmtiles = Some(target),
            Err(e) => {
                warn!(error = %e, "Vector tile packaging failed");
                warnings.push(format!("Vector tile packaging skipped: {e}"));
            }
        }
    }

    Ok(VectorOutcome {
        features: count,
        source_epsg,
        ellipsized: ellipsize,
        pmtiles,
        warnings,
    })
}

fn transform_geometry(
    geometry: geojson::Geometry,
    transformer: &CoordTransformer,
    ellipse_points: Option<usize>,
) -> Result<geojson::Geometry> {
    let mut shape = geo::Geometry::<f64>::try_from(geometry)?;
    if !transformer.is_identity() {
        shape = shape
            .try_map_coords(|c| transformer.transform(c.x, c.y).map(|(x, y)| geo::Coord { x, y }))
            .map_err(Error::conversion)?;
    }
    if let Some(points) = ellipse_points {
        shape = ellipse::ellipsize(shape, points);
    }
    Ok(geojson::Geometry::new(geojson::Value::from(&shape)))
}

fn legacy_crs(members: Option<&JsonObject>) -> Result<Option<i32>> {
    crs::epsg_from_geojson_crs(members.and_then(|m| m.get("crs")))
}

/// Features and declared CRS of a GeoJSON document.
fn read_geojson(path: &Path) -> Result<(Vec<Feature>, Option<i32>)> {
    let text = std::fs::read_to_string(path)?;
    let geojson: GeoJson = text.parse()?;
    Ok(match geojson {
        GeoJson::FeatureCollection(fc) => {
            let epsg = legacy_crs(fc.foreign_members.as_ref())?;
            (fc.features, epsg)
        }
        GeoJson::Feature(f) => {
            let epsg = legacy_crs(f.foreign_members.as_ref())?;
            (vec![f], epsg)
        }
        GeoJson::Geometry(g) => {
            let epsg = legacy_crs(g.foreign_members.as_ref())?;
            (vec![Feature::from(g)], epsg)
        }
    })
}

fn field_to_json(value: FieldValue) -> Value {
    match value {
        FieldValue::Character(s) => s.map_or(Value::Null, Value::String),
        FieldValue::Numeric(n) => n.map_or(Value::Null, |n| json!(n)),
        FieldValue::Float(f) => f.map_or(Value::Null, |f| json!(f)),
        FieldValue::Logical(b) => b.map_or(Value::Null, Value::Bool),
        FieldValue::Integer(i) => json!(i),
        FieldValue::Double(d) => json!(d),
        FieldValue::Currency(c) => json!(c),
        FieldValue::Memo(m) => Value::String(m),
        other => Value::String(format!("{other:?}")),
    }
}

fn record_to_properties(record: Record) -> JsonObject {
    let mut fields: Vec<(String, FieldValue)> = HashMap::<String, FieldValue>::from(record).into_iter().collect();
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    fields
        .into_iter()
        .map(|(name, value)| (name, field_to_json(value)))
        .collect()
}

/// Features and `.prj` CRS of a shapefile.
fn read_shapefile(path: &Path) -> Result<(Vec<Feature>, Option<i32>)> {
    let epsg = crs::shapefile_epsg(path)?;
    let mut reader = shapefile::Reader::from_path(path)?;
    let mut features = Vec::new();
    for item in reader.iter_shapes_and_records() {
        let (shape, record) = item?;
        let geometry = match shape {
            Shape::NullShape => None,
            other => {
                let g = geo::Geometry::<f64>::try_from(other)
                    .map_err(|e| Error::conversion(format!("unsupported shapefile geometry: {e:?}")))?;
                Some(geojson::Geometry::new(geojson::Value::from(&g)))
            }
        };
        features.push(Feature {
            bbox: None,
            geometry,
            id: None,
            properties: Some(record_to_properties(record)),
            foreign_members: None,
        });
    }
    Ok((features, epsg))
}

/// Write a FeatureCollection via a staged temporary file next to `output`.
fn write_geojson(features: Vec<Feature>, output: &Path) -> Result<()> {
    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    };
    let dir = output.parent().unwrap_or_else(|| Path::new("."));
    let staged = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(staged.as_file());
        serde_json::to_writer(&mut writer, &collection).map_err(|e| Error::conversion(e.to_string()))?;
        writer.flush()?;
    }
    staged.persist(output).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs::File;

    fn options() -> VectorOptions {
        VectorOptions {
            tiling_tool: None,
            ..VectorOptions::default()
        }
    }

    fn all_coords(value: &Value, out: &mut Vec<(f64, f64)>) {
        match value {
            Value::Array(items) if items.len() >= 2 && items.iter().all(Value::is_number) => {
                out.push((items[0].as_f64().unwrap(), items[1].as_f64().unwrap()));
            }
            Value::Array(items) => items.iter().for_each(|v| all_coords(v, out)),
            _ => {}
        }
    }

    fn output_coords(path: &Path) -> (Value, Vec<(f64, f64)>) {
        let doc: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        let mut coords = Vec::new();
        for f in doc["features"].as_array().unwrap() {
            all_coords(&f["geometry"]["coordinates"], &mut coords);
        }
        (doc, coords)
    }

    #[test]
    fn test_change_keywords() {
        assert!(is_change_layer("Forest_CHANGE_2020.geojson"));
        assert!(is_change_layer("detection_result.zip"));
        assert!(is_change_layer("土地変化.shp"));
        assert!(is_change_layer("cambio_suelo.json"));
        assert!(!is_change_layer("parcels.geojson"));
    }

    #[test]
    fn test_reprojects_legacy_crs_to_wgs84() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.geojson");
        let output = dir.path().join("out.geojson");
        let doc = json!({
            "type": "FeatureCollection",
            "crs": {"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG::3857"}},
            "features": [
                {"type": "Feature", "properties": {"name": "a"},
                 "geometry": {"type": "Point", "coordinates": [1113194.9, 6446275.8]}},
                {"type": "Feature", "properties": {"name": "b"},
                 "geometry": {"type": "LineString", "coordinates": [[-20037508.0, -20037508.0], [20037508.0, 20037508.0]]}}
            ]
        });
        std::fs::write(&input, doc.to_string()).unwrap();

        let outcome = normalize_vector(&input, "roads.geojson", &output, &options()).unwrap();
        assert_eq!(outcome.features, 2);
        assert_eq!(outcome.source_epsg, 3857);
        assert!(!outcome.ellipsized);
        assert!(outcome.pmtiles.is_none());
        assert!(outcome.warnings.is_empty());

        let (doc, coords) = output_coords(&output);
        assert!(doc.get("crs").is_none());
        assert_eq!(doc["features"][0]["properties"]["name"], "a");
        let (lon, lat) = coords[0];
        assert!((lon - 10.0).abs() < 1e-4 && (lat - 50.0).abs() < 1e-4);
        for (lon, lat) in coords {
            assert!((-180.0..=180.0).contains(&lon), "lon {lon}");
            assert!((-90.0..=90.0).contains(&lat), "lat {lat}");
        }
    }

    #[test]
    fn test_change_layer_polygons_become_ellipses() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.geojson");
        let output = dir.path().join("out.geojson");
        let doc = json!({
            "type": "Feature",
            "properties": {},
            "geometry": {"type": "Polygon", "coordinates": [[[0.0, 0.0], [0.4, 0.0], [0.4, 0.2], [0.0, 0.2], [0.0, 0.0]]]}
        });
        std::fs::write(&input, doc.to_string()).unwrap();

        let opts = VectorOptions {
            ellipse_points: 32,
            tiling_tool: None,
        };
        let outcome = normalize_vector(&input, "change_map.geojson", &output, &opts).unwrap();
        assert!(outcome.ellipsized);
        let (doc, coords) = output_coords(&output);
        assert_eq!(doc["features"][0]["geometry"]["type"], "Polygon");
        assert_eq!(coords.len(), 33);
    }

    #[test]
    fn test_missing_tiler_is_warning() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.geojson");
        let output = dir.path().join("out.geojson");
        std::fs::write(&input, r#"{"type":"Point","coordinates":[1.0,2.0]}"#).unwrap();
        let opts = VectorOptions {
            tiling_tool: Some("geoswipe-no-such-tiler".to_string()),
            ..VectorOptions::default()
        };
        let outcome = normalize_vector(&input, "points.geojson", &output, &opts).unwrap();
        assert!(outcome.pmtiles.is_none());
        assert_eq!(outcome.warnings.len(), 1);
        assert!(output.exists());
        assert!(!dir.path().join("out.pmtiles").exists());
    }

    #[test]
    fn test_invalid_inputs_are_conversion_errors() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.geojson");

        let bad_json = dir.path().join("bad.geojson");
        std::fs::write(&bad_json, "{ nope").unwrap();
        let err = normalize_vector(&bad_json, "bad.geojson", &output, &options()).unwrap_err();
        assert!(matches!(err, Error::Conversion(_)));

        let bad_shp = dir.path().join("bad.shp");
        std::fs::write(&bad_shp, b"not a shapefile").unwrap();
        let err = normalize_vector(&bad_shp, "bad.shp", &output, &options()).unwrap_err();
        assert!(matches!(err, Error::Conversion(_)));

        assert!(!output.exists());
    }

    #[test]
    fn test_archive_without_shapefile() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("upload.zip");
        let mut writer = zip::ZipWriter::new(File::create(&zip_path).unwrap());
        writer.start_file("readme.txt", zip::write::FileOptions::default()).unwrap();
        writer.write_all(b"no data").unwrap();
        writer.finish().unwrap();

        let err = normalize_vector(&zip_path, "parcels.zip", &dir.path().join("out.geojson"), &options()).unwrap_err();
        assert_eq!(err.to_string(), "No shapefile found in archive");
    }

    const UTM_33N_PRJ: &str = r#"PROJCS["WGS_1984_UTM_Zone_33N",GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]],PROJECTION["Transverse_Mercator"],PARAMETER["False_Easting",500000.0],PARAMETER["False_Northing",0.0],PARAMETER["Central_Meridian",15.0],PARAMETER["Scale_Factor",0.9996],PARAMETER["Latitude_Of_Origin",0.0],UNIT["Meter",1.0]]"#;

    #[test]
    fn test_zipped_utm_shapefile() {
        use shapefile::dbase::{FieldName, FieldValue, Record, TableWriterBuilder};
        use shapefile::{Point, Polygon, PolygonRing};

        let dir = tempfile::tempdir().unwrap();
        let shp_dir = dir.path().join("src");
        std::fs::create_dir(&shp_dir).unwrap();
        let shp = shp_dir.join("parcels.shp");
        {
            let table = TableWriterBuilder::new().add_character_field(FieldName::try_from("name").unwrap(), 20);
            let mut writer = shapefile::Writer::from_path(&shp, table).unwrap();
            // 1 km square whose western edge lies on the zone's central meridian
            let ring = PolygonRing::Outer(vec![
                Point::new(500_000.0, 5_000_000.0),
                Point::new(500_000.0, 5_001_000.0),
                Point::new(501_000.0, 5_001_000.0),
                Point::new(501_000.0, 5_000_000.0),
            ]);
            let mut record = Record::default();
            record.insert("name".to_string(), FieldValue::Character(Some("Forest".to_string())));
            writer.write_shape_and_record(&Polygon::new(ring), &record).unwrap();
        }
        std::fs::write(shp.with_extension("prj"), UTM_33N_PRJ).unwrap();

        let zip_path = dir.path().join("upload.zip");
        let mut zip = zip::ZipWriter::new(File::create(&zip_path).unwrap());
        for ext in ["shp", "shx", "dbf", "prj"] {
            zip.start_file(format!("parcels/parcels.{ext}"), zip::write::FileOptions::default()).unwrap();
            zip.write_all(&std::fs::read(shp.with_extension(ext)).unwrap()).unwrap();
        }
        zip.finish().unwrap();

        let output = dir.path().join("parcels.geojson");
        let outcome = normalize_vector(&zip_path, "parcels.zip", &output, &options()).unwrap();
        assert_eq!(outcome.features, 1);
        assert_eq!(outcome.source_epsg, 32633);
        assert!(!outcome.ellipsized);

        let (doc, coords) = output_coords(&output);
        assert_eq!(doc["features"].as_array().unwrap().len(), 1);
        assert_eq!(doc["features"][0]["properties"]["name"], "Forest");
        assert_eq!(coords.len(), 5);

        let min_lon = coords.iter().map(|c| c.0).fold(f64::INFINITY, f64::min);
        let max_lon = coords.iter().map(|c| c.0).fold(f64::NEG_INFINITY, f64::max);
        assert!((min_lon - 15.0).abs() < 1e-6, "min lon {min_lon}");
        assert!(max_lon > 15.01 && max_lon < 15.02, "max lon {max_lon}");
        for (_, lat) in &coords {
            assert!((45.1..45.2).contains(lat), "lat {lat}");
        }
    }
}
