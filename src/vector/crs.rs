//! CRS detection for vector inputs.
//!
//! GeoJSON may carry the pre-RFC 7946 `crs` member; shapefiles describe
//! their CRS in a sibling `.prj` file holding ESRI-flavoured WKT. Both are
//! reduced to an EPSG code so they can go through
//! [`crate::geometry::CoordTransformer`].

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::geometry::{WEB_MERCATOR, WGS84};

static EPSG_URN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)EPSG(?:/\d+/|:+)(\d+)\s*$").expect("static regex"));
static WKT_AUTHORITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"AUTHORITY\[\s*"EPSG"\s*,\s*"?(\d+)"?\s*\]"#).expect("static regex"));
static WKT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*(PROJCS|GEOGCS)\[\s*"([^"]+)""#).expect("static regex"));
static UTM_ZONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(.*)_UTM_Zone_(\d{1,2})([NS])$").expect("static regex"));
static JAPAN_ZONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^JGD_(2000|2011)_Japan_Zone_(\d{1,2})$").expect("static regex"));

/// EPSG code named by a legacy GeoJSON `crs` member, if present.
///
/// # Errors
/// Returns a conversion error for a `crs` member that names an unknown system.
pub fn epsg_from_geojson_crs(crs: Option<&Value>) -> Result<Option<i32>> {
    let Some(crs) = crs else {
        return Ok(None);
    };
    if crs.is_null() {
        return Ok(None);
    }
    let name = crs
        .pointer("/properties/name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::conversion("GeoJSON crs member has no name"))?;
    if name.to_ascii_uppercase().ends_with("CRS84") {
        return Ok(Some(WGS84));
    }
    EPSG_URN
        .captures(name)
        .and_then(|c| c[1].parse().ok())
        .map(Some)
        .ok_or_else(|| Error::conversion(format!("Unsupported GeoJSON crs: {name}")))
}

/// EPSG code for the ESRI WKT in a `.prj` file.
///
/// # Errors
/// Returns a conversion error when the CRS cannot be identified.
pub fn epsg_from_prj(wkt: &str) -> Result<i32> {
    // the outermost AUTHORITY comes last in WKT1
    if let Some(code) = WKT_AUTHORITY
        .captures_iter(wkt)
        .last()
        .and_then(|c| c[1].parse().ok())
    {
        return Ok(code);
    }

    let caps = WKT_NAME
        .captures(wkt)
        .ok_or_else(|| Error::conversion("Unreadable .prj file"))?;
    let name = &caps[2];
    epsg_from_esri_name(name).ok_or_else(|| Error::conversion(format!("Unsupported coordinate system in .prj: {name}")))
}

fn epsg_from_esri_name(name: &str) -> Option<i32> {
    let fixed = match name {
        "GCS_WGS_1984" | "WGS 84" | "WGS_1984" => Some(WGS84),
        "WGS_1984_Web_Mercator_Auxiliary_Sphere" | "WGS_1984_Web_Mercator" | "WGS 84 / Pseudo-Mercator" => {
            Some(WEB_MERCATOR)
        }
        "GCS_ETRS_1989" => Some(4258),
        "GCS_North_American_1983" => Some(4269),
        "GCS_JGD_2000" => Some(4612),
        "GCS_JGD_2011" => Some(6668),
        _ => None,
    };
    if fixed.is_some() {
        return fixed;
    }

    if let Some(c) = UTM_ZONE.captures(name) {
        let zone: i32 = c[2].parse().ok()?;
        if !(1..=60).contains(&zone) {
            return None;
        }
        let north = c[3].eq_ignore_ascii_case("N");
        return match (c[1].to_ascii_uppercase().as_str(), north) {
            ("WGS_1984", true) => Some(32600 + zone),
            ("WGS_1984", false) => Some(32700 + zone),
            ("ETRS_1989", true) if (28..=38).contains(&zone) => Some(25800 + zone),
            ("NAD_1983", true) if (1..=23).contains(&zone) => Some(26900 + zone),
            ("JGD_2000", true) if (51..=55).contains(&zone) => Some(3097 + zone - 51),
            ("JGD_2011", true) if (51..=55).contains(&zone) => Some(6688 + zone - 51),
            _ => None,
        };
    }

    if let Some(c) = JAPAN_ZONE.captures(name) {
        let zone: i32 = c[2].parse().ok()?;
        if !(1..=19).contains(&zone) {
            return None;
        }
        return Some(if &c[1] == "2000" { 2443 + zone - 1 } else { 6669 + zone - 1 });
    }
    None
}

/// CRS of a shapefile from its sibling `.prj`; `None` when there is no `.prj`.
///
/// # Errors
/// Returns an error if the `.prj` exists but cannot be read or identified.
pub fn shapefile_epsg(shp: &Path) -> Result<Option<i32>> {
    let prj = shp.with_extension("prj");
    let prj = if prj.exists() { prj } else { shp.with_extension("PRJ") };
    if !prj.exists() {
        return Ok(None);
    }
    let wkt = std::fs::read_to_string(&prj)?;
    epsg_from_prj(&wkt).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_geojson_crs_names() {
        let crs = |name: &str| json!({"type": "name", "properties": {"name": name}});
        assert_eq!(epsg_from_geojson_crs(Some(&crs("urn:ogc:def:crs:EPSG::3857"))).unwrap(), Some(3857));
        assert_eq!(epsg_from_geojson_crs(Some(&crs("EPSG:32654"))).unwrap(), Some(32654));
        assert_eq!(
            epsg_from_geojson_crs(Some(&crs("http://www.opengis.net/def/crs/EPSG/0/2154"))).unwrap(),
            Some(2154)
        );
        assert_eq!(epsg_from_geojson_crs(Some(&crs("urn:ogc:def:crs:OGC:1.3:CRS84"))).unwrap(), Some(4326));
        assert_eq!(epsg_from_geojson_crs(None).unwrap(), None);
        assert!(epsg_from_geojson_crs(Some(&crs("urn:ogc:def:crs:FOO::1"))).is_err());
    }

    #[test]
    fn test_prj_with_authority() {
        let wkt = r#"PROJCS["WGS 84 / UTM zone 33N",GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],AUTHORITY["EPSG","4326"]],PROJECTION["Transverse_Mercator"],AUTHORITY["EPSG","32633"]]"#;
        assert_eq!(epsg_from_prj(wkt).unwrap(), 32633);
    }

    #[test]
    fn test_prj_esri_names() {
        let geo = r#"GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]]"#;
        assert_eq!(epsg_from_prj(geo).unwrap(), 4326);

        let utm = r#"PROJCS["WGS_1984_UTM_Zone_54N",GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]]],PROJECTION["Transverse_Mercator"]]"#;
        assert_eq!(epsg_from_prj(utm).unwrap(), 32654);

        assert_eq!(epsg_from_esri_name("WGS_1984_UTM_Zone_19S"), Some(32719));
        assert_eq!(epsg_from_esri_name("ETRS_1989_UTM_Zone_32N"), Some(25832));
        assert_eq!(epsg_from_esri_name("JGD_2011_UTM_Zone_53N"), Some(6690));
        assert_eq!(epsg_from_esri_name("JGD_2011_Japan_Zone_9"), Some(6677));
        assert_eq!(epsg_from_esri_name("JGD_2000_Japan_Zone_1"), Some(2443));
        assert_eq!(epsg_from_esri_name("WGS_1984_Web_Mercator_Auxiliary_Sphere"), Some(3857));
    }

    #[test]
    fn test_prj_unknown() {
        assert!(epsg_from_prj(r#"PROJCS["Some_Local_Grid",GEOGCS["GCS_Unknown"]]"#).is_err());
        assert!(epsg_from_prj("garbage").is_err());
    }

    #[test]
    fn test_missing_prj() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(shapefile_epsg(&dir.path().join("a.shp")).unwrap(), None);
    }
}
