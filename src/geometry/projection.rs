//! Coordinate reference system handling on top of proj4rs + crs-definitions.
//!
//! All EPSG lookups go through the crs-definitions database, so any code it
//! knows (UTM zones, national grids, ...) can be used as a source CRS. The
//! pipeline only ever targets two systems: [`WGS84`] for vectors and
//! [`WEB_MERCATOR`] for rasters.

use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use serde::Serialize;

/// Canonical geographic CRS (lon/lat degrees).
pub const WGS84: i32 = 4326;

/// Canonical web-display CRS.
pub const WEB_MERCATOR: i32 = 3857;

/// Half the width of the Web Mercator square, in meters.
pub const MERCATOR_HALF_EXTENT: f64 = 20_037_508.342_789_244;

/// Latitude at which Web Mercator becomes square.
pub const MERCATOR_MAX_LAT: f64 = 85.051_128_779_806_59;

/// Bounding box in some coordinate reference system.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

impl BoundingBox {
    #[must_use]
    pub fn new(minx: f64, miny: f64, maxx: f64, maxy: f64) -> Self {
        Self { minx, miny, maxx, maxy }
    }

    /// Web Mercator extent of an XYZ tile.
    #[must_use]
    pub fn from_xyz(z: u32, x: u32, y: u32) -> Self {
        let n = f64::from(2_u32.pow(z));
        let tile_size = 2.0 * MERCATOR_HALF_EXTENT / n;

        let minx = -MERCATOR_HALF_EXTENT + f64::from(x) * tile_size;
        let maxx = minx + tile_size;
        let maxy = MERCATOR_HALF_EXTENT - f64::from(y) * tile_size;
        let miny = maxy - tile_size;

        Self { minx, miny, maxx, maxy }
    }

    #[must_use]
    pub fn width(&self) -> f64 {
        self.maxx - self.minx
    }

    #[must_use]
    pub fn height(&self) -> f64 {
        self.maxy - self.miny
    }

    /// Strict overlap test: boxes that only touch along an edge do not intersect.
    #[must_use]
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.minx < other.maxx
            && self.maxx > other.minx
            && self.miny < other.maxy
            && self.maxy > other.miny
    }

    fn expand(&mut self, x: f64, y: f64) {
        self.minx = self.minx.min(x);
        self.miny = self.miny.min(y);
        self.maxx = self.maxx.max(x);
        self.maxy = self.maxy.max(y);
    }

    fn empty() -> Self {
        Self::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY)
    }

    fn is_finite(&self) -> bool {
        self.minx.is_finite() && self.miny.is_finite() && self.maxx.is_finite() && self.maxy.is_finite()
    }
}

/// PROJ4 string for an EPSG code, from the crs-definitions database.
#[inline]
#[must_use]
pub fn get_proj_string(epsg: i32) -> Option<&'static str> {
    u16::try_from(epsg)
        .ok()
        .and_then(crs_definitions::from_code)
        .map(|def| def.proj4)
}

/// True if the EPSG code is a lon/lat system.
#[inline]
#[must_use]
pub fn is_geographic_crs(epsg: i32) -> bool {
    if let Some(proj_str) = get_proj_string(epsg) {
        proj_str.contains("+proj=longlat")
    } else {
        epsg == WGS84 || (4000..5000).contains(&epsg)
    }
}

/// Reusable transformer between two EPSG systems.
///
/// Building a [`Proj`] parses its definition string, so hot loops (warping,
/// tile rendering, feature reprojection) construct one transformer and call
/// [`CoordTransformer::transform`] per coordinate. Geographic systems take and
/// return degrees; the radian bookkeeping proj4rs needs stays in here.
pub struct CoordTransformer {
    source_epsg: i32,
    target_epsg: i32,
    projs: Option<(Proj, Proj)>,
    source_is_geographic: bool,
    target_is_geographic: bool,
}

impl CoordTransformer {
    /// # Errors
    /// Returns an error if either code is unknown to crs-definitions or its
    /// definition cannot be parsed.
    pub fn new(source_epsg: i32, target_epsg: i32) -> Result<Self, String> {
        let projs = if source_epsg == target_epsg {
            None
        } else {
            let source_str = get_proj_string(source_epsg)
                .ok_or_else(|| format!("EPSG:{source_epsg} is not in the crs-definitions database"))?;
            let target_str = get_proj_string(target_epsg)
                .ok_or_else(|| format!("EPSG:{target_epsg} is not in the crs-definitions database"))?;
            let source = Proj::from_proj_string(source_str)
                .map_err(|e| format!("Invalid source projection EPSG:{source_epsg}: {e:?}"))?;
            let target = Proj::from_proj_string(target_str)
                .map_err(|e| format!("Invalid target projection EPSG:{target_epsg}: {e:?}"))?;
            Some((source, target))
        };

        Ok(Self {
            source_epsg,
            target_epsg,
            projs,
            source_is_geographic: is_geographic_crs(source_epsg),
            target_is_geographic: is_geographic_crs(target_epsg),
        })
    }

    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.projs.is_none()
    }

    #[must_use]
    pub fn source_epsg(&self) -> i32 {
        self.source_epsg
    }

    #[must_use]
    pub fn target_epsg(&self) -> i32 {
        self.target_epsg
    }

    /// # Errors
    /// Returns an error if proj4rs rejects the point (outside the projection's domain).
    #[inline]
    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64), String> {
        let Some((source, target)) = &self.projs else {
            return Ok((x, y));
        };

        let (x_in, y_in) = if self.source_is_geographic {
            (x.to_radians(), y.to_radians())
        } else {
            (x, y)
        };

        let mut point = (x_in, y_in, 0.0);
        transform(source, target, &mut point).map_err(|e| {
            format!(
                "Transform from EPSG:{} to EPSG:{} failed: {e:?}",
                self.source_epsg, self.target_epsg
            )
        })?;

        if self.target_is_geographic {
            Ok((point.0.to_degrees(), point.1.to_degrees()))
        } else {
            Ok((point.0, point.1))
        }
    }

    /// Transform a box by sampling `densify` points along each edge.
    ///
    /// Curved projections bend straight edges, so the corners alone can
    /// understate the target extent. Points that fail to project are skipped;
    /// the call only fails when none succeed.
    ///
    /// # Errors
    /// Returns an error if no sampled point could be transformed.
    pub fn transform_bounds(&self, bounds: &BoundingBox, densify: usize) -> Result<BoundingBox, String> {
        if self.is_identity() {
            return Ok(*bounds);
        }

        let steps = densify.max(1);
        let clamp_lat = self.source_is_geographic && self.target_epsg == WEB_MERCATOR;
        let mut out = BoundingBox::empty();
        let mut last_err = None;

        for i in 0..=steps {
            #[allow(clippy::cast_precision_loss)]
            let t = i as f64 / steps as f64;
            let x = bounds.minx + t * bounds.width();
            let y = bounds.miny + t * bounds.height();
            let edge_points = [
                (x, bounds.miny),
                (x, bounds.maxy),
                (bounds.minx, y),
                (bounds.maxx, y),
            ];
            for (px, py) in edge_points {
                let py = if clamp_lat {
                    py.clamp(-MERCATOR_MAX_LAT, MERCATOR_MAX_LAT)
                } else {
                    py
                };
                match self.transform(px, py) {
                    Ok((tx, ty)) if tx.is_finite() && ty.is_finite() => out.expand(tx, ty),
                    Ok(_) => {}
                    Err(e) => last_err = Some(e),
                }
            }
        }

        if out.is_finite() {
            Ok(out)
        } else {
            Err(last_err.unwrap_or_else(|| "no point of the bounds could be transformed".to_string()))
        }
    }
}

/// Project a single point between two EPSG systems.
///
/// # Errors
/// Returns an error if either code is unsupported or the transform fails.
#[inline]
pub fn project_point(source_epsg: i32, target_epsg: i32, x: f64, y: f64) -> Result<(f64, f64), String> {
    if source_epsg == target_epsg {
        return Ok((x, y));
    }
    CoordTransformer::new(source_epsg, target_epsg)?.transform(x, y)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < EPS
    }

    #[test]
    fn test_bbox_from_xyz() {
        let bbox = BoundingBox::from_xyz(0, 0, 0);
        assert!((bbox.minx + MERCATOR_HALF_EXTENT).abs() < 1.0);
        assert!((bbox.maxx - MERCATOR_HALF_EXTENT).abs() < 1.0);

        let left = BoundingBox::from_xyz(1, 0, 0);
        let right = BoundingBox::from_xyz(1, 1, 0);
        assert!((left.maxx - right.minx).abs() < 1.0);
        assert!(left.miny.abs() < 1.0);
    }

    #[test]
    fn test_bbox_intersects() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!(a.intersects(&BoundingBox::new(5.0, 5.0, 15.0, 15.0)));
        assert!(!a.intersects(&BoundingBox::new(20.0, 20.0, 30.0, 30.0)));
        assert!(!a.intersects(&BoundingBox::new(10.0, 0.0, 20.0, 10.0)));
    }

    #[test]
    fn test_roundtrip_4326_3857() {
        for (lon, lat) in [(0.0, 0.0), (10.0, 51.5), (-122.4, 37.8), (139.7, 35.7)] {
            let (x, y) = project_point(WGS84, WEB_MERCATOR, lon, lat).unwrap();
            let (lon2, lat2) = project_point(WEB_MERCATOR, WGS84, x, y).unwrap();
            assert!(approx_eq(lon, lon2), "lon: {lon} != {lon2}");
            assert!(approx_eq(lat, lat2), "lat: {lat} != {lat2}");
        }
    }

    #[test]
    fn test_utm_roundtrip() {
        let t = CoordTransformer::new(WGS84, 32633).unwrap();
        let (x, y) = t.transform(15.0, 52.0).unwrap();
        assert!(x > 400_000.0 && x < 600_000.0, "UTM easting: {x}");
        assert!(y > 5_000_000.0 && y < 6_000_000.0, "UTM northing: {y}");

        let back = CoordTransformer::new(32633, WGS84).unwrap();
        let (lon, lat) = back.transform(x, y).unwrap();
        assert!((lon - 15.0).abs() < 1e-5);
        assert!((lat - 52.0).abs() < 1e-5);
    }

    #[test]
    fn test_identity_transformer() {
        let t = CoordTransformer::new(WEB_MERCATOR, WEB_MERCATOR).unwrap();
        assert!(t.is_identity());
        assert_eq!(t.transform(1.5, -2.5).unwrap(), (1.5, -2.5));
    }

    #[test]
    fn test_is_geographic_crs() {
        assert!(is_geographic_crs(WGS84));
        assert!(!is_geographic_crs(WEB_MERCATOR));
        assert!(!is_geographic_crs(32633));
    }

    #[test]
    fn test_unsupported_epsg_code() {
        let result = CoordTransformer::new(WGS84, 999_999);
        assert!(result.is_err());
        assert!(result.err().unwrap().contains("not in the crs-definitions database"));
    }

    #[test]
    fn test_transform_bounds_clamps_poles() {
        let t = CoordTransformer::new(WGS84, WEB_MERCATOR).unwrap();
        let world = BoundingBox::new(-180.0, -90.0, 180.0, 90.0);
        let merc = t.transform_bounds(&world, 8).unwrap();
        assert!(merc.maxy.is_finite());
        assert!((merc.maxy - MERCATOR_HALF_EXTENT).abs() < 10.0);
        assert!((merc.minx + MERCATOR_HALF_EXTENT).abs() < 10.0);
    }

    #[test]
    fn test_transform_bounds_utm_contains_corners() {
        let t = CoordTransformer::new(32633, WGS84).unwrap();
        let utm = BoundingBox::new(400_000.0, 5_700_000.0, 600_000.0, 5_800_000.0);
        let geo = t.transform_bounds(&utm, 16).unwrap();
        let (lon, lat) = t.transform(400_000.0, 5_800_000.0).unwrap();
        assert!(geo.minx <= lon && lon <= geo.maxx);
        assert!(geo.miny <= lat && lat <= geo.maxy);
    }
}
