//! Reprojection of a source raster onto a Web Mercator grid.
//!
//! The destination grid follows GDAL's "suggested warp output": the source
//! bounds are transformed with densified edges, and the pixel size is chosen
//! so the destination diagonal spans as many pixels as the source diagonal.
//! Destination pixels are then filled tile by tile with an inverse transform
//! and bilinear sampling, so only the source chunks under the current tile
//! are resident.

use tracing::{debug, info};

use crate::cog_reader::CogReader;
use crate::error::{Error, Result};
use crate::geometry::{BoundingBox, CoordTransformer, WEB_MERCATOR};
use crate::geotiff_writer::CogLayout;
use crate::raster::scratch::ScratchStore;

const DENSIFY_POINTS: usize = 21;
/// Bilinear weights below this are treated as zero.
const WEIGHT_EPSILON: f64 = 1e-9;

/// Output grid in EPSG:3857.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DestinationGrid {
    pub width: usize,
    pub height: usize,
    /// Top-left corner.
    pub origin: (f64, f64),
    pub resolution: (f64, f64),
}

impl DestinationGrid {
    #[must_use]
    pub fn bounds(&self) -> BoundingBox {
        #[allow(clippy::cast_precision_loss)]
        let (w, h) = (self.width as f64, self.height as f64);
        BoundingBox::new(
            self.origin.0,
            self.origin.1 - h * self.resolution.1,
            self.origin.0 + w * self.resolution.0,
            self.origin.1,
        )
    }
}

/// Pick the Web Mercator grid for `reader`.
///
/// A source already in EPSG:3857 keeps its own grid.
///
/// # Errors
/// Returns a conversion error if the source is not georeferenced or its
/// bounds cannot be projected.
pub fn suggested_grid(reader: &CogReader, src_crs: i32) -> Result<DestinationGrid> {
    let meta = &reader.metadata;
    let (Some(src_bounds), Some(origin), Some(res)) =
        (reader.bounds(), meta.geo_transform.origin(), meta.geo_transform.resolution())
    else {
        return Err(Error::conversion("source raster has no geotransform"));
    };

    if src_crs == WEB_MERCATOR {
        return Ok(DestinationGrid {
            width: meta.width,
            height: meta.height,
            origin,
            resolution: res,
        });
    }

    let transformer = CoordTransformer::new(src_crs, WEB_MERCATOR).map_err(Error::conversion)?;
    let dst = transformer
        .transform_bounds(&src_bounds, DENSIFY_POINTS)
        .map_err(Error::conversion)?;
    if dst.width() <= 0.0 || dst.height() <= 0.0 {
        return Err(Error::conversion("projected source bounds are empty"));
    }

    #[allow(clippy::cast_precision_loss)]
    let src_diag = ((meta.width * meta.width + meta.height * meta.height) as f64).sqrt();
    let dst_diag = dst.width().hypot(dst.height());
    let resolution = dst_diag / src_diag;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let width = ((dst.width() / resolution).round() as usize).max(1);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let height = ((dst.height() / resolution).round() as usize).max(1);

    Ok(DestinationGrid {
        width,
        height,
        origin: (dst.minx, dst.maxy),
        resolution: (resolution, resolution),
    })
}

/// Running min/max per band.
#[derive(Debug, Clone)]
pub struct BandStats {
    ranges: Vec<Option<(f64, f64)>>,
}

impl BandStats {
    #[must_use]
    pub fn new(bands: usize) -> Self {
        Self { ranges: vec![None; bands] }
    }

    #[inline]
    pub fn update(&mut self, band: usize, value: f64) {
        let slot = &mut self.ranges[band];
        *slot = Some(match *slot {
            Some((lo, hi)) => (lo.min(value), hi.max(value)),
            None => (value, value),
        });
    }

    #[must_use]
    pub fn into_ranges(self) -> Vec<Option<(f64, f64)>> {
        self.ranges
    }
}

/// Bilinear sample at fractional source pixel `(fx, fy)` (pixel centers at
/// integer + 0.5 are addressed as integers here). Neighbors that are off
/// the image or nodata drop out and the remaining weights are renormalized.
fn sample_bilinear(
    reader: &mut CogReader,
    fx: f64,
    fy: f64,
    out: &mut [f64],
    valid: &mut [bool],
    scratch: &mut [f64],
) -> Result<()> {
    let (width, height) = (reader.metadata.width, reader.metadata.height);
    let x0 = fx.floor();
    let y0 = fy.floor();
    let (dx, dy) = (fx - x0, fy - y0);

    let bands = out.len();
    out.fill(0.0);
    let mut wsum = vec![0.0f64; bands];

    let neighbors = [
        (x0, y0, (1.0 - dx) * (1.0 - dy)),
        (x0 + 1.0, y0, dx * (1.0 - dy)),
        (x0, y0 + 1.0, (1.0 - dx) * dy),
        (x0 + 1.0, y0 + 1.0, dx * dy),
    ];
    for &(nx, ny, w) in &neighbors {
        if w < WEIGHT_EPSILON || nx < 0.0 || ny < 0.0 {
            continue;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let (col, row) = (nx as usize, ny as usize);
        if col >= width || row >= height {
            continue;
        }
        if !reader.read_pixel(0, col, row, scratch)? {
            continue;
        }
        for b in 0..bands {
            let v = scratch[b];
            if !reader.is_nodata(v) {
                out[b] += v * w;
                wsum[b] += w;
            }
        }
    }

    for b in 0..bands {
        valid[b] = wsum[b] > WEIGHT_EPSILON;
        if valid[b] {
            out[b] /= wsum[b];
        }
    }
    Ok(())
}

/// Fill level 0 of `store` with the source resampled onto `grid`.
///
/// Returns the per-band value range of everything written.
///
/// # Errors
/// Returns an error if the source cannot be read or the transform cannot be built.
pub fn warp_into(
    reader: &mut CogReader,
    src_crs: i32,
    grid: &DestinationGrid,
    layout: &CogLayout,
    store: &mut ScratchStore,
) -> Result<BandStats> {
    let meta = reader.metadata.clone();
    let (Some(src_origin), Some(src_res)) = (meta.geo_transform.origin(), meta.geo_transform.resolution()) else {
        return Err(Error::conversion("source raster has no geotransform"));
    };
    let transformer = CoordTransformer::new(WEB_MERCATOR, src_crs).map_err(Error::conversion)?;
    let (src_w, src_h) = (meta.width as f64, meta.height as f64);

    let bands = layout.bands;
    let block = layout.block_size;
    let round = !layout.data_type.is_float();
    let (across, down) = layout.level_tiles(0);

    info!(
        src_crs,
        width = grid.width,
        height = grid.height,
        resolution = grid.resolution.0,
        tiles = across * down,
        "Warping raster to EPSG:3857"
    );

    let mut stats = BandStats::new(bands);
    let mut sample = vec![0.0; bands];
    let mut valid = vec![false; bands];
    let mut scratch = vec![0.0; meta.bands];

    for ty in 0..down {
        for tx in 0..across {
            let mut tile = vec![layout.nodata; layout.tile_samples()];
            for y in 0..block {
                let row = ty * block + y;
                if row >= grid.height {
                    break;
                }
                #[allow(clippy::cast_precision_loss)]
                let my = grid.origin.1 - (row as f64 + 0.5) * grid.resolution.1;
                for x in 0..block {
                    let col = tx * block + x;
                    if col >= grid.width {
                        break;
                    }
                    #[allow(clippy::cast_precision_loss)]
                    let mx = grid.origin.0 + (col as f64 + 0.5) * grid.resolution.0;
                    let Ok((sx, sy)) = transformer.transform(mx, my) else {
                        continue;
                    };
                    let px = (sx - src_origin.0) / src_res.0;
                    let py = (src_origin.1 - sy) / src_res.1;
                    if !px.is_finite() || !py.is_finite() || px < 0.0 || py < 0.0 || px > src_w || py > src_h {
                        continue;
                    }

                    sample_bilinear(reader, px - 0.5, py - 0.5, &mut sample, &mut valid, &mut scratch)?;
                    let start = (y * block + x) * bands;
                    for b in 0..bands {
                        if !valid[b] {
                            continue;
                        }
                        let v = if round { sample[b].round() } else { sample[b] };
                        tile[start + b] = v;
                        stats.update(b, v);
                    }
                }
            }
            store.write_tile(0, tx, ty, &tile)?;
        }
        debug!(row = ty, of = down, "Warped tile row");
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_test_geotiff, TestRaster};

    #[test]
    fn test_grid_keeps_mercator_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.tif");
        let raster = TestRaster::gradient(30, 20)
            .with_epsg(3857)
            .with_origin(1_000_000.0, 6_000_000.0, 25.0);
        write_test_geotiff(&path, &raster).unwrap();
        let reader = CogReader::open(&path).unwrap();
        let grid = suggested_grid(&reader, 3857).unwrap();
        assert_eq!((grid.width, grid.height), (30, 20));
        assert_eq!(grid.origin, (1_000_000.0, 6_000_000.0));
        assert_eq!(grid.resolution, (25.0, 25.0));
    }

    #[test]
    fn test_grid_from_geographic_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.tif");
        write_test_geotiff(&path, &TestRaster::gradient(100, 100)).unwrap();
        let reader = CogReader::open(&path).unwrap();
        let grid = suggested_grid(&reader, 4326).unwrap();

        // 1 degree square at 50N is taller than wide in Mercator
        assert!(grid.height > grid.width);
        let diag = ((grid.width * grid.width + grid.height * grid.height) as f64).sqrt();
        assert!((diag - 100.0 * 2f64.sqrt()).abs() < 2.0);

        let b = grid.bounds();
        assert!((b.minx - 1_113_194.9).abs() < 1.0);
        assert!(b.maxy > b.miny);
    }

    #[test]
    fn test_bilinear_renormalizes_nodata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("n.tif");
        let raster = TestRaster::float(4, 4).with_nodata_block(-9999.0, 1..2, 0..1);
        write_test_geotiff(&path, &raster).unwrap();
        let mut reader = CogReader::open(&path).unwrap();

        let mut out = [0.0];
        let mut valid = [false];
        let mut scratch = [0.0];
        // halfway between (0,0)=0.0 and nodata at (1,0)
        sample_bilinear(&mut reader, 0.5, 0.0, &mut out, &mut valid, &mut scratch).unwrap();
        assert!(valid[0]);
        assert_eq!(out[0], 0.0);

        // exact pixel center
        sample_bilinear(&mut reader, 2.0, 3.0, &mut out, &mut valid, &mut scratch).unwrap();
        assert_eq!(out[0], raster.value_at(2, 3, 0));

        // fully off the image
        sample_bilinear(&mut reader, 10.0, 10.0, &mut out, &mut valid, &mut scratch).unwrap();
        assert!(!valid[0]);
    }

    #[test]
    fn test_band_stats() {
        let mut stats = BandStats::new(2);
        stats.update(0, 3.0);
        stats.update(0, -1.0);
        assert_eq!(stats.into_ranges(), vec![Some((-1.0, 3.0)), None]);
    }
}
