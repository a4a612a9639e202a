//! Overview construction by repeated 2x2 area averaging.
//!
//! Each overview level halves the previous one, so level `k` with factor
//! `2^k` is built from level `k - 1` only. Nodata pixels are left out of the
//! average; an output pixel with no valid contributors is nodata.

use tracing::debug;

use crate::error::{Error, Result};
use crate::geotiff_writer::{CogLayout, TileSource};
use crate::raster::scratch::ScratchStore;

/// Fill every overview level of `store` from the level below it.
///
/// # Errors
/// Returns an error if the factors are not successive doublings, or on I/O failure.
pub fn build_overviews(store: &mut ScratchStore, layout: &CogLayout, nodata: f64) -> Result<()> {
    for level in 1..layout.level_count() {
        if layout.level_factor(level) != layout.level_factor(level - 1) * 2 {
            return Err(Error::conversion(format!(
                "overview factor {} does not double the previous level",
                layout.level_factor(level)
            )));
        }
        let (across, down) = layout.level_tiles(level);
        for ty in 0..down {
            for tx in 0..across {
                let tile = downsample_tile(store, layout, level, tx, ty, nodata)?;
                store.write_tile(level, tx, ty, &tile)?;
            }
        }
        debug!(level, factor = layout.level_factor(level), tiles = across * down, "Built overview level");
    }
    Ok(())
}

fn is_nodata(value: f64, nodata: f64) -> bool {
    value.is_nan() || value == nodata
}

fn downsample_tile(
    store: &mut ScratchStore,
    layout: &CogLayout,
    level: usize,
    tx: usize,
    ty: usize,
    nodata: f64,
) -> Result<Vec<f64>> {
    let block = layout.block_size;
    let bands = layout.bands;
    let (parent_w, parent_h) = layout.level_size(level - 1);
    let (parent_across, parent_down) = layout.level_tiles(level - 1);
    let (width, height) = layout.level_size(level);

    // the four parent tiles under this tile, if they exist
    let mut parents: [[Option<Vec<f64>>; 2]; 2] = Default::default();
    for (dy, row) in parents.iter_mut().enumerate() {
        for (dx, slot) in row.iter_mut().enumerate() {
            let (px, py) = (tx * 2 + dx, ty * 2 + dy);
            if px < parent_across && py < parent_down {
                *slot = Some(store.read_tile(level - 1, px, py)?);
            }
        }
    }

    let mut out = vec![nodata; layout.tile_samples()];
    let mut sums = vec![0.0; bands];
    let mut counts = vec![0usize; bands];
    for y in 0..block {
        let row = ty * block + y;
        if row >= height {
            break;
        }
        for x in 0..block {
            let col = tx * block + x;
            if col >= width {
                break;
            }
            sums.fill(0.0);
            counts.fill(0);
            for (sy, sx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                let (src_col, src_row) = (col * 2 + sx, row * 2 + sy);
                if src_col >= parent_w || src_row >= parent_h {
                    continue;
                }
                let tile_col = (src_col / block) % 2;
                let tile_row = (src_row / block) % 2;
                let Some(parent) = &parents[tile_row][tile_col] else {
                    continue;
                };
                let start = ((src_row % block) * block + src_col % block) * bands;
                for b in 0..bands {
                    let v = parent[start + b];
                    if !is_nodata(v, nodata) {
                        sums[b] += v;
                        counts[b] += 1;
                    }
                }
            }
            let start = (y * block + x) * bands;
            for b in 0..bands {
                if counts[b] > 0 {
                    #[allow(clippy::cast_precision_loss)]
                    let mean = sums[b] / counts[b] as f64;
                    out[start + b] = mean;
                }
            }
        }
    }
    Ok(out)
}
