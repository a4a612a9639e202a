//! On-disk tile store used between the warp pass and the final write.
//!
//! Every level of the pyramid is stored as fixed-size `f64` tiles in one
//! anonymous temporary file, so a whole pyramid never sits in memory.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};
use crate::geotiff_writer::{CogLayout, TileSource};

const SAMPLE_BYTES: usize = std::mem::size_of::<f64>();

pub struct ScratchStore {
    file: File,
    tile_samples: usize,
    /// First tile slot of each level.
    level_base: Vec<usize>,
    tiles_across: Vec<usize>,
    tiles_down: Vec<usize>,
}

impl ScratchStore {
    /// Create an empty store sized for every level of `layout`.
    ///
    /// # Errors
    /// Returns an error if the temporary file cannot be created.
    pub fn new(layout: &CogLayout) -> Result<Self> {
        let mut level_base = Vec::with_capacity(layout.level_count());
        let mut tiles_across = Vec::with_capacity(layout.level_count());
        let mut tiles_down = Vec::with_capacity(layout.level_count());
        let mut next = 0;
        for level in 0..layout.level_count() {
            let (across, down) = layout.level_tiles(level);
            level_base.push(next);
            tiles_across.push(across);
            tiles_down.push(down);
            next += across * down;
        }
        Ok(Self {
            file: tempfile::tempfile()?,
            tile_samples: layout.tile_samples(),
            level_base,
            tiles_across,
            tiles_down,
        })
    }

    fn offset(&self, level: usize, tx: usize, ty: usize) -> Result<u64> {
        let (Some(base), Some(&across), Some(&down)) =
            (self.level_base.get(level), self.tiles_across.get(level), self.tiles_down.get(level))
        else {
            return Err(Error::conversion(format!("level {level} is not part of the pyramid")));
        };
        if tx >= across || ty >= down {
            return Err(Error::conversion(format!("tile ({tx}, {ty}) outside level {level}")));
        }
        let slot = base + ty * across + tx;
        Ok((slot * self.tile_samples * SAMPLE_BYTES) as u64)
    }

    /// Store a full tile.
    ///
    /// # Errors
    /// Returns an error on a wrong sample count, an unknown tile, or I/O failure.
    pub fn write_tile(&mut self, level: usize, tx: usize, ty: usize, samples: &[f64]) -> Result<()> {
        if samples.len() != self.tile_samples {
            return Err(Error::conversion(format!(
                "tile has {} samples, expected {}",
                samples.len(),
                self.tile_samples
            )));
        }
        let offset = self.offset(level, tx, ty)?;
        let bytes: Vec<u8> = samples.iter().flat_map(|v| v.to_ne_bytes()).collect();
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&bytes)?;
        Ok(())
    }
}

impl TileSource for ScratchStore {
    fn read_tile(&mut self, level: usize, tx: usize, ty: usize) -> Result<Vec<f64>> {
        let offset = self.offset(level, tx, ty)?;
        let mut bytes = vec![0u8; self.tile_samples * SAMPLE_BYTES];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut bytes)?;
        Ok(bytes
            .chunks_exact(SAMPLE_BYTES)
            .map(|b| {
                let mut raw = [0u8; SAMPLE_BYTES];
                raw.copy_from_slice(b);
                f64::from_ne_bytes(raw)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cog_reader::CogDataType;

    fn layout() -> CogLayout {
        CogLayout {
            width: 40,
            height: 20,
            bands: 2,
            data_type: CogDataType::F32,
            block_size: 16,
            crs: 3857,
            origin: (0.0, 0.0),
            resolution: (1.0, 1.0),
            nodata: 0.0,
            overviews: vec![2],
            statistics: Vec::new(),
        }
    }

    #[test]
    fn test_tiles_are_independent() {
        let l = layout();
        let mut store = ScratchStore::new(&l).unwrap();
        let a = vec![1.5; l.tile_samples()];
        let b = vec![-2.0; l.tile_samples()];
        store.write_tile(0, 2, 1, &a).unwrap();
        store.write_tile(1, 0, 0, &b).unwrap();
        assert_eq!(store.read_tile(0, 2, 1).unwrap(), a);
        assert_eq!(store.read_tile(1, 0, 0).unwrap(), b);
    }

    #[test]
    fn test_rejects_out_of_range() {
        let l = layout();
        let mut store = ScratchStore::new(&l).unwrap();
        // level 0 is 3x2 tiles, level 1 is 2x1
        assert!(store.write_tile(0, 3, 0, &vec![0.0; l.tile_samples()]).is_err());
        assert!(store.read_tile(1, 0, 1).is_err());
        assert!(store.read_tile(2, 0, 0).is_err());
        assert!(store.write_tile(0, 0, 0, &[0.0]).is_err());
    }
}
