//! In-process GeoTIFF fixtures for unit tests, integration tests and benches.
//!
//! Writes plain stripped GeoTIFFs through the `tiff` encoder's image API, the
//! way a typical upload looks before normalization. Band-sequential files are
//! laid out by hand, since the image API only writes pixel-interleaved data.

use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;

use tiff::encoder::colortype::{Gray32Float, Gray8, RGB8};
use tiff::encoder::{DirectoryEncoder, TiffEncoder, TiffKind};
use tiff::tags::Tag;

use crate::cog_reader::{tag, TAG_GDAL_NODATA, TAG_GEO_KEY_DIRECTORY, TAG_MODEL_PIXEL_SCALE, TAG_MODEL_TIEPOINT};
use crate::error::{Error, Result};
use crate::geotiff_writer::build_geokey_directory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestSample {
    Gray8,
    Rgb8,
    Float32,
}

/// Synthetic north-up raster.
#[derive(Debug, Clone)]
pub struct TestRaster {
    pub width: usize,
    pub height: usize,
    pub sample: TestSample,
    pub epsg: Option<i32>,
    pub origin: (f64, f64),
    pub pixel_size: f64,
    pub nodata: Option<f64>,
    /// Strip height; the encoder picks one when unset.
    pub rows_per_strip: Option<u32>,
    /// Store each band in its own strip (PlanarConfiguration 2).
    pub planar: bool,
    /// Pixel-interleaved samples.
    pub values: Vec<f64>,
}

impl TestRaster {
    /// Single-band 8-bit ramp in EPSG:4326 near 10E 50N, 0.01 degree pixels.
    #[must_use]
    pub fn gradient(width: usize, height: usize) -> Self {
        let values = (0..height)
            .flat_map(|row| (0..width).map(move |col| ((col + row) % 250 + 1) as f64))
            .collect();
        Self {
            width,
            height,
            sample: TestSample::Gray8,
            epsg: Some(4326),
            origin: (10.0, 50.0),
            pixel_size: 0.01,
            nodata: None,
            rows_per_strip: None,
            planar: false,
            values,
        }
    }

    /// Three-band 8-bit raster with a distinct ramp per band.
    #[must_use]
    pub fn rgb(width: usize, height: usize) -> Self {
        let values = (0..height)
            .flat_map(|row| {
                (0..width).flat_map(move |col| [(col % 256) as f64, (row % 256) as f64, 128.0])
            })
            .collect();
        Self {
            sample: TestSample::Rgb8,
            values,
            ..Self::gradient(width, height)
        }
    }

    /// Single-band float raster with values `col * 0.5 - row`.
    #[must_use]
    pub fn float(width: usize, height: usize) -> Self {
        let values = (0..height)
            .flat_map(|row| (0..width).map(move |col| col as f64 * 0.5 - row as f64))
            .collect();
        Self {
            sample: TestSample::Float32,
            values,
            ..Self::gradient(width, height)
        }
    }

    #[must_use]
    pub fn with_epsg(mut self, epsg: i32) -> Self {
        self.epsg = Some(epsg);
        self
    }

    #[must_use]
    pub fn without_crs(mut self) -> Self {
        self.epsg = None;
        self
    }

    #[must_use]
    pub fn with_origin(mut self, x: f64, y: f64, pixel_size: f64) -> Self {
        self.origin = (x, y);
        self.pixel_size = pixel_size;
        self
    }

    #[must_use]
    pub fn with_rows_per_strip(mut self, rows: u32) -> Self {
        self.rows_per_strip = Some(rows);
        self
    }

    /// Band-sequential layout, one full-height strip per band. 8-bit RGB only.
    #[must_use]
    pub fn band_sequential(mut self) -> Self {
        self.planar = true;
        self
    }

    /// Declare `nodata` and write it into every pixel of the given rectangle.
    #[must_use]
    pub fn with_nodata_block(mut self, nodata: f64, cols: std::ops::Range<usize>, rows: std::ops::Range<usize>) -> Self {
        let bands = self.bands();
        for row in rows {
            for col in cols.clone() {
                let start = (row * self.width + col) * bands;
                self.values[start..start + bands].fill(nodata);
            }
        }
        self.nodata = Some(nodata);
        self
    }

    #[must_use]
    pub fn bands(&self) -> usize {
        match self.sample {
            TestSample::Rgb8 => 3,
            TestSample::Gray8 | TestSample::Float32 => 1,
        }
    }

    #[must_use]
    pub fn value_at(&self, col: usize, row: usize, band: usize) -> f64 {
        self.values[(row * self.width + col) * self.bands() + band]
    }
}

fn write_geo_tags<W: Write + Seek, K: TiffKind>(dir: &mut DirectoryEncoder<'_, W, K>, raster: &TestRaster) -> Result<()> {
    let scale = [raster.pixel_size, raster.pixel_size, 0.0];
    dir.write_tag(tag(TAG_MODEL_PIXEL_SCALE), scale.as_slice())?;
    let tiepoint = [0.0, 0.0, 0.0, raster.origin.0, raster.origin.1, 0.0];
    dir.write_tag(tag(TAG_MODEL_TIEPOINT), tiepoint.as_slice())?;
    if let Some(epsg) = raster.epsg {
        let mut keys = build_geokey_directory(epsg, 0)?;
        // drop the citation entry, there is no GeoAsciiParams tag here
        keys.drain(12..16);
        keys[3] = 3;
        dir.write_tag(tag(TAG_GEO_KEY_DIRECTORY), keys.as_slice())?;
    }
    if let Some(nodata) = raster.nodata {
        dir.write_tag(tag(TAG_GDAL_NODATA), format!("{nodata}").as_str())?;
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn as_u8(values: &[f64]) -> Vec<u8> {
    values.iter().map(|&v| v.clamp(0.0, 255.0) as u8).collect()
}

/// Write `raster` to `path` as a stripped, uncompressed GeoTIFF.
///
/// # Errors
/// Returns an error if the file cannot be written.
#[allow(clippy::cast_possible_truncation)]
pub fn write_test_geotiff(path: &Path, raster: &TestRaster) -> Result<()> {
    let width = u32::try_from(raster.width).map_err(|_| Error::validation("width"))?;
    let height = u32::try_from(raster.height).map_err(|_| Error::validation("height"))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(File::create(path)?))?;
    if raster.planar {
        if raster.sample != TestSample::Rgb8 {
            return Err(Error::validation("band-sequential fixtures are 8-bit RGB"));
        }
        let mut dir = encoder.new_directory()?;
        write_band_sequential(&mut dir, raster, width, height)?;
        write_geo_tags(&mut dir, raster)?;
        dir.finish()?;
        return Ok(());
    }
    match raster.sample {
        TestSample::Gray8 => {
            let mut image = encoder.new_image::<Gray8>(width, height)?;
            if let Some(rows) = raster.rows_per_strip {
                image.rows_per_strip(rows)?;
            }
            write_geo_tags(image.encoder(), raster)?;
            image.write_data(&as_u8(&raster.values))?;
        }
        TestSample::Rgb8 => {
            let mut image = encoder.new_image::<RGB8>(width, height)?;
            if let Some(rows) = raster.rows_per_strip {
                image.rows_per_strip(rows)?;
            }
            write_geo_tags(image.encoder(), raster)?;
            image.write_data(&as_u8(&raster.values))?;
        }
        TestSample::Float32 => {
            let data: Vec<f32> = raster.values.iter().map(|&v| v as f32).collect();
            let mut image = encoder.new_image::<Gray32Float>(width, height)?;
            if let Some(rows) = raster.rows_per_strip {
                image.rows_per_strip(rows)?;
            }
            write_geo_tags(image.encoder(), raster)?;
            image.write_data(&data)?;
        }
    }
    Ok(())
}

fn write_band_sequential<W: Write + Seek, K: TiffKind>(
    dir: &mut DirectoryEncoder<'_, W, K>,
    raster: &TestRaster,
    width: u32,
    height: u32,
) -> Result<()> {
    let bands = raster.bands();
    let interleaved = as_u8(&raster.values);
    let mut offsets = Vec::with_capacity(bands);
    let mut byte_counts = Vec::with_capacity(bands);
    for band in 0..bands {
        let plane: Vec<u8> = interleaved.iter().skip(band).step_by(bands).copied().collect();
        let offset = dir.write_data(plane.as_slice())?;
        offsets.push(u32::try_from(offset).map_err(|_| Error::validation("offset"))?);
        byte_counts.push(u32::try_from(plane.len()).map_err(|_| Error::validation("strip size"))?);
    }

    let band_count = u16::try_from(bands).map_err(|_| Error::validation("bands"))?;
    dir.write_tag(Tag::ImageWidth, width)?;
    dir.write_tag(Tag::ImageLength, height)?;
    dir.write_tag(Tag::BitsPerSample, vec![8u16; bands].as_slice())?;
    dir.write_tag(Tag::Compression, 1u16)?;
    dir.write_tag(Tag::PhotometricInterpretation, 2u16)?;
    dir.write_tag(Tag::SamplesPerPixel, band_count)?;
    dir.write_tag(Tag::RowsPerStrip, height)?;
    dir.write_tag(Tag::StripOffsets, offsets.as_slice())?;
    dir.write_tag(Tag::StripByteCounts, byte_counts.as_slice())?;
    dir.write_tag(Tag::PlanarConfiguration, 2u16)?;
    dir.write_tag(Tag::SampleFormat, vec![1u16; bands].as_slice())?;
    Ok(())
}
