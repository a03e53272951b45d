//! GeoTIFF access for the DHMV rasters.
//!
//! Only the strips or tiles that intersect the requested window are decoded,
//! so cropping a building out of a 1 m tile of a few hundred megabytes reads
//! a few kilobytes.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::Gray32Float;
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;
use tiff::{ColorType, TiffError};
use tracing::debug;

use crate::error::{DhmvError, Result};
use crate::geo_core::{BoundingBox, LAMBERT72_EPSG};

/// Tolerance, in pixels, when snapping coordinates to the grid
const SNAP_EPSILON: f64 = 1e-6;

/// North-up affine transform: pixel (0, 0) has its top-left corner at
/// (`origin_x`, `origin_y`); rows go south.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    /// Pixel size along x, in metres
    pub pixel_width: f64,
    /// Pixel size along y, positive even though rows go south
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        GeoTransform {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
        }
    }

    /// Centre of a pixel
    pub fn pixel_center(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.pixel_width,
            self.origin_y - (row as f64 + 0.5) * self.pixel_height,
        )
    }

    /// Extent of a `width` x `height` grid
    pub fn extent(&self, width: usize, height: usize) -> BoundingBox {
        BoundingBox::new(
            self.origin_x,
            self.origin_y - height as f64 * self.pixel_height,
            self.origin_x + width as f64 * self.pixel_width,
            self.origin_y,
        )
    }

    /// Pixel window covering `bbox`, snapped outward to whole pixels and
    /// clipped to a `width` x `height` grid. `None` when nothing overlaps.
    pub fn window(&self, bbox: &BoundingBox, width: usize, height: usize) -> Option<PixelWindow> {
        let col_start = ((bbox.min_x - self.origin_x) / self.pixel_width + SNAP_EPSILON).floor();
        let col_end = ((bbox.max_x - self.origin_x) / self.pixel_width - SNAP_EPSILON).ceil();
        let row_start = ((self.origin_y - bbox.max_y) / self.pixel_height + SNAP_EPSILON).floor();
        let row_end = ((self.origin_y - bbox.min_y) / self.pixel_height - SNAP_EPSILON).ceil();

        let col_start = col_start.max(0.0);
        let row_start = row_start.max(0.0);
        let col_end = col_end.min(width as f64);
        let row_end = row_end.min(height as f64);
        if col_end <= col_start || row_end <= row_start {
            return None;
        }
        Some(PixelWindow {
            col_off: col_start as usize,
            row_off: row_start as usize,
            width: (col_end - col_start) as usize,
            height: (row_end - row_start) as usize,
        })
    }

    /// Transform of a window cut out of this grid
    pub fn for_window(&self, window: &PixelWindow) -> GeoTransform {
        GeoTransform::new(
            self.origin_x + window.col_off as f64 * self.pixel_width,
            self.origin_y - window.row_off as f64 * self.pixel_height,
            self.pixel_width,
            self.pixel_height,
        )
    }

    /// Same grid within `tolerance` of a pixel
    pub fn is_aligned_with(&self, other: &GeoTransform, tolerance: f64) -> bool {
        let tol_x = tolerance * self.pixel_width.abs();
        let tol_y = tolerance * self.pixel_height.abs();
        (self.pixel_width - other.pixel_width).abs() <= tol_x
            && (self.pixel_height - other.pixel_height).abs() <= tol_y
            && (self.origin_x - other.origin_x).abs() <= tol_x
            && (self.origin_y - other.origin_y).abs() <= tol_y
    }
}

/// Rectangle of pixels in a raster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

/// An opened single-band GeoTIFF
pub struct RasterFile {
    path: PathBuf,
    /// Kept open so that windows decode lazily
    decoder: Decoder<BufReader<File>>,
    width: usize,
    height: usize,
    transform: GeoTransform,
    nodata: Option<f64>,
}

impl std::fmt::Debug for RasterFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterFile")
            .field("path", &self.path)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("transform", &self.transform)
            .field("nodata", &self.nodata)
            .finish()
    }
}

impl RasterFile {
    /// Open a GeoTIFF and read its georeferencing.
    /// Anything that is not a single-band GeoTIFF is a `CorruptRaster` error.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let corrupt = |reason: String| DhmvError::CorruptRaster {
            path: path.clone(),
            reason,
        };

        let file = File::open(&path)?;
        let mut limits = Limits::default();
        limits.decoding_buffer_size = 1024 * 1024 * 1024;
        limits.intermediate_buffer_size = 1024 * 1024 * 1024;
        let mut decoder = Decoder::new(BufReader::new(file))
            .map_err(|e| decode_error(&path, e))?
            .with_limits(limits);

        let (width, height) = decoder.dimensions().map_err(|e| decode_error(&path, e))?;
        match decoder.colortype().map_err(|e| decode_error(&path, e))? {
            ColorType::Gray(_) => {}
            other => return Err(corrupt(format!("expected a single band, found {:?}", other))),
        }

        let tiepoint = decoder
            .get_tag_f64_vec(Tag::ModelTiepointTag)
            .map_err(|_| corrupt("missing ModelTiepoint tag".to_string()))?;
        let scale = decoder
            .get_tag_f64_vec(Tag::ModelPixelScaleTag)
            .map_err(|_| corrupt("missing ModelPixelScale tag".to_string()))?;
        if tiepoint.len() < 6 || scale.len() < 2 || scale[0] <= 0.0 || scale[1] <= 0.0 {
            return Err(corrupt("invalid georeferencing tags".to_string()));
        }
        // tiepoint = [i, j, k, x, y, z]: raster point (i, j) sits at (x, y)
        let transform = GeoTransform::new(
            tiepoint[3] - tiepoint[0] * scale[0],
            tiepoint[4] + tiepoint[1] * scale[1],
            scale[0],
            scale[1],
        );

        let nodata = decoder
            .get_tag_ascii_string(Tag::GdalNodata)
            .ok()
            .and_then(|s| s.trim_matches(char::from(0)).trim().parse::<f64>().ok());

        debug!(path = %path.display(), width, height, ?transform, ?nodata, "Raster opened");
        Ok(RasterFile {
            path,
            decoder,
            width: width as usize,
            height: height as usize,
            transform,
            nodata,
        })
    }

    /// Open and decode the last strip or tile, which catches truncated files
    pub fn validate<P: AsRef<Path>>(path: P) -> Result<()> {
        let mut raster = Self::open(path)?;
        let chunks = raster.chunk_count();
        if chunks == 0 {
            return Err(raster.corrupt("no image data".to_string()));
        }
        raster
            .decoder
            .read_chunk(chunks - 1)
            .map_err(|e| decode_error(&raster.path, e))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn transform(&self) -> GeoTransform {
        self.transform
    }

    /// Value of the GDAL no-data tag, when present and numeric
    pub fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    pub fn extent(&self) -> BoundingBox {
        self.transform.extent(self.width, self.height)
    }

    /// Pixel window of this raster covering `bbox`
    pub fn window(&self, bbox: &BoundingBox) -> Option<PixelWindow> {
        self.transform.window(bbox, self.width, self.height)
    }

    /// Read a window, decoding only the chunks that intersect it.
    pub fn read_window(&mut self, window: &PixelWindow) -> Result<RasterGrid> {
        if window.width == 0
            || window.height == 0
            || window.col_off + window.width > self.width
            || window.row_off + window.height > self.height
        {
            return Err(DhmvError::InvalidInput(format!(
                "window {:?} outside a {}x{} raster",
                window, self.width, self.height
            )));
        }

        let (chunk_w, chunk_h) = self.decoder.chunk_dimensions();
        let (chunk_w, chunk_h) = (chunk_w as usize, chunk_h as usize);
        let chunks_across = self.width.div_ceil(chunk_w);

        let mut data = vec![f32::NAN; window.width * window.height];
        let first_chunk_col = window.col_off / chunk_w;
        let last_chunk_col = (window.col_off + window.width - 1) / chunk_w;
        let first_chunk_row = window.row_off / chunk_h;
        let last_chunk_row = (window.row_off + window.height - 1) / chunk_h;

        for chunk_row in first_chunk_row..=last_chunk_row {
            for chunk_col in first_chunk_col..=last_chunk_col {
                let index = (chunk_row * chunks_across + chunk_col) as u32;
                let (data_w, data_h) = self.decoder.chunk_data_dimensions(index);
                let chunk = self
                    .decoder
                    .read_chunk(index)
                    .map_err(|e| decode_error(&self.path, e))?;
                let chunk = to_f32(chunk);

                let x0 = chunk_col * chunk_w;
                let y0 = chunk_row * chunk_h;
                let col_from = window.col_off.max(x0);
                let col_to = (window.col_off + window.width).min(x0 + data_w as usize);
                let row_from = window.row_off.max(y0);
                let row_to = (window.row_off + window.height).min(y0 + data_h as usize);

                for row in row_from..row_to {
                    let src = (row - y0) * data_w as usize;
                    let dst = (row - window.row_off) * window.width;
                    for col in col_from..col_to {
                        data[dst + col - window.col_off] = chunk[src + col - x0];
                    }
                }
            }
        }

        Ok(RasterGrid {
            width: window.width,
            height: window.height,
            transform: self.transform.for_window(window),
            data,
            nodata: self.nodata,
        })
    }

    /// Read the whole raster
    pub fn read_all(&mut self) -> Result<RasterGrid> {
        let window = PixelWindow {
            col_off: 0,
            row_off: 0,
            width: self.width,
            height: self.height,
        };
        self.read_window(&window)
    }

    fn chunk_count(&self) -> u32 {
        let (chunk_w, chunk_h) = self.decoder.chunk_dimensions();
        if chunk_w == 0 || chunk_h == 0 {
            return 0;
        }
        (self.width.div_ceil(chunk_w as usize) * self.height.div_ceil(chunk_h as usize)) as u32
    }

    fn corrupt(&self, reason: String) -> DhmvError {
        DhmvError::CorruptRaster {
            path: self.path.clone(),
            reason,
        }
    }
}

/// Truncated or malformed data is a `CorruptRaster`; other read failures
/// stay I/O errors so that a valid file is not mistaken for a broken one.
fn decode_error(path: &Path, err: TiffError) -> DhmvError {
    match err {
        TiffError::IoError(e) if e.kind() != io::ErrorKind::UnexpectedEof => DhmvError::Io(e),
        other => DhmvError::CorruptRaster {
            path: path.to_path_buf(),
            reason: other.to_string(),
        },
    }
}

fn to_f32(result: DecodingResult) -> Vec<f32> {
    match result {
        DecodingResult::F32(data) => data,
        DecodingResult::F64(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I16(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I32(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U16(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U32(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U8(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I8(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U64(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I64(data) => data.into_iter().map(|v| v as f32).collect(),
    }
}

/// A georeferenced block of `f32` values, row-major, north row first
#[derive(Debug, Clone, PartialEq)]
pub struct RasterGrid {
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    pub data: Vec<f32>,
    pub nodata: Option<f64>,
}

impl RasterGrid {
    pub fn new(width: usize, height: usize, transform: GeoTransform, data: Vec<f32>) -> Result<Self> {
        if data.len() != width * height {
            return Err(DhmvError::InvalidInput(format!(
                "{} values for a {}x{} grid",
                data.len(),
                width,
                height
            )));
        }
        Ok(RasterGrid {
            width,
            height,
            transform,
            data,
            nodata: None,
        })
    }

    /// Mark `nodata` as the missing value
    pub fn with_nodata(mut self, nodata: Option<f64>) -> Self {
        self.nodata = nodata;
        self
    }

    /// Value at a pixel, `None` outside the grid
    pub fn get(&self, col: usize, row: usize) -> Option<f32> {
        (col < self.width && row < self.height).then(|| self.data[row * self.width + col])
    }

    /// Whether a value is missing (no-data or not finite)
    pub fn is_nodata(&self, value: f32) -> bool {
        !value.is_finite() || self.nodata.is_some_and(|nd| (value as f64 - nd).abs() < 1e-6)
    }

    /// Write as a Float32 GeoTIFF in Lambert 72
    pub fn write_geotiff<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let writer = BufWriter::new(File::create(path)?);
        let mut encoder = TiffEncoder::new(writer)?;
        let mut image = encoder.new_image::<Gray32Float>(self.width as u32, self.height as u32)?;

        let scale = [self.transform.pixel_width, self.transform.pixel_height, 0.0];
        image
            .encoder()
            .write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
        let tiepoint = [0.0, 0.0, 0.0, self.transform.origin_x, self.transform.origin_y, 0.0];
        image
            .encoder()
            .write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;
        // projected model, pixel is area, EPSG code
        #[rustfmt::skip]
        let geokeys: [u16; 16] = [
            1, 1, 0, 3,
            1024, 0, 1, 1,
            1025, 0, 1, 1,
            3072, 0, 1, LAMBERT72_EPSG as u16,
        ];
        image
            .encoder()
            .write_tag(Tag::GeoKeyDirectoryTag, &geokeys[..])?;
        let nodata = match self.nodata {
            Some(v) => v.to_string(),
            None => "nan".to_string(),
        };
        image
            .encoder()
            .write_tag(Tag::GdalNodata, nodata.as_str())?;

        image.write_data(&self.data)?;
        debug!(path = %path.display(), width = self.width, height = self.height, "GeoTIFF written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_grid() -> RasterGrid {
        let data: Vec<f32> = (0..40 * 30).map(|v| v as f32).collect();
        RasterGrid::new(40, 30, GeoTransform::new(1000.0, 2000.0, 1.0, 1.0), data)
            .unwrap()
            .with_nodata(Some(-9999.0))
    }

    #[test]
    fn test_window_snapping() {
        let transform = GeoTransform::new(1000.0, 2000.0, 1.0, 1.0);
        let window = transform
            .window(&BoundingBox::new(1002.5, 1990.0, 1005.0, 1997.2), 40, 30)
            .unwrap();
        assert_eq!(
            window,
            PixelWindow {
                col_off: 2,
                row_off: 2,
                width: 3,
                height: 8
            }
        );
        let sub = transform.for_window(&window);
        assert_relative_eq!(sub.origin_x, 1002.0);
        assert_relative_eq!(sub.origin_y, 1998.0);

        // clipped at the raster edge, empty outside
        let clipped = transform
            .window(&BoundingBox::new(990.0, 1995.0, 1001.0, 2010.0), 40, 30)
            .unwrap();
        assert_eq!((clipped.col_off, clipped.row_off, clipped.width, clipped.height), (0, 0, 1, 5));
        assert!(transform
            .window(&BoundingBox::new(0.0, 0.0, 10.0, 10.0), 40, 30)
            .is_none());
    }

    #[test]
    fn test_write_then_read_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.tif");
        let grid = sample_grid();
        grid.write_geotiff(&path).unwrap();

        let mut raster = RasterFile::open(&path).unwrap();
        assert_eq!((raster.width(), raster.height()), (40, 30));
        assert_eq!(raster.transform(), grid.transform);
        assert_eq!(raster.nodata(), Some(-9999.0));
        assert_eq!(raster.extent(), BoundingBox::new(1000.0, 1970.0, 1040.0, 2000.0));

        let window = PixelWindow {
            col_off: 5,
            row_off: 10,
            width: 4,
            height: 3,
        };
        let sub = raster.read_window(&window).unwrap();
        assert_eq!(sub.get(0, 0), grid.get(5, 10));
        assert_eq!(sub.get(3, 2), grid.get(8, 12));
        assert_eq!(sub.get(4, 0), None);
        assert_relative_eq!(sub.transform.origin_x, 1005.0);
        assert_relative_eq!(sub.transform.origin_y, 1990.0);

        assert_eq!(raster.read_all().unwrap().data, grid.data);
        assert!(RasterFile::validate(&path).is_ok());
    }

    #[test]
    fn test_not_a_geotiff() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.tif");
        std::fs::write(&path, b"definitely not a tiff").unwrap();
        assert!(matches!(
            RasterFile::open(&path),
            Err(DhmvError::CorruptRaster { .. })
        ));
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.tif");
        sample_grid().write_geotiff(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(matches!(
            RasterFile::validate(&path),
            Err(DhmvError::CorruptRaster { .. })
        ));
    }

    #[test]
    fn test_unreadable_path_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            RasterFile::open(dir.path().join("missing.tif")),
            Err(DhmvError::Io(_))
        ));
        // opens on Linux, but every read fails
        assert!(matches!(RasterFile::open(dir.path()), Err(DhmvError::Io(_))));
    }

    #[test]
    fn test_alignment_tolerance() {
        let a = GeoTransform::new(1000.0, 2000.0, 1.0, 1.0);
        assert!(a.is_aligned_with(&GeoTransform::new(1000.0 + 1e-9, 2000.0, 1.0, 1.0), 1e-6));
        assert!(!a.is_aligned_with(&GeoTransform::new(1000.5, 2000.0, 1.0, 1.0), 1e-6));
        assert!(!a.is_aligned_with(&GeoTransform::new(1000.0, 2000.0, 5.0, 5.0), 1e-6));
    }
}
