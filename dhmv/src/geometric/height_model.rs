//! Height above ground (DSM - DTM) around a building footprint.

use geo::{Intersects, Point};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::commons::config::Config;
use crate::error::{DhmvError, Result};
use crate::geo_core::BoundingBox;
use crate::geometric::address::Footprint;
use crate::geometric::dhmv::RasterPair;
use crate::geometric::raster::{GeoTransform, RasterFile, RasterGrid};

/// Grids are aligned when origins and pixel sizes agree within this fraction of a pixel
const ALIGNMENT_TOLERANCE: f64 = 1e-6;

/// Fraction of a pixel a footprint may stick out of the raster
const EDGE_TOLERANCE: f64 = 1e-6;

/// What to do with pixels where the terrain lies above the surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegativeHeightPolicy {
    /// Set to 0.0
    #[default]
    Clamp,
    /// Set to no-data
    Flag,
    /// Keep the negative difference
    Keep,
}

/// Crops the surface and terrain rasters to a footprint and subtracts them
#[derive(Debug, Clone)]
pub struct HeightModelBuilder {
    /// Metres added around the footprint bounding box
    margin: f64,
    /// Blank out pixels outside the footprint
    mask: bool,
    policy: NegativeHeightPolicy,
}

impl Default for HeightModelBuilder {
    fn default() -> Self {
        HeightModelBuilder {
            margin: 2.0,
            mask: true,
            policy: NegativeHeightPolicy::default(),
        }
    }
}

impl HeightModelBuilder {
    /// Builder with a 2 m margin, masking on and negative heights clamped
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder using the configured margin
    pub fn from_config(config: &Config) -> Self {
        Self::default().with_margin(config.margin)
    }

    /// Margin around the footprint bounding box, in metres
    pub fn with_margin(mut self, margin: f64) -> Self {
        self.margin = margin;
        self
    }

    /// Set pixels whose centre lies outside the footprint to no-data
    pub fn with_mask(mut self, mask: bool) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_policy(mut self, policy: NegativeHeightPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn margin(&self) -> f64 {
        self.margin
    }

    /// Read the footprint region from both rasters and build the height model
    pub fn build(&self, pair: &RasterPair, footprint: &Footprint) -> Result<HeightModel> {
        if !(self.margin >= 0.0 && self.margin.is_finite()) {
            return Err(DhmvError::InvalidInput(format!(
                "margin must be a non-negative number, got {}",
                self.margin
            )));
        }
        let footprint_box = footprint
            .bbox()
            .ok_or_else(|| DhmvError::InvalidInput("empty footprint".to_string()))?;
        let region = footprint_box.expand(self.margin);
        debug!(?region, tile = %pair.tile, "Cropping rasters");

        let mut surface = RasterFile::open(&pair.surface)?;
        let mut terrain = RasterFile::open(&pair.terrain)?;

        let (cx, cy) = region.center();
        let out_of_coverage = || DhmvError::OutOfCoverage { x: cx, y: cy };
        // a footprint across the tile edge would lose part of the building;
        // only the margin may be clipped
        for raster in [&surface, &terrain] {
            let extent = raster.extent();
            let tolerance = EDGE_TOLERANCE * raster.transform().pixel_width;
            if !extent.contains_box(&footprint_box, tolerance) {
                warn!(
                    path = %raster.path().display(),
                    ?extent,
                    footprint = ?footprint_box,
                    "Footprint extends beyond the raster"
                );
                return Err(out_of_coverage());
            }
        }
        let surface_window = surface.window(&region).ok_or_else(out_of_coverage)?;
        let terrain_window = terrain.window(&region).ok_or_else(out_of_coverage)?;

        check_alignment(
            &surface.transform().for_window(&surface_window),
            (surface_window.width, surface_window.height),
            &terrain.transform().for_window(&terrain_window),
            (terrain_window.width, terrain_window.height),
        )?;

        let surface = surface.read_window(&surface_window)?;
        let terrain = terrain.read_window(&terrain_window)?;
        self.from_grids(&surface, &terrain, Some(footprint))
    }

    /// Subtract two aligned grids, masking with `footprint` when masking is on
    pub fn from_grids(
        &self,
        surface: &RasterGrid,
        terrain: &RasterGrid,
        footprint: Option<&Footprint>,
    ) -> Result<HeightModel> {
        check_alignment(
            &surface.transform,
            (surface.width, surface.height),
            &terrain.transform,
            (terrain.width, terrain.height),
        )?;

        let transform = surface.transform;
        let mask = footprint.filter(|_| self.mask);
        let mut data = Vec::with_capacity(surface.data.len());
        let mut negative_count = 0usize;

        for row in 0..surface.height {
            for col in 0..surface.width {
                let i = row * surface.width + col;
                let (s, t) = (surface.data[i], terrain.data[i]);

                if surface.is_nodata(s) || terrain.is_nodata(t) {
                    data.push(f32::NAN);
                    continue;
                }
                if let Some(footprint) = mask {
                    let (x, y) = transform.pixel_center(col, row);
                    if !footprint.polygons().intersects(&Point::new(x, y)) {
                        data.push(f32::NAN);
                        continue;
                    }
                }

                let height = s - t;
                if height < 0.0 {
                    negative_count += 1;
                    data.push(match self.policy {
                        NegativeHeightPolicy::Clamp => 0.0,
                        NegativeHeightPolicy::Flag => f32::NAN,
                        NegativeHeightPolicy::Keep => height,
                    });
                } else {
                    data.push(height);
                }
            }
        }

        if negative_count > 0 {
            warn!(
                negative_count,
                policy = ?self.policy,
                "Terrain above surface for some pixels"
            );
        }

        let grid = RasterGrid::new(surface.width, surface.height, transform, data)?;
        let model = HeightModel {
            grid,
            negative_count,
            policy: self.policy,
        };
        info!(
            width = model.width(),
            height = model.height(),
            valid = model.valid_values().count(),
            max = ?model.max(),
            "Height model built"
        );
        Ok(model)
    }
}

fn check_alignment(
    surface: &GeoTransform,
    surface_size: (usize, usize),
    terrain: &GeoTransform,
    terrain_size: (usize, usize),
) -> Result<()> {
    if !surface.is_aligned_with(terrain, ALIGNMENT_TOLERANCE) {
        return Err(DhmvError::MisalignedGrids(format!(
            "surface {:?} vs terrain {:?}",
            surface, terrain
        )));
    }
    if surface_size != terrain_size {
        return Err(DhmvError::MisalignedGrids(format!(
            "surface is {}x{}, terrain is {}x{}",
            surface_size.0, surface_size.1, terrain_size.0, terrain_size.1
        )));
    }
    Ok(())
}

/// Object heights above the terrain; missing pixels are `NaN`
#[derive(Debug, Clone)]
pub struct HeightModel {
    /// Heights in metres on the surface raster grid
    grid: RasterGrid,
    negative_count: usize,
    /// Policy the negative pixels were handled with
    policy: NegativeHeightPolicy,
}

impl HeightModel {
    pub fn width(&self) -> usize {
        self.grid.width
    }

    pub fn height(&self) -> usize {
        self.grid.height
    }

    pub fn transform(&self) -> GeoTransform {
        self.grid.transform
    }

    pub fn grid(&self) -> &RasterGrid {
        &self.grid
    }

    /// Row-major values, north row first
    pub fn data(&self) -> &[f32] {
        &self.grid.data
    }

    pub fn get(&self, col: usize, row: usize) -> Option<f32> {
        self.grid.get(col, row)
    }

    /// Every height that is not no-data
    pub fn valid_values(&self) -> impl Iterator<Item = f32> + '_ {
        self.grid.data.iter().copied().filter(|v| v.is_finite())
    }

    pub fn min(&self) -> Option<f32> {
        self.valid_values().reduce(f32::min)
    }

    pub fn max(&self) -> Option<f32> {
        self.valid_values().reduce(f32::max)
    }

    /// Mean of the valid heights, accumulated in `f64`
    pub fn mean(&self) -> Option<f32> {
        let (sum, count) = self
            .valid_values()
            .fold((0.0f64, 0usize), |(sum, count), v| (sum + v as f64, count + 1));
        (count > 0).then(|| (sum / count as f64) as f32)
    }

    /// Pixel-centre x coordinates, west to east
    pub fn x_coords(&self) -> Vec<f64> {
        (0..self.width())
            .map(|col| self.grid.transform.pixel_center(col, 0).0)
            .collect()
    }

    /// Pixel-centre y coordinates, north to south
    pub fn y_coords(&self) -> Vec<f64> {
        (0..self.height())
            .map(|row| self.grid.transform.pixel_center(0, row).1)
            .collect()
    }

    /// Extent covered by the model
    pub fn bbox(&self) -> BoundingBox {
        self.grid.transform.extent(self.width(), self.height())
    }

    /// Pixels where the terrain was above the surface
    pub fn negative_count(&self) -> usize {
        self.negative_count
    }

    pub fn policy(&self) -> NegativeHeightPolicy {
        self.policy
    }

    /// Save as a Float32 GeoTIFF, no-data written as NaN
    pub fn write_geotiff<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.grid.write_geotiff(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometric::zone::TileId;
    use approx::assert_relative_eq;
    use geo::MultiPolygon;

    const ORIGIN: (f64, f64) = (152_000.0, 212_020.0);

    fn grid(origin_x: f64, values: impl Fn(usize, usize) -> f32) -> RasterGrid {
        let data = (0..20 * 20).map(|i| values(i % 20, i / 20)).collect();
        RasterGrid::new(20, 20, GeoTransform::new(origin_x, ORIGIN.1, 1.0, 1.0), data).unwrap()
    }

    fn terrain_value(col: usize, row: usize) -> f32 {
        10.0 + col as f32 * 0.1 + row as f32 * 0.05
    }

    fn footprint() -> Footprint {
        Footprint::new(MultiPolygon(vec![BoundingBox::new(
            152_005.0, 212_005.0, 152_010.0, 212_010.0,
        )
        .to_polygon()]))
    }

    fn write_pair(dir: &Path, surface: &RasterGrid, terrain: &RasterGrid) -> RasterPair {
        let pair = RasterPair {
            tile: TileId::new("15").unwrap(),
            surface: dir.join("dsm.tif"),
            terrain: dir.join("dtm.tif"),
        };
        surface.write_geotiff(&pair.surface).unwrap();
        terrain.write_geotiff(&pair.terrain).unwrap();
        pair
    }

    #[test]
    fn test_constant_offset_inside_footprint() {
        let dir = tempfile::tempdir().unwrap();
        let terrain = grid(ORIGIN.0, terrain_value);
        let surface = grid(ORIGIN.0, |c, r| terrain_value(c, r) + 5.0);
        let pair = write_pair(dir.path(), &surface, &terrain);

        let model = HeightModelBuilder::new().build(&pair, &footprint()).unwrap();
        // 5 m footprint + 2 m margin on both sides
        assert_eq!((model.width(), model.height()), (9, 9));
        assert_eq!(model.valid_values().count(), 25);
        for v in model.valid_values() {
            assert_relative_eq!(v, 5.0, epsilon = 1e-4);
        }
        assert!(model.get(0, 0).unwrap().is_nan());
        assert_relative_eq!(model.mean().unwrap(), 5.0, epsilon = 1e-4);
        assert_eq!(model.negative_count(), 0);
        assert_relative_eq!(model.x_coords()[0], 152_003.5);
        assert_relative_eq!(model.y_coords()[0], 212_011.5);

        let unmasked = HeightModelBuilder::new()
            .with_mask(false)
            .build(&pair, &footprint())
            .unwrap();
        assert_eq!(unmasked.valid_values().count(), 81);
    }

    #[test]
    fn test_misaligned_grids() {
        let dir = tempfile::tempdir().unwrap();
        let terrain = grid(ORIGIN.0 + 0.5, terrain_value);
        let surface = grid(ORIGIN.0, |c, r| terrain_value(c, r) + 5.0);
        let pair = write_pair(dir.path(), &surface, &terrain);

        assert!(matches!(
            HeightModelBuilder::new().build(&pair, &footprint()),
            Err(DhmvError::MisalignedGrids(_))
        ));
    }

    #[test]
    fn test_footprint_outside_rasters() {
        let dir = tempfile::tempdir().unwrap();
        let terrain = grid(ORIGIN.0, terrain_value);
        let pair = write_pair(dir.path(), &terrain, &terrain);
        let far = Footprint::synthetic(Point::new(0.0, 0.0), 10.0);

        assert!(matches!(
            HeightModelBuilder::new().build(&pair, &far),
            Err(DhmvError::OutOfCoverage { .. })
        ));
    }

    #[test]
    fn test_footprint_across_raster_edge() {
        let dir = tempfile::tempdir().unwrap();
        let terrain = grid(ORIGIN.0, terrain_value);
        let pair = write_pair(dir.path(), &terrain, &terrain);

        // three quarters of the building lie east of the tile
        let straddling = Footprint::new(MultiPolygon(vec![BoundingBox::new(
            152_015.0, 212_005.0, 152_030.0, 212_010.0,
        )
        .to_polygon()]));
        assert!(matches!(
            HeightModelBuilder::new().build(&pair, &straddling),
            Err(DhmvError::OutOfCoverage { .. })
        ));

        // flush with the edge: only the margin is clipped
        let flush = Footprint::new(MultiPolygon(vec![BoundingBox::new(
            152_015.0, 212_005.0, 152_020.0, 212_010.0,
        )
        .to_polygon()]));
        let model = HeightModelBuilder::new().build(&pair, &flush).unwrap();
        assert_eq!((model.width(), model.height()), (7, 9));
        assert_eq!(model.valid_values().count(), 25);
    }

    #[test]
    fn test_negative_height_policy() {
        let surface = grid(ORIGIN.0, |_, _| 1.0);
        let terrain = grid(ORIGIN.0, |c, _| if c == 0 { 3.0 } else { 0.5 });

        let clamp = HeightModelBuilder::new()
            .from_grids(&surface, &terrain, None)
            .unwrap();
        assert_eq!(clamp.negative_count(), 20);
        assert_eq!(clamp.get(0, 0), Some(0.0));
        assert_eq!(clamp.get(1, 0), Some(0.5));

        let flag = HeightModelBuilder::new()
            .with_policy(NegativeHeightPolicy::Flag)
            .from_grids(&surface, &terrain, None)
            .unwrap();
        assert!(flag.get(0, 0).unwrap().is_nan());
        assert_eq!(flag.valid_values().count(), 380);

        let keep = HeightModelBuilder::new()
            .with_policy(NegativeHeightPolicy::Keep)
            .from_grids(&surface, &terrain, None)
            .unwrap();
        assert_eq!(keep.min(), Some(-2.0));
        assert_eq!(keep.policy(), NegativeHeightPolicy::Keep);
    }

    #[test]
    fn test_nodata_propagates() {
        let surface = grid(ORIGIN.0, |c, r| if (c, r) == (3, 4) { -9999.0 } else { 12.0 })
            .with_nodata(Some(-9999.0));
        let terrain = grid(ORIGIN.0, |_, _| 10.0);
        let model = HeightModelBuilder::new()
            .from_grids(&surface, &terrain, None)
            .unwrap();
        assert!(model.get(3, 4).unwrap().is_nan());
        assert_eq!(model.max(), Some(2.0));
        assert_eq!(model.valid_values().count(), 399);
    }
}
