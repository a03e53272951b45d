//! The per-address entry point of the pipeline.

use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use crate::commons::config::Config;
use crate::error::Result;
use crate::geometric::address::Address;
use crate::geometric::dhmv::{RasterCache, RasterPair};
use crate::geometric::height_model::{HeightModel, HeightModelBuilder};
use crate::geometric::plot::{Figure, PlotKind, PlotOptions, Plotter};
use crate::geometric::zone::{TileId, ZoneIndex};

/// A resolved address together with its DHMV tile and height model.
///
/// The tile and the height model are derived on first access and kept for
/// the lifetime of the building; the address never changes, so they are
/// never recomputed.
pub struct Building {
    address: Address,
    /// Shared between buildings
    zone_index: Arc<ZoneIndex>,
    cache: RasterCache,
    builder: HeightModelBuilder,
    plotter: Plotter,
    /// Set by the first successful `tile_id`
    tile: OnceLock<TileId>,
    /// Set by the first successful `height_model`
    height_model: OnceLock<HeightModel>,
}

impl Building {
    /// Create a building; nothing is located or downloaded until first use
    pub fn new(address: Address, zone_index: Arc<ZoneIndex>, cache: RasterCache) -> Self {
        Building {
            address,
            zone_index,
            cache,
            builder: HeightModelBuilder::new(),
            plotter: Plotter::new(),
            tile: OnceLock::new(),
            height_model: OnceLock::new(),
        }
    }

    /// Building with an HTTP backed raster cache and the configured margin
    pub fn from_config(address: Address, zone_index: Arc<ZoneIndex>, config: &Config) -> Result<Self> {
        let cache = RasterCache::from_config(config)?;
        Ok(Self::new(address, zone_index, cache).with_builder(HeightModelBuilder::from_config(config)))
    }

    pub fn with_builder(mut self, builder: HeightModelBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_plot_options(mut self, options: PlotOptions) -> Self {
        self.plotter = Plotter::with_options(options);
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn zone_index(&self) -> &Arc<ZoneIndex> {
        &self.zone_index
    }

    /// Zone containing the address position
    pub fn tile_id(&self) -> Result<&TileId> {
        if let Some(tile) = self.tile.get() {
            return Ok(tile);
        }
        let (x, y) = self.address.lambert();
        let tile = self.zone_index.locate(x, y)?;
        debug!(address = %self.address, %tile, "Tile located");
        Ok(self.tile.get_or_init(|| tile))
    }

    /// Local DSM and DTM files, downloaded when missing
    pub fn raster_pair(&self) -> Result<RasterPair> {
        let tile = self.tile_id()?;
        self.cache.ensure(tile)
    }

    /// Height above ground over the footprint, built on first call.
    /// A cached raster that fails to decode is downloaded again once.
    pub fn height_model(&self) -> Result<&HeightModel> {
        if let Some(model) = self.height_model.get() {
            return Ok(model);
        }
        let tile = self.tile_id()?;
        let model = self
            .cache
            .read_pair(tile, |pair| self.builder.build(pair, self.address.footprint()))?;
        info!(
            address = %self.address,
            width = model.width(),
            height = model.height(),
            max = ?model.max(),
            "Height model ready"
        );
        Ok(self.height_model.get_or_init(|| model))
    }

    /// Render the height model, saving a PNG when `path` is given
    pub fn plot(&self, kind: PlotKind, path: Option<&Path>) -> Result<Figure> {
        let figure = self.plotter.plot(self.height_model()?, kind)?;
        if let Some(path) = path {
            figure.save(path)?;
        }
        Ok(figure)
    }

    pub fn plot_3d(&self, path: Option<&Path>) -> Result<Figure> {
        self.plot(PlotKind::Surface3d, path)
    }

    pub fn plot_flat(&self, path: Option<&Path>) -> Result<Figure> {
        self.plot(PlotKind::Flat, path)
    }
}
