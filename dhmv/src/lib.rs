//! Building height models for Flemish addresses.
//!
//! An address is resolved against the Basisregisters Vlaanderen or Geopunt,
//! located in the DHMV map sheet index, and the matching DSM and DTM rasters
//! are downloaded, cropped to the building footprint and subtracted. The
//! resulting height model can be rendered as a flat or 3D plot.
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use dhmv::{Address, Building, Config, ZoneIndex};
//!
//! # fn main() -> dhmv::Result<()> {
//! let config = Config::from_env()?;
//! let address = Address::new("Grote Markt", "1", Some("Antwerpen"), None, &config)?;
//! let zones = Arc::new(ZoneIndex::from_path(&config.zone_index_path, &config.zone_id_property)?);
//! let building = Building::from_config(address, zones, &config)?;
//! building.plot_3d(Some(Path::new("grote_markt.png")))?;
//! # Ok(())
//! # }
//! ```

pub mod collect;
pub mod commons;
pub mod error;
pub mod geo_core;
pub mod geometric;

pub use collect::transport::{HttpTransport, Transport};
pub use commons::config::Config;
pub use error::{DhmvError, ErrorKind, Result};
pub use geometric::address::{
    Address, AddressQuery, AddressResolver, AmbiguityPolicy, Footprint, ResolveAddress,
    StructuredAddress,
};
pub use geometric::building::Building;
pub use geometric::dhmv::{DhmvProduct, ModelType, RasterCache, RasterPair};
pub use geometric::height_model::{HeightModel, HeightModelBuilder, NegativeHeightPolicy};
pub use geometric::plot::{Figure, PlotKind, PlotOptions, Plotter};
pub use geometric::zone::{TileId, ZoneIndex};
