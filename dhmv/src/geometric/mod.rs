//! Address, tile, raster and height model types, from a query to a plot.

pub mod address;
pub mod building;
pub mod dhmv;
pub mod height_model;
pub mod plot;
pub mod raster;
pub mod zone;
