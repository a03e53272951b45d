/// Example: full pipeline from an address to a 3D and a flat height plot
///
/// The zone index is read from `DHMV_ZONE_INDEX` (default
/// ./general_data/Kaartbladversnijdingen.zip) and rasters are cached in
/// `DHMV_CACHE_DIR` (default ./tiff_data).
use anyhow::Result;
use dhmv::{Address, Building, Config, ZoneIndex};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    let address = Address::new("Sint-Pietersnieuwstraat", "33", Some("Gent"), None, &config)?;
    println!("Address: {}", address);

    let zones = Arc::new(ZoneIndex::from_path(
        &config.zone_index_path,
        &config.zone_id_property,
    )?);
    println!("Zones loaded: {}", zones.len());

    let building = Building::from_config(address, zones, &config)?;
    println!("Tile: {}", building.tile_id()?);

    let model = building.height_model()?;
    println!(
        "Height model: {}x{} pixels, max {:.2} m, mean {:.2} m, {} negative pixels",
        model.width(),
        model.height(),
        model.max().unwrap_or(f32::NAN),
        model.mean().unwrap_or(f32::NAN),
        model.negative_count()
    );

    std::fs::create_dir_all("./output")?;
    building.plot_3d(Some(Path::new("./output/building_3d.png")))?;
    building.plot_flat(Some(Path::new("./output/building_flat.png")))?;
    model.write_geotiff("./output/building_chm.tif")?;
    println!("Plots written to ./output");

    Ok(())
}
