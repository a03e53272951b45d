/// Example: resolve an address through both geocoding backends
///
/// cargo run --example lookup_address -- "Kerkstraat 1, 9000 Gent"
use anyhow::Result;
use dhmv::{Address, Config, ZoneIndex};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    let query = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Grote Markt 1, 2000 Antwerpen".to_string());

    println!("=== Free-text search (Geopunt) ===");
    let found = Address::from_search(&query, &config)?;
    println!("{}", found);
    println!("  Lambert 72: {:?}", found.lambert());
    println!("  Geopunt id: {:?}", found.geopunt_id());

    println!("\n=== Registry lookup (Basisregisters) ===");
    let address = Address::new(
        found.street(),
        found.number(),
        None,
        Some(found.zipcode()),
        &config,
    )?;
    println!("{}", address);
    println!("  Registry id: {:?}", address.basisregisters_id());
    println!("  Building units: {:?}", address.building_units());
    println!(
        "  Footprint: {:.1} m² ({})",
        address.footprint().area(),
        if address.footprint().is_synthetic() {
            "synthetic"
        } else {
            "building geometry"
        }
    );

    if config.zone_index_path.exists() {
        let zones = ZoneIndex::from_path(&config.zone_index_path, &config.zone_id_property)?;
        let (x, y) = address.lambert();
        println!("  DHMV zone: {}", zones.locate(x, y)?);
    }

    Ok(())
}
