use std::path::PathBuf;

/// Basisregisters Vlaanderen REST API (addresses, building units, buildings)
pub const BASISREGISTERS_URL: &str = "https://api.basisregisters.vlaanderen.be/v1";

/// Geopunt location service (free-text geocoding)
pub const GEOPUNT_URL: &str = "https://loc.geopunt.be/geolocation/location";

/// Azure blob storage serving the DHMV raster archives
pub const DHMV_DOWNLOAD_URL: &str = "https://downloadagiv.blob.core.windows.net";

/// Local directory where the DHMV GeoTIFFs are cached
pub const TIFF_DATA_PATH: &str = "./tiff_data";

/// Kaartbladversnijdingen (map sheet zones) of the DHMV tiles
pub const ZONE_INDEX_PATH: &str = "./general_data/Kaartbladversnijdingen.zip";

/// Attribute of the zone index holding the zone number
pub const ZONE_ID_PROPERTY: &str = "CODE";

pub const DHMV_VERSION: &str = "II";
pub const DHMV_RESOLUTION: &str = "1m";

pub fn get_tiff_data_path() -> PathBuf {
    PathBuf::from(TIFF_DATA_PATH)
}
