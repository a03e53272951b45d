use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::collect::global_variables::{
    get_tiff_data_path, BASISREGISTERS_URL, DHMV_DOWNLOAD_URL, DHMV_RESOLUTION, DHMV_VERSION,
    GEOPUNT_URL, ZONE_ID_PROPERTY, ZONE_INDEX_PATH,
};
use crate::error::{DhmvError, Result};

/// Runtime configuration of the pipeline.
///
/// Every field has a default; `from_env` overrides them with `DHMV_*`
/// environment variables and `from_json_file` with a JSON document whose
/// keys are the field names (missing keys keep their default).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub basisregisters_url: String,
    pub geopunt_url: String,
    pub download_url: String,
    /// Directory of the cached DHMV GeoTIFFs
    pub cache_dir: PathBuf,
    /// Zone index (GeoJSON, zip or shapefile)
    pub zone_index_path: PathBuf,
    pub zone_id_property: String,
    pub dhmv_version: String,
    pub resolution: String,
    /// Timeout for API calls, in seconds
    pub http_timeout_secs: u64,
    /// Timeout for raster archive downloads, in seconds
    pub download_timeout_secs: u64,
    /// Margin around the footprint when cropping, in metres
    pub margin: f64,
    /// Half side of the square footprint used when no building geometry is known
    pub fallback_half_size: f64,
    pub show_progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            basisregisters_url: BASISREGISTERS_URL.to_string(),
            geopunt_url: GEOPUNT_URL.to_string(),
            download_url: DHMV_DOWNLOAD_URL.to_string(),
            cache_dir: get_tiff_data_path(),
            zone_index_path: PathBuf::from(ZONE_INDEX_PATH),
            zone_id_property: ZONE_ID_PROPERTY.to_string(),
            dhmv_version: DHMV_VERSION.to_string(),
            resolution: DHMV_RESOLUTION.to_string(),
            http_timeout_secs: 30,
            download_timeout_secs: 600,
            margin: 2.0,
            fallback_half_size: 10.0,
            show_progress: true,
        }
    }
}

impl Config {
    /// Defaults overridden by `DHMV_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Defaults overridden by the `DHMV_*` values that `lookup` returns.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(v) = lookup("DHMV_BASISREGISTERS_URL") {
            config.basisregisters_url = v;
        }
        if let Some(v) = lookup("DHMV_GEOPUNT_URL") {
            config.geopunt_url = v;
        }
        if let Some(v) = lookup("DHMV_DOWNLOAD_URL") {
            config.download_url = v;
        }
        if let Some(v) = lookup("DHMV_CACHE_DIR") {
            config.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("DHMV_ZONE_INDEX") {
            config.zone_index_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("DHMV_ZONE_ID_PROPERTY") {
            config.zone_id_property = v;
        }
        if let Some(v) = lookup("DHMV_VERSION") {
            config.dhmv_version = v;
        }
        if let Some(v) = lookup("DHMV_RESOLUTION") {
            config.resolution = v;
        }
        config.http_timeout_secs = parse_var(&lookup, "DHMV_HTTP_TIMEOUT", config.http_timeout_secs)?;
        config.download_timeout_secs =
            parse_var(&lookup, "DHMV_DOWNLOAD_TIMEOUT", config.download_timeout_secs)?;
        config.margin = parse_var(&lookup, "DHMV_MARGIN", config.margin)?;
        config.show_progress = lookup("DHMV_PROGRESS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(config.show_progress);

        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.margin >= 0.0 && self.margin.is_finite()) {
            return Err(DhmvError::InvalidInput(format!(
                "margin must be a non-negative number, got {}",
                self.margin
            )));
        }
        if !(self.fallback_half_size > 0.0 && self.fallback_half_size.is_finite()) {
            return Err(DhmvError::InvalidInput(format!(
                "fallback_half_size must be positive, got {}",
                self.fallback_half_size
            )));
        }
        if self.http_timeout_secs == 0 || self.download_timeout_secs == 0 {
            return Err(DhmvError::InvalidInput(
                "timeouts must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T> {
    match lookup(name) {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| DhmvError::InvalidInput(format!("{} has an invalid value: {}", name, v))),
        None => Ok(default),
    }
}
