//! Digitaal Hoogtemodel Vlaanderen products and their local cache.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::collect::global_variables::{DHMV_DOWNLOAD_URL, DHMV_RESOLUTION, DHMV_VERSION};
use crate::collect::transport::{HttpTransport, Transport};
use crate::commons::config::Config;
use crate::error::{DhmvError, Result};
use crate::geometric::raster::RasterFile;
use crate::geometric::zone::TileId;

/// Surface (DSM) or terrain (DTM) model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    /// Digital surface model: ground plus buildings and vegetation
    Dsm,
    /// Digital terrain model: bare ground
    Dtm,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Dsm => "DSM",
            ModelType::Dtm => "DTM",
        }
    }

    /// DSM for DTM and the other way round
    pub fn complement(&self) -> ModelType {
        match self {
            ModelType::Dsm => ModelType::Dtm,
            ModelType::Dtm => ModelType::Dsm,
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = DhmvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DSM" => Ok(ModelType::Dsm),
            "DTM" => Ok(ModelType::Dtm),
            other => Err(DhmvError::InvalidInput(format!(
                "model type must be DSM or DTM, got '{}'",
                other
            ))),
        }
    }
}

/// One downloadable DHMV raster: version, model type, resolution and zone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhmvProduct {
    zone: String,
    model_type: ModelType,
    resolution: String,
    version: String,
    download_base: String,
}

impl DhmvProduct {
    /// Product of the default version and resolution
    pub fn new(zone: impl Into<String>, model_type: ModelType) -> Self {
        DhmvProduct {
            zone: zone.into(),
            model_type,
            resolution: DHMV_RESOLUTION.to_string(),
            version: DHMV_VERSION.to_string(),
            download_base: DHMV_DOWNLOAD_URL.to_string(),
        }
    }

    pub fn for_tile(tile: &TileId, model_type: ModelType) -> Self {
        Self::new(tile.as_str(), model_type)
    }

    /// Product with the version, resolution and download base of `config`
    pub fn from_config(tile: &TileId, model_type: ModelType, config: &Config) -> Self {
        Self::for_tile(tile, model_type)
            .with_version(&config.dhmv_version)
            .with_resolution(&config.resolution)
            .with_download_base(&config.download_url)
    }

    pub fn with_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = resolution.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_download_base(mut self, base: impl Into<String>) -> Self {
        self.download_base = base.into();
        self
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    pub fn resolution(&self) -> &str {
        &self.resolution
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// `DHMV{version}{type}RAS{resolution}_k{zone}{extension}`
    pub fn file_name(&self, extension: &str) -> String {
        format!(
            "DHMV{}{}RAS{}_k{}{}",
            self.version, self.model_type, self.resolution, self.zone, extension
        )
    }

    pub fn tif_name(&self) -> String {
        self.file_name(".tif")
    }

    /// Link to the zip archive holding this product
    pub fn download_link(&self) -> String {
        format!(
            "{}/dhm-vlaanderen-{}-{}-raster-{}/{}",
            self.download_base.trim_end_matches('/'),
            self.version.to_lowercase(),
            self.model_type.as_str().to_lowercase(),
            self.resolution,
            self.file_name(".zip")
        )
    }

    /// The other model type of the same zone
    pub fn complement(&self) -> DhmvProduct {
        DhmvProduct {
            model_type: self.model_type.complement(),
            ..self.clone()
        }
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.tif_name())
    }

    pub fn is_downloaded(&self, dir: &Path) -> bool {
        self.path_in(dir).exists()
    }
}

impl fmt::Display for DhmvProduct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tif_name())
    }
}

/// Parts of an existing DHMV file name such as `DHMVIIDSMRAS1m_k15.tif`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhmvFileName {
    pub version: String,
    pub model_type: ModelType,
    pub resolution: String,
    pub zone: String,
}

impl DhmvFileName {
    /// Parse a GeoTIFF name; `None` for anything that is not a DHMV raster
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix("DHMV")?;
        let stem = rest
            .strip_suffix(".tif")
            .or_else(|| rest.strip_suffix(".TIF"))?;

        let type_at = stem.find("DSM").or_else(|| stem.find("DTM"))?;
        let version = &stem[..type_at];
        if version.is_empty() || !version.chars().all(|c| matches!(c, 'I' | 'V' | 'X')) {
            return None;
        }
        let model_type: ModelType = stem[type_at..type_at + 3].parse().ok()?;

        let rest = stem[type_at + 3..].strip_prefix("RAS")?;
        let (resolution, zone) = rest.split_once("_k")?;
        let numeric = resolution.strip_suffix('m')?;
        if numeric.is_empty() || !numeric.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        if zone.len() != 2 || !zone.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }

        Some(DhmvFileName {
            version: version.to_string(),
            model_type,
            resolution: resolution.to_string(),
            zone: zone.to_string(),
        })
    }

    pub fn tile_id(&self) -> Result<TileId> {
        TileId::new(&self.zone)
    }
}

/// Local surface and terrain GeoTIFFs of one zone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterPair {
    pub tile: TileId,
    /// DSM GeoTIFF
    pub surface: PathBuf,
    /// DTM GeoTIFF
    pub terrain: PathBuf,
}

impl RasterPair {
    /// Whether `path` is the surface or the terrain file
    pub fn contains(&self, path: &Path) -> bool {
        self.surface == path || self.terrain == path
    }
}

/// On-disk cache of DHMV GeoTIFFs, filled on demand from the download service.
///
/// Files are never evicted for space. A cached file that does not open as a
/// GeoTIFF, or that fails to decode while being read, is removed and
/// downloaded again.
pub struct RasterCache {
    cache_dir: PathBuf,
    version: String,
    resolution: String,
    download_base: String,
    transport: Arc<dyn Transport>,
}

impl RasterCache {
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Self {
        RasterCache {
            cache_dir: config.cache_dir.clone(),
            version: config.dhmv_version.clone(),
            resolution: config.resolution.clone(),
            download_base: config.download_url.clone(),
            transport,
        }
    }

    /// Cache downloading over HTTP
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config, Arc::new(HttpTransport::from_config(config)?)))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn product(&self, tile: &TileId, model_type: ModelType) -> DhmvProduct {
        DhmvProduct::for_tile(tile, model_type)
            .with_version(&self.version)
            .with_resolution(&self.resolution)
            .with_download_base(&self.download_base)
    }

    /// Local paths of the DSM and DTM of a zone, downloading what is missing
    pub fn ensure(&self, tile: &TileId) -> Result<RasterPair> {
        let surface = self.ensure_product(&self.product(tile, ModelType::Dsm))?;
        let terrain = self.ensure_product(&self.product(tile, ModelType::Dtm))?;
        Ok(RasterPair {
            tile: tile.clone(),
            surface,
            terrain,
        })
    }

    /// Local path of one product, downloading it when missing or invalid
    pub fn ensure_product(&self, product: &DhmvProduct) -> Result<PathBuf> {
        let path = product.path_in(&self.cache_dir);
        if self.is_cached(&path)? {
            debug!(path = %path.display(), "Cache hit");
            return Ok(path);
        }
        info!(product = %product, "Cache miss");
        self.download(product, &path)?;
        Ok(path)
    }

    /// Run `read` on the rasters of a zone. When a cached file turns out to
    /// be corrupt while reading, it is evicted and the read is retried once
    /// on a fresh download.
    pub fn read_pair<T>(
        &self,
        tile: &TileId,
        mut read: impl FnMut(&RasterPair) -> Result<T>,
    ) -> Result<T> {
        let pair = self.ensure(tile)?;
        match read(&pair) {
            Err(DhmvError::CorruptRaster { path, reason }) if pair.contains(&path) => {
                warn!(path = %path.display(), %reason, "Corrupt cached raster evicted");
                self.evict(&path)?;
                let pair = self.ensure(tile)?;
                read(&pair)
            }
            other => other,
        }
    }

    /// Remove a cached file; a file that is already gone is fine
    pub fn evict(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// DHMV files present in the cache directory
    pub fn cached_products(&self) -> Result<Vec<DhmvFileName>> {
        let entries = match fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut products = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(parsed) = entry.file_name().to_str().and_then(DhmvFileName::parse) {
                products.push(parsed);
            }
        }
        products.sort_by(|a, b| {
            (&a.zone, a.model_type.as_str()).cmp(&(&b.zone, b.model_type.as_str()))
        });
        Ok(products)
    }

    fn is_cached(&self, path: &Path) -> Result<bool> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let problem = if metadata.len() == 0 {
            Some("empty file".to_string())
        } else {
            match RasterFile::validate(path) {
                Ok(()) => None,
                Err(e @ (DhmvError::CorruptRaster { .. } | DhmvError::Tiff(_))) => {
                    Some(e.to_string())
                }
                // the file may be fine; never drop it over a failed read
                Err(e) => return Err(e),
            }
        };
        match problem {
            None => Ok(true),
            Some(reason) => {
                warn!(path = %path.display(), %reason, "Invalid cached raster removed");
                fs::remove_file(path)?;
                Ok(false)
            }
        }
    }

    /// Download the archive, extract the GeoTIFF next to its final path,
    /// validate it and move it in place.
    fn download(&self, product: &DhmvProduct, target: &Path) -> Result<()> {
        fs::create_dir_all(&self.cache_dir)?;
        let url = product.download_link();
        info!(url = %url, "Downloading DHMV archive");

        let mut archive_file = NamedTempFile::new_in(&self.cache_dir)?;
        let bytes = self.transport.download(&url, archive_file.as_file_mut())?;
        archive_file.as_file_mut().flush()?;
        debug!(bytes, "Archive downloaded");

        let mut archive = zip::ZipArchive::new(archive_file.reopen()?)?;
        let tif_name = product.tif_name();
        let entry = {
            let tifs: Vec<&str> = archive
                .file_names()
                .filter(|n| n.to_ascii_lowercase().ends_with(".tif"))
                .collect();
            tifs.iter()
                .find(|n| n.rsplit('/').next() == Some(tif_name.as_str()))
                .or(if tifs.len() == 1 { tifs.first() } else { None })
                .map(|n| n.to_string())
        };
        let Some(entry) = entry else {
            return Err(DhmvError::CorruptRaster {
                path: PathBuf::from(&url),
                reason: format!("archive does not contain {}", tif_name),
            });
        };

        let mut extracted = NamedTempFile::new_in(&self.cache_dir)?;
        io::copy(&mut archive.by_name(&entry)?, extracted.as_file_mut())?;
        extracted.as_file_mut().flush()?;
        RasterFile::validate(extracted.path()).map_err(|e| match e {
            DhmvError::CorruptRaster { reason, .. } => DhmvError::CorruptRaster {
                path: target.to_path_buf(),
                reason,
            },
            other => other,
        })?;

        extracted.persist(target).map_err(|e| DhmvError::Io(e.error))?;
        info!(path = %target.display(), "Raster cached");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::collect::transport::fake::FakeTransport;
    use crate::geometric::raster::{GeoTransform, RasterGrid};
    use std::io::Cursor;

    const BASE: &str = "http://download.test";

    /// GeoTIFF bytes of a grid
    pub(crate) fn geotiff_bytes(grid: &RasterGrid) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.tif");
        grid.write_geotiff(&path).unwrap();
        fs::read(path).unwrap()
    }

    pub(crate) fn zip_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn small_grid(value: f32) -> RasterGrid {
        RasterGrid::new(
            4,
            4,
            GeoTransform::new(152_000.0, 212_000.0, 1.0, 1.0),
            vec![value; 16],
        )
        .unwrap()
    }

    fn fixture(tile: &str) -> (tempfile::TempDir, Config, Arc<FakeTransport>) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            cache_dir: dir.path().join("tiff_data"),
            download_url: BASE.to_string(),
            ..Config::default()
        };
        let tile = TileId::new(tile).unwrap();
        let dsm = DhmvProduct::from_config(&tile, ModelType::Dsm, &config);
        let dtm = dsm.complement();
        let transport = FakeTransport::new()
            .respond(
                &dsm.download_link(),
                200,
                zip_with(&[(
                    format!("GeoTIFF/{}", dsm.tif_name()).as_str(),
                    geotiff_bytes(&small_grid(15.0)).as_slice(),
                )]),
            )
            .respond(
                &dtm.download_link(),
                200,
                zip_with(&[(
                    dtm.tif_name().as_str(),
                    geotiff_bytes(&small_grid(10.0)).as_slice(),
                )]),
            );
        (dir, config, Arc::new(transport))
    }

    #[test]
    fn test_product_naming() {
        let product = DhmvProduct::new("15", ModelType::Dsm).with_resolution("5m");
        assert_eq!(product.tif_name(), "DHMVIIDSMRAS5m_k15.tif");
        assert_eq!(
            product.download_link(),
            "https://downloadagiv.blob.core.windows.net/dhm-vlaanderen-ii-dsm-raster-5m/DHMVIIDSMRAS5m_k15.zip"
        );
        let complement = product.complement();
        assert_eq!(complement.model_type(), ModelType::Dtm);
        assert_eq!(complement.tif_name(), "DHMVIIDTMRAS5m_k15.tif");
        assert_eq!(complement.complement(), product);
        assert_eq!("dtm".parse::<ModelType>().unwrap(), ModelType::Dtm);
        assert!("CHM".parse::<ModelType>().is_err());
    }

    #[test]
    fn test_parse_file_name() {
        let parsed = DhmvFileName::parse("DHMVIIDTMRAS1m_k01.tif").unwrap();
        assert_eq!(parsed.version, "II");
        assert_eq!(parsed.model_type, ModelType::Dtm);
        assert_eq!(parsed.resolution, "1m");
        assert_eq!(parsed.tile_id().unwrap().as_str(), "01");

        assert!(DhmvFileName::parse("DHMVIIDSMRAS1m_k1.tif").is_none());
        assert!(DhmvFileName::parse("DHMVIIDSMRAS1m_k15.zip").is_none());
        assert!(DhmvFileName::parse("notes.txt").is_none());
    }

    #[test]
    fn test_ensure_downloads_once() {
        let (_dir, config, transport) = fixture("15");
        let cache = RasterCache::new(&config, transport.clone());
        let tile = TileId::new("15").unwrap();

        let pair = cache.ensure(&tile).unwrap();
        assert!(pair.surface.ends_with("DHMVIIDSMRAS1m_k15.tif"));
        assert!(pair.terrain.ends_with("DHMVIIDTMRAS1m_k15.tif"));
        assert!(RasterFile::validate(&pair.surface).is_ok());

        let again = cache.ensure(&tile).unwrap();
        assert_eq!(again, pair);
        let dsm = cache.product(&tile, ModelType::Dsm);
        assert_eq!(transport.calls_to(&dsm.download_link()), 1);
        assert_eq!(transport.calls_to(&dsm.complement().download_link()), 1);

        let cached = cache.cached_products().unwrap();
        assert_eq!(cached.len(), 2);
        // only the two GeoTIFFs are left, no temporary files
        assert_eq!(fs::read_dir(cache.cache_dir()).unwrap().count(), 2);
    }

    #[test]
    fn test_empty_cached_file_is_downloaded_again() {
        let (_dir, config, transport) = fixture("15");
        let cache = RasterCache::new(&config, transport.clone());
        let tile = TileId::new("15").unwrap();
        let dsm = cache.product(&tile, ModelType::Dsm);

        fs::create_dir_all(cache.cache_dir()).unwrap();
        fs::write(dsm.path_in(cache.cache_dir()), b"").unwrap();
        assert!(dsm.is_downloaded(cache.cache_dir()));

        cache.ensure(&tile).unwrap();
        assert_eq!(transport.calls_to(&dsm.download_link()), 1);
        assert!(fs::metadata(dsm.path_in(cache.cache_dir())).unwrap().len() > 0);
    }

    #[test]
    fn test_unreadable_cache_entry_is_kept() {
        let (_dir, config, transport) = fixture("15");
        let cache = RasterCache::new(&config, transport.clone());
        let tile = TileId::new("15").unwrap();
        let dsm = cache.product(&tile, ModelType::Dsm);

        // exists, but reading it fails with an I/O error
        let entry = dsm.path_in(cache.cache_dir());
        fs::create_dir_all(&entry).unwrap();
        fs::write(entry.join("placeholder"), b"x").unwrap();

        assert!(matches!(cache.ensure(&tile), Err(DhmvError::Io(_))));
        assert!(entry.join("placeholder").exists());
        assert_eq!(transport.calls_to(BASE), 0);
    }

    #[test]
    fn test_corrupt_read_evicts_and_retries_once() {
        let (_dir, config, transport) = fixture("15");
        let cache = RasterCache::new(&config, transport.clone());
        let tile = TileId::new("15").unwrap();
        let dsm = cache.product(&tile, ModelType::Dsm);

        let mut attempts = 0;
        let width = cache
            .read_pair(&tile, |pair| {
                attempts += 1;
                if attempts == 1 {
                    return Err(DhmvError::CorruptRaster {
                        path: pair.surface.clone(),
                        reason: "bad strip".to_string(),
                    });
                }
                Ok(RasterFile::open(&pair.surface)?.width())
            })
            .unwrap();
        assert_eq!((attempts, width), (2, 4));
        assert_eq!(transport.calls_to(&dsm.download_link()), 2);
        assert_eq!(transport.calls_to(&dsm.complement().download_link()), 1);

        // a second failure is reported, not retried again
        let mut attempts = 0;
        let err = cache
            .read_pair(&tile, |pair| -> Result<()> {
                attempts += 1;
                Err(DhmvError::CorruptRaster {
                    path: pair.terrain.clone(),
                    reason: "bad strip".to_string(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, DhmvError::CorruptRaster { .. }));
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_archive_without_geotiff() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            cache_dir: dir.path().to_path_buf(),
            download_url: BASE.to_string(),
            ..Config::default()
        };
        let tile = TileId::new("07").unwrap();
        let dsm = DhmvProduct::from_config(&tile, ModelType::Dsm, &config);
        let transport = Arc::new(FakeTransport::new().respond(
            &dsm.download_link(),
            200,
            zip_with(&[("readme.txt", &b"nothing here"[..])]),
        ));
        let cache = RasterCache::new(&config, transport);

        assert!(matches!(
            cache.ensure_product(&dsm),
            Err(DhmvError::CorruptRaster { .. })
        ));
        assert!(!dsm.is_downloaded(dir.path()));
    }

    #[test]
    fn test_download_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            cache_dir: dir.path().to_path_buf(),
            download_url: BASE.to_string(),
            ..Config::default()
        };
        let cache = RasterCache::new(&config, Arc::new(FakeTransport::new()));
        assert!(matches!(
            cache.ensure(&TileId::new("43").unwrap()),
            Err(DhmvError::DownloadFailed { .. })
        ));
        assert!(cache.cached_products().unwrap().is_empty());
    }
}
