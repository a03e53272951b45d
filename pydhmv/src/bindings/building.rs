use dhmv::{Building, Config, Figure, ZoneIndex};
use pyo3::prelude::*;
use pyo3::types::PyBytes;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use crate::bindings::address::PyAddress;
use crate::bindings::to_py_err;

/// Zone index from the configured path, loaded once per process
static DEFAULT_ZONES: OnceLock<Arc<ZoneIndex>> = OnceLock::new();

fn zone_index(path: Option<&str>, config: &Config) -> PyResult<Arc<ZoneIndex>> {
    if let Some(path) = path {
        let zones = ZoneIndex::from_path(path, &config.zone_id_property).map_err(to_py_err)?;
        return Ok(Arc::new(zones));
    }
    if let Some(zones) = DEFAULT_ZONES.get() {
        return Ok(zones.clone());
    }
    let zones = ZoneIndex::from_path(&config.zone_index_path, &config.zone_id_property)
        .map_err(to_py_err)?;
    Ok(DEFAULT_ZONES.get_or_init(|| Arc::new(zones)).clone())
}

/// Building Python binding: height model and plots of an address
#[pyclass(frozen)]
pub struct PyBuilding {
    inner: Building,
}

#[pymethods]
impl PyBuilding {
    #[new]
    #[pyo3(signature = (address, margin = 2.0, cache_dir = None, zone_index = None))]
    fn new(
        address: PyRef<'_, PyAddress>,
        margin: f64,
        cache_dir: Option<String>,
        zone_index: Option<String>,
    ) -> PyResult<Self> {
        let mut config = Config::from_env().map_err(to_py_err)?;
        config.margin = margin;
        if let Some(dir) = cache_dir {
            config.cache_dir = dir.into();
        }
        config.validate().map_err(to_py_err)?;

        let zones = self::zone_index(zone_index.as_deref(), &config)?;
        let inner =
            Building::from_config(address.inner.clone(), zones, &config).map_err(to_py_err)?;
        Ok(PyBuilding { inner })
    }

    #[getter]
    fn address(&self) -> PyAddress {
        PyAddress {
            inner: self.inner.address().clone(),
        }
    }

    #[getter]
    fn tile_id(&self) -> PyResult<String> {
        Ok(self.inner.tile_id().map_err(to_py_err)?.to_string())
    }

    /// Height above ground, row by row (north first); NaN outside the footprint
    fn heights(&self) -> PyResult<Vec<Vec<f32>>> {
        let model = self.inner.height_model().map_err(to_py_err)?;
        Ok(model
            .data()
            .chunks(model.width().max(1))
            .map(|row| row.to_vec())
            .collect())
    }

    /// (x, y) of the pixel centres
    fn coordinates(&self) -> PyResult<(Vec<f64>, Vec<f64>)> {
        let model = self.inner.height_model().map_err(to_py_err)?;
        Ok((model.x_coords(), model.y_coords()))
    }

    /// 3D surface plot as PNG bytes, also saved to `filename` when given
    #[pyo3(signature = (filename = None))]
    fn plot3d<'py>(&self, py: Python<'py>, filename: Option<String>) -> PyResult<Bound<'py, PyBytes>> {
        let figure = self
            .inner
            .plot_3d(filename.as_deref().map(Path::new))
            .map_err(to_py_err)?;
        png(py, &figure)
    }

    /// Flat colour-coded plot as PNG bytes, also saved to `filename` when given
    #[pyo3(signature = (filename = None))]
    fn plot_flat<'py>(
        &self,
        py: Python<'py>,
        filename: Option<String>,
    ) -> PyResult<Bound<'py, PyBytes>> {
        let figure = self
            .inner
            .plot_flat(filename.as_deref().map(Path::new))
            .map_err(to_py_err)?;
        png(py, &figure)
    }

    /// Write the height model as a GeoTIFF
    fn to_geotiff(&self, path: &str) -> PyResult<()> {
        let model = self.inner.height_model().map_err(to_py_err)?;
        model.write_geotiff(path).map_err(to_py_err)
    }

    fn __repr__(&self) -> String {
        format!("Building('{}')", self.inner.address())
    }
}

fn png<'py>(py: Python<'py>, figure: &Figure) -> PyResult<Bound<'py, PyBytes>> {
    let bytes = figure.to_png_bytes().map_err(to_py_err)?;
    Ok(PyBytes::new(py, &bytes))
}

/// DHMV zone (map sheet) containing a Lambert 72 coordinate
#[pyfunction]
#[pyo3(signature = (x, y, zone_index = None))]
pub fn get_zone(x: f64, y: f64, zone_index: Option<String>) -> PyResult<String> {
    let config = Config::from_env().map_err(to_py_err)?;
    let zones = self::zone_index(zone_index.as_deref(), &config)?;
    Ok(zones.locate(x, y).map_err(to_py_err)?.to_string())
}
