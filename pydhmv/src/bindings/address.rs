use dhmv::{Address, Config};
use pyo3::prelude::*;

use crate::bindings::to_py_err;

/// Address Python binding, resolved against the Flemish address services
#[pyclass(frozen)]
pub struct PyAddress {
    pub(crate) inner: Address,
}

#[pymethods]
impl PyAddress {
    /// Look up an address in the Basisregisters Vlaanderen.
    /// Give the municipality, the zipcode or both.
    #[new]
    #[pyo3(signature = (street, number, municipality = None, zipcode = None))]
    fn new(
        street: &str,
        number: &str,
        municipality: Option<&str>,
        zipcode: Option<&str>,
    ) -> PyResult<Self> {
        let config = Config::from_env().map_err(to_py_err)?;
        let inner =
            Address::new(street, number, municipality, zipcode, &config).map_err(to_py_err)?;
        Ok(PyAddress { inner })
    }

    /// Free-text search with Geopunt; the first match is used
    #[staticmethod]
    fn from_search(q: &str) -> PyResult<Self> {
        let config = Config::from_env().map_err(to_py_err)?;
        let inner = Address::from_search(q, &config).map_err(to_py_err)?;
        Ok(PyAddress { inner })
    }

    #[getter]
    fn street(&self) -> &str {
        self.inner.street()
    }

    #[getter]
    fn number(&self) -> &str {
        self.inner.number()
    }

    #[getter]
    fn zipcode(&self) -> &str {
        self.inner.zipcode()
    }

    #[getter]
    fn municipality(&self) -> &str {
        self.inner.municipality()
    }

    /// (x, y) in Lambert 72
    #[getter]
    fn lambert(&self) -> (f64, f64) {
        self.inner.lambert()
    }

    /// Footprint rings as lists of (x, y)
    #[getter]
    fn footprint(&self) -> Vec<Vec<(f64, f64)>> {
        self.inner.footprint().rings()
    }

    #[getter]
    fn footprint_is_synthetic(&self) -> bool {
        self.inner.footprint().is_synthetic()
    }

    fn __str__(&self) -> String {
        self.inner.to_string()
    }

    fn __repr__(&self) -> String {
        format!("Address('{}')", self.inner)
    }
}
