use pyo3::prelude::*;

mod bindings;

use bindings::{get_zone, PyAddress, PyBuilding};

/// Python bindings for dhmv
/// Building height models for Flemish addresses from the DHMV LiDAR rasters

#[pymodule]
fn pydhmv(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyAddress>()?;
    m.add_class::<PyBuilding>()?;
    m.add_function(wrap_pyfunction!(get_zone, m)?)?;

    // Add aliases for Pythonic API (Building instead of PyBuilding)
    m.setattr("Address", m.getattr("PyAddress")?)?;
    m.setattr("Building", m.getattr("PyBuilding")?)?;

    m.add(
        "__doc__",
        "Python bindings for dhmv - building height models from Flemish LiDAR rasters",
    )?;

    Ok(())
}
