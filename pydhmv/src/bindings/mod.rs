// Python bindings module
// Each file contains one or more PyO3 #[pyclass] definitions

pub mod address;
pub mod building;

use dhmv::{DhmvError, ErrorKind};
use pyo3::exceptions::{PyConnectionError, PyIOError, PyRuntimeError, PyValueError};
use pyo3::PyErr;

pub use address::PyAddress;
pub use building::{get_zone, PyBuilding};

/// Map a dhmv error onto the closest Python exception
pub(crate) fn to_py_err(err: DhmvError) -> PyErr {
    let message = err.to_string();
    match err.kind() {
        ErrorKind::Resolution | ErrorKind::InvalidInput => PyValueError::new_err(message),
        ErrorKind::Connectivity => PyConnectionError::new_err(message),
        ErrorKind::DataIntegrity => PyRuntimeError::new_err(message),
        ErrorKind::Io => PyIOError::new_err(message),
    }
}
