//! Error types for the dhmv crate.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, DhmvError>;

/// Broad classification of a [`DhmvError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Address not found, ambiguous, or outside the zone coverage.
    Resolution,
    /// A remote service or download was unreachable, timed out or answered badly.
    Connectivity,
    /// Corrupt cached raster or misaligned surface/terrain grids.
    DataIntegrity,
    /// Malformed input from the caller.
    InvalidInput,
    /// Local filesystem or encoding failure.
    Io,
}

/// Errors that can occur while resolving addresses and building height models.
#[derive(Debug, Error)]
pub enum DhmvError {
    /// No address matched the query.
    #[error("No address found for '{query}'")]
    AddressNotFound {
        /// The query as sent to the service.
        query: String,
    },

    /// The query matched several addresses and the resolver is strict.
    #[error("More than one possible address found for '{query}' ({count} matches, best score {best_score:?})")]
    AmbiguousAddress {
        /// The query as sent to the service.
        query: String,
        /// Number of matches returned.
        count: usize,
        /// Score of the best match, when the service reports one.
        best_score: Option<f64>,
    },

    /// The registry returned a match that is not a concrete address.
    #[error("API returned a result for '{query}', but no concrete address")]
    NoAddressableObjects {
        /// The query as sent to the service.
        query: String,
    },

    /// The coordinate lies outside every zone of the index.
    #[error("Coordinate ({x}, {y}) is outside all known zones")]
    OutOfCoverage {
        /// Easting (EPSG:31370).
        x: f64,
        /// Northing (EPSG:31370).
        y: f64,
    },

    /// HTTP transport error (connection refused, timeout, TLS, ...).
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("{service} API error status {status}: {message}")]
    ServiceStatus {
        /// Service name.
        service: &'static str,
        /// HTTP status code.
        status: u16,
        /// Problem title or response body.
        message: String,
    },

    /// The service answered with a body we cannot interpret.
    #[error("Malformed {service} response: {reason}")]
    MalformedResponse {
        /// Service name.
        service: &'static str,
        /// What was missing or wrong.
        reason: String,
    },

    /// Downloading a raster archive failed.
    #[error("Failed to download {url}: {reason}")]
    DownloadFailed {
        /// Requested URL.
        url: String,
        /// Reason for failure.
        reason: String,
    },

    /// A cached or freshly extracted raster is not a usable GeoTIFF.
    #[error("Corrupt raster {path:?}: {reason}")]
    CorruptRaster {
        /// Offending file.
        path: PathBuf,
        /// What the validation found.
        reason: String,
    },

    /// Surface and terrain windows do not share the same grid.
    #[error("Surface and terrain grids are misaligned: {0}")]
    MisalignedGrids(String),

    /// Malformed caller input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TIFF decoding or encoding error.
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// Zip archive error.
    #[error("Zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Image encoding error.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl DhmvError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DhmvError::AddressNotFound { .. }
            | DhmvError::AmbiguousAddress { .. }
            | DhmvError::NoAddressableObjects { .. }
            | DhmvError::OutOfCoverage { .. } => ErrorKind::Resolution,
            DhmvError::Http(_)
            | DhmvError::ServiceStatus { .. }
            | DhmvError::MalformedResponse { .. }
            | DhmvError::DownloadFailed { .. } => ErrorKind::Connectivity,
            DhmvError::CorruptRaster { .. }
            | DhmvError::MisalignedGrids(_)
            | DhmvError::Tiff(_)
            | DhmvError::Zip(_) => ErrorKind::DataIntegrity,
            DhmvError::InvalidInput(_) => ErrorKind::InvalidInput,
            DhmvError::Io(_) | DhmvError::Json(_) | DhmvError::Image(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn malformed(service: &'static str, reason: impl Into<String>) -> Self {
        DhmvError::MalformedResponse {
            service,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err = DhmvError::OutOfCoverage { x: 0.0, y: 0.0 };
        assert_eq!(err.kind(), ErrorKind::Resolution);

        let err = DhmvError::MisalignedGrids("origin differs".to_string());
        assert_eq!(err.kind(), ErrorKind::DataIntegrity);

        let err = DhmvError::malformed("Geopunt", "missing LocationResult");
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert_eq!(
            err.to_string(),
            "Malformed Geopunt response: missing LocationResult"
        );
    }

    #[test]
    fn test_ambiguous_message() {
        let err = DhmvError::AmbiguousAddress {
            query: "Statiestraat 10, Antwerpen".to_string(),
            count: 3,
            best_score: Some(98.5),
        };
        assert!(err.to_string().contains("3 matches"));
    }
}
