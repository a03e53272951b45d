//! Collectors for the Flemish government geocoding services.

pub mod basisregisters;
pub mod geopunt;

pub use basisregisters::BasisregistersResolver;
pub use geopunt::GeopuntResolver;

use serde::{Deserialize, Deserializer};

/// Identifiers come back as strings from one service and as numbers from another
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
