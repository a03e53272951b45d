//! Flemish addresses and their resolution to a position and a building footprint.

use geo::{Area, MultiPolygon, Point, Polygon};
use std::fmt;
use std::sync::Arc;

use crate::collect::transport::{HttpTransport, Transport};
use crate::collect::vlaanderen::{BasisregistersResolver, GeopuntResolver};
use crate::commons::basic_functions::{polygon_count, square_buffer};
use crate::commons::config::Config;
use crate::error::{DhmvError, Result};
use crate::geo_core::BoundingBox;

/// Address fields as specified by the caller.
/// Street and number are required, together with a zipcode and/or a municipality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredAddress {
    /// Street name (straatnaam)
    pub street: String,
    /// House number, with bus or letter suffix when there is one
    pub number: String,
    /// Four-digit postal code
    pub zipcode: Option<String>,
    /// Municipality (gemeente) name
    pub municipality: Option<String>,
}

impl StructuredAddress {
    /// Create a query from street and number; add a zipcode or municipality
    /// before resolving.
    pub fn new(street: impl Into<String>, number: impl Into<String>) -> Self {
        StructuredAddress {
            street: street.into(),
            number: number.into(),
            zipcode: None,
            municipality: None,
        }
    }

    pub fn with_zipcode(mut self, zipcode: impl Into<String>) -> Self {
        self.zipcode = Some(zipcode.into());
        self
    }

    pub fn with_municipality(mut self, municipality: impl Into<String>) -> Self {
        self.municipality = Some(municipality.into());
        self
    }

    /// Check the fields before any request is made.
    pub fn validate(&self) -> Result<()> {
        if self.street.trim().is_empty() {
            return Err(DhmvError::InvalidInput("street must not be empty".to_string()));
        }
        if self.number.trim().is_empty() {
            return Err(DhmvError::InvalidInput(
                "house number must not be empty".to_string(),
            ));
        }
        let has_zipcode = self.zipcode.as_deref().is_some_and(|z| !z.trim().is_empty());
        let has_municipality = self
            .municipality
            .as_deref()
            .is_some_and(|m| !m.trim().is_empty());
        if !has_zipcode && !has_municipality {
            return Err(DhmvError::InvalidInput(
                "either a zipcode or a municipality is required".to_string(),
            ));
        }
        if let Some(zipcode) = self.zipcode.as_deref().filter(|z| !z.trim().is_empty()) {
            let zipcode = zipcode.trim();
            if zipcode.len() != 4 || !zipcode.chars().all(|c| c.is_ascii_digit()) {
                return Err(DhmvError::InvalidInput(format!(
                    "zipcode must be four digits, got '{}'",
                    zipcode
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for StructuredAddress {
    /// Best-effort Belgian rendering, used as a free-text query
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.street.trim(), self.number.trim())?;
        let locality: Vec<&str> = [self.zipcode.as_deref(), self.municipality.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if !locality.is_empty() {
            write!(f, ", {}", locality.join(" "))?;
        }
        Ok(())
    }
}

/// What to resolve
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressQuery {
    /// Separate fields, for the address registry
    Structured(StructuredAddress),
    /// One search string, for the location service
    FreeText(String),
}

impl AddressQuery {
    /// Reject empty or incomplete queries before any request is made
    pub fn validate(&self) -> Result<()> {
        match self {
            AddressQuery::Structured(address) => address.validate(),
            AddressQuery::FreeText(q) if q.trim().is_empty() => Err(DhmvError::InvalidInput(
                "search query must not be empty".to_string(),
            )),
            AddressQuery::FreeText(_) => Ok(()),
        }
    }
}

impl fmt::Display for AddressQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressQuery::Structured(address) => address.fmt(f),
            AddressQuery::FreeText(q) => f.write_str(q.trim()),
        }
    }
}

/// How a resolver reacts when a service returns more than one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmbiguityPolicy {
    /// Fail with `AmbiguousAddress`
    Strict,
    /// Take the first (best-scored) candidate and log a warning
    FirstMatch,
}

/// Outline of the building(s) at an address, in Lambert 72.
#[derive(Debug, Clone, PartialEq)]
pub struct Footprint {
    polygons: MultiPolygon<f64>,
    /// Set when the outline is a stand-in square, not registry geometry
    synthetic: bool,
}

impl Footprint {
    pub fn new(polygons: MultiPolygon<f64>) -> Self {
        Footprint {
            polygons,
            synthetic: false,
        }
    }

    /// Square stand-in around a point, for addresses without building geometry
    pub fn synthetic(point: Point<f64>, half_size: f64) -> Self {
        Footprint {
            polygons: MultiPolygon(vec![square_buffer(point, half_size)]),
            synthetic: true,
        }
    }

    pub fn polygons(&self) -> &MultiPolygon<f64> {
        &self.polygons
    }

    /// Whether the outline is a stand-in square around the address point
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    pub fn is_empty(&self) -> bool {
        polygon_count(&self.polygons) == 0
    }

    /// Area in square metres
    pub fn area(&self) -> f64 {
        self.polygons.unsigned_area()
    }

    /// Bounding box of all polygons, `None` when empty
    pub fn bbox(&self) -> Option<BoundingBox> {
        BoundingBox::of(&self.polygons)
    }

    /// Exterior rings as coordinate pairs, one vector per polygon
    pub fn rings(&self) -> Vec<Vec<(f64, f64)>> {
        self.polygons
            .0
            .iter()
            .map(|p: &Polygon<f64>| p.exterior().coords().map(|c| (c.x, c.y)).collect())
            .collect()
    }
}

/// A resolved address: completed fields, Lambert 72 position and footprint.
/// Immutable once resolved.
#[derive(Debug, Clone)]
pub struct Address {
    pub(crate) street: String,
    pub(crate) number: String,
    pub(crate) zipcode: String,
    pub(crate) municipality: String,
    pub(crate) position: Point<f64>,
    pub(crate) footprint: Footprint,
    pub(crate) basisregisters_id: Option<String>,
    pub(crate) geopunt_id: Option<String>,
    pub(crate) building_units: Vec<String>,
}

impl Address {
    /// Look up an address in the Basisregisters Vlaanderen.
    /// Missing zipcode or municipality is filled in from the registry.
    pub fn new(
        street: &str,
        number: &str,
        municipality: Option<&str>,
        zipcode: Option<&str>,
        config: &Config,
    ) -> Result<Self> {
        let mut query = StructuredAddress::new(street, number);
        query.municipality = municipality.map(String::from);
        query.zipcode = zipcode.map(String::from);
        let resolver = AddressResolver::structured(config, default_transport(config)?);
        resolver.resolve(&AddressQuery::Structured(query))
    }

    /// Look up an address from a free-text search string with Geopunt.
    /// The first match is selected, so give enough detail to avoid ambiguity.
    pub fn from_search(q: &str, config: &Config) -> Result<Self> {
        let transport = default_transport(config)?;
        let resolver = AddressResolver::free_text(config, transport.clone())
            .with_refinement(BasisregistersResolver::new(config, transport));
        resolver.resolve(&AddressQuery::FreeText(q.to_string()))
    }

    pub fn street(&self) -> &str {
        &self.street
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn zipcode(&self) -> &str {
        &self.zipcode
    }

    pub fn municipality(&self) -> &str {
        &self.municipality
    }

    /// Position in Lambert 72
    pub fn position(&self) -> Point<f64> {
        self.position
    }

    /// Position as an `(x, y)` pair
    pub fn lambert(&self) -> (f64, f64) {
        (self.position.x(), self.position.y())
    }

    pub fn footprint(&self) -> &Footprint {
        &self.footprint
    }

    /// Address id in the Basisregisters, when the registry was consulted
    pub fn basisregisters_id(&self) -> Option<&str> {
        self.basisregisters_id.as_deref()
    }

    /// Location id of a free-text search result
    pub fn geopunt_id(&self) -> Option<&str> {
        self.geopunt_id.as_deref()
    }

    /// Building unit (gebouweenheid) ids attached to this address
    pub fn building_units(&self) -> &[String] {
        &self.building_units
    }
}

impl fmt::Display for Address {
    /// Standard Belgian format `<street> <number>, <zipcode> <municipality>`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}, {} {}",
            self.street, self.number, self.zipcode, self.municipality
        )
    }
}

/// Capability shared by the geocoding backends
pub trait ResolveAddress {
    fn resolve(&self, query: &AddressQuery) -> Result<Address>;
}

/// Geocoding strategy, chosen at construction time
pub enum AddressResolver {
    /// Exact lookup in the address registry, with building footprints
    Structured(BasisregistersResolver),
    /// Best-effort search, footprint only through refinement
    FreeText(GeopuntResolver),
}

impl AddressResolver {
    /// Registry lookup, strict about ambiguous matches
    pub fn structured(config: &Config, transport: Arc<dyn Transport>) -> Self {
        AddressResolver::Structured(BasisregistersResolver::new(config, transport))
    }

    /// Free-text search, taking the first result
    pub fn free_text(config: &Config, transport: Arc<dyn Transport>) -> Self {
        AddressResolver::FreeText(GeopuntResolver::new(config, transport))
    }

    /// Override the ambiguity policy of the chosen strategy
    pub fn with_policy(self, policy: AmbiguityPolicy) -> Self {
        match self {
            AddressResolver::Structured(r) => AddressResolver::Structured(r.with_policy(policy)),
            AddressResolver::FreeText(r) => AddressResolver::FreeText(r.with_policy(policy)),
        }
    }

    /// Complete free-text results against the registry (no-op for the structured strategy)
    pub fn with_refinement(self, registry: BasisregistersResolver) -> Self {
        match self {
            AddressResolver::FreeText(r) => AddressResolver::FreeText(r.with_refinement(registry)),
            structured => structured,
        }
    }
}

impl ResolveAddress for AddressResolver {
    fn resolve(&self, query: &AddressQuery) -> Result<Address> {
        match self {
            AddressResolver::Structured(r) => r.resolve(query),
            AddressResolver::FreeText(r) => r.resolve(query),
        }
    }
}

fn default_transport(config: &Config) -> Result<Arc<dyn Transport>> {
    Ok(Arc::new(HttpTransport::from_config(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_validation() {
        let ok = StructuredAddress::new("Grote Markt", "5").with_zipcode("2000");
        assert!(ok.validate().is_ok());

        let no_locality = StructuredAddress::new("Grote Markt", "5");
        assert!(matches!(
            no_locality.validate(),
            Err(DhmvError::InvalidInput(_))
        ));

        let bad_zip = StructuredAddress::new("Grote Markt", "5").with_zipcode("20A0");
        assert!(bad_zip.validate().is_err());

        let blank_street = StructuredAddress::new("  ", "5").with_municipality("Antwerpen");
        assert!(blank_street.validate().is_err());

        assert!(AddressQuery::FreeText("   ".to_string()).validate().is_err());
    }

    #[test]
    fn test_structured_display() {
        let address = StructuredAddress::new("Bist", "2").with_municipality("Antwerpen");
        assert_eq!(address.to_string(), "Bist 2, Antwerpen");
        let address = address.with_zipcode("2610");
        assert_eq!(address.to_string(), "Bist 2, 2610 Antwerpen");
    }

    #[test]
    fn test_synthetic_footprint() {
        let footprint = Footprint::synthetic(Point::new(152_000.0, 212_000.0), 10.0);
        assert!(footprint.is_synthetic());
        assert!(!footprint.is_empty());
        assert_eq!(footprint.area(), 400.0);
        let bbox = footprint.bbox().unwrap();
        assert_eq!(bbox.min_x, 151_990.0);
        assert_eq!(footprint.rings()[0].len(), 5);
    }
}
