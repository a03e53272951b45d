use geo::Point;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::string_or_number;
use super::BasisregistersResolver;
use crate::collect::transport::Transport;
use crate::commons::config::Config;
use crate::error::{DhmvError, Result};
use crate::geometric::address::{
    Address, AddressQuery, AmbiguityPolicy, Footprint, ResolveAddress, StructuredAddress,
};

const SERVICE: &str = "Geopunt";

/// Response of the Geopunt location service
#[derive(Debug, Deserialize)]
struct LocationResponse {
    #[serde(rename = "LocationResult", default)]
    location_result: Vec<LocationResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LocationResult {
    #[serde(default, deserialize_with = "string_or_number")]
    zipcode: Option<String>,
    municipality: Option<String>,
    thoroughfarename: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    housenumber: Option<String>,
    formatted_address: Option<String>,
    #[serde(rename = "ID", default, deserialize_with = "string_or_number")]
    id: Option<String>,
    location: Option<Location>,
}

#[derive(Debug, Deserialize)]
struct Location {
    #[serde(rename = "X_Lambert72")]
    x_lambert72: f64,
    #[serde(rename = "Y_Lambert72")]
    y_lambert72: f64,
}

/// Free-text address search with the Geopunt location API.
///
/// Geopunt only returns a point. With a registry attached through
/// [`GeopuntResolver::with_refinement`] the result is completed with the
/// registry id, building units and footprint; otherwise the footprint is a
/// square around the point.
#[derive(Clone)]
pub struct GeopuntResolver {
    url: String,
    transport: Arc<dyn Transport>,
    policy: AmbiguityPolicy,
    fallback_half_size: f64,
    registry: Option<BasisregistersResolver>,
}

impl GeopuntResolver {
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Self {
        GeopuntResolver {
            url: config.geopunt_url.clone(),
            transport,
            policy: AmbiguityPolicy::FirstMatch,
            fallback_half_size: config.fallback_half_size,
            registry: None,
        }
    }

    pub fn with_policy(mut self, policy: AmbiguityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_refinement(mut self, registry: BasisregistersResolver) -> Self {
        // the Geopunt result is a single candidate already, the registry must not reject it
        self.registry = Some(registry.with_policy(AmbiguityPolicy::FirstMatch));
        self
    }

    pub fn policy(&self) -> AmbiguityPolicy {
        self.policy
    }

    /// Search an address from a general query string
    pub fn search(&self, q: &str) -> Result<Address> {
        let q = q.trim();
        if q.is_empty() {
            return Err(DhmvError::InvalidInput(
                "search query must not be empty".to_string(),
            ));
        }
        info!(query = q, "Searching address with Geopunt");

        let response: LocationResponse = self
            .transport
            .get(&self.url, &[("q", q.to_string())])?
            .error_for_status(SERVICE)?
            .json(SERVICE)?;
        let result = self.select(q, response.location_result)?;

        let (street, number) = match (result.thoroughfarename, result.housenumber) {
            (Some(street), Some(number)) => (street, number),
            _ => {
                return Err(DhmvError::NoAddressableObjects {
                    query: q.to_string(),
                })
            }
        };
        let location = result
            .location
            .ok_or_else(|| DhmvError::malformed(SERVICE, "result without Location"))?;
        let position = Point::new(location.x_lambert72, location.y_lambert72);

        let mut address = Address {
            street,
            number,
            zipcode: result.zipcode.unwrap_or_default(),
            municipality: result.municipality.unwrap_or_default(),
            position,
            footprint: Footprint::synthetic(position, self.fallback_half_size),
            basisregisters_id: None,
            geopunt_id: result.id,
            building_units: Vec::new(),
        };

        if let Some(formatted) = result.formatted_address.as_deref() {
            if formatted != address.to_string() {
                warn!(
                    geopunt = formatted,
                    rendered = %address,
                    "Formatted address differs from the Geopunt result"
                );
            }
        }

        if let Some(registry) = &self.registry {
            let mut structured = StructuredAddress::new(&address.street, &address.number);
            if !address.zipcode.is_empty() {
                structured = structured.with_zipcode(&address.zipcode);
            }
            if !address.municipality.is_empty() {
                structured = structured.with_municipality(&address.municipality);
            }
            let refined = registry.match_address(&structured)?;
            address.basisregisters_id = refined.basisregisters_id;
            address.building_units = refined.building_units;
            address.footprint = if refined.footprint.is_synthetic() {
                // keep the square around the Geopunt point
                address.footprint
            } else {
                refined.footprint
            };
        } else {
            warn!(address = %address, "No registry refinement, using a square footprint");
        }

        info!(address = %address, x = position.x(), y = position.y(), "Address resolved");
        Ok(address)
    }

    fn select(&self, q: &str, mut results: Vec<LocationResult>) -> Result<LocationResult> {
        let count = results.len();
        if count == 0 {
            return Err(DhmvError::AddressNotFound {
                query: q.to_string(),
            });
        }
        if count > 1 {
            match self.policy {
                AmbiguityPolicy::Strict => {
                    return Err(DhmvError::AmbiguousAddress {
                        query: q.to_string(),
                        count,
                        best_score: None,
                    })
                }
                AmbiguityPolicy::FirstMatch => {
                    warn!(count, query = q, "More than one result, selected the first")
                }
            }
        }
        Ok(results.swap_remove(0))
    }
}

impl ResolveAddress for GeopuntResolver {
    fn resolve(&self, query: &AddressQuery) -> Result<Address> {
        query.validate()?;
        self.search(&query.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::transport::fake::FakeTransport;
    use crate::collect::vlaanderen::basisregisters::tests::{registry_fake, BASE};

    const GEOPUNT: &str = "http://geopunt.test/location";

    const GROTE_MARKT: &str = r#"{"LocationResult": [{
        "Municipality": "Antwerpen", "Zipcode": "2000", "Thoroughfarename": "Grote Markt",
        "Housenumber": "5", "ID": 3402021, "FormattedAddress": "Grote Markt 5, 2000 Antwerpen",
        "Location": {"Lat_WGS84": 51.2213, "Lon_WGS84": 4.3997, "X_Lambert72": 152284.81, "Y_Lambert72": 212205.63},
        "LocationType": "crab_huisnummer_afgeleidVanGebouw"
    }]}"#;

    fn config() -> Config {
        Config {
            geopunt_url: GEOPUNT.to_string(),
            basisregisters_url: BASE.to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_search_without_refinement() {
        let transport: Arc<dyn Transport> =
            Arc::new(FakeTransport::new().respond(GEOPUNT, 200, GROTE_MARKT));
        let resolver = GeopuntResolver::new(&config(), transport);

        let address = resolver.search("grote markt 5 antwerpen").unwrap();
        assert_eq!(address.to_string(), "Grote Markt 5, 2000 Antwerpen");
        assert_eq!(address.geopunt_id(), Some("3402021"));
        assert_eq!(address.lambert(), (152284.81, 212205.63));
        assert!(address.footprint().is_synthetic());
        assert_eq!(address.footprint().area(), 400.0);
    }

    #[test]
    fn test_search_with_refinement_keeps_geopunt_position() {
        let transport = Arc::new(registry_fake().respond(GEOPUNT, 200, GROTE_MARKT));
        let registry = BasisregistersResolver::new(&config(), transport.clone());
        let resolver = GeopuntResolver::new(&config(), transport).with_refinement(registry);

        let address = resolver
            .resolve(&AddressQuery::FreeText("Grote Markt 5, Antwerpen".to_string()))
            .unwrap();
        assert_eq!(address.lambert(), (152284.81, 212205.63));
        assert_eq!(address.basisregisters_id(), Some("2000001"));
        assert!(!address.footprint().is_synthetic());
        assert_eq!(address.footprint().area(), 120.0);
    }

    #[test]
    fn test_zero_and_many_results() {
        let empty: Arc<dyn Transport> = Arc::new(FakeTransport::new().respond(
            GEOPUNT,
            200,
            r#"{"LocationResult": []}"#,
        ));
        let resolver = GeopuntResolver::new(&config(), empty);
        assert!(matches!(
            resolver.search("Onbestaande 1"),
            Err(DhmvError::AddressNotFound { .. })
        ));

        let two = r#"{"LocationResult": [
            {"Municipality": "Gent", "Zipcode": "9000", "Thoroughfarename": "Kouter", "Housenumber": "1",
             "ID": 1, "Location": {"X_Lambert72": 104900.0, "Y_Lambert72": 193700.0}},
            {"Municipality": "Gent", "Zipcode": "9000", "Thoroughfarename": "Kouter", "Housenumber": "10",
             "ID": 2, "Location": {"X_Lambert72": 104950.0, "Y_Lambert72": 193650.0}}
        ]}"#;
        let transport: Arc<dyn Transport> = Arc::new(FakeTransport::new().respond(GEOPUNT, 200, two));
        let resolver = GeopuntResolver::new(&config(), transport);
        assert_eq!(resolver.search("Kouter 1 Gent").unwrap().geopunt_id(), Some("1"));

        let strict = resolver.with_policy(AmbiguityPolicy::Strict);
        assert!(matches!(
            strict.search("Kouter 1 Gent"),
            Err(DhmvError::AmbiguousAddress { count: 2, .. })
        ));
    }

    #[test]
    fn test_street_level_result_is_not_an_address() {
        let street = r#"{"LocationResult": [{"Municipality": "Gent", "Zipcode": "9000",
            "Thoroughfarename": "Kouter", "Housenumber": null,
            "Location": {"X_Lambert72": 104900.0, "Y_Lambert72": 193700.0}}]}"#;
        let transport: Arc<dyn Transport> =
            Arc::new(FakeTransport::new().respond(GEOPUNT, 200, street));
        let resolver = GeopuntResolver::new(&config(), transport);
        assert!(matches!(
            resolver.search("Kouter Gent"),
            Err(DhmvError::NoAddressableObjects { .. })
        ));
    }
}
