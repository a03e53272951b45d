use geo::{MultiPolygon, Point};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::string_or_number;
use crate::collect::transport::{endpoint, Transport};
use crate::commons::basic_functions::ring_to_polygon;
use crate::commons::config::Config;
use crate::error::{DhmvError, Result};
use crate::geometric::address::{
    Address, AddressQuery, AmbiguityPolicy, Footprint, ResolveAddress, StructuredAddress,
};

const SERVICE: &str = "Basisregisters";

/// Response of `GET /adresmatch`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdresMatchResponse {
    #[serde(default)]
    adres_matches: Vec<AdresMatch>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdresMatch {
    identificator: Option<ObjectRef>,
    gemeente: Option<Gemeente>,
    postinfo: Option<ObjectRef>,
    straatnaam: Option<Straatnaam>,
    #[serde(default, deserialize_with = "string_or_number")]
    huisnummer: Option<String>,
    adres_positie: Option<AdresPositie>,
    #[serde(default)]
    adresseerbare_objecten: Vec<AdresseerbaarObject>,
    score: Option<f64>,
}

/// `{"objectId": ..., "detail": ...}` references used all over the API
#[derive(Debug, Deserialize)]
struct ObjectRef {
    #[serde(rename = "objectId", default, deserialize_with = "string_or_number")]
    object_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Gemeente {
    gemeentenaam: Option<Naam>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Naam {
    geografische_naam: Option<GeografischeNaam>,
}

#[derive(Debug, Deserialize)]
struct GeografischeNaam {
    spelling: String,
}

/// The street name is either nested (`straatnaam.straatnaam.geografischeNaam`)
/// or flat (`straatnaam.geografischeNaam`) depending on the API version
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Straatnaam {
    straatnaam: Option<Naam>,
    geografische_naam: Option<GeografischeNaam>,
}

impl Straatnaam {
    fn spelling(&self) -> Option<&str> {
        self.geografische_naam
            .as_ref()
            .or_else(|| {
                self.straatnaam
                    .as_ref()
                    .and_then(|n| n.geografische_naam.as_ref())
            })
            .map(|n| n.spelling.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct AdresPositie {
    point: Option<GeoPoint>,
}

#[derive(Debug, Deserialize)]
struct GeoPoint {
    coordinates: Vec<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdresseerbaarObject {
    object_type: String,
    #[serde(default, deserialize_with = "string_or_number")]
    object_id: Option<String>,
}

/// Response of `GET /gebouweenheden/{id}`
#[derive(Debug, Deserialize)]
struct Gebouweenheid {
    gebouw: Option<ObjectRef>,
}

/// Response of `GET /gebouwen/{id}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Gebouw {
    geometrie_polygoon: Option<GeometriePolygoon>,
}

#[derive(Debug, Deserialize)]
struct GeometriePolygoon {
    polygon: Option<PolygonGeometry>,
}

#[derive(Debug, Deserialize)]
struct PolygonGeometry {
    coordinates: Vec<Vec<Vec<f64>>>,
}

/// Structured address lookup against the Basisregisters Vlaanderen API,
/// including the building footprint behind the address.
#[derive(Clone)]
pub struct BasisregistersResolver {
    base_url: String,
    transport: Arc<dyn Transport>,
    policy: AmbiguityPolicy,
    fallback_half_size: f64,
}

impl BasisregistersResolver {
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Self {
        BasisregistersResolver {
            base_url: config.basisregisters_url.clone(),
            transport,
            policy: AmbiguityPolicy::Strict,
            fallback_half_size: config.fallback_half_size,
        }
    }

    pub fn with_policy(mut self, policy: AmbiguityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> AmbiguityPolicy {
        self.policy
    }

    /// Match an address and complete its missing fields from the registry
    pub fn match_address(&self, query: &StructuredAddress) -> Result<Address> {
        query.validate()?;
        let url = endpoint(&self.base_url, &["adresmatch"])?;
        info!(address = %query, "Looking up address in the Basisregisters");

        let response: AdresMatchResponse = self
            .transport
            .get(&url, &query_params(query))?
            .error_for_status(SERVICE)?
            .json(SERVICE)?;
        let best = self.select(query, response.adres_matches)?;

        if best.adresseerbare_objecten.is_empty() {
            return Err(DhmvError::NoAddressableObjects {
                query: query.to_string(),
            });
        }

        let street = given(&query.street)
            .or_else(|| best.straatnaam.as_ref().and_then(|s| s.spelling()).map(String::from))
            .ok_or_else(|| DhmvError::malformed(SERVICE, "match without street name"))?;
        let number = given(&query.number)
            .or(best.huisnummer.clone())
            .ok_or_else(|| DhmvError::malformed(SERVICE, "match without house number"))?;
        let zipcode = query
            .zipcode
            .as_deref()
            .and_then(given)
            .or_else(|| best.postinfo.as_ref().and_then(|p| p.object_id.clone()))
            .ok_or_else(|| DhmvError::malformed(SERVICE, "match without postinfo"))?;
        let municipality = query
            .municipality
            .as_deref()
            .and_then(given)
            .or_else(|| {
                best.gemeente
                    .as_ref()
                    .and_then(|g| g.gemeentenaam.as_ref())
                    .and_then(|n| n.geografische_naam.as_ref())
                    .map(|n| n.spelling.clone())
            })
            .ok_or_else(|| DhmvError::malformed(SERVICE, "match without municipality"))?;

        let position = match best
            .adres_positie
            .as_ref()
            .and_then(|p| p.point.as_ref())
            .map(|p| p.coordinates.as_slice())
        {
            Some([x, y, ..]) => Point::new(*x, *y),
            _ => return Err(DhmvError::malformed(SERVICE, "match without adresPositie")),
        };

        let building_units: Vec<String> = best
            .adresseerbare_objecten
            .iter()
            .filter(|o| o.object_type == "gebouweenheid")
            .filter_map(|o| o.object_id.clone())
            .collect();

        let footprint = self.footprint(&building_units, position)?;

        let address = Address {
            street,
            number,
            zipcode,
            municipality,
            position,
            footprint,
            basisregisters_id: best.identificator.and_then(|i| i.object_id),
            geopunt_id: None,
            building_units,
        };
        info!(address = %address, x = position.x(), y = position.y(), "Address resolved");
        Ok(address)
    }

    /// Footprint of the buildings the given building units belong to.
    /// Falls back to a square around `position` when no geometry is found.
    pub fn footprint(&self, building_units: &[String], position: Point<f64>) -> Result<Footprint> {
        let mut building_ids: Vec<String> = Vec::new();
        for unit in building_units {
            if let Some(id) = self.building_of_unit(unit)? {
                if !building_ids.contains(&id) {
                    building_ids.push(id);
                }
            }
        }

        let mut polygons = Vec::with_capacity(building_ids.len());
        for id in &building_ids {
            match self.building_polygon(id)? {
                Some(polygon) => polygons.push(polygon),
                None => warn!(building = %id, "Building has no polygon geometry"),
            }
        }

        if polygons.is_empty() {
            warn!(
                x = position.x(),
                y = position.y(),
                half_size = self.fallback_half_size,
                "No building geometry found, using a square footprint"
            );
            return Ok(Footprint::synthetic(position, self.fallback_half_size));
        }
        debug!(buildings = polygons.len(), "Footprint collected");
        Ok(Footprint::new(MultiPolygon(polygons)))
    }

    fn building_of_unit(&self, unit: &str) -> Result<Option<String>> {
        let url = endpoint(&self.base_url, &["gebouweenheden", unit])?;
        let unit: Gebouweenheid = self
            .transport
            .get(&url, &[])?
            .error_for_status(SERVICE)?
            .json(SERVICE)?;
        Ok(unit.gebouw.and_then(|g| g.object_id))
    }

    fn building_polygon(&self, building: &str) -> Result<Option<geo::Polygon<f64>>> {
        let url = endpoint(&self.base_url, &["gebouwen", building])?;
        let building: Gebouw = self
            .transport
            .get(&url, &[])?
            .error_for_status(SERVICE)?
            .json(SERVICE)?;
        Ok(building
            .geometrie_polygoon
            .and_then(|g| g.polygon)
            .and_then(|p| p.coordinates.into_iter().next())
            .and_then(|ring| ring_to_polygon(&ring)))
    }

    fn select(&self, query: &StructuredAddress, mut matches: Vec<AdresMatch>) -> Result<AdresMatch> {
        if matches.is_empty() {
            return Err(DhmvError::AddressNotFound {
                query: query.to_string(),
            });
        }

        // first of the highest scores
        let mut best = 0;
        for (i, m) in matches.iter().enumerate() {
            if m.score.unwrap_or(f64::MIN) > matches[best].score.unwrap_or(f64::MIN) {
                best = i;
            }
        }
        let count = matches.len();
        let best_score = matches[best].score;

        if count > 1 {
            match self.policy {
                AmbiguityPolicy::Strict => {
                    return Err(DhmvError::AmbiguousAddress {
                        query: query.to_string(),
                        count,
                        best_score,
                    })
                }
                AmbiguityPolicy::FirstMatch => warn!(
                    count,
                    score = ?best_score,
                    "More than one possible address found, selected the best match"
                ),
            }
        }
        Ok(matches.swap_remove(best))
    }
}

impl ResolveAddress for BasisregistersResolver {
    fn resolve(&self, query: &AddressQuery) -> Result<Address> {
        match query {
            AddressQuery::Structured(address) => self.match_address(address),
            AddressQuery::FreeText(q) => Err(DhmvError::InvalidInput(format!(
                "the address registry needs a street and a house number, got free text '{}'",
                q
            ))),
        }
    }
}

fn given(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn query_params(query: &StructuredAddress) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("straatnaam", query.street.trim().to_string()),
        ("huisnummer", query.number.trim().to_string()),
    ];
    if let Some(zipcode) = query.zipcode.as_deref().and_then(given) {
        params.push(("postcode", zipcode));
    }
    if let Some(municipality) = query.municipality.as_deref().and_then(given) {
        params.push(("gemeentenaam", municipality));
    }
    params
}
