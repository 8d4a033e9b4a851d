//! Static geographic reference data used to enrich `dim_location`.
//!
//! The reference is a JSON array of places with country, region and elevation. Lookups take
//! the nearest place (great-circle distance) within a configured radius.

pub mod error;

use crate::types::location::LatLon;
pub use error::GeoError;
use haversine::{distance, Location as HaversineLocation, Units};
use log::{info, warn};
use ordered_float::OrderedFloat;
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use std::path::Path;

const BUNDLED_REFERENCE: &str = include_str!("../../data/geo_reference.json");
const BUNDLED_ORIGIN: &str = "<bundled>";

/// R-tree candidates examined per lookup before the haversine filter.
const CANDIDATE_LIMIT: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencePlace {
    pub name: String,
    pub country: String,
    pub region: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    /// Metres above sea level.
    pub elevation: Option<f64>,
}

impl RTreeObject for ReferencePlace {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.latitude, self.longitude])
    }
}

impl PointDistance for ReferencePlace {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.latitude - point[0];
        let dy = self.longitude - point[1];
        dx * dx + dy * dy
    }
}

/// A reference match for one location.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    pub place: ReferencePlace,
    pub distance_km: f64,
}

#[derive(Debug, Clone)]
pub struct GeoReference {
    rtree: RTree<ReferencePlace>,
}

impl GeoReference {
    /// Loads the reference file at `path`, or the bundled dataset when the file is absent.
    pub async fn load(path: &Path) -> Result<Self, GeoError> {
        if !path.exists() {
            warn!(
                "Geo reference {:?} not found, using the bundled dataset",
                path
            );
            return Self::bundled();
        }
        let path_buf = path.to_path_buf();
        let places = tokio::task::spawn_blocking(move || {
            let text = std::fs::read_to_string(&path_buf)
                .map_err(|e| GeoError::Read(path_buf.clone(), e))?;
            parse_places(&text, &path_buf.display().to_string())
        })
        .await??;
        info!("Loaded {} geo reference places from {:?}", places.len(), path);
        Ok(Self::from_places(places))
    }

    pub fn bundled() -> Result<Self, GeoError> {
        parse_places(BUNDLED_REFERENCE, BUNDLED_ORIGIN).map(Self::from_places)
    }

    pub fn from_places(places: Vec<ReferencePlace>) -> Self {
        Self {
            rtree: RTree::bulk_load(places),
        }
    }

    pub fn len(&self) -> usize {
        self.rtree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.rtree.size() == 0
    }

    /// The nearest place to `point` no further than `max_distance_km`, if any.
    pub fn nearest(&self, point: LatLon, max_distance_km: f64) -> Option<Enrichment> {
        let LatLon(latitude, longitude) = point;
        self.rtree
            .nearest_neighbor_iter(&[latitude, longitude])
            .take(CANDIDATE_LIMIT)
            .map(|place| {
                let distance_km = distance(
                    HaversineLocation {
                        latitude,
                        longitude,
                    },
                    HaversineLocation {
                        latitude: place.latitude,
                        longitude: place.longitude,
                    },
                    Units::Kilometers,
                );
                (place, distance_km)
            })
            .filter(|(_, distance_km)| *distance_km <= max_distance_km)
            .min_by_key(|(_, distance_km)| OrderedFloat(*distance_km))
            .map(|(place, distance_km)| Enrichment {
                place: place.clone(),
                distance_km,
            })
    }
}

fn parse_places(text: &str, origin: &str) -> Result<Vec<ReferencePlace>, GeoError> {
    let places: Vec<ReferencePlace> =
        serde_json::from_str(text).map_err(|e| GeoError::Parse(origin.to_string(), e))?;
    if let Some(bad) = places.iter().find(|p| {
        !(-90.0..=90.0).contains(&p.latitude) || !(-180.0..=180.0).contains(&p.longitude)
    }) {
        return Err(GeoError::InvalidCoordinates {
            name: bad.name.clone(),
            latitude: bad.latitude,
            longitude: bad.longitude,
        });
    }
    Ok(places)
}
