//! Static location reference data and the forecast time window.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

/// Represents a geographical coordinate using latitude and longitude.
///
/// Latitude is the first element (index 0), and longitude is the second (index 1).
///
/// # Examples
///
/// ```
/// use forecast_warehouse::LatLon;
///
/// let sopron = LatLon(47.685, 16.5905);
/// assert_eq!(sopron.0, 47.685);
/// assert_eq!(sopron.1, 16.5905);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLon(pub f64, pub f64);

/// A named geographic point forecasts are fetched for.
///
/// Locations are seeded from configuration and never change during a run. The `id` is the
/// natural key used by every downstream layer (raw store directory, snapshot column,
/// `dim_location.location_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// IANA timezone name, or `"auto"` to let the provider resolve it from the coordinates.
    pub timezone: String,
}

impl Location {
    pub fn new(name: &str, latitude: f64, longitude: f64) -> Self {
        Self {
            id: slugify(name),
            name: name.to_string(),
            latitude,
            longitude,
            timezone: "auto".to_string(),
        }
    }

    pub fn lat_lon(&self) -> LatLon {
        LatLon(self.latitude, self.longitude)
    }
}

/// Derives a filesystem and SQL friendly identifier from a display name.
///
/// Lowercases ASCII alphanumerics and collapses every other run of characters into a
/// single `-`.
///
/// ```
/// use forecast_warehouse::slugify;
///
/// assert_eq!(slugify("New York"), "new-york");
/// assert_eq!(slugify("  Győr / Sopron "), "gy-r-sopron");
/// ```
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// An inclusive range of calendar dates requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeWindow {
    /// Returns `None` when `end` lies before `start`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// A window of `days` days starting at `start` (`days` is clamped to at least one).
    pub fn starting_at(start: NaiveDate, days: u32) -> Self {
        let span = u64::from(days.max(1) - 1);
        let end = start.checked_add_days(Days::new(span)).unwrap_or(start);
        Self { start, end }
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}
