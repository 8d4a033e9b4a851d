//! Pipeline configuration, loaded from a TOML file.
//!
//! Every option except `locations` has a default, so the smallest valid file is a single
//! `[[locations]]` table:
//!
//! ```toml
//! [[locations]]
//! name = "Sopron"
//! latitude = 47.685
//! longitude = 16.5905
//! ```

use crate::raw_store::WritePolicy;
use crate::types::location::{slugify, Location};
use crate::utils::get_data_dir;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "forecast_warehouse.toml";

pub const DEFAULT_HOURLY_VARIABLES: [&str; 7] = [
    "temperature_2m",
    "precipitation",
    "precipitation_probability",
    "cloud_cover",
    "weather_code",
    "wind_speed_10m",
    "wind_direction_10m",
];

pub const DEFAULT_DAILY_VARIABLES: [&str; 14] = [
    "temperature_2m_max",
    "temperature_2m_min",
    "sunrise",
    "sunset",
    "daylight_duration",
    "sunshine_duration",
    "uv_index_max",
    "precipitation_sum",
    "precipitation_hours",
    "snowfall_sum",
    "precipitation_probability_max",
    "wind_speed_10m_max",
    "wind_direction_10m_dominant",
    "wind_gusts_10m_max",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file '{0}' not found")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file '{0}'")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse configuration")]
    Parse(#[from] toml::de::Error),

    #[error("At least one location must be provided")]
    NoLocations,

    #[error("Latitude of '{name}' must be between -90 and 90 degrees, got {value}")]
    LatitudeOutOfRange { name: String, value: f64 },

    #[error("Longitude of '{name}' must be between -180 and 180 degrees, got {value}")]
    LongitudeOutOfRange { name: String, value: f64 },

    #[error("Location id '{0}' is used more than once")]
    DuplicateLocationId(String),

    #[error("Location name '{0}' does not produce a usable id; set `id` explicitly")]
    EmptyLocationId(String),

    #[error("Option '{0}' must be at least 1")]
    ZeroValue(&'static str),

    #[error("At least one hourly or daily variable must be requested")]
    NoVariables,

    #[error("Failed to determine default data directory")]
    DataDirResolution(#[source] std::io::Error),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LocationEntry {
    name: String,
    latitude: f64,
    longitude: f64,
    id: Option<String>,
    timezone: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    locations: Vec<LocationEntry>,
    hourly_variables: Option<Vec<String>>,
    daily_variables: Option<Vec<String>>,
    fetch_window_days: Option<u32>,
    retry_max: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
    concurrency_limit: Option<usize>,
    data_dir: Option<PathBuf>,
    warehouse_path: Option<PathBuf>,
    reference_path: Option<PathBuf>,
    max_reference_distance_km: Option<f64>,
    write_policy: Option<WritePolicy>,
    base_url: Option<String>,
    archive_base_url: Option<String>,
    run_timeout_secs: Option<u64>,
}

/// Validated configuration with every default resolved.
#[derive(Debug, Clone)]
pub struct Config {
    pub locations: Vec<Location>,
    pub hourly_variables: Vec<String>,
    pub daily_variables: Vec<String>,
    pub fetch_window_days: u32,
    pub retry: RetryConfig,
    pub request_timeout: Duration,
    pub concurrency_limit: usize,
    pub data_dir: PathBuf,
    pub warehouse_path: PathBuf,
    pub reference_path: PathBuf,
    pub max_reference_distance_km: f64,
    pub write_policy: WritePolicy,
    pub base_url: String,
    pub archive_base_url: String,
    pub run_timeout: Option<Duration>,
}

/// Bounded exponential backoff settings for the API client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt; `0` disables retrying.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        Self::from_toml_str(&text)
    }

    /// Parses configuration text; relative defaults are placed under the platform data dir.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        let default_data_dir = match &file.data_dir {
            Some(dir) => dir.clone(),
            None => get_data_dir().map_err(ConfigError::DataDirResolution)?,
        };
        Self::resolve(file, default_data_dir)
    }

    /// A configuration rooted at `data_dir`, used by tests and embedding callers.
    pub fn for_locations(locations: Vec<Location>, data_dir: &Path) -> Self {
        Self {
            locations,
            hourly_variables: DEFAULT_HOURLY_VARIABLES.map(String::from).to_vec(),
            daily_variables: DEFAULT_DAILY_VARIABLES.map(String::from).to_vec(),
            fetch_window_days: 16,
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(30),
            concurrency_limit: 4,
            data_dir: data_dir.to_path_buf(),
            warehouse_path: data_dir.join("warehouse").join("weather_dwh.duckdb"),
            reference_path: data_dir.join("reference").join("geo_reference.json"),
            max_reference_distance_km: 50.0,
            write_policy: WritePolicy::default(),
            base_url: "https://api.open-meteo.com".to_string(),
            archive_base_url: "https://archive-api.open-meteo.com".to_string(),
            run_timeout: None,
        }
    }

    fn resolve(file: ConfigFile, data_dir: PathBuf) -> Result<Self, ConfigError> {
        if file.locations.is_empty() {
            return Err(ConfigError::NoLocations);
        }

        let mut seen_ids = HashSet::new();
        let mut locations = Vec::with_capacity(file.locations.len());
        for entry in file.locations {
            if !(-90.0..=90.0).contains(&entry.latitude) {
                return Err(ConfigError::LatitudeOutOfRange {
                    name: entry.name,
                    value: entry.latitude,
                });
            }
            if !(-180.0..=180.0).contains(&entry.longitude) {
                return Err(ConfigError::LongitudeOutOfRange {
                    name: entry.name,
                    value: entry.longitude,
                });
            }
            let id = entry
                .id
                .as_deref()
                .map(slugify)
                .unwrap_or_else(|| slugify(&entry.name));
            if id.is_empty() {
                return Err(ConfigError::EmptyLocationId(entry.name));
            }
            if !seen_ids.insert(id.clone()) {
                return Err(ConfigError::DuplicateLocationId(id));
            }
            locations.push(Location {
                id,
                name: entry.name,
                latitude: entry.latitude,
                longitude: entry.longitude,
                timezone: entry.timezone.unwrap_or_else(|| "auto".to_string()),
            });
        }

        let mut config = Self::for_locations(locations, &data_dir);
        if let Some(vars) = file.hourly_variables {
            config.hourly_variables = vars;
        }
        if let Some(vars) = file.daily_variables {
            config.daily_variables = vars;
        }
        if config.hourly_variables.is_empty() && config.daily_variables.is_empty() {
            return Err(ConfigError::NoVariables);
        }

        if let Some(days) = file.fetch_window_days {
            if days == 0 {
                return Err(ConfigError::ZeroValue("fetch_window_days"));
            }
            config.fetch_window_days = days;
        }
        if let Some(limit) = file.concurrency_limit {
            if limit == 0 {
                return Err(ConfigError::ZeroValue("concurrency_limit"));
            }
            config.concurrency_limit = limit;
        }
        if let Some(retries) = file.retry_max {
            config.retry.max_retries = retries;
        }
        if let Some(ms) = file.backoff_base_ms {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = file.backoff_max_ms {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = file.request_timeout_secs {
            config.request_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(path) = file.warehouse_path {
            config.warehouse_path = path;
        }
        if let Some(path) = file.reference_path {
            config.reference_path = path;
        }
        if let Some(km) = file.max_reference_distance_km {
            config.max_reference_distance_km = km;
        }
        if let Some(policy) = file.write_policy {
            config.write_policy = policy;
        }
        if let Some(url) = file.base_url {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = file.archive_base_url {
            config.archive_base_url = url.trim_end_matches('/').to_string();
        }
        config.run_timeout = file.run_timeout_secs.map(Duration::from_secs);

        Ok(config)
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    pub fn normalized_dir(&self) -> PathBuf {
        self.data_dir.join("normalized")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        data_dir = "/tmp/fw"

        [[locations]]
        name = "Sopron"
        latitude = 47.685
        longitude = 16.5905
    "#;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.locations.len(), 1);
        assert_eq!(config.locations[0].id, "sopron");
        assert_eq!(config.locations[0].timezone, "auto");
        assert_eq!(config.fetch_window_days, 16);
        assert_eq!(config.concurrency_limit, 4);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.write_policy, WritePolicy::Idempotent);
        assert_eq!(
            config.warehouse_path,
            PathBuf::from("/tmp/fw/warehouse/weather_dwh.duckdb")
        );
        assert_eq!(config.hourly_variables.len(), DEFAULT_HOURLY_VARIABLES.len());
        assert_eq!(config.daily_variables.len(), 14);
        assert!(config.daily_variables.iter().any(|v| v == "sunrise"));
    }

    #[test]
    fn test_full_config() {
        let text = r#"
            data_dir = "/tmp/fw"
            hourly_variables = ["temperature_2m"]
            daily_variables = []
            fetch_window_days = 3
            retry_max = 2
            backoff_base_ms = 10
            backoff_max_ms = 40
            concurrency_limit = 8
            warehouse_path = "/tmp/other.duckdb"
            write_policy = "write_once"
            base_url = "http://localhost:9999/"
            run_timeout_secs = 60

            [[locations]]
            name = "New York"
            latitude = 40.7128
            longitude = -74.0060
            timezone = "America/New_York"

            [[locations]]
            id = "la"
            name = "Los Angeles"
            latitude = 34.0522
            longitude = -118.2437
        "#;
        let config = Config::from_toml_str(text).unwrap();
        assert_eq!(config.locations[0].id, "new-york");
        assert_eq!(config.locations[0].timezone, "America/New_York");
        assert_eq!(config.locations[1].id, "la");
        assert_eq!(config.hourly_variables, vec!["temperature_2m".to_string()]);
        assert!(config.daily_variables.is_empty());
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.write_policy, WritePolicy::WriteOnce);
        assert_eq!(config.base_url, "http://localhost:9999");
        assert_eq!(config.run_timeout, Some(Duration::from_secs(60)));
        assert!(config.locations.iter().any(|l| l.id == "la"));
    }

    #[test]
    fn test_coordinate_validation() {
        let cases = [
            ("New York", 40.7128, -74.0060, true),
            ("Invalid Latitude", 100.0, 50.0, false),
            ("Invalid Longitude", 50.0, 200.0, false),
            ("Edge Case Latitude", -90.0, 0.0, true),
            ("Edge Case Longitude", 0.0, -180.0, true),
        ];
        for (name, lat, lon, ok) in cases {
            let text = format!(
                "data_dir = \"/tmp/fw\"\n[[locations]]\nname = \"{name}\"\nlatitude = {lat:?}\nlongitude = {lon:?}\n"
            );
            assert_eq!(Config::from_toml_str(&text).is_ok(), ok, "case {name}");
        }
    }

    #[test]
    fn test_rejects_empty_and_duplicate_locations() {
        let empty = Config::from_toml_str("data_dir = \"/tmp/fw\"\nlocations = []\n");
        assert!(matches!(empty, Err(ConfigError::NoLocations)));

        let dup = r#"
            data_dir = "/tmp/fw"
            [[locations]]
            name = "Sopron"
            latitude = 47.6
            longitude = 16.5
            [[locations]]
            name = "sopron"
            latitude = 47.7
            longitude = 16.6
        "#;
        assert!(matches!(
            Config::from_toml_str(dup),
            Err(ConfigError::DuplicateLocationId(id)) if id == "sopron"
        ));
    }

    #[test]
    fn test_rejects_unknown_keys_and_zero_limits() {
        let unknown = format!("{MINIMAL}\nfetch_days = 3\n");
        assert!(matches!(
            Config::from_toml_str(&unknown),
            Err(ConfigError::Parse(_))
        ));

        let zero = MINIMAL.replace("data_dir", "concurrency_limit = 0\ndata_dir");
        assert!(matches!(
            Config::from_toml_str(&zero),
            Err(ConfigError::ZeroValue("concurrency_limit"))
        ));
    }

    #[test]
    fn test_backoff_is_bounded() {
        let retry = RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(4), Duration::from_millis(800));
        assert_eq!(retry.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(retry.delay_for(60), Duration::from_millis(1_000));
    }
}
