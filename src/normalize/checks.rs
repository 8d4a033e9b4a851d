//! Physically plausible value ranges for known Open-Meteo variables.
//!
//! Bounds are deliberately wide: they reject sensor and encoding garbage, not extreme weather.

/// Inclusive `(min, max)` for `variable`, or `None` when the variable is not known.
pub fn plausible_range(variable: &str) -> Option<(f64, f64)> {
    let range = match variable {
        "temperature_2m"
        | "apparent_temperature"
        | "dew_point_2m"
        | "temperature_2m_max"
        | "temperature_2m_min"
        | "temperature_2m_mean"
        | "apparent_temperature_max"
        | "apparent_temperature_min" => (-90.0, 60.0),
        "precipitation" | "rain" | "showers" => (0.0, 500.0),
        "precipitation_sum" | "rain_sum" | "showers_sum" => (0.0, 2000.0),
        "snowfall" | "snowfall_sum" | "snow_depth" => (0.0, 1000.0),
        "precipitation_hours" => (0.0, 24.0),
        "precipitation_probability"
        | "precipitation_probability_max"
        | "precipitation_probability_mean"
        | "relative_humidity_2m"
        | "cloud_cover"
        | "cloud_cover_low"
        | "cloud_cover_mid"
        | "cloud_cover_high" => (0.0, 100.0),
        "weather_code" => (0.0, 99.0),
        "wind_speed_10m" | "wind_gusts_10m" | "wind_speed_10m_max" | "wind_gusts_10m_max" => {
            (0.0, 500.0)
        }
        "wind_direction_10m" | "wind_direction_10m_dominant" => (0.0, 360.0),
        "pressure_msl" | "surface_pressure" => (300.0, 1100.0),
        "uv_index" | "uv_index_max" => (0.0, 20.0),
        "visibility" => (0.0, 100_000.0),
        "shortwave_radiation" => (0.0, 1500.0),
        "shortwave_radiation_sum" => (0.0, 50.0),
        "sunshine_duration" | "daylight_duration" => (0.0, 86_400.0),
        _ => return None,
    };
    Some(range)
}

/// Daily variables the provider reports as ISO timestamps rather than numbers.
///
/// They are stored as seconds since the Unix epoch, on the same local clock as
/// `forecast_time`.
pub fn is_time_valued(variable: &str) -> bool {
    matches!(variable, "sunrise" | "sunset")
}

/// A human-readable note when `value` lies outside the plausible range of `variable`.
pub fn range_violation(variable: &str, value: f64) -> Option<String> {
    let (min, max) = plausible_range(variable)?;
    if value.is_finite() && (min..=max).contains(&value) {
        None
    } else {
        Some(format!("value {value} outside plausible range [{min}, {max}]"))
    }
}
