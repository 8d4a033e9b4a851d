use chrono::{Duration, NaiveDate, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use forecast_warehouse::normalize::normalize_records;
use forecast_warehouse::{IngestionBatch, RawFetch};
use serde_json::json;

/// A 16 day hourly forecast with the default seven hourly variables.
fn sixteen_day_fetch() -> RawFetch {
    let start = NaiveDate::from_ymd_opt(2026, 2, 21)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap();
    let hours = 16 * 24;
    let times: Vec<String> = (0..hours)
        .map(|i| (start + Duration::hours(i)).format("%Y-%m-%dT%H:%M").to_string())
        .collect();
    let series = |scale: f64| -> Vec<f64> { (0..hours).map(|i| (i % 24) as f64 * scale).collect() };
    let payload = json!({
        "latitude": 47.68,
        "longitude": 16.58,
        "hourly": {
            "time": times,
            "temperature_2m": series(0.5),
            "precipitation": series(0.1),
            "precipitation_probability": series(4.0),
            "cloud_cover": series(4.0),
            "weather_code": series(1.0),
            "wind_speed_10m": series(1.5),
            "wind_direction_10m": series(15.0),
        }
    });

    let requested_at = Utc.with_ymd_and_hms(2026, 2, 21, 6, 0, 0).unwrap();
    RawFetch {
        fetch_id: RawFetch::fetch_id_for("sopron", requested_at),
        location_id: "sopron".to_string(),
        requested_at,
        payload: serde_json::to_vec(&payload).unwrap(),
        source_url: "https://api.open-meteo.com/v1/forecast".to_string(),
    }
}

fn bench_normalize(c: &mut Criterion) {
    let fetch = sixteen_day_fetch();
    let batch_id = IngestionBatch::batch_id_for(&fetch.fetch_id);
    c.bench_function("normalize_records_16_days", |b| {
        b.iter(|| normalize_records(black_box(&fetch), black_box(&batch_id)))
    });
}

criterion_group!(benches, bench_normalize);
criterion_main!(benches);
