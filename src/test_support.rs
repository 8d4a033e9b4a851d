//! Fixtures shared by the in-module test suites.

use crate::types::location::Location;
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub fn sample_location() -> Location {
    Location::new("Sopron", 47.685, 16.5905)
}

pub fn second_location() -> Location {
    Location::new("Budapest", 47.4979, 19.0402)
}

/// Hourly timestamps in the provider's `YYYY-MM-DDTHH:MM` layout.
pub fn hourly_times(start: NaiveDateTime, count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            (start + ChronoDuration::hours(i as i64))
                .format("%Y-%m-%dT%H:%M")
                .to_string()
        })
        .collect()
}

pub fn day_start(year: i32, month: u32, day: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("valid test date")
}

/// A provider payload with `temperature_2m` and `precipitation` hourly series.
///
/// Temperatures are `base_temp + hour index * 0.1`; precipitation is `0.2` everywhere.
pub fn hourly_payload(start: NaiveDateTime, hours: usize, base_temp: f64) -> Value {
    let times = hourly_times(start, hours);
    let temps: Vec<f64> = (0..hours).map(|i| base_temp + i as f64 * 0.1).collect();
    let precip: Vec<f64> = vec![0.2; hours];
    json!({
        "latitude": 47.68,
        "longitude": 16.58,
        "timezone": "Europe/Budapest",
        "hourly_units": {"time": "iso8601", "temperature_2m": "°C", "precipitation": "mm"},
        "hourly": {
            "time": times,
            "temperature_2m": temps,
            "precipitation": precip,
        }
    })
}

pub fn payload_bytes(payload: &Value) -> Vec<u8> {
    serde_json::to_vec(payload).expect("serializable payload")
}

/// Minimal HTTP/1.1 server answering requests with a scripted list of responses.
///
/// The n-th request receives the n-th response; once the script runs out the last
/// response is repeated.
pub struct StubServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl StubServer {
    pub async fn start(responses: Vec<(u16, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub server");
        let addr = listener.local_addr().expect("stub server address");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&buf).to_string();
                let target = head
                    .lines()
                    .next()
                    .and_then(|line| line.split_whitespace().nth(1))
                    .unwrap_or_default()
                    .to_string();

                let index = {
                    let mut seen = seen.lock().expect("stub lock");
                    seen.push(target);
                    seen.len() - 1
                };
                let (status, body) = responses
                    .get(index)
                    .or_else(|| responses.last())
                    .cloned()
                    .unwrap_or((500, String::new()));
                let response = format!(
                    "HTTP/1.1 {status} STUB\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            requests,
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("stub lock").clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("stub lock").len()
    }
}
