//! HTTP client for the Open-Meteo forecast and archive endpoints.
//!
//! The client performs no transformation: a successful fetch returns the response body
//! byte for byte so the raw store can keep it verbatim.

use crate::client::error::FetchError;
use crate::client::retry::FetchState;
use crate::config::{Config, RetryConfig};
use crate::types::location::{Location, TimeWindow};
use bon::bon;
use log::{debug, info, warn};
use reqwest::{Client, Url};
use std::time::Duration;

/// Maximum length of the response body preview included in errors.
const BODY_PREVIEW_LEN: usize = 500;

/// Which provider API a window is requested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endpoint {
    /// Forecasts starting today.
    #[default]
    Forecast,
    /// Reanalysis data for past windows.
    Archive,
}

/// A successful provider response.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload {
    pub bytes: Vec<u8>,
    pub source_url: String,
    pub status: u16,
}

pub struct ForecastClient {
    http: Client,
    base_url: String,
    archive_base_url: String,
    hourly_variables: Vec<String>,
    daily_variables: Vec<String>,
    retry: RetryConfig,
}

#[bon]
impl ForecastClient {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout.min(Duration::from_secs(30)))
            .build()
            .map_err(FetchError::ClientBuild)?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            archive_base_url: config.archive_base_url.clone(),
            hourly_variables: config.hourly_variables.clone(),
            daily_variables: config.daily_variables.clone(),
            retry: config.retry,
        })
    }

    /// Fetches the forecast payload for one location and window.
    ///
    /// Transient failures (connection problems, timeouts, HTTP 5xx and 429) are retried with
    /// bounded exponential backoff; any other 4xx fails immediately with
    /// [`FetchError::InvalidRequest`].
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use forecast_warehouse::{Config, ForecastClient, Location, TimeWindow, FetchError};
    /// # use chrono::NaiveDate;
    /// # async fn run(config: &Config) -> Result<(), FetchError> {
    /// let client = ForecastClient::new(config)?;
    /// let sopron = Location::new("Sopron", 47.685, 16.5905);
    /// let window = TimeWindow::starting_at(NaiveDate::from_ymd_opt(2026, 2, 21).unwrap(), 16);
    ///
    /// let payload = client.fetch().location(&sopron).window(window).call().await?;
    /// println!("{} bytes from {}", payload.bytes.len(), payload.source_url);
    /// # Ok(())
    /// # }
    /// ```
    #[builder]
    pub async fn fetch(
        &self,
        location: &Location,
        window: TimeWindow,
        endpoint: Option<Endpoint>,
    ) -> Result<RawPayload, FetchError> {
        let url = self.build_url(location, window, endpoint.unwrap_or_default())?;
        info!("Fetching {} for {}", url, location.id);

        let mut state = FetchState::Pending;
        loop {
            state = match state {
                FetchState::Succeeded(payload) => return Ok(payload),
                FetchState::Failed(error) => return Err(error),
                FetchState::Retrying(n) => {
                    let delay = self.retry.delay_for(n);
                    warn!(
                        "retry {}/{} for {} in {:?}",
                        n, self.retry.max_retries, location.id, delay
                    );
                    tokio::time::sleep(delay).await;
                    FetchState::Retrying(n)
                }
                FetchState::Pending => FetchState::Pending,
            };
            let outcome = self.attempt(&url).await;
            if let Err(e) = &outcome {
                warn!("Fetch attempt for {} failed: {}", location.id, e);
            }
            state = state.next(outcome, &self.retry);
        }
    }
}

impl ForecastClient {
    pub(crate) fn build_url(
        &self,
        location: &Location,
        window: TimeWindow,
        endpoint: Endpoint,
    ) -> Result<Url, FetchError> {
        let base = match endpoint {
            Endpoint::Forecast => format!("{}/v1/forecast", self.base_url),
            Endpoint::Archive => format!("{}/v1/archive", self.archive_base_url),
        };

        let mut params: Vec<(&str, String)> = vec![
            ("latitude", location.latitude.to_string()),
            ("longitude", location.longitude.to_string()),
        ];
        if !self.hourly_variables.is_empty() {
            params.push(("hourly", self.hourly_variables.join(",")));
        }
        if !self.daily_variables.is_empty() {
            params.push(("daily", self.daily_variables.join(",")));
        }
        params.push(("start_date", window.start.format("%Y-%m-%d").to_string()));
        params.push(("end_date", window.end.format("%Y-%m-%d").to_string()));
        params.push(("timezone", location.timezone.clone()));

        Url::parse_with_params(&base, &params).map_err(|e| FetchError::InvalidUrl {
            url: base.clone(),
            message: e.to_string(),
        })
    }

    /// Sends one request and classifies the outcome.
    async fn attempt(&self, url: &Url) -> Result<RawPayload, FetchError> {
        let url_string = url.to_string();
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::Network {
                url: url_string.clone(),
                source: e,
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited { url: url_string });
        }
        if status.is_server_error() {
            return Err(FetchError::ServerError {
                url: url_string,
                status,
            });
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            let body_preview = body.chars().take(BODY_PREVIEW_LEN).collect();
            return Err(FetchError::InvalidRequest {
                url: url_string,
                status,
                body_preview,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network {
                url: url_string.clone(),
                source: e,
            })?;
        debug!("Received {} bytes from {}", bytes.len(), url_string);

        Ok(RawPayload {
            bytes: bytes.to_vec(),
            source_url: url_string,
            status: status.as_u16(),
        })
    }
}
