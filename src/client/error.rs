use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to build HTTP client")]
    ClientBuild(#[source] reqwest::Error),

    #[error("Invalid request URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Network request failed for {url}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP request failed for {url} with server status {status}")]
    ServerError {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("Rate limited by provider for {url}")]
    RateLimited { url: String },

    /// A 4xx response other than 429. Permanent: the same request will fail again.
    #[error("Invalid request for {url}: HTTP {status}: {body_preview}")]
    InvalidRequest {
        url: String,
        status: reqwest::StatusCode,
        body_preview: String,
    },

    #[error("Giving up on {url} after {attempts} attempts")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },

    #[error("Fetch for location '{location_id}' was cancelled")]
    Cancelled { location_id: String },
}

impl FetchError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network { source, .. } => {
                source.is_timeout()
                    || source.is_connect()
                    || source.is_request()
                    || source.is_body()
                    || source.is_decode()
            }
            FetchError::ServerError { .. } | FetchError::RateLimited { .. } => true,
            FetchError::ClientBuild(_)
            | FetchError::InvalidUrl { .. }
            | FetchError::InvalidRequest { .. }
            | FetchError::RetriesExhausted { .. }
            | FetchError::Cancelled { .. } => false,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            FetchError::InvalidUrl { url, .. }
            | FetchError::Network { url, .. }
            | FetchError::ServerError { url, .. }
            | FetchError::RateLimited { url }
            | FetchError::InvalidRequest { url, .. }
            | FetchError::RetriesExhausted { url, .. } => Some(url),
            FetchError::ClientBuild(_) | FetchError::Cancelled { .. } => None,
        }
    }
}
