//! Retry bookkeeping for a single fetch, modelled as an explicit state machine.
//!
//! ```text
//! Pending ──ok──▶ Succeeded
//!    │ transient error, retries left
//!    ▼
//! Retrying(n) ──ok──▶ Succeeded
//!    │ permanent error, or transient with no retries left
//!    ▼
//! Failed
//! ```

use crate::client::error::FetchError;
use crate::client::forecast_client::RawPayload;
use crate::config::RetryConfig;

#[derive(Debug)]
pub enum FetchState {
    /// No attempt made yet.
    Pending,
    /// `n` retries have been scheduled so far; the next attempt is retry number `n`.
    Retrying(u32),
    Failed(FetchError),
    Succeeded(RawPayload),
}

impl FetchState {
    /// Advances the machine with the outcome of one HTTP attempt. Terminal states are
    /// returned unchanged.
    pub fn next(self, outcome: Result<RawPayload, FetchError>, retry: &RetryConfig) -> FetchState {
        let retries_so_far = match self {
            FetchState::Pending => 0,
            FetchState::Retrying(n) => n,
            terminal @ (FetchState::Failed(_) | FetchState::Succeeded(_)) => return terminal,
        };

        match outcome {
            Ok(payload) => FetchState::Succeeded(payload),
            Err(error) if error.is_transient() && retries_so_far < retry.max_retries => {
                FetchState::Retrying(retries_so_far + 1)
            }
            Err(error) if error.is_transient() => FetchState::Failed(FetchError::RetriesExhausted {
                url: error.url().unwrap_or_default().to_string(),
                attempts: retries_so_far + 1,
                last: Box::new(error),
            }),
            Err(error) => FetchState::Failed(error),
        }
    }
}
