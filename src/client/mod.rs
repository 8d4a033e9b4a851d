pub mod error;
pub mod forecast_client;
pub mod retry;
