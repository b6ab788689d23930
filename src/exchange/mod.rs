pub mod filters;
pub mod info;
pub mod rest;

pub use filters::{FilterCache, SymbolFilters};
pub use info::InfoClient;
pub use rest::FuturesRestClient;

use thiserror::Error;

/// Exchange business error codes treated as "order already gone" on cancel.
pub const CODE_UNKNOWN_ORDER: i64 = -2011;
pub const CODE_NO_SUCH_ORDER: i64 = -2013;

/// Error taxonomy for exchange calls.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Transport failure; retriable, no state change implied.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The exchange answered with a business error.
    #[error("exchange error {code}: {message}")]
    Api { code: i64, message: String },

    /// The response body did not have the expected shape.
    #[error("unexpected response shape: {0}")]
    Shape(String),

    /// A safety procedure could not restore a clean state; a human must act.
    #[error("MANUAL INTERVENTION REQUIRED: {0}")]
    Unrecovered(String),
}

impl ExchangeError {
    /// True for the unknown-order family of cancel errors.
    pub fn is_unknown_order(&self) -> bool {
        matches!(
            self,
            Self::Api { code, .. } if *code == CODE_UNKNOWN_ORDER || *code == CODE_NO_SUCH_ORDER
        )
    }
}
