// =============================================================================
// Info endpoint client — exchange universe metadata and mid prices
// =============================================================================

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, instrument};

use super::ExchangeError;

/// One asset of the exchange universe.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMeta {
    pub name: String,
    pub sz_decimals: u32,
    #[serde(default)]
    pub tick_size: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct MetaResponse {
    universe: Vec<AssetMeta>,
}

/// Client for the exchange's unsigned `POST /info` endpoint.
#[derive(Debug, Clone)]
pub struct InfoClient {
    base_url: String,
    client: reqwest::Client,
}

impl InfoClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    /// `POST /info {type: "meta"}` — the tradable universe.
    #[instrument(skip(self), name = "info::meta")]
    pub async fn meta(&self) -> Result<Vec<AssetMeta>, ExchangeError> {
        let resp = self
            .client
            .post(&self.base_url)
            .json(&serde_json::json!({"type": "meta"}))
            .send()
            .await?;

        let body: MetaResponse = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Shape(format!("meta response: {e}")))?;

        debug!(assets = body.universe.len(), "universe metadata fetched");
        Ok(body.universe)
    }

    /// `POST /info {type: "allMids"}` — current mid per coin, prices sent as
    /// strings.
    #[instrument(skip(self), name = "info::all_mids")]
    pub async fn all_mids(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        let resp = self
            .client
            .post(&self.base_url)
            .json(&serde_json::json!({"type": "allMids"}))
            .send()
            .await?;

        let body: serde_json::Value = resp.json().await?;
        let map = body
            .as_object()
            .ok_or_else(|| ExchangeError::Shape("allMids is not an object".into()))?;

        let mids = map
            .iter()
            .filter_map(|(coin, price)| {
                let price: f64 = price.as_str()?.parse().ok()?;
                Some((coin.to_uppercase(), price))
            })
            .collect();

        Ok(mids)
    }
}
