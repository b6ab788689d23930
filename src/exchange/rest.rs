// =============================================================================
// Futures REST client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry the API key as the X-MBX-APIKEY header plus `timestamp` and a
// recvWindow of 5 000 ms to tolerate minor clock drift against the exchange.
// =============================================================================

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

use super::ExchangeError;
use crate::types::OrderSide;

type HmacSha256 = Hmac<Sha256>;

/// Recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Signed REST client for the USDT-margined futures API.
#[derive(Clone)]
pub struct FuturesRestClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl FuturesRestClient {
    /// # Arguments
    /// * `api_key` — sent as a header, never in query params.
    /// * `secret`  — used exclusively for HMAC signing.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            secret,
            base_url: base_url.into(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Full query string for a signed request (appends timestamp, recvWindow,
    /// and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Read a response body, mapping non-2xx statuses with a `code` field to
    /// `ExchangeError::Api`.
    async fn read_response(resp: reqwest::Response) -> Result<serde_json::Value, ExchangeError> {
        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;

        if !status.is_success() {
            let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(-1);
            let message = body
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            return Err(ExchangeError::Api { code, message });
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/order (signed) — submit a MARKET or LIMIT order.
    ///
    /// `price` + `timeInForce=GTC` are sent for limits; `reduceOnly=true` is
    /// set for close and take-profit orders.
    #[instrument(skip(self, price), name = "rest::place_order")]
    pub async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: &str,
        quantity: f64,
        price: Option<f64>,
        reduce_only: bool,
    ) -> Result<serde_json::Value, ExchangeError> {
        let mut params = format!(
            "symbol={symbol}&side={}&type={order_type}&quantity={quantity}",
            side.as_exchange_str()
        );

        if let Some(p) = price {
            params.push_str(&format!("&price={p}&timeInForce=GTC"));
        }
        if reduce_only {
            params.push_str("&reduceOnly=true");
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol, side = %side, order_type, quantity, reduce_only, "placing order");

        let resp = self.client.post(&url).send().await?;
        let body = Self::read_response(resp).await?;

        debug!(
            symbol,
            order_id = body.get("orderId").and_then(|v| v.as_u64()).unwrap_or(0),
            "order placed"
        );
        Ok(body)
    }

    /// DELETE /fapi/v1/order (signed) — cancel an order by id.
    #[instrument(skip(self), name = "rest::cancel_order")]
    pub async fn cancel_order(
        &self,
        symbol: &str,
        order_id: u64,
    ) -> Result<serde_json::Value, ExchangeError> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol, order_id, "cancelling order");

        let resp = self.client.delete(&url).send().await?;
        Self::read_response(resp).await
    }

    /// GET /fapi/v1/order (signed) — query a single order's status.
    #[instrument(skip(self), name = "rest::get_order")]
    pub async fn get_order(
        &self,
        symbol: &str,
        order_id: u64,
    ) -> Result<serde_json::Value, ExchangeError> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        let resp = self.client.get(&url).send().await?;
        Self::read_response(resp).await
    }

    /// GET /fapi/v1/userTrades (signed) — fills for one order.
    #[instrument(skip(self), name = "rest::get_user_trades")]
    pub async fn get_user_trades(
        &self,
        symbol: &str,
        order_id: u64,
    ) -> Result<Vec<serde_json::Value>, ExchangeError> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/userTrades?{}", self.base_url, qs);

        let resp = self.client.get(&url).send().await?;
        let body = Self::read_response(resp).await?;

        body.as_array()
            .cloned()
            .ok_or_else(|| ExchangeError::Shape("userTrades is not an array".into()))
    }

    /// GET /fapi/v2/positionRisk (signed) — current positions.
    #[instrument(skip(self), name = "rest::get_position_risk")]
    pub async fn get_position_risk(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<serde_json::Value>, ExchangeError> {
        let params = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v2/positionRisk?{}", self.base_url, qs);

        let resp = self.client.get(&url).send().await?;
        let body = Self::read_response(resp).await?;

        body.as_array()
            .cloned()
            .ok_or_else(|| ExchangeError::Shape("positionRisk is not an array".into()))
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/exchangeInfo (public) — symbol filters.
    #[instrument(skip(self), name = "rest::get_exchange_info")]
    pub async fn get_exchange_info(&self) -> Result<serde_json::Value, ExchangeError> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let resp = self.client.get(&url).send().await?;
        Self::read_response(resp).await
    }

    /// GET /fapi/v1/klines (public) — raw candle arrays.
    ///
    /// Array indices: [0] openTime, [1] open, [2] high, [3] low, [4] close,
    /// [5] volume, [6] closeTime, …
    #[instrument(skip(self), name = "rest::get_klines")]
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<serde_json::Value>, ExchangeError> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        let resp = self.client.get(&url).send().await?;
        let body = Self::read_response(resp).await?;

        body.as_array()
            .cloned()
            .ok_or_else(|| ExchangeError::Shape("klines is not an array".into()))
    }
}

impl std::fmt::Debug for FuturesRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuturesRestClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
