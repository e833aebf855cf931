//! BloFin REST gateway adapter.
//!
//! Implements [`BrokerGateway`] against the BloFin futures REST API:
//! HMAC-SHA256 header signing, a shared HTTP client with bounded
//! timeouts, and typed decoding of the `code`/`msg`/`data` envelope.
//! Rate limiting and transport details live here, below the trait.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Method;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use sha2::Sha256;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::models::{InstrumentSpec, Side};

use super::{
    BrokerGateway, CloseReason, ConditionalOrder, ConditionalOrderSpec, GatewayError,
    OrderLifecycle, PendingOrder, PositionSnapshot,
};

type HmacSha256 = Hmac<Sha256>;

/// API credentials for the BloFin REST API.
#[derive(Debug, Clone)]
pub struct BlofinCredentials {
    /// API key.
    pub api_key: String,
    /// API secret used for request signing.
    pub api_secret: String,
    /// API passphrase.
    pub passphrase: String,
}

/// BloFin REST gateway.
pub struct BlofinGateway {
    client: reqwest::Client,
    base_url: String,
    credentials: BlofinCredentials,
    timeout_secs: u64,
    margin_mode: String,
}

/// Standard BloFin response envelope.
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    code: String,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

/// Some endpoints return a single object, others a one-element list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_first(self) -> Option<T> {
        match self {
            Self::One(v) => Some(v),
            Self::Many(vs) => vs.into_iter().next(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTpslAck {
    tpsl_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOrderAck {
    order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTpslOrder {
    tpsl_id: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    tp_trigger_price: Option<String>,
    #[serde(default)]
    sl_trigger_price: Option<String>,
    #[serde(default)]
    order_category: Option<String>,
    #[serde(default)]
    create_time: Option<String>,
    #[serde(default)]
    trigger_time: Option<String>,
}

impl WireTpslOrder {
    fn into_conditional(self) -> ConditionalOrder {
        let updated_at = self
            .trigger_time
            .as_deref()
            .or(self.create_time.as_deref())
            .and_then(parse_millis)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        ConditionalOrder {
            order_id: self.tpsl_id,
            state: OrderLifecycle::from_wire(&self.state),
            tp_trigger: opt_price(self.tp_trigger_price.as_deref()),
            sl_trigger: opt_price(self.sl_trigger_price.as_deref()),
            updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePosition {
    inst_id: String,
    #[serde(default)]
    positions: String,
    #[serde(default)]
    unrealized_pnl: Option<String>,
    #[serde(default)]
    mark_price: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOrder {
    order_id: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    filled_size: Option<String>,
    #[serde(default)]
    average_price: Option<String>,
    #[serde(default)]
    order_category: Option<String>,
}

impl WireOrder {
    fn into_pending(self) -> PendingOrder {
        PendingOrder {
            order_id: self.order_id,
            state: OrderLifecycle::from_wire(&self.state),
            filled_size: self
                .filled_size
                .as_deref()
                .and_then(|s| Decimal::from_str(s).ok())
                .unwrap_or(Decimal::ZERO),
            avg_price: opt_price(self.average_price.as_deref()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInstrument {
    #[serde(default)]
    lot_size: String,
    #[serde(default)]
    tick_size: String,
    #[serde(default)]
    min_size: String,
    #[serde(default)]
    contract_value: String,
}

#[derive(Debug, Deserialize)]
struct WireTicker {
    last: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBalance {
    currency: String,
    #[serde(default)]
    available: String,
}

/// Parse an epoch-milliseconds string.
fn parse_millis(s: &str) -> Option<DateTime<Utc>> {
    s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)
}

/// Parse an optional price field; empty strings and "0" mean unset.
fn opt_price(s: Option<&str>) -> Option<Decimal> {
    let s = s?;
    if s.is_empty() || s == "0" {
        return None;
    }
    Decimal::from_str(s).ok()
}

fn parse_decimal(s: &str, field: &str) -> Result<Decimal, GatewayError> {
    Decimal::from_str(s)
        .map_err(|e| GatewayError::Decode(format!("{field}: bad decimal {s:?}: {e}")))
}

impl BlofinGateway {
    /// Create a gateway from config and credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        config: &GatewayConfig,
        credentials: BlofinCredentials,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
            timeout_secs: config.timeout_secs,
            margin_mode: config.margin_mode.clone(),
        })
    }

    /// Sign a request: hex HMAC-SHA256 of the prehash, then base64.
    fn sign(
        &self,
        path_and_query: &str,
        method: &str,
        timestamp: &str,
        nonce: &str,
        body: &str,
    ) -> Result<String, GatewayError> {
        let prehash = format!("{path_and_query}{method}{timestamp}{nonce}{body}");
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .map_err(|e| GatewayError::Http(e.to_string()))?;
        mac.update(prehash.as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());
        Ok(BASE64.encode(digest.as_bytes()))
    }

    /// Signed request returning the full envelope (code already checked).
    async fn request_envelope<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<ApiEnvelope<T>, GatewayError> {
        let query_string = if query.is_empty() {
            String::new()
        } else {
            let parts: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
            format!("?{}", parts.join("&"))
        };
        let path_and_query = format!("{path}{query_string}");

        let body_str = match &body {
            Some(b) if method != Method::GET => b.to_string(),
            _ => String::new(),
        };

        let timestamp = Utc::now().timestamp_millis().to_string();
        let nonce = Uuid::new_v4().to_string();
        let signature = self.sign(
            &path_and_query,
            method.as_str(),
            &timestamp,
            &nonce,
            &body_str,
        )?;

        let url = format!("{}{}", self.base_url, path_and_query);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("ACCESS-KEY", &self.credentials.api_key)
            .header("ACCESS-SIGN", signature)
            .header("ACCESS-TIMESTAMP", timestamp)
            .header("ACCESS-NONCE", nonce)
            .header("ACCESS-PASSPHRASE", &self.credentials.passphrase)
            .header("Content-Type", "application/json");

        if method != Method::GET {
            if let Some(b) = body {
                request = request.body(b.to_string());
            }
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.timeout_secs)
            } else {
                GatewayError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(GatewayError::RateLimited);
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(GatewayError::AuthenticationFailed);
        }

        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        if envelope.code != "0" {
            return Err(GatewayError::Api {
                code: envelope.code,
                message: envelope.msg,
            });
        }

        Ok(envelope)
    }

    /// Signed request whose `data` field is required.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<T, GatewayError> {
        let envelope = self.request_envelope(method, path, query, body).await?;
        envelope
            .data
            .ok_or_else(|| GatewayError::Decode("missing data field".to_string()))
    }

    /// Signed request for list endpoints; a missing `data` field means
    /// an empty result, not an error.
    async fn request_list<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, GatewayError> {
        let envelope = self.request_envelope(method, path, query, None).await?;
        Ok(envelope.data.unwrap_or_default())
    }

    /// Fire a request where only the envelope code matters.
    async fn request_ok(
        &self,
        method: Method,
        path: &str,
        body: serde_json::Value,
    ) -> Result<(), GatewayError> {
        let _: ApiEnvelope<serde_json::Value> = self
            .request_envelope(method, path, &[], Some(body))
            .await?;
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        self.request_ok(
            Method::POST,
            "/api/v1/account/set-leverage",
            json!({
                "instId": symbol,
                "leverage": leverage.to_string(),
                "marginMode": self.margin_mode,
            }),
        )
        .await
    }

    async fn place_entry_order(
        &self,
        symbol: &str,
        side: Side,
        size: Decimal,
        price: Option<Decimal>,
        leverage: u32,
    ) -> Result<String, GatewayError> {
        self.set_leverage(symbol, leverage).await?;

        let mut body = json!({
            "instId": symbol,
            "marginMode": self.margin_mode,
            "positionSide": "net",
            "side": side.as_str(),
            "orderType": if price.is_some() { "limit" } else { "market" },
            "size": size.to_string(),
        });
        if let Some(p) = price {
            body["price"] = json!(p.to_string());
        }

        let ack: OneOrMany<WireOrderAck> = self
            .request(Method::POST, "/api/v1/trade/order", &[], Some(body))
            .await?;
        ack.into_first()
            .map(|a| a.order_id)
            .ok_or_else(|| GatewayError::Decode("empty order ack".to_string()))
    }
}

#[async_trait]
impl BrokerGateway for BlofinGateway {
    async fn place_conditional_order(
        &self,
        spec: &ConditionalOrderSpec,
    ) -> Result<String, GatewayError> {
        let mut body = json!({
            "instId": spec.symbol,
            "marginMode": self.margin_mode,
            "positionSide": "net",
            "side": spec.side.close_side().as_str(),
            "size": spec.size.to_string(),
            "reduceOnly": "true",
        });
        if let Some(tp) = spec.tp_trigger {
            body["tpTriggerPrice"] = json!(tp.to_string());
            body["tpOrderPrice"] = json!("-1");
        }
        if let Some(sl) = spec.sl_trigger {
            body["slTriggerPrice"] = json!(sl.to_string());
            body["slOrderPrice"] = json!("-1");
        }

        let ack: OneOrMany<WireTpslAck> = self
            .request(Method::POST, "/api/v1/trade/order-tpsl", &[], Some(body))
            .await?;
        ack.into_first()
            .map(|a| a.tpsl_id)
            .ok_or_else(|| GatewayError::Decode("empty tpsl ack".to_string()))
    }

    async fn cancel_conditional_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<(), GatewayError> {
        self.request_ok(
            Method::POST,
            "/api/v1/trade/cancel-tpsl",
            json!({ "instId": symbol, "tpslId": order_id }),
        )
        .await
    }

    async fn amend_conditional_order(
        &self,
        symbol: &str,
        order_id: &str,
        new_tp: Option<Decimal>,
        new_sl: Option<Decimal>,
        new_size: Option<Decimal>,
    ) -> Result<(), GatewayError> {
        let mut body = json!({ "instId": symbol, "tpslId": order_id });
        if let Some(tp) = new_tp {
            body["tpTriggerPrice"] = json!(tp.to_string());
        }
        if let Some(sl) = new_sl {
            body["slTriggerPrice"] = json!(sl.to_string());
        }
        if let Some(size) = new_size {
            body["size"] = json!(size.to_string());
        }
        self.request_ok(Method::POST, "/api/v1/trade/amend-tpsl", body)
            .await
    }

    async fn conditional_order_history(
        &self,
        symbol: &str,
    ) -> Result<Vec<ConditionalOrder>, GatewayError> {
        let orders: Vec<WireTpslOrder> = self
            .request_list(
                Method::GET,
                "/api/v1/trade/orders-tpsl-history",
                &[
                    ("instType", "SWAP".to_string()),
                    ("instId", symbol.to_string()),
                ],
            )
            .await?;
        Ok(orders.into_iter().map(WireTpslOrder::into_conditional).collect())
    }

    async fn pending_conditional_orders(
        &self,
        symbol: &str,
    ) -> Result<Vec<ConditionalOrder>, GatewayError> {
        let orders: Vec<WireTpslOrder> = self
            .request_list(
                Method::GET,
                "/api/v1/trade/orders-tpsl-pending",
                &[
                    ("instType", "SWAP".to_string()),
                    ("instId", symbol.to_string()),
                ],
            )
            .await?;
        Ok(orders.into_iter().map(WireTpslOrder::into_conditional).collect())
    }

    async fn open_positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<PositionSnapshot>, GatewayError> {
        let mut query = Vec::new();
        if let Some(s) = symbol {
            query.push(("instId", s.to_string()));
        }

        let positions: Vec<WirePosition> = self
            .request_list(Method::GET, "/api/v1/account/positions", &query)
            .await?;

        let mut snapshots = Vec::new();
        for p in positions {
            let size = Decimal::from_str(&p.positions).unwrap_or(Decimal::ZERO);
            if size.is_zero() {
                continue;
            }
            snapshots.push(PositionSnapshot {
                symbol: p.inst_id,
                size: size.abs(),
                unrealized_pnl: p
                    .unrealized_pnl
                    .as_deref()
                    .and_then(|s| Decimal::from_str(s).ok())
                    .unwrap_or(Decimal::ZERO),
                mark_price: p
                    .mark_price
                    .as_deref()
                    .and_then(|s| Decimal::from_str(s).ok())
                    .unwrap_or(Decimal::ZERO),
            });
        }
        Ok(snapshots)
    }

    async fn pending_limit_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<PendingOrder>, GatewayError> {
        let mut query = vec![("instType", "SWAP".to_string())];
        if let Some(s) = symbol {
            query.push(("instId", s.to_string()));
        }

        let orders: Vec<WireOrder> = self
            .request_list(Method::GET, "/api/v1/trade/orders-pending", &query)
            .await?;
        Ok(orders.into_iter().map(WireOrder::into_pending).collect())
    }

    async fn order_history(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<PendingOrder>, GatewayError> {
        let orders: Vec<WireOrder> = self
            .request_list(
                Method::GET,
                "/api/v1/trade/orders-history",
                &[
                    ("instType", "SWAP".to_string()),
                    ("instId", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;
        Ok(orders.into_iter().next().map(WireOrder::into_pending))
    }

    async fn classify_close_reason(&self, symbol: &str) -> Result<CloseReason, GatewayError> {
        // The most recent TPSL history entry is the strongest evidence.
        let tpsl: Vec<WireTpslOrder> = self
            .request_list(
                Method::GET,
                "/api/v1/trade/orders-tpsl-history",
                &[
                    ("instId", symbol.to_string()),
                    ("limit", "5".to_string()),
                ],
            )
            .await?;

        if let Some(recent) = tpsl.first() {
            if OrderLifecycle::from_wire(&recent.state).is_triggered() {
                let category = recent.order_category.as_deref().unwrap_or("");
                if category == "tp" || opt_price(recent.tp_trigger_price.as_deref()).is_some() {
                    return Ok(CloseReason::TakeProfit);
                }
                if category == "sl" || opt_price(recent.sl_trigger_price.as_deref()).is_some() {
                    return Ok(CloseReason::StopLoss);
                }
            }
        }

        // Fall back to regular order history for liquidations and manual closes.
        let orders: Vec<WireOrder> = self
            .request_list(
                Method::GET,
                "/api/v1/trade/orders-history",
                &[
                    ("instId", symbol.to_string()),
                    ("limit", "5".to_string()),
                ],
            )
            .await?;

        for order in &orders {
            match order.order_category.as_deref().unwrap_or("") {
                "full_liquidation" | "partial_liquidation" => {
                    return Ok(CloseReason::Liquidation);
                }
                "tp" => return Ok(CloseReason::TakeProfit),
                "sl" => return Ok(CloseReason::StopLoss),
                "normal" if OrderLifecycle::from_wire(&order.state) == OrderLifecycle::Filled => {
                    return Ok(CloseReason::Manual);
                }
                _ => {}
            }
        }

        Ok(CloseReason::Unknown)
    }

    async fn instrument_spec(&self, symbol: &str) -> Result<InstrumentSpec, GatewayError> {
        let instruments: Vec<WireInstrument> = self
            .request_list(
                Method::GET,
                "/api/v1/market/instruments",
                &[
                    ("instType", "SWAP".to_string()),
                    ("instId", symbol.to_string()),
                ],
            )
            .await?;

        let inst = instruments
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Decode(format!("unknown instrument {symbol}")))?;

        Ok(InstrumentSpec {
            lot_size: parse_decimal(&inst.lot_size, "lotSize")?,
            tick_size: parse_decimal(&inst.tick_size, "tickSize")?,
            min_size: parse_decimal(&inst.min_size, "minSize")?,
            contract_value: parse_decimal(&inst.contract_value, "contractValue")?,
        })
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        size: Decimal,
        leverage: u32,
    ) -> Result<String, GatewayError> {
        self.place_entry_order(symbol, side, size, None, leverage)
            .await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        size: Decimal,
        price: Decimal,
        leverage: u32,
    ) -> Result<String, GatewayError> {
        self.place_entry_order(symbol, side, size, Some(price), leverage)
            .await
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        let tickers: Vec<WireTicker> = self
            .request_list(
                Method::GET,
                "/api/v1/market/tickers",
                &[("instId", symbol.to_string())],
            )
            .await?;

        tickers
            .first()
            .map(|t| parse_decimal(&t.last, "last"))
            .transpose()?
            .ok_or_else(|| GatewayError::Decode(format!("no ticker for {symbol}")))
    }

    async fn available_balance(&self) -> Result<Decimal, GatewayError> {
        let balances: Vec<WireBalance> = self
            .request_list(Method::GET, "/api/v1/asset/balances", &[])
            .await?;

        balances
            .iter()
            .find(|b| b.currency == "USDT")
            .map(|b| parse_decimal(&b.available, "available"))
            .transpose()?
            .ok_or_else(|| GatewayError::Decode("no USDT balance".to_string()))
    }

    fn gateway_name(&self) -> &'static str {
        "blofin"
    }
}
