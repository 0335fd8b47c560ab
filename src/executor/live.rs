// =============================================================================
// Live Executor — delegates order flow to the execution service
// =============================================================================
//
// All real exchange access goes through the execution service's REST
// endpoints (`/execute/*`); the service owns request signing, symbol
// precision rounding, and the $5 notional floor.  Credentials travel in the
// request body and are never logged.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::types::{Credentials, Side};

use super::{CloseFill, EntryFill, EntryRequest, Executor, ProtectionRequest};

/// Timeout for order placement and account calls.
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct LiveExecutor {
    base_url: String,
    client: reqwest::Client,
}

impl LiveExecutor {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(EXECUTE_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        let base_url = base_url.into();
        debug!(base_url = %base_url, "LiveExecutor initialised");

        Self { base_url, client }
    }

    /// POST `body` to `{base_url}{path}` and parse the JSON response,
    /// treating any non-2xx status as an error carrying the response body.
    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {path} request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("execution service POST {path} returned {status}: {text}");
        }

        resp.json::<T>()
            .await
            .with_context(|| format!("failed to parse {path} response"))
    }
}

#[async_trait]
impl Executor for LiveExecutor {
    async fn execute_entry(&self, req: &EntryRequest) -> Result<EntryFill> {
        let body = serde_json::json!({
            "symbol": req.symbol,
            "side": req.side,
            "notional_usd": req.notional_usd,
            "leverage": req.leverage,
            "credentials": req.credentials,
        });

        let fill: EntryFill = self.post_json("/execute/entry", &body).await?;

        info!(
            symbol = %req.symbol,
            side = %req.side,
            notional_usd = req.notional_usd,
            order_id = %fill.order_id,
            status = ?fill.status,
            "entry order placed"
        );
        Ok(fill)
    }

    async fn execute_close(
        &self,
        symbol: &str,
        side: Side,
        size: f64,
        credentials: &Credentials,
    ) -> Result<CloseFill> {
        let body = serde_json::json!({
            "symbol": symbol,
            "side": side,
            "size": size,
            "credentials": credentials,
        });

        let fill: CloseFill = self.post_json("/execute/close", &body).await?;
        info!(symbol, side = %side, size, fill_price = fill.avg_fill_price, "close order filled");
        Ok(fill)
    }

    async fn attach_protection(&self, req: &ProtectionRequest) -> Result<()> {
        let body = serde_json::json!({
            "symbol": req.symbol,
            "side": req.side,
            "sl_price": req.sl_price,
            "tp_price": req.tp_price,
            "size": req.size,
            "credentials": req.credentials,
        });

        let _: serde_json::Value = self.post_json("/execute/protection", &body).await?;
        debug!(symbol = %req.symbol, sl = req.sl_price, tp = req.tp_price, "protection attached");
        Ok(())
    }

    async fn batch_has_open_position(
        &self,
        symbols: &[String],
        credentials: &Credentials,
    ) -> Result<HashMap<String, bool>> {
        let body = serde_json::json!({
            "symbols": symbols,
            "credentials": credentials,
        });

        self.post_json("/execute/has-position", &body).await
    }

    async fn get_real_balance(&self, credentials: &Credentials) -> Result<f64> {
        #[derive(serde::Deserialize)]
        struct BalanceResponse {
            balance_usd: f64,
        }

        let body = serde_json::json!({ "credentials": credentials });
        let resp: BalanceResponse = self.post_json("/execute/balance", &body).await?;
        Ok(resp.balance_usd)
    }
}

impl std::fmt::Debug for LiveExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveExecutor")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
