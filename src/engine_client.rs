// =============================================================================
// Engine Client — HTTP client for the AI analysis service
// =============================================================================
//
// The AI service is a black box: it screens the market, runs the logic and
// vision models, and returns structured signals.  The engine consumes three
// surfaces: `/analyze` (scan), `/feedback` (outcome learning, fire-and-
// forget), and `/prices` (REST fallback for the price cache).
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{Side, StrategyMode};

/// Timeout for AI analysis calls.
const ANALYZE_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for price reads.
const PRICE_TIMEOUT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Directional verdict returned by the AI for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalSignal {
    Long,
    Short,
    Wait,
}

impl FinalSignal {
    /// The tradeable direction, if any. WAIT produces nothing.
    pub fn side(&self) -> Option<Side> {
        match self {
            Self::Long => Some(Side::Long),
            Self::Short => Some(Side::Short),
            Self::Wait => None,
        }
    }
}

/// Price levels proposed by the AI for a trade.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeParams {
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    #[serde(default)]
    pub position_size_usdt: Option<f64>,
}

/// One symbol's analysis as returned by `/analyze`.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisResult {
    pub symbol: String,
    pub final_signal: FinalSignal,
    pub combined_confidence: f64,
    #[serde(default)]
    pub logic_reasoning: String,
    #[serde(default)]
    pub vision_analysis: String,
    pub trade_params: Option<TradeParams>,
    #[serde(default)]
    pub screener_metrics: Option<serde_json::Value>,
}

/// Outcome feedback payload for the ML subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeFeedback {
    pub symbol: String,
    pub outcome: String,
    pub pnl_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct EngineClient {
    base_url: String,
    client: reqwest::Client,
}

impl EngineClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(ANALYZE_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    /// Run one market scan. Returns the AI's per-symbol analysis.
    pub async fn analyze(
        &self,
        symbols: &[String],
        strategy_mode: StrategyMode,
    ) -> Result<Vec<AnalysisResult>> {
        let url = format!("{}/analyze", self.base_url);
        let body = serde_json::json!({
            "symbols": symbols,
            "strategy_mode": strategy_mode,
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("POST /analyze request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("AI service POST /analyze returned {status}: {text}");
        }

        let results: Vec<AnalysisResult> = resp
            .json()
            .await
            .context("failed to parse /analyze response")?;

        debug!(count = results.len(), "analysis results received");
        Ok(results)
    }

    /// REST fallback for the price cache. Returns only what the service
    /// currently knows; missing symbols are absent from the map.
    pub async fn get_prices(&self, symbols: &[String]) -> Result<HashMap<String, f64>> {
        let url = format!("{}/prices?symbols={}", self.base_url, symbols.join(","));

        let resp = self
            .client
            .get(&url)
            .timeout(PRICE_TIMEOUT)
            .send()
            .await
            .context("GET /prices request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("AI service GET /prices returned {status}: {text}");
        }

        resp.json().await.context("failed to parse /prices response")
    }

    /// Fire-and-forget outcome feedback.  Failures are logged and swallowed:
    /// learning must never block or fail the trading path.
    pub async fn send_feedback(&self, feedback: OutcomeFeedback) {
        let url = format!("{}/feedback", self.base_url);

        match self.client.post(&url).json(&feedback).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(symbol = %feedback.symbol, outcome = %feedback.outcome, "feedback delivered");
            }
            Ok(resp) => {
                warn!(
                    symbol = %feedback.symbol,
                    status = %resp.status(),
                    "feedback rejected by AI service"
                );
            }
            Err(e) => {
                warn!(symbol = %feedback.symbol, error = %e, "feedback delivery failed");
            }
        }
    }
}

impl std::fmt::Debug for EngineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
