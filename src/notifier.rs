// =============================================================================
// Notifier — best-effort webhook notifications
// =============================================================================
//
// Every event is a single JSON POST to the configured webhook.  Delivery is
// best-effort by contract: failures are logged at WARN and never propagate
// into the trading path.  With no webhook configured the notifier is a
// no-op.
// =============================================================================

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::types::{ClosedBy, Position, Signal};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Notifier {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(NOTIFY_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            webhook_url,
            client,
        }
    }

    /// A signal was executed and a position opened (or queued for approval).
    pub async fn signal_executed(&self, signal: &Signal, position: &Position) {
        self.post(serde_json::json!({
            "event": "signal_executed",
            "symbol": signal.symbol,
            "side": signal.side,
            "confidence": signal.confidence,
            "entry_price": position.entry_price,
            "size": position.size,
            "leverage": position.leverage,
            "position_status": position.status,
            "at": Utc::now().to_rfc3339(),
        }))
        .await;
    }

    /// A position was closed, by the bodyguard or manually.
    pub async fn position_closed(&self, position: &Position, closed_by: ClosedBy, pnl: f64) {
        self.post(serde_json::json!({
            "event": "position_closed",
            "symbol": position.symbol,
            "side": position.side,
            "entry_price": position.entry_price,
            "exit_price": position.exit_price,
            "pnl": pnl,
            "pnl_percent": position.pnl_percent,
            "closed_by": closed_by,
            "at": Utc::now().to_rfc3339(),
        }))
        .await;
    }

    /// The panic button fired: all positions of a user were force-closed.
    pub async fn panic_fired(&self, user_id: i64, closed_count: usize) {
        self.post(serde_json::json!({
            "event": "panic_fired",
            "user_id": user_id,
            "closed_count": closed_count,
            "at": Utc::now().to_rfc3339(),
        }))
        .await;
    }

    async fn post(&self, payload: serde_json::Value) {
        let Some(url) = &self.webhook_url else {
            return;
        };

        match self.client.post(url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(event = %payload["event"], "notification delivered");
            }
            Ok(resp) => {
                warn!(event = %payload["event"], status = %resp.status(), "notification rejected");
            }
            Err(e) => {
                warn!(event = %payload["event"], error = %e, "notification delivery failed");
            }
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("configured", &self.webhook_url.is_some())
            .finish_non_exhaustive()
    }
}
