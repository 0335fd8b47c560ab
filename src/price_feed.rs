// =============================================================================
// Price Feed — WebSocket mark-price pump into the shared cache
// =============================================================================
//
// The single writer of the price cache.  Connects to the exchange combined
// mark-price stream for the configured top-N symbols plus every symbol with
// an active position, and reconnects with exponential backoff (1 s doubling
// to 60 s, reset after a healthy read).
//
// The subscription set is recomputed on every (re)connect, and a periodic
// refresh tears the connection down when the set changes so newly opened
// symbols start streaming without waiting for a failure.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::price_cache::PriceCache;
use crate::runtime_config::EngineConfig;
use crate::store::PositionStore;

const WS_BASE: &str = "wss://fstream.binance.com/stream";
/// How often the subscription set is re-checked against open positions.
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Run the price pump forever. Spawn once at engine startup.
pub async fn run_price_feed(
    prices: Arc<PriceCache>,
    store: Arc<PositionStore>,
    config: Arc<RwLock<EngineConfig>>,
) {
    let mut backoff = BACKOFF_INITIAL;

    loop {
        let symbols = subscription_set(&store, &config);
        if symbols.is_empty() {
            tokio::time::sleep(REFRESH_INTERVAL).await;
            continue;
        }

        match stream_prices(&symbols, &prices, &store, &config).await {
            Ok(()) => {
                // Clean teardown: the subscription set changed.
                backoff = BACKOFF_INITIAL;
            }
            Err(e) => {
                warn!(error = %e, backoff_secs = backoff.as_secs(), "price stream error — reconnecting");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
    }
}

/// The symbols the pump must cover: configured top-N plus active exposure.
fn subscription_set(
    store: &Arc<PositionStore>,
    config: &Arc<RwLock<EngineConfig>>,
) -> BTreeSet<String> {
    let mut symbols: BTreeSet<String> = config.read().symbols.iter().cloned().collect();
    match store.active_symbols() {
        Ok(active) => symbols.extend(active),
        Err(e) => warn!(error = %e, "failed to load active symbols for subscription"),
    }
    symbols
}

/// Connect and pump until the stream fails or the subscription set changes.
///
/// `Ok(())` means a deliberate teardown (resubscribe); `Err` means the
/// connection dropped and the caller should back off.
async fn stream_prices(
    symbols: &BTreeSet<String>,
    prices: &PriceCache,
    store: &Arc<PositionStore>,
    config: &Arc<RwLock<EngineConfig>>,
) -> Result<()> {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@markPrice@1s", s.to_lowercase()))
        .collect();
    let url = format!("{}?streams={}", WS_BASE, streams.join("/"));

    info!(symbols = symbols.len(), "connecting to price stream");
    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to price WebSocket")?;
    info!("price stream connected");

    let (_write, mut read) = ws_stream.split();
    let mut refresh = tokio::time::interval(REFRESH_INTERVAL);
    refresh.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                    match parse_mark_price(&text) {
                        Ok((symbol, price)) => prices.set(&symbol, price),
                        Err(e) => debug!(error = %e, "unparseable price message"),
                    }
                }
                Some(Ok(_)) => {} // ping/pong/binary
                Some(Err(e)) => return Err(e).context("price WebSocket read error"),
                None => anyhow::bail!("price WebSocket stream ended"),
            },
            _ = refresh.tick() => {
                let wanted = subscription_set(store, config);
                if wanted != *symbols {
                    info!(
                        old = symbols.len(),
                        new = wanted.len(),
                        "subscription set changed — resubscribing"
                    );
                    return Ok(());
                }
            }
        }
    }
}

/// Parse one combined-stream mark price event.
///
/// Expected shape:
/// ```json
/// {"stream":"btcusdt@markPrice@1s","data":{"e":"markPriceUpdate","s":"BTCUSDT","p":"50123.40"}}
/// ```
fn parse_mark_price(text: &str) -> Result<(String, f64)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse price JSON")?;
    let data = root.get("data").unwrap_or(&root);

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_string();

    let price: f64 = data["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;

    Ok((symbol, price))
}

// =============================================================================
// Tests
// =============================================================================
