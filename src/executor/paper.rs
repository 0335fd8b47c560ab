// =============================================================================
// Paper Executor — simulated fills against the shared price cache
// =============================================================================
//
// Fills happen instantly at the last cached price with a synthetic order id.
// No exchange state exists, so the exposure check always reports empty and
// protective orders are accepted silently; the bodyguard enforces SL/TP for
// paper positions the same way it does for real ones.  The 0.04 % taker fee
// is charged per side by the closure PnL math, not here.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::price_cache::PriceCache;
use crate::types::{Credentials, Side, MIN_NOTIONAL_USD};

use super::{CloseFill, EntryFill, EntryRequest, Executor, OrderStatus, ProtectionRequest};

pub struct PaperExecutor {
    prices: Arc<PriceCache>,
}

impl PaperExecutor {
    pub fn new(prices: Arc<PriceCache>) -> Self {
        Self { prices }
    }

    fn last_price(&self, symbol: &str) -> Result<f64> {
        match self.prices.get(symbol) {
            Some((price, _)) => Ok(price),
            None => bail!("no cached price for {symbol} — cannot simulate fill"),
        }
    }
}

#[async_trait]
impl Executor for PaperExecutor {
    async fn execute_entry(&self, req: &EntryRequest) -> Result<EntryFill> {
        if req.notional_usd < MIN_NOTIONAL_USD {
            bail!(
                "notional {:.2} below exchange minimum {MIN_NOTIONAL_USD:.2}",
                req.notional_usd
            );
        }

        let price = self.last_price(&req.symbol)?;
        let order_id = format!("paper-{}", Uuid::new_v4());

        info!(
            symbol = %req.symbol,
            side = %req.side,
            notional_usd = req.notional_usd,
            fill_price = price,
            order_id = %order_id,
            "paper entry filled"
        );

        Ok(EntryFill {
            order_id,
            avg_fill_price: price,
            status: OrderStatus::Filled,
        })
    }

    async fn execute_close(
        &self,
        symbol: &str,
        side: Side,
        size: f64,
        _credentials: &Credentials,
    ) -> Result<CloseFill> {
        let price = self.last_price(symbol)?;
        debug!(symbol, side = %side, size, fill_price = price, "paper close filled");
        Ok(CloseFill {
            avg_fill_price: price,
        })
    }

    async fn attach_protection(&self, req: &ProtectionRequest) -> Result<()> {
        // Nothing to place: the bodyguard is the paper protection mechanism.
        debug!(
            symbol = %req.symbol,
            sl = req.sl_price,
            tp = req.tp_price,
            "paper protection accepted (bodyguard-enforced)"
        );
        Ok(())
    }

    async fn batch_has_open_position(
        &self,
        symbols: &[String],
        _credentials: &Credentials,
    ) -> Result<HashMap<String, bool>> {
        Ok(symbols.iter().map(|s| (s.clone(), false)).collect())
    }

    async fn get_real_balance(&self, _credentials: &Credentials) -> Result<f64> {
        bail!("paper accounts have no exchange balance")
    }
}

impl std::fmt::Debug for PaperExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperExecutor").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn executor_with_price(symbol: &str, price: f64) -> PaperExecutor {
        let prices = Arc::new(PriceCache::new());
        prices.set(symbol, price);
        PaperExecutor::new(prices)
    }

    fn entry(symbol: &str, notional: f64) -> EntryRequest {
        EntryRequest {
            symbol: symbol.to_string(),
            side: Side::Long,
            notional_usd: notional,
            leverage: 20,
            credentials: Credentials::default(),
        }
    }

    #[tokio::test]
    async fn fills_at_cached_price() {
        let exec = executor_with_price("BTCUSDT", 50_000.0);
        let fill = exec.execute_entry(&entry("BTCUSDT", 200.0)).await.unwrap();

        assert!(fill.status.is_filled());
        assert!((fill.avg_fill_price - 50_000.0).abs() < f64::EPSILON);
        assert!(fill.order_id.starts_with("paper-"));
    }

    #[tokio::test]
    async fn entry_without_cached_price_fails() {
        let exec = PaperExecutor::new(Arc::new(PriceCache::new()));
        assert!(exec.execute_entry(&entry("BTCUSDT", 200.0)).await.is_err());
    }

    #[tokio::test]
    async fn notional_floor_is_inclusive() {
        let exec = executor_with_price("BTCUSDT", 50_000.0);
        assert!(exec.execute_entry(&entry("BTCUSDT", 5.0)).await.is_ok());
        assert!(exec.execute_entry(&entry("BTCUSDT", 4.99)).await.is_err());
    }

    #[tokio::test]
    async fn reports_no_exchange_exposure() {
        let exec = executor_with_price("BTCUSDT", 50_000.0);
        let out = exec
            .batch_has_open_position(&["BTCUSDT".to_string()], &Credentials::default())
            .await
            .unwrap();
        assert_eq!(out.get("BTCUSDT"), Some(&false));
    }
}
