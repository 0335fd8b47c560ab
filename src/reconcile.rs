// =============================================================================
// Reconciliation — compare store state against the exchange
// =============================================================================
//
// SAFETY POLICY: this module logs any drift it discovers but will **never**
// automatically cancel orders or close positions on the exchange.  A human
// operator must resolve discrepancies.
//
// The pass runs once at startup (catching orphans from a post-fill
// persistence failure on the previous run) and then periodically.  It also
// refreshes each REAL user's cached balance.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::executor::Executor;
use crate::runtime_config::EngineConfig;
use crate::store::PositionStore;
use crate::types::TradeMode;

/// Summary of a single reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileResult {
    /// Store positions that the exchange confirms.
    pub positions_matched: u32,
    /// Exchange-held symbols with no store row (orphan exposure).
    pub orphan_symbols: u32,
    /// Store-open symbols the exchange does not hold.
    pub missing_on_exchange: u32,
    /// ISO-8601 timestamp of this run.
    pub timestamp: String,
}

/// Run one reconciliation cycle across all REAL users.
///
/// The queried symbol set is the union of the configured top-N list and
/// every symbol with an active store position, so an orphan on any traded
/// symbol is visible.
pub async fn reconcile_once(
    store: &Arc<PositionStore>,
    live: &dyn Executor,
    config: &RwLock<EngineConfig>,
) -> Result<ReconcileResult> {
    let now = Utc::now().to_rfc3339();
    debug!(timestamp = %now, "reconciliation cycle started");

    let mut symbols: HashSet<String> = config.read().symbols.iter().cloned().collect();
    symbols.extend(store.active_symbols()?);
    let symbols: Vec<String> = symbols.into_iter().collect();

    let mut matched: u32 = 0;
    let mut orphans: u32 = 0;
    let mut missing: u32 = 0;

    for user in store.users()? {
        if user.mode != TradeMode::Real || !user.has_credentials() {
            continue;
        }

        let held = match live.batch_has_open_position(&symbols, &user.credentials).await {
            Ok(map) => map,
            Err(e) => {
                warn!(user_id = user.id, error = %e, "exchange exposure query failed");
                continue;
            }
        };

        let store_symbols: HashSet<String> = store
            .get_active_positions()?
            .into_iter()
            .filter(|p| p.user_id == user.id)
            .map(|p| p.symbol)
            .collect();

        for (symbol, has) in &held {
            let in_store = store_symbols.contains(symbol);
            match (has, in_store) {
                (true, true) => {
                    matched += 1;
                    debug!(user_id = user.id, symbol = %symbol, "position confirmed by exchange");
                }
                (true, false) => {
                    orphans += 1;
                    error!(
                        user_id = user.id,
                        symbol = %symbol,
                        "orphan exchange position — no store row; operator intervention required"
                    );
                }
                (false, true) => {
                    missing += 1;
                    warn!(
                        user_id = user.id,
                        symbol = %symbol,
                        "store position has no exchange exposure — possible out-of-band close"
                    );
                }
                (false, false) => {}
            }
        }

        // Balance sync keeps the pipeline's funds check honest.
        match live.get_real_balance(&user.credentials).await {
            Ok(balance) => {
                store.set_real_balance_cache(user.id, balance)?;
                debug!(user_id = user.id, balance, "real balance refreshed");
            }
            Err(e) => warn!(user_id = user.id, error = %e, "balance refresh failed"),
        }
    }

    let result = ReconcileResult {
        positions_matched: matched,
        orphan_symbols: orphans,
        missing_on_exchange: missing,
        timestamp: now,
    };

    info!(
        matched = result.positions_matched,
        orphans = result.orphan_symbols,
        missing = result.missing_on_exchange,
        "reconciliation cycle completed"
    );

    Ok(result)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::MockExecutor;
    use crate::types::{Credentials, Position, PositionStatus, Side, User};
    use uuid::Uuid;

    fn real_user(store: &PositionStore) -> i64 {
        store
            .insert_user(&User {
                id: 0,
                name: "real".into(),
                mode: TradeMode::Real,
                fixed_order_size: 10.0,
                leverage: 5,
                auto_trade_enabled: true,
                credentials: Credentials {
                    api_key: "k".into(),
                    api_secret: "s".into(),
                },
                real_balance_cache: None,
                paper_balance: 0.0,
            })
            .unwrap()
    }

    fn open_position(user_id: i64, symbol: &str) -> Position {
        Position {
            id: Uuid::new_v4().to_string(),
            user_id,
            signal_id: None,
            symbol: symbol.to_string(),
            side: Side::Long,
            entry_price: 100.0,
            sl_price: 98.0,
            tp_price: 104.0,
            size: 1.0,
            leverage: 5,
            exit_price: None,
            pnl: None,
            pnl_percent: None,
            status: PositionStatus::Open,
            closed_by: None,
            sl_trailed: false,
            created_at: Utc::now().to_rfc3339(),
            closed_at: None,
        }
    }

    #[tokio::test]
    async fn detects_orphans_matches_and_missing() {
        let store = Arc::new(PositionStore::open_in_memory().unwrap());
        let config = RwLock::new(EngineConfig::default());
        let user_id = real_user(&store);

        // Store knows BTC and ETH; the exchange holds BTC and SOL.
        store.save_position(&open_position(user_id, "BTCUSDT")).unwrap();
        store.save_position(&open_position(user_id, "ETHUSDT")).unwrap();
        let mock = MockExecutor::filling_at(100.0);
        mock.hold_position("BTCUSDT");
        mock.hold_position("SOLUSDT");
        *mock.balance.lock() = 512.0;

        let result = reconcile_once(&store, &mock, &config).await.unwrap();

        assert_eq!(result.positions_matched, 1);
        assert_eq!(result.orphan_symbols, 1);
        assert_eq!(result.missing_on_exchange, 1);

        // Balance cache refreshed as part of the pass.
        let user = store.user(user_id).unwrap().unwrap();
        assert_eq!(user.real_balance_cache, Some(512.0));
    }

    #[tokio::test]
    async fn paper_users_are_ignored() {
        let store = Arc::new(PositionStore::open_in_memory().unwrap());
        let config = RwLock::new(EngineConfig::default());
        store
            .insert_user(&User {
                id: 0,
                name: "paper".into(),
                mode: TradeMode::Paper,
                fixed_order_size: 10.0,
                leverage: 5,
                auto_trade_enabled: true,
                credentials: Credentials::default(),
                real_balance_cache: None,
                paper_balance: 1000.0,
            })
            .unwrap();

        let mock = MockExecutor::filling_at(100.0);
        mock.hold_position("BTCUSDT");

        let result = reconcile_once(&store, &mock, &config).await.unwrap();
        assert_eq!(result.positions_matched, 0);
        assert_eq!(result.orphan_symbols, 0);
    }
}
