// =============================================================================
// Dedup Engine — four-layer admission filter for candidate signals
// =============================================================================
//
// Layers, evaluated in order; the first failing layer discards the candidate
// with a stable reason code:
//
//   1. DEDUP_BATCH     — one candidate per symbol within a scan (highest
//                        confidence wins)
//   2. DEDUP_EXCHANGE  — the exchange already holds the symbol (ground truth
//                        over the store)
//   3. DEDUP_DB        — an OPEN or PENDING_APPROVAL position exists
//   4. DEDUP_COOLDOWN  — a FAILED signal for the symbol within the cooldown
//                        window
//
// Accepted candidates are recorded via UpsertPendingSignal, which collapses
// rapid re-proposals onto a single row.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::executor::Executor;
use crate::store::PositionStore;
use crate::types::{Signal, TradeMode, User};

// ---------------------------------------------------------------------------
// Reason codes
// ---------------------------------------------------------------------------

/// Why a candidate was discarded. The codes are stable: logs and metrics key
/// on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupReason {
    Batch,
    Exchange,
    Db,
    Cooldown,
}

impl DedupReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Batch => "DEDUP_BATCH",
            Self::Exchange => "DEDUP_EXCHANGE",
            Self::Db => "DEDUP_DB",
            Self::Cooldown => "DEDUP_COOLDOWN",
        }
    }
}

/// A discarded candidate and the layer that rejected it.
#[derive(Debug, Clone)]
pub struct Discard {
    pub symbol: String,
    pub reason: DedupReason,
}

/// Outcome of one admission pass.
#[derive(Debug)]
pub struct AdmissionResult {
    /// Survivors, with ids rewritten to their upserted signal rows.
    pub accepted: Vec<Signal>,
    pub discarded: Vec<Discard>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct DedupEngine {
    store: Arc<PositionStore>,
}

impl DedupEngine {
    pub fn new(store: Arc<PositionStore>) -> Self {
        Self { store }
    }

    /// Run all four layers over `candidates` and persist the survivors as
    /// PENDING signals.
    ///
    /// `live` is consulted once per REAL-mode user holding credentials
    /// (layer 2); a symbol held by any account discards the candidate.
    pub async fn admit(
        &self,
        candidates: Vec<Signal>,
        users: &[User],
        live: &dyn Executor,
        cooldown_secs: i64,
    ) -> Result<AdmissionResult> {
        let mut discarded = Vec::new();

        // ── Layer 1: in-batch uniqueness ────────────────────────────────
        let mut survivors = collapse_batch(candidates, &mut discarded);

        // ── Layer 2: live exchange check ────────────────────────────────
        let held = self.exchange_held_symbols(&survivors, users, live).await;
        survivors.retain(|sig| {
            if held.get(&sig.symbol).copied().unwrap_or(false) {
                discarded.push(Discard {
                    symbol: sig.symbol.clone(),
                    reason: DedupReason::Exchange,
                });
                false
            } else {
                true
            }
        });

        // ── Layer 3: store active-exposure check ────────────────────────
        let active = self.store.active_symbols()?;
        survivors.retain(|sig| {
            if active.contains(&sig.symbol) {
                discarded.push(Discard {
                    symbol: sig.symbol.clone(),
                    reason: DedupReason::Db,
                });
                false
            } else {
                true
            }
        });

        // ── Layer 4: failure cooldown ───────────────────────────────────
        let mut accepted = Vec::with_capacity(survivors.len());
        for mut sig in survivors {
            if self.store.has_recent_failure(&sig.symbol, cooldown_secs)? {
                discarded.push(Discard {
                    symbol: sig.symbol.clone(),
                    reason: DedupReason::Cooldown,
                });
                continue;
            }

            // Collapse onto any existing PENDING row for the symbol.
            match self.store.upsert_pending_signal(&sig) {
                Ok((id, created)) => {
                    sig.id = id;
                    if !created {
                        info!(symbol = %sig.symbol, signal_id = %sig.id, "re-fire collapsed onto pending signal");
                    }
                    accepted.push(sig);
                }
                Err(e) => {
                    warn!(symbol = %sig.symbol, error = %e, "dropping candidate that failed validation");
                }
            }
        }

        for d in &discarded {
            info!(symbol = %d.symbol, reason = d.reason.code(), "candidate discarded");
        }

        Ok(AdmissionResult {
            accepted,
            discarded,
        })
    }

    /// Union of exchange-held symbols across all REAL accounts, one
    /// round-trip per account.  A failed query degrades to "nothing held":
    /// layer 3 still guards against double exposure recorded in the store.
    async fn exchange_held_symbols(
        &self,
        survivors: &[Signal],
        users: &[User],
        live: &dyn Executor,
    ) -> HashMap<String, bool> {
        let symbols: Vec<String> = survivors.iter().map(|s| s.symbol.clone()).collect();
        let mut held: HashMap<String, bool> = HashMap::new();

        if symbols.is_empty() {
            return held;
        }

        for user in users {
            if user.mode != TradeMode::Real || !user.has_credentials() {
                continue;
            }
            match live.batch_has_open_position(&symbols, &user.credentials).await {
                Ok(map) => {
                    for (symbol, has) in map {
                        *held.entry(symbol).or_insert(false) |= has;
                    }
                }
                Err(e) => {
                    warn!(user_id = user.id, error = %e, "exchange exposure check failed — relying on store state");
                }
            }
        }

        held
    }
}

/// Layer 1: keep one candidate per symbol, highest confidence winning.
/// Order of first appearance is preserved for the winners.
fn collapse_batch(candidates: Vec<Signal>, discarded: &mut Vec<Discard>) -> Vec<Signal> {
    let mut by_symbol: HashMap<String, usize> = HashMap::new();
    let mut winners: Vec<Signal> = Vec::with_capacity(candidates.len());

    for sig in candidates {
        match by_symbol.get(&sig.symbol) {
            Some(&idx) => {
                let loser = if sig.confidence > winners[idx].confidence {
                    std::mem::replace(&mut winners[idx], sig)
                } else {
                    sig
                };
                discarded.push(Discard {
                    symbol: loser.symbol,
                    reason: DedupReason::Batch,
                });
            }
            None => {
                by_symbol.insert(sig.symbol.clone(), winners.len());
                winners.push(sig);
            }
        }
    }

    winners
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::MockExecutor;
    use crate::types::{Credentials, PositionStatus, Side, SignalStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn candidate(symbol: &str, confidence: f64) -> Signal {
        Signal {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: Side::Long,
            entry_price: 100.0,
            sl_price: 98.0,
            tp_price: 104.0,
            confidence,
            reasoning: String::new(),
            status: SignalStatus::Pending,
            review_result: None,
            review_pnl: None,
            metrics: None,
            created_at: Utc::now().to_rfc3339(),
            updated_at: Utc::now().to_rfc3339(),
        }
    }

    fn real_user() -> User {
        User {
            id: 1,
            name: "real".into(),
            mode: TradeMode::Real,
            fixed_order_size: 10.0,
            leverage: 5,
            auto_trade_enabled: true,
            credentials: Credentials {
                api_key: "k".into(),
                api_secret: "s".into(),
            },
            real_balance_cache: Some(100.0),
            paper_balance: 0.0,
        }
    }

    fn open_position(symbol: &str) -> crate::types::Position {
        crate::types::Position {
            id: Uuid::new_v4().to_string(),
            user_id: 1,
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

    #[test]
    fn batch_layer_keeps_highest_confidence_per_symbol() {
        let mut discarded = Vec::new();
        let winners = collapse_batch(
            vec![
                candidate("BTCUSDT", 80.0),
                candidate("BTCUSDT", 92.0),
                candidate("ETHUSDT", 85.0),
                candidate("BTCUSDT", 90.0),
            ],
            &mut discarded,
        );

        assert_eq!(winners.len(), 2);
        assert_eq!(winners[0].symbol, "BTCUSDT");
        assert!((winners[0].confidence - 92.0).abs() < f64::EPSILON);
        assert_eq!(winners[1].symbol, "ETHUSDT");
        assert_eq!(discarded.len(), 2);
        assert!(discarded.iter().all(|d| d.reason == DedupReason::Batch));
    }

    #[tokio::test]
    async fn exchange_layer_discards_held_symbols() {
        let store = Arc::new(PositionStore::open_in_memory().unwrap());
        let engine = DedupEngine::new(store);
        let mock = MockExecutor::filling_at(100.0);
        mock.hold_position("ETHUSDT");

        let result = engine
            .admit(
                vec![candidate("BTCUSDT", 90.0), candidate("ETHUSDT", 91.0)],
                &[real_user()],
                &mock,
                1800,
            )
            .await
            .unwrap();

        assert_eq!(result.accepted.len(), 1);
        assert_eq!(result.accepted[0].symbol, "BTCUSDT");
        assert_eq!(result.discarded.len(), 1);
        assert_eq!(result.discarded[0].reason, DedupReason::Exchange);
    }

    #[tokio::test]
    async fn db_layer_discards_active_exposure() {
        let store = Arc::new(PositionStore::open_in_memory().unwrap());
        store.save_position(&open_position("BTCUSDT")).unwrap();
        let engine = DedupEngine::new(store);
        let mock = MockExecutor::filling_at(100.0);

        let result = engine
            .admit(vec![candidate("BTCUSDT", 90.0)], &[], &mock, 1800)
            .await
            .unwrap();

        assert!(result.accepted.is_empty());
        assert_eq!(result.discarded[0].reason, DedupReason::Db);
    }

    #[tokio::test]
    async fn cooldown_layer_discards_recent_failures() {
        let store = Arc::new(PositionStore::open_in_memory().unwrap());
        let (id, _) = store.upsert_pending_signal(&candidate("XRPUSDT", 90.0)).unwrap();
        store.finalize_signal(&id, SignalStatus::Failed).unwrap();

        let engine = DedupEngine::new(store.clone());
        let mock = MockExecutor::filling_at(100.0);

        let result = engine
            .admit(vec![candidate("XRPUSDT", 95.0)], &[], &mock, 1800)
            .await
            .unwrap();
        assert!(result.accepted.is_empty());
        assert_eq!(result.discarded[0].reason, DedupReason::Cooldown);

        // Outside the window the same candidate is admitted again.
        store
            .execute_raw(
                "UPDATE signals SET updated_at = '2020-01-01T00:00:00+00:00'
                 WHERE symbol = 'XRPUSDT'",
            )
            .unwrap();
        let result = engine
            .admit(vec![candidate("XRPUSDT", 95.0)], &[], &mock, 1800)
            .await
            .unwrap();
        assert_eq!(result.accepted.len(), 1);
    }

    #[tokio::test]
    async fn accepted_candidates_are_upserted_and_collapsed() {
        let store = Arc::new(PositionStore::open_in_memory().unwrap());
        let engine = DedupEngine::new(store.clone());
        let mock = MockExecutor::filling_at(100.0);

        let first = engine
            .admit(vec![candidate("BTCUSDT", 85.0)], &[], &mock, 1800)
            .await
            .unwrap();
        let second = engine
            .admit(vec![candidate("BTCUSDT", 95.0)], &[], &mock, 1800)
            .await
            .unwrap();

        // Both passes accept, but they share one PENDING row.
        assert_eq!(first.accepted.len(), 1);
        assert_eq!(second.accepted.len(), 1);
        assert_eq!(first.accepted[0].id, second.accepted[0].id);
        assert_eq!(store.recent_signals(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exchange_check_failure_degrades_to_store_state() {
        let store = Arc::new(PositionStore::open_in_memory().unwrap());
        let engine = DedupEngine::new(store);

        // A mock whose exposure query always fails.
        struct FailingExchange;
        #[async_trait::async_trait]
        impl Executor for FailingExchange {
            async fn execute_entry(
                &self,
                _req: &crate::executor::EntryRequest,
            ) -> Result<crate::executor::EntryFill> {
                anyhow::bail!("unused")
            }
            async fn execute_close(
                &self,
                _symbol: &str,
                _side: Side,
                _size: f64,
                _credentials: &Credentials,
            ) -> Result<crate::executor::CloseFill> {
                anyhow::bail!("unused")
            }
            async fn attach_protection(
                &self,
                _req: &crate::executor::ProtectionRequest,
            ) -> Result<()> {
                anyhow::bail!("unused")
            }
            async fn batch_has_open_position(
                &self,
                _symbols: &[String],
                _credentials: &Credentials,
            ) -> Result<HashMap<String, bool>> {
                anyhow::bail!("exchange unavailable")
            }
            async fn get_real_balance(&self, _credentials: &Credentials) -> Result<f64> {
                anyhow::bail!("unused")
            }
        }

        let result = engine
            .admit(vec![candidate("BTCUSDT", 90.0)], &[real_user()], &FailingExchange, 1800)
            .await
            .unwrap();
        assert_eq!(result.accepted.len(), 1);
    }
}
