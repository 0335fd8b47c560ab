// =============================================================================
// Execution Pipeline — sizing → entry → persist → protect → notify
// =============================================================================
//
// For each admitted signal and each eligible user, in order:
//
//   1. Compute sizing (notional = fixed margin × leverage, clamped).
//   2. Route to the paper or live executor by the user's mode.
//   3. Place the entry; anything but FILLED fails the attempt.
//   4. Persist the Position BEFORE any protective-order attempt.  A fill
//      without a row means the exchange holds exposure the engine cannot
//      see, so this write is the one that must never be skipped.
//   5. Attach SL/TP protection, best-effort — the bodyguard is the safety
//      net when attachment fails.
//   6. Mark the signal EXECUTED and notify.
//
// One signal fans out to every user; the signal row's terminal status
// aggregates across them (EXECUTED if anyone filled, else FAILED if any
// entry failed, else REJECTED).
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::executor::{EntryRequest, Executor, ProtectionRequest};
use crate::notifier::Notifier;
use crate::store::PositionStore;
use crate::types::{
    Position, PositionStatus, Signal, SignalStatus, TradeMode, User, MAX_LEVERAGE,
    MIN_NOTIONAL_USD,
};

// ---------------------------------------------------------------------------
// Per-user outcome
// ---------------------------------------------------------------------------

/// What happened for a single user while executing a signal.
#[derive(Debug)]
pub enum UserExecution {
    /// Entry filled and the position row exists (OPEN or PENDING_APPROVAL).
    Opened(Position),
    /// Rejected before any order was placed. No cooldown.
    Rejected(String),
    /// Entry, credential, funds, or post-fill persistence failure. Starts
    /// the symbol's cooldown.
    Failed(String),
}

/// Aggregate outcome of one signal across all users.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub signal_status: SignalStatus,
    pub opened: Vec<Position>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct ExecutionPipeline {
    store: Arc<PositionStore>,
    paper: Arc<dyn Executor>,
    live: Arc<dyn Executor>,
    notifier: Arc<Notifier>,
}

impl ExecutionPipeline {
    pub fn new(
        store: Arc<PositionStore>,
        paper: Arc<dyn Executor>,
        live: Arc<dyn Executor>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            store,
            paper,
            live,
            notifier,
        }
    }

    /// Execute `signal` for every user and finalize the signal row.
    pub async fn run(&self, signal: &Signal, users: &[User]) -> PipelineOutcome {
        let mut opened = Vec::new();
        let mut any_failed = false;

        for user in users {
            match self.execute_for_user(signal, user).await {
                UserExecution::Opened(pos) => opened.push(pos),
                UserExecution::Rejected(reason) => {
                    info!(
                        symbol = %signal.symbol,
                        user_id = user.id,
                        reason = %reason,
                        "signal rejected for user"
                    );
                }
                UserExecution::Failed(reason) => {
                    any_failed = true;
                    warn!(
                        symbol = %signal.symbol,
                        user_id = user.id,
                        reason = %reason,
                        "signal execution failed for user"
                    );
                }
            }
        }

        let signal_status = if !opened.is_empty() {
            SignalStatus::Executed
        } else if any_failed {
            SignalStatus::Failed
        } else {
            SignalStatus::Rejected
        };

        match self.store.finalize_signal(&signal.id, signal_status) {
            Ok(true) => {}
            Ok(false) => {
                warn!(signal_id = %signal.id, "signal already finalized elsewhere");
            }
            Err(e) => {
                error!(signal_id = %signal.id, error = %e, "failed to finalize signal status");
            }
        }

        for pos in &opened {
            self.notifier.signal_executed(signal, pos).await;
        }

        PipelineOutcome {
            signal_status,
            opened,
        }
    }

    /// Steps 1-5 for a single user.
    pub async fn execute_for_user(&self, signal: &Signal, user: &User) -> UserExecution {
        // ── 1. Sizing ───────────────────────────────────────────────────
        if user.leverage == 0 {
            return UserExecution::Rejected("leverage must be at least 1".into());
        }
        let leverage = user.leverage.min(MAX_LEVERAGE);
        let notional = user.fixed_order_size * leverage as f64;
        if notional < MIN_NOTIONAL_USD {
            return UserExecution::Rejected(format!(
                "notional {notional:.2} below the {MIN_NOTIONAL_USD:.2} USD minimum"
            ));
        }

        // ── 2. Mode routing ─────────────────────────────────────────────
        let executor: &dyn Executor = match user.mode {
            TradeMode::Paper => self.paper.as_ref(),
            TradeMode::Real => {
                if !user.has_credentials() {
                    return UserExecution::Failed("missing exchange credentials".into());
                }
                let balance = user.real_balance_cache.unwrap_or(0.0);
                if balance < user.fixed_order_size {
                    return UserExecution::Failed(format!(
                        "cached balance {balance:.2} below order size {:.2}",
                        user.fixed_order_size
                    ));
                }
                self.live.as_ref()
            }
        };

        // ── 3. Entry ────────────────────────────────────────────────────
        let entry_req = EntryRequest {
            symbol: signal.symbol.clone(),
            side: signal.side,
            notional_usd: notional,
            leverage,
            credentials: user.credentials.clone(),
        };

        let fill = match executor.execute_entry(&entry_req).await {
            Ok(fill) if fill.status.is_filled() => fill,
            Ok(fill) => {
                return UserExecution::Failed(format!(
                    "entry not filled: {:?} (order {})",
                    fill.status, fill.order_id
                ));
            }
            Err(e) => return UserExecution::Failed(format!("entry error: {e}")),
        };

        // ── 4. Persist the position before anything else ────────────────
        let status = if user.auto_trade_enabled {
            PositionStatus::Open
        } else {
            PositionStatus::PendingApproval
        };

        let position = Position {
            id: Uuid::new_v4().to_string(),
            user_id: user.id,
            signal_id: Some(signal.id.clone()),
            symbol: signal.symbol.clone(),
            side: signal.side,
            entry_price: fill.avg_fill_price,
            sl_price: signal.sl_price,
            tp_price: signal.tp_price,
            size: notional / fill.avg_fill_price,
            leverage,
            exit_price: None,
            pnl: None,
            pnl_percent: None,
            status,
            closed_by: None,
            sl_trailed: false,
            created_at: Utc::now().to_rfc3339(),
            closed_at: None,
        };

        if let Err(e) = self.store.save_position(&position) {
            // The exchange holds a fill the store does not know about.
            // Nothing downstream can repair this; it needs an operator.
            error!(
                symbol = %signal.symbol,
                user_id = user.id,
                order_id = %fill.order_id,
                error = %e,
                "CRITICAL: position persistence failed after a filled entry — orphan exposure on the exchange"
            );
            return UserExecution::Failed(format!(
                "post-fill persistence failure (order {})",
                fill.order_id
            ));
        }

        info!(
            symbol = %signal.symbol,
            user_id = user.id,
            position_id = %position.id,
            entry_price = fill.avg_fill_price,
            size = position.size,
            leverage,
            status = %position.status,
            "position opened"
        );

        // ── 5. Protection, best-effort ──────────────────────────────────
        let protection = ProtectionRequest {
            symbol: signal.symbol.clone(),
            side: signal.side,
            sl_price: signal.sl_price,
            tp_price: signal.tp_price,
            size: position.size,
            credentials: user.credentials.clone(),
        };
        if let Err(e) = executor.attach_protection(&protection).await {
            warn!(
                symbol = %signal.symbol,
                position_id = %position.id,
                error = %e,
                "protection attach failed — bodyguard will cover this position"
            );
        }

        UserExecution::Opened(position)
    }
}

impl std::fmt::Debug for ExecutionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPipeline").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::MockExecutor;
    use crate::executor::{EntryFill, OrderStatus};
    use crate::types::{Credentials, Side};

    fn signal_in_store(store: &PositionStore) -> Signal {
        let mut sig = Signal {
            id: Uuid::new_v4().to_string(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry_price: 50_000.0,
            sl_price: 49_500.0,
            tp_price: 51_000.0,
            confidence: 90.0,
            reasoning: "breakout".into(),
            status: SignalStatus::Pending,
            review_result: None,
            review_pnl: None,
            metrics: None,
            created_at: Utc::now().to_rfc3339(),
            updated_at: Utc::now().to_rfc3339(),
        };
        let (id, _) = store.upsert_pending_signal(&sig).unwrap();
        sig.id = id;
        sig
    }

    fn paper_user() -> User {
        User {
            id: 1,
            name: "paper".into(),
            mode: TradeMode::Paper,
            fixed_order_size: 10.0,
            leverage: 20,
            auto_trade_enabled: true,
            credentials: Credentials::default(),
            real_balance_cache: None,
            paper_balance: 1000.0,
        }
    }

    fn real_user(balance: Option<f64>) -> User {
        User {
            id: 2,
            name: "real".into(),
            mode: TradeMode::Real,
            fixed_order_size: 10.0,
            leverage: 20,
            auto_trade_enabled: true,
            credentials: Credentials {
                api_key: "k".into(),
                api_secret: "s".into(),
            },
            real_balance_cache: balance,
            paper_balance: 0.0,
        }
    }

    struct Harness {
        store: Arc<PositionStore>,
        paper: Arc<MockExecutor>,
        live: Arc<MockExecutor>,
        pipeline: ExecutionPipeline,
    }

    fn harness(fill_price: f64) -> Harness {
        let store = Arc::new(PositionStore::open_in_memory().unwrap());
        let paper = Arc::new(MockExecutor::filling_at(fill_price));
        let live = Arc::new(MockExecutor::filling_at(fill_price));
        let pipeline = ExecutionPipeline::new(
            store.clone(),
            paper.clone(),
            live.clone(),
            Arc::new(Notifier::new(None)),
        );
        Harness {
            store,
            paper,
            live,
            pipeline,
        }
    }

    #[tokio::test]
    async fn happy_path_opens_position_and_executes_signal() {
        let h = harness(50_000.0);
        let sig = signal_in_store(&h.store);

        let outcome = h.pipeline.run(&sig, &[paper_user()]).await;

        assert_eq!(outcome.signal_status, SignalStatus::Executed);
        assert_eq!(outcome.opened.len(), 1);
        let pos = &outcome.opened[0];
        // $10 margin at 20x = $200 notional = 0.004 BTC at 50k.
        assert!((pos.size - 0.004).abs() < 1e-12);
        assert_eq!(pos.status, PositionStatus::Open);
        assert_eq!(pos.signal_id.as_deref(), Some(sig.id.as_str()));

        let stored = h.store.signal(&sig.id).unwrap().unwrap();
        assert_eq!(stored.status, SignalStatus::Executed);
        assert_eq!(h.store.get_open_positions().unwrap().len(), 1);
        assert_eq!(
            h.paper.protection_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn notional_floor_boundary_is_inclusive() {
        let h = harness(100.0);

        // fixed 1.0 × 5x = exactly $5.00: accepted.
        let mut at_floor = paper_user();
        at_floor.fixed_order_size = 1.0;
        at_floor.leverage = 5;
        let sig = signal_in_store(&h.store);
        let outcome = h.pipeline.run(&sig, &[at_floor]).await;
        assert_eq!(outcome.signal_status, SignalStatus::Executed);

        // $4.99: rejected before any order, no cooldown.
        let mut below = paper_user();
        below.fixed_order_size = 0.998;
        below.leverage = 5;
        let sig2 = {
            let mut s = signal_in_store(&h.store);
            s.symbol = "ETHUSDT".into();
            s.entry_price = 100.0;
            s.sl_price = 98.0;
            s.tp_price = 104.0;
            let (id, _) = h.store.upsert_pending_signal(&s).unwrap();
            s.id = id;
            s
        };
        let outcome = h.pipeline.run(&sig2, &[below]).await;
        assert_eq!(outcome.signal_status, SignalStatus::Rejected);
        assert!(!h.store.has_recent_failure("ETHUSDT", 1800).unwrap());
    }

    #[tokio::test]
    async fn leverage_clamped_to_exchange_cap_and_zero_rejected() {
        let h = harness(100.0);
        let sig = signal_in_store(&h.store);

        let mut over = paper_user();
        over.leverage = 126;
        let outcome = h.pipeline.run(&sig, &[over]).await;
        assert_eq!(outcome.signal_status, SignalStatus::Executed);
        assert_eq!(h.paper.entry_calls.lock()[0].leverage, 125);

        let mut zero = paper_user();
        zero.leverage = 0;
        match h.pipeline.execute_for_user(&sig, &zero).await {
            UserExecution::Rejected(_) => {}
            other => panic!("expected sizing reject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unfilled_entry_fails_signal_and_starts_cooldown() {
        let h = harness(100.0);
        let sig = signal_in_store(&h.store);
        h.paper.push_entry_response(Ok(EntryFill {
            order_id: "rejected-1".into(),
            avg_fill_price: 0.0,
            status: OrderStatus::Rejected,
        }));

        let outcome = h.pipeline.run(&sig, &[paper_user()]).await;

        assert_eq!(outcome.signal_status, SignalStatus::Failed);
        assert!(outcome.opened.is_empty());
        // No position record may exist for an unfilled entry.
        assert!(h.store.get_active_positions().unwrap().is_empty());
        assert!(h.store.has_recent_failure("BTCUSDT", 1800).unwrap());
    }

    #[tokio::test]
    async fn protection_failure_keeps_position_open() {
        let h = harness(50_000.0);
        let sig = signal_in_store(&h.store);
        h.paper
            .protection_fails
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let outcome = h.pipeline.run(&sig, &[paper_user()]).await;

        assert_eq!(outcome.signal_status, SignalStatus::Executed);
        assert_eq!(h.store.get_open_positions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn auto_trade_disabled_parks_position_for_approval() {
        let h = harness(50_000.0);
        let sig = signal_in_store(&h.store);
        let mut user = paper_user();
        user.auto_trade_enabled = false;

        let outcome = h.pipeline.run(&sig, &[user]).await;

        assert_eq!(outcome.opened[0].status, PositionStatus::PendingApproval);
        assert!(h.store.get_open_positions().unwrap().is_empty());
        assert_eq!(h.store.get_active_positions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn real_mode_requires_credentials_and_balance() {
        let h = harness(100.0);
        let sig = signal_in_store(&h.store);

        let mut no_creds = real_user(Some(100.0));
        no_creds.credentials = Credentials::default();
        match h.pipeline.execute_for_user(&sig, &no_creds).await {
            UserExecution::Failed(reason) => assert!(reason.contains("credentials")),
            other => panic!("expected failure, got {other:?}"),
        }

        match h.pipeline.execute_for_user(&sig, &real_user(Some(5.0))).await {
            UserExecution::Failed(reason) => assert!(reason.contains("balance")),
            other => panic!("expected failure, got {other:?}"),
        }

        // A zero/unknown balance is a hard block, not a best-effort attempt.
        match h.pipeline.execute_for_user(&sig, &real_user(None)).await {
            UserExecution::Failed(_) => {}
            other => panic!("expected failure, got {other:?}"),
        }

        // Funded real user routes through the live executor.
        match h.pipeline.execute_for_user(&sig, &real_user(Some(100.0))).await {
            UserExecution::Opened(_) => {}
            other => panic!("expected fill, got {other:?}"),
        }
        assert_eq!(h.live.entry_calls.lock().len(), 1);
        assert!(h.paper.entry_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn one_fill_among_failures_still_executes_signal() {
        let h = harness(100.0);
        let sig = signal_in_store(&h.store);

        // The real user's entry errors out; the paper user fills.
        h.live.push_entry_response(Err(anyhow::anyhow!("insufficient funds")));

        let outcome = h
            .pipeline
            .run(&sig, &[real_user(Some(100.0)), paper_user()])
            .await;

        assert_eq!(outcome.signal_status, SignalStatus::Executed);
        assert_eq!(outcome.opened.len(), 1);
        assert_eq!(outcome.opened[0].user_id, 1);
    }
}
