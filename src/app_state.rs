// =============================================================================
// Central Application State — Meridian Perp Nexus
// =============================================================================
//
// Ties every subsystem together for the operator API.  All subsystems manage
// their own interior mutability; AppState only aggregates Arc references and
// builds the dashboard snapshot.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::bodyguard::Bodyguard;
use crate::cadence::Regime;
use crate::price_cache::PriceCache;
use crate::runtime_config::EngineConfig;
use crate::scheduler::{ScanScheduler, ScanSummary};
use crate::store::PositionStore;
use crate::types::{Position, Signal, StrategyMode};

/// State shared with the operator API. The background loops hold their own
/// Arc references; this aggregates what the HTTP handlers read and mutate.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every meaningful
    /// mutation driven through the API.
    pub state_version: AtomicU64,

    pub config: Arc<RwLock<EngineConfig>>,
    pub prices: Arc<PriceCache>,
    pub store: Arc<PositionStore>,
    pub scheduler: Arc<ScanScheduler>,
    pub bodyguard: Arc<Bodyguard>,

    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Build the full, serialisable snapshot served by `GET /api/v1/state`.
    pub fn build_snapshot(&self) -> anyhow::Result<StateSnapshot> {
        let config = self.config.read();

        Ok(StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            regime: self.scheduler.current_regime(),
            strategy_mode: config.strategy_mode,
            symbols: config.symbols.clone(),
            last_scan: self.scheduler.last_scan(),
            open_positions: self.store.get_open_positions()?,
            active_positions: self.store.get_active_positions()?,
            recent_closed: self.store.recent_closed_positions(50)?,
            recent_signals: self.store.recent_signals(50)?,
            cached_symbols: self.prices.len(),
        })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("state_version", &self.current_state_version())
            .finish_non_exhaustive()
    }
}

/// Full engine state snapshot for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub regime: Regime,
    pub strategy_mode: StrategyMode,
    pub symbols: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scan: Option<ScanSummary>,
    pub open_positions: Vec<Position>,
    pub active_positions: Vec<Position>,
    pub recent_closed: Vec<Position>,
    pub recent_signals: Vec<Signal>,
    pub cached_symbols: usize,
}
