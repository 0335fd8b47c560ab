// =============================================================================
// Executor Port — narrow interface between the engine and the exchange
// =============================================================================
//
// The engine never talks to an exchange directly.  Everything it needs is
// expressed through this trait, with two concrete implementations selected
// per call by the user's trade mode:
//
//   PaperExecutor — simulates fills against the shared price cache.
//   LiveExecutor  — delegates to the execution service's REST endpoints.
// =============================================================================

pub mod live;
pub mod paper;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Credentials, Side};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Entry order request. `notional_usd` is margin × leverage; the executor is
/// responsible for symbol precision rounding and the $5 notional floor.
#[derive(Debug, Clone, Serialize)]
pub struct EntryRequest {
    pub symbol: String,
    pub side: Side,
    pub notional_usd: f64,
    pub leverage: u32,
    pub credentials: Credentials,
}

/// Terminal state of an entry order as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Filled,
    Rejected,
    Expired,
    Canceled,
}

impl OrderStatus {
    pub fn is_filled(&self) -> bool {
        matches!(self, Self::Filled)
    }
}

/// Result of an entry attempt. Callers proceed only on FILLED.
#[derive(Debug, Clone, Deserialize)]
pub struct EntryFill {
    pub order_id: String,
    pub avg_fill_price: f64,
    pub status: OrderStatus,
}

/// Result of a close order (always a market order).
#[derive(Debug, Clone, Deserialize)]
pub struct CloseFill {
    pub avg_fill_price: f64,
}

/// Reduce-only protective orders attached after an entry fill.
#[derive(Debug, Clone, Serialize)]
pub struct ProtectionRequest {
    pub symbol: String,
    pub side: Side,
    pub sl_price: f64,
    pub tp_price: f64,
    pub size: f64,
    pub credentials: Credentials,
}

// ---------------------------------------------------------------------------
// The port
// ---------------------------------------------------------------------------

/// Abstract exchange interface consumed by the pipeline and the bodyguard.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Place a market entry. Any status other than FILLED is a failure for
    /// the caller.
    async fn execute_entry(&self, req: &EntryRequest) -> Result<EntryFill>;

    /// Close `size` of an existing position with a market order.
    async fn execute_close(
        &self,
        symbol: &str,
        side: Side,
        size: f64,
        credentials: &Credentials,
    ) -> Result<CloseFill>;

    /// Attach reduce-only SL/TP orders. May fail without failing the overall
    /// flow; the bodyguard covers unprotected positions.
    async fn attach_protection(&self, req: &ProtectionRequest) -> Result<()>;

    /// One exchange round-trip answering "is there exposure on each symbol".
    async fn batch_has_open_position(
        &self,
        symbols: &[String],
        credentials: &Credentials,
    ) -> Result<HashMap<String, bool>>;

    /// Available USD balance on the exchange account.
    async fn get_real_balance(&self, credentials: &Credentials) -> Result<f64>;
}

// =============================================================================
// Test double
// =============================================================================

/// Scriptable in-memory executor shared by the dedup/pipeline/bodyguard
/// tests.
#[cfg(test)]
pub mod testing {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::types::{Credentials, Side};

    use super::{CloseFill, EntryFill, EntryRequest, Executor, OrderStatus, ProtectionRequest};

    #[derive(Default)]
    pub struct MockExecutor {
        /// Scripted entry responses, popped per call. Empty queue means a
        /// FILLED entry at `fill_price`.
        pub entry_responses: Mutex<VecDeque<Result<EntryFill>>>,
        pub fill_price: Mutex<f64>,
        pub protection_fails: AtomicBool,
        pub exchange_positions: Mutex<HashMap<String, bool>>,
        pub balance: Mutex<f64>,
        pub entry_calls: Mutex<Vec<EntryRequest>>,
        pub close_calls: Mutex<Vec<(String, Side, f64)>>,
        pub protection_calls: AtomicUsize,
    }

    impl MockExecutor {
        pub fn filling_at(price: f64) -> Self {
            let mock = Self::default();
            *mock.fill_price.lock() = price;
            mock
        }

        pub fn push_entry_response(&self, resp: Result<EntryFill>) {
            self.entry_responses.lock().push_back(resp);
        }

        pub fn hold_position(&self, symbol: &str) {
            self.exchange_positions.lock().insert(symbol.to_string(), true);
        }
    }

    #[async_trait]
    impl Executor for MockExecutor {
        async fn execute_entry(&self, req: &EntryRequest) -> Result<EntryFill> {
            self.entry_calls.lock().push(req.clone());
            if let Some(resp) = self.entry_responses.lock().pop_front() {
                return resp;
            }
            Ok(EntryFill {
                order_id: format!("mock-{}", self.entry_calls.lock().len()),
                avg_fill_price: *self.fill_price.lock(),
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
            self.close_calls.lock().push((symbol.to_string(), side, size));
            Ok(CloseFill {
                avg_fill_price: *self.fill_price.lock(),
            })
        }

        async fn attach_protection(&self, _req: &ProtectionRequest) -> Result<()> {
            self.protection_calls.fetch_add(1, Ordering::SeqCst);
            if self.protection_fails.load(Ordering::SeqCst) {
                bail!("reduce-only order conflict");
            }
            Ok(())
        }

        async fn batch_has_open_position(
            &self,
            symbols: &[String],
            _credentials: &Credentials,
        ) -> Result<HashMap<String, bool>> {
            let held = self.exchange_positions.lock();
            Ok(symbols
                .iter()
                .map(|s| (s.clone(), held.get(s).copied().unwrap_or(false)))
                .collect())
        }

        async fn get_real_balance(&self, _credentials: &Credentials) -> Result<f64> {
            Ok(*self.balance.lock())
        }
    }
}
