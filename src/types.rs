// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Taker fee charged per side on marketable orders (0.04 %).
pub const TAKER_FEE_RATE: f64 = 0.0004;

/// Hard exchange cap on leverage.
pub const MAX_LEVERAGE: u32 = 125;

/// Minimum notional the exchange accepts, in USD.
pub const MIN_NOTIONAL_USD: f64 = 5.0;

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Trade direction of a signal or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "LONG" => Some(Self::Long),
            "SHORT" => Some(Self::Short),
            _ => None,
        }
    }

    /// +1.0 for longs, -1.0 for shorts. Multiplied into PnL math.
    pub fn direction(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Execution routing
// ---------------------------------------------------------------------------

/// Whether a user's orders are simulated locally or routed to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeMode {
    Paper,
    Real,
}

impl TradeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "PAPER",
            Self::Real => "REAL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PAPER" => Some(Self::Paper),
            "REAL" => Some(Self::Real),
            _ => None,
        }
    }
}

impl Default for TradeMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy hint forwarded to the AI service. Never alters scan cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyMode {
    Scalper,
    Investor,
}

impl StrategyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scalper => "SCALPER",
            Self::Investor => "INVESTOR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SCALPER" => Some(Self::Scalper),
            "INVESTOR" => Some(Self::Investor),
            _ => None,
        }
    }
}

impl Default for StrategyMode {
    fn default() -> Self {
        Self::Scalper
    }
}

impl std::fmt::Display for StrategyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Signal lifecycle
// ---------------------------------------------------------------------------

/// Admission/execution state of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStatus {
    Pending,
    Executed,
    Failed,
    Rejected,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Executed => "EXECUTED",
            Self::Failed => "FAILED",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "EXECUTED" => Some(Self::Executed),
            "FAILED" => Some(Self::Failed),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final (or floating) classification of a signal's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewResult {
    Win,
    Loss,
    Floating,
    FloatingWin,
    FloatingLoss,
}

impl ReviewResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Win => "WIN",
            Self::Loss => "LOSS",
            Self::Floating => "FLOATING",
            Self::FloatingWin => "FLOATING_WIN",
            Self::FloatingLoss => "FLOATING_LOSS",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "WIN" => Some(Self::Win),
            "LOSS" => Some(Self::Loss),
            "FLOATING" => Some(Self::Floating),
            "FLOATING_WIN" => Some(Self::FloatingWin),
            "FLOATING_LOSS" => Some(Self::FloatingLoss),
            _ => None,
        }
    }

    /// Floating classifications may be revised; WIN/LOSS are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Win | Self::Loss)
    }
}

impl std::fmt::Display for ReviewResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Position lifecycle
// ---------------------------------------------------------------------------

/// Current status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    PendingApproval,
    Open,
    ClosedWin,
    ClosedLoss,
    ClosedManual,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingApproval => "PENDING_APPROVAL",
            Self::Open => "OPEN",
            Self::ClosedWin => "CLOSED_WIN",
            Self::ClosedLoss => "CLOSED_LOSS",
            Self::ClosedManual => "CLOSED_MANUAL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING_APPROVAL" => Some(Self::PendingApproval),
            "OPEN" => Some(Self::Open),
            "CLOSED_WIN" => Some(Self::ClosedWin),
            "CLOSED_LOSS" => Some(Self::ClosedLoss),
            "CLOSED_MANUAL" => Some(Self::ClosedManual),
            _ => None,
        }
    }

    /// OPEN and PENDING_APPROVAL both count as live exposure for dedup.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Open | Self::PendingApproval)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ClosedWin | Self::ClosedLoss | Self::ClosedManual)
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What triggered a position closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClosedBy {
    Tp,
    Sl,
    Trailing,
    Manual,
}

impl ClosedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tp => "TP",
            Self::Sl => "SL",
            Self::Trailing => "TRAILING",
            Self::Manual => "MANUAL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "TP" => Some(Self::Tp),
            "SL" => Some(Self::Sl),
            "TRAILING" => Some(Self::Trailing),
            "MANUAL" => Some(Self::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClosedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Per-user exchange credentials. Opaque to the engine; forwarded to the
/// execution service as-is and never logged.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.api_key.is_empty() || self.api_secret.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// A generated trade recommendation, tracked from admission to review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub sl_price: f64,
    pub tp_price: f64,
    /// Combined model confidence in [0, 100].
    pub confidence: f64,
    pub reasoning: String,
    pub status: SignalStatus,
    #[serde(default)]
    pub review_result: Option<ReviewResult>,
    #[serde(default)]
    pub review_pnl: Option<f64>,
    /// Screener metrics snapshot at signal time, forwarded with ML feedback.
    #[serde(default)]
    pub metrics: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl Signal {
    /// Check the price-ordering and confidence invariants.
    ///
    /// LONG requires `sl < entry < tp`; SHORT the reverse. Violations are
    /// fatal for the caller: nothing downstream may persist such a signal.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.confidence) {
            bail!("confidence {} outside [0, 100]", self.confidence);
        }
        if self.entry_price <= 0.0 {
            bail!("entry price {} must be positive", self.entry_price);
        }
        let ordered = match self.side {
            Side::Long => self.sl_price < self.entry_price && self.entry_price < self.tp_price,
            Side::Short => self.tp_price < self.entry_price && self.entry_price < self.sl_price,
        };
        if !ordered {
            bail!(
                "{} price levels out of order: sl={} entry={} tp={}",
                self.side,
                self.sl_price,
                self.entry_price,
                self.tp_price
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// A realized exposure tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub user_id: i64,
    /// Weak back-reference to the originating signal, if any.
    #[serde(default)]
    pub signal_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    /// Current stop-loss. Only ever trails in the favorable direction.
    pub sl_price: f64,
    pub tp_price: f64,
    /// Base-asset quantity.
    pub size: f64,
    pub leverage: u32,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub pnl: Option<f64>,
    #[serde(default)]
    pub pnl_percent: Option<f64>,
    pub status: PositionStatus,
    #[serde(default)]
    pub closed_by: Option<ClosedBy>,
    /// Set once the trailing logic has moved the stop at least once.
    #[serde(default)]
    pub sl_trailed: bool,
    pub created_at: String,
    #[serde(default)]
    pub closed_at: Option<String>,
}

impl Position {
    /// The trader's own capital backing this position.
    pub fn initial_margin(&self) -> f64 {
        self.size * self.entry_price / self.leverage.max(1) as f64
    }

    /// Gross unrealized PnL at `price`, in USD.
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.side.direction() * (price - self.entry_price) * self.size
    }

    /// Unrealized PnL as a percentage of initial margin (leverage applied).
    pub fn unrealized_pnl_pct(&self, price: f64) -> f64 {
        let margin = self.initial_margin();
        if margin <= 0.0 {
            return 0.0;
        }
        self.unrealized_pnl(price) / margin * 100.0
    }
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// Per-actor configuration consumed by the engine. Created and updated by
/// the presentation layer; the engine only reads (except paper balance).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub mode: TradeMode,
    /// USD margin committed per trade.
    pub fixed_order_size: f64,
    pub leverage: u32,
    pub auto_trade_enabled: bool,
    #[serde(skip_serializing, default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub real_balance_cache: Option<f64>,
    pub paper_balance: f64,
}

impl User {
    pub fn has_credentials(&self) -> bool {
        !self.credentials.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
