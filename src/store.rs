// =============================================================================
// Position Store — SQLite persistence for positions, signals, and users
// =============================================================================
//
// The single source of truth for "does user X hold symbol Y".  All write
// paths are single statements or small explicit transactions.  Status
// transitions are guarded in SQL (`WHERE status = ...`) so concurrent loops
// cannot resurrect a terminal state; zero rows affected means "someone else
// finalized it" and is reported as `false`, not as an error.
//
// The connection is wrapped in a Mutex: statements are short and the store
// is shared across async tasks via `Arc<PositionStore>`.
// =============================================================================

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use crate::types::{
    ClosedBy, Credentials, Position, PositionStatus, ReviewResult, Side, Signal, SignalStatus,
    TradeMode, User,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    name                  TEXT NOT NULL,
    mode                  TEXT NOT NULL DEFAULT 'PAPER',
    fixed_order_size      REAL NOT NULL DEFAULT 10.0,
    leverage              INTEGER NOT NULL DEFAULT 5,
    is_auto_trade_enabled INTEGER NOT NULL DEFAULT 1,
    api_key               TEXT NOT NULL DEFAULT '',
    api_secret            TEXT NOT NULL DEFAULT '',
    real_balance_cache    REAL,
    paper_balance         REAL NOT NULL DEFAULT 1000.0,
    created_at            TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS signals (
    id            TEXT PRIMARY KEY,
    symbol        TEXT NOT NULL,
    side          TEXT NOT NULL,
    entry_price   REAL NOT NULL,
    sl_price      REAL NOT NULL,
    tp_price      REAL NOT NULL,
    confidence    REAL NOT NULL,
    reasoning     TEXT NOT NULL DEFAULT '',
    status        TEXT NOT NULL DEFAULT 'PENDING',
    review_result TEXT,
    review_pnl    REAL,
    metrics       TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS signals_pending_symbol
    ON signals(symbol) WHERE status = 'PENDING';
CREATE INDEX IF NOT EXISTS signals_symbol_status ON signals(symbol, status);

CREATE TABLE IF NOT EXISTS positions (
    id          TEXT PRIMARY KEY,
    user_id     INTEGER NOT NULL,
    signal_id   TEXT,
    symbol      TEXT NOT NULL,
    side        TEXT NOT NULL,
    entry_price REAL NOT NULL,
    sl_price    REAL NOT NULL,
    tp_price    REAL NOT NULL,
    size        REAL NOT NULL,
    leverage    INTEGER NOT NULL,
    exit_price  REAL,
    pnl         REAL,
    pnl_percent REAL,
    status      TEXT NOT NULL,
    closed_by   TEXT,
    sl_trailed  INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL,
    closed_at   TEXT
);
CREATE INDEX IF NOT EXISTS positions_status ON positions(status);
CREATE INDEX IF NOT EXISTS positions_user_symbol ON positions(user_id, symbol);
";

/// SQLite-backed store for all persistent engine state.
pub struct PositionStore {
    conn: Mutex<Connection>,
}

impl PositionStore {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;
        conn.execute_batch(SCHEMA)
            .context("failed to apply database schema")?;
        info!(path, "position store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch(SCHEMA)
            .context("failed to apply database schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // -------------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------------

    pub fn users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM users ORDER BY id")?;
        let rows = stmt
            .query_map([], user_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn user(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let user = conn
            .query_row("SELECT * FROM users WHERE id = ?1", params![id], user_from_row)
            .optional()?;
        Ok(user)
    }

    /// Insert a user and return its row id. Provisioning normally belongs to
    /// the presentation layer; the engine uses this for first-run seeding.
    pub fn insert_user(&self, user: &User) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (name, mode, fixed_order_size, leverage,
                                is_auto_trade_enabled, api_key, api_secret,
                                real_balance_cache, paper_balance, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                user.name,
                user.mode.as_str(),
                user.fixed_order_size,
                user.leverage,
                user.auto_trade_enabled as i64,
                user.credentials.api_key,
                user.credentials.api_secret,
                user.real_balance_cache,
                user.paper_balance,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn user_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
        Ok(count)
    }

    /// Credit (or debit, with a negative delta) a user's paper balance.
    pub fn adjust_paper_balance(&self, user_id: i64, delta: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET paper_balance = paper_balance + ?1 WHERE id = ?2",
            params![delta, user_id],
        )?;
        Ok(())
    }

    /// Refresh the cached real balance after an exchange sync.
    pub fn set_real_balance_cache(&self, user_id: i64, balance: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET real_balance_cache = ?1 WHERE id = ?2",
            params![balance, user_id],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Signals
    // -------------------------------------------------------------------------

    /// Insert a PENDING signal, or update the existing PENDING row for the
    /// same symbol in place.  Returns `(id, created)`: rapid re-fires of the
    /// same symbol collapse onto a single row and keep the original id.
    pub fn upsert_pending_signal(&self, signal: &Signal) -> Result<(String, bool)> {
        signal.validate()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM signals WHERE symbol = ?1 AND status = 'PENDING'",
                params![signal.symbol],
                |r| r.get(0),
            )
            .optional()?;

        let result = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE signals
                     SET side = ?1, entry_price = ?2, sl_price = ?3, tp_price = ?4,
                         confidence = ?5, reasoning = ?6, metrics = ?7, updated_at = ?8
                     WHERE id = ?9",
                    params![
                        signal.side.as_str(),
                        signal.entry_price,
                        signal.sl_price,
                        signal.tp_price,
                        signal.confidence,
                        signal.reasoning,
                        signal.metrics.as_ref().map(|m| m.to_string()),
                        now,
                        id,
                    ],
                )?;
                (id, false)
            }
            None => {
                tx.execute(
                    "INSERT INTO signals (id, symbol, side, entry_price, sl_price, tp_price,
                                          confidence, reasoning, status, metrics,
                                          created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'PENDING', ?9, ?10, ?10)",
                    params![
                        signal.id,
                        signal.symbol,
                        signal.side.as_str(),
                        signal.entry_price,
                        signal.sl_price,
                        signal.tp_price,
                        signal.confidence,
                        signal.reasoning,
                        signal.metrics.as_ref().map(|m| m.to_string()),
                        now,
                    ],
                )?;
                (signal.id.clone(), true)
            }
        };

        tx.commit()?;
        Ok(result)
    }

    pub fn signal(&self, id: &str) -> Result<Option<Signal>> {
        let conn = self.conn.lock();
        let signal = conn
            .query_row("SELECT * FROM signals WHERE id = ?1", params![id], signal_from_row)
            .optional()?;
        Ok(signal)
    }

    pub fn recent_signals(&self, limit: usize) -> Result<Vec<Signal>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM signals ORDER BY created_at DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], signal_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Transition a signal out of PENDING.  The `status = 'PENDING'` guard
    /// keeps transitions monotone: a FAILED signal can never become EXECUTED.
    /// Returns whether a row was updated.
    pub fn finalize_signal(&self, id: &str, status: SignalStatus) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE signals SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'PENDING'",
            params![status.as_str(), Utc::now().to_rfc3339(), id],
        )?;
        Ok(rows > 0)
    }

    /// Whether any signal for `symbol` was marked FAILED within the last
    /// `window_secs` seconds (the failure cooldown).
    pub fn has_recent_failure(&self, symbol: &str, window_secs: i64) -> Result<bool> {
        let cutoff = (Utc::now() - ChronoDuration::seconds(window_secs)).to_rfc3339();
        let conn = self.conn.lock();
        let found: bool = conn.query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM signals
                 WHERE symbol = ?1 AND status = 'FAILED' AND updated_at >= ?2)",
            params![symbol, cutoff],
            |r| r.get(0),
        )?;
        Ok(found)
    }

    /// Optimistic review write: only lands while the current review result is
    /// NULL or still floating.  A terminal WIN/LOSS written earlier (e.g. by
    /// the bodyguard) is never overwritten; that case returns `false`.
    pub fn update_signal_review(
        &self,
        id: &str,
        result: ReviewResult,
        pnl_percent: Option<f64>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE signals SET review_result = ?1, review_pnl = ?2, updated_at = ?3
             WHERE id = ?4
               AND (review_result IS NULL OR review_result LIKE 'FLOATING%')",
            params![result.as_str(), pnl_percent, Utc::now().to_rfc3339(), id],
        )?;
        Ok(rows > 0)
    }

    /// EXECUTED signals old enough to classify whose review is still open.
    pub fn signals_for_review(&self, min_age_secs: i64) -> Result<Vec<Signal>> {
        let cutoff = (Utc::now() - ChronoDuration::seconds(min_age_secs)).to_rfc3339();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM signals
             WHERE status = 'EXECUTED'
               AND (review_result IS NULL OR review_result LIKE 'FLOATING%')
               AND created_at <= ?1
             ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![cutoff], signal_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    pub fn save_position(&self, pos: &Position) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO positions (id, user_id, signal_id, symbol, side, entry_price,
                                    sl_price, tp_price, size, leverage, exit_price, pnl,
                                    pnl_percent, status, closed_by, sl_trailed,
                                    created_at, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18)",
            params![
                pos.id,
                pos.user_id,
                pos.signal_id,
                pos.symbol,
                pos.side.as_str(),
                pos.entry_price,
                pos.sl_price,
                pos.tp_price,
                pos.size,
                pos.leverage,
                pos.exit_price,
                pos.pnl,
                pos.pnl_percent,
                pos.status.as_str(),
                pos.closed_by.map(|c| c.as_str()),
                pos.sl_trailed as i64,
                pos.created_at,
                pos.closed_at,
            ],
        )?;
        Ok(())
    }

    pub fn position(&self, id: &str) -> Result<Option<Position>> {
        let conn = self.conn.lock();
        let pos = conn
            .query_row(
                "SELECT * FROM positions WHERE id = ?1",
                params![id],
                position_from_row,
            )
            .optional()?;
        Ok(pos)
    }

    /// All positions in {OPEN, PENDING_APPROVAL} across all users.
    pub fn get_active_positions(&self) -> Result<Vec<Position>> {
        self.positions_where("status IN ('OPEN', 'PENDING_APPROVAL')")
    }

    /// OPEN positions only (the bodyguard's working set).
    pub fn get_open_positions(&self) -> Result<Vec<Position>> {
        self.positions_where("status = 'OPEN'")
    }

    /// Distinct symbols with live exposure. Used by dedup layer 3 and by the
    /// price pump's subscription set.
    pub fn active_symbols(&self) -> Result<HashSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT symbol FROM positions
             WHERE status IN ('OPEN', 'PENDING_APPROVAL')",
        )?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(rows)
    }

    pub fn pending_approval_positions(&self, user_id: i64) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM positions
             WHERE status = 'PENDING_APPROVAL' AND user_id = ?1
             ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![user_id], position_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn recent_closed_positions(&self, limit: usize) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM positions
             WHERE status IN ('CLOSED_WIN', 'CLOSED_LOSS', 'CLOSED_MANUAL')
             ORDER BY closed_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], position_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Move the stop of an OPEN position. The caller is responsible for the
    /// monotonicity check; this only records the move and flags the position
    /// as trailed.
    pub fn update_position_sl(&self, id: &str, new_sl: f64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE positions SET sl_price = ?1, sl_trailed = 1
             WHERE id = ?2 AND status = 'OPEN'",
            params![new_sl, id],
        )?;
        Ok(rows > 0)
    }

    /// PENDING_APPROVAL → OPEN. Returns whether a row transitioned.
    pub fn approve_position(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE positions SET status = 'OPEN'
             WHERE id = ?1 AND status = 'PENDING_APPROVAL'",
            params![id],
        )?;
        Ok(rows > 0)
    }

    /// Atomically persist a closure.  Guarded on the position still being
    /// active so two loops cannot close the same position twice.
    #[allow(clippy::too_many_arguments)]
    pub fn close_position(
        &self,
        id: &str,
        status: PositionStatus,
        exit_price: f64,
        pnl: f64,
        pnl_percent: f64,
        closed_by: ClosedBy,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE positions
             SET status = ?1, exit_price = ?2, pnl = ?3, pnl_percent = ?4,
                 closed_by = ?5, closed_at = ?6
             WHERE id = ?7 AND status IN ('OPEN', 'PENDING_APPROVAL')",
            params![
                status.as_str(),
                exit_price,
                pnl,
                pnl_percent,
                closed_by.as_str(),
                Utc::now().to_rfc3339(),
                id,
            ],
        )?;
        Ok(rows > 0)
    }

    fn positions_where(&self, predicate: &str) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT * FROM positions WHERE {predicate} ORDER BY created_at");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], position_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    #[cfg(test)]
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }
}

impl std::fmt::Debug for PositionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionStore").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_enum<T>(raw: String, what: &str, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown {what}: {raw}").into(),
        )
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get("id")?,
        name: row.get("name")?,
        mode: parse_enum(row.get("mode")?, "trade mode", TradeMode::from_str)?,
        fixed_order_size: row.get("fixed_order_size")?,
        leverage: row.get("leverage")?,
        auto_trade_enabled: row.get::<_, i64>("is_auto_trade_enabled")? != 0,
        credentials: Credentials {
            api_key: row.get("api_key")?,
            api_secret: row.get("api_secret")?,
        },
        real_balance_cache: row.get("real_balance_cache")?,
        paper_balance: row.get("paper_balance")?,
    })
}

fn signal_from_row(row: &Row<'_>) -> rusqlite::Result<Signal> {
    let review_result: Option<String> = row.get("review_result")?;
    let metrics: Option<String> = row.get("metrics")?;
    Ok(Signal {
        id: row.get("id")?,
        symbol: row.get("symbol")?,
        side: parse_enum(row.get("side")?, "side", Side::from_str)?,
        entry_price: row.get("entry_price")?,
        sl_price: row.get("sl_price")?,
        tp_price: row.get("tp_price")?,
        confidence: row.get("confidence")?,
        reasoning: row.get("reasoning")?,
        status: parse_enum(row.get("status")?, "signal status", SignalStatus::from_str)?,
        review_result: match review_result {
            Some(raw) => Some(parse_enum(raw, "review result", ReviewResult::from_str)?),
            None => None,
        },
        review_pnl: row.get("review_pnl")?,
        metrics: metrics.and_then(|m| serde_json::from_str(&m).ok()),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
    let closed_by: Option<String> = row.get("closed_by")?;
    Ok(Position {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        signal_id: row.get("signal_id")?,
        symbol: row.get("symbol")?,
        side: parse_enum(row.get("side")?, "side", Side::from_str)?,
        entry_price: row.get("entry_price")?,
        sl_price: row.get("sl_price")?,
        tp_price: row.get("tp_price")?,
        size: row.get("size")?,
        leverage: row.get("leverage")?,
        exit_price: row.get("exit_price")?,
        pnl: row.get("pnl")?,
        pnl_percent: row.get("pnl_percent")?,
        status: parse_enum(row.get("status")?, "position status", PositionStatus::from_str)?,
        closed_by: match closed_by {
            Some(raw) => Some(parse_enum(raw, "closed_by", ClosedBy::from_str)?),
            None => None,
        },
        sl_trailed: row.get::<_, i64>("sl_trailed")? != 0,
        created_at: row.get("created_at")?,
        closed_at: row.get("closed_at")?,
    })
}

// =============================================================================
// Tests
// =============================================================================
