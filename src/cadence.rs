// =============================================================================
// Clock & Cadence Policy — time-of-day-aware scan frequency
// =============================================================================
//
// The scan scheduler ticks every second and asks this module whether a scan
// is due.  The regime is recomputed from the current UTC hour on every tick
// rather than precomputed into cron strings, which keeps the boundary logic
// a pure, testable function.
//
// Regimes (UTC hours):
//   AGGRESSIVE  13-16           scan every 5 s   (session overlap)
//   NORMAL      0-3, 7-10, 17   scan every 30 s
//   SLOW        everything else scan every 2 min
// =============================================================================

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;

// ---------------------------------------------------------------------------
// Regime
// ---------------------------------------------------------------------------

/// Scan-frequency regime derived from the UTC hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    Aggressive,
    Normal,
    Slow,
}

impl Regime {
    /// Map a UTC hour (0-23) to its regime.
    pub fn for_hour(hour: u32) -> Self {
        match hour {
            13..=16 => Self::Aggressive,
            0..=3 | 7..=10 | 17 => Self::Normal,
            _ => Self::Slow,
        }
    }

    /// Regime for a wall-clock instant.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self::for_hour(now.hour())
    }

    /// Seconds between scans in this regime.
    pub fn interval_secs(&self) -> i64 {
        match self {
            Self::Aggressive => 5,
            Self::Normal => 30,
            Self::Slow => 120,
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aggressive => write!(f, "AGGRESSIVE"),
            Self::Normal => write!(f, "NORMAL"),
            Self::Slow => write!(f, "SLOW"),
        }
    }
}

// ---------------------------------------------------------------------------
// CadenceClock
// ---------------------------------------------------------------------------

/// Tracks when the last scan fired and decides whether the current tick is a
/// scan boundary.
///
/// The clock advances both on a fired scan and on a tick dropped because a
/// scan was still in flight, so a dropped tick waits for the next full
/// interval instead of firing again one second later.  Regime handover is
/// lossless: after the hour rolls over, the very next boundary is computed
/// with the new regime's interval relative to the last fire.
#[derive(Debug)]
pub struct CadenceClock {
    last_fired_unix: i64,
}

impl CadenceClock {
    pub fn new() -> Self {
        Self { last_fired_unix: 0 }
    }

    /// Whether a scan is due at `now`. Does not advance the clock.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let interval = Regime::at(now).interval_secs();
        now.timestamp() - self.last_fired_unix >= interval
    }

    /// Mark the boundary at `now` as consumed (scan fired or dropped).
    pub fn advance(&mut self, now: DateTime<Utc>) {
        self.last_fired_unix = now.timestamp();
    }
}

impl Default for CadenceClock {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
