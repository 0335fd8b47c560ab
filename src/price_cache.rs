// =============================================================================
// Price Cache — shared symbol → last-price map
// =============================================================================
//
// Single-writer (the WebSocket price pump), many readers (bodyguard, outcome
// reviewer, paper executor, API).  The write lock is held only around the
// map assignment.  Readers receive the price together with its staleness so
// they can decide whether to fall back to the REST path.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// A cached price and the instant it was observed.
#[derive(Debug, Clone, Copy)]
struct PriceTick {
    price: f64,
    at: Instant,
}

/// Thread-safe last-price cache. No persistence; rebuilt at startup from a
/// REST snapshot and maintained by the WS pump afterwards.
pub struct PriceCache {
    prices: RwLock<HashMap<String, PriceTick>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Record a fresh price for `symbol`. Non-positive prices are discarded.
    pub fn set(&self, symbol: &str, price: f64) {
        if price <= 0.0 {
            return;
        }
        let tick = PriceTick {
            price,
            at: Instant::now(),
        };
        self.prices.write().insert(symbol.to_string(), tick);
    }

    /// Current price and staleness for `symbol`, if cached.
    pub fn get(&self, symbol: &str) -> Option<(f64, Duration)> {
        self.prices
            .read()
            .get(symbol)
            .map(|tick| (tick.price, tick.at.elapsed()))
    }

    /// Price for `symbol` only if it is fresher than `max_age`.
    pub fn get_fresh(&self, symbol: &str, max_age: Duration) -> Option<f64> {
        self.get(symbol)
            .filter(|(_, age)| *age <= max_age)
            .map(|(price, _)| price)
    }

    /// Bulk lookup. Missing symbols are simply absent from the result.
    pub fn get_many(&self, symbols: &[String]) -> HashMap<String, f64> {
        let prices = self.prices.read();
        symbols
            .iter()
            .filter_map(|s| prices.get(s).map(|t| (s.clone(), t.price)))
            .collect()
    }

    /// All symbols currently cached.
    pub fn symbols(&self) -> Vec<String> {
        self.prices.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.prices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.read().is_empty()
    }
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PriceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceCache")
            .field("symbols", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get() {
        let cache = PriceCache::new();
        cache.set("BTCUSDT", 50_000.0);

        let (price, age) = cache.get("BTCUSDT").unwrap();
        assert!((price - 50_000.0).abs() < f64::EPSILON);
        assert!(age < Duration::from_secs(1));
    }

    #[test]
    fn missing_symbol_returns_none() {
        let cache = PriceCache::new();
        assert!(cache.get("ETHUSDT").is_none());
        assert!(cache.get_fresh("ETHUSDT", Duration::from_secs(10)).is_none());
    }

    #[test]
    fn non_positive_prices_are_discarded() {
        let cache = PriceCache::new();
        cache.set("BTCUSDT", 0.0);
        cache.set("ETHUSDT", -1.0);
        assert!(cache.is_empty());
    }

    #[test]
    fn fresh_lookup_respects_max_age() {
        let cache = PriceCache::new();
        cache.set("BTCUSDT", 50_000.0);
        assert!(cache.get_fresh("BTCUSDT", Duration::from_secs(10)).is_some());
        assert!(cache.get_fresh("BTCUSDT", Duration::ZERO).is_none());
    }

    #[test]
    fn bulk_lookup_skips_missing() {
        let cache = PriceCache::new();
        cache.set("BTCUSDT", 50_000.0);
        cache.set("ETHUSDT", 2_000.0);

        let out = cache.get_many(&[
            "BTCUSDT".to_string(),
            "ETHUSDT".to_string(),
            "DOGEUSDT".to_string(),
        ]);
        assert_eq!(out.len(), 2);
        assert!(!out.contains_key("DOGEUSDT"));
    }

    #[test]
    fn latest_write_wins() {
        let cache = PriceCache::new();
        cache.set("BTCUSDT", 50_000.0);
        cache.set("BTCUSDT", 50_100.0);
        let (price, _) = cache.get("BTCUSDT").unwrap();
        assert!((price - 50_100.0).abs() < f64::EPSILON);
    }
}
