use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Time source behind the response cache so tests can drive expiry by hand.
pub trait Clock {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Keyed TTL cache for read-side aggregates. Pure time-based expiry, no
/// invalidation on writes; a zero TTL disables caching entirely.
pub struct ResponseCache {
    ttl: Duration,
    clock: Box<dyn Clock>,
    entries: HashMap<String, (Instant, Value)>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Box::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Box<dyn Clock>) -> Self {
        ResponseCache {
            ttl,
            clock,
            entries: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&mut self, key: &str) -> Option<Value> {
        if self.ttl.is_zero() {
            return None;
        }
        let now = self.clock.now();
        match self.entries.get(key) {
            Some((expires, v)) if *expires >= now => Some(v.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&mut self, key: String, value: Value) {
        if self.ttl.is_zero() {
            return;
        }
        let expires = self.clock.now() + self.ttl;
        self.entries.insert(key, (expires, value));
    }

    /// Entries are keyed per endpoint, not per database file, so anything
    /// that swaps the underlying database must flush them.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Stable key: params sorted by name, so call-site argument order never
/// splits entries.
pub fn cache_key(endpoint: &str, params: &[(&str, String)]) -> String {
    let mut items: Vec<&(&str, String)> = params.iter().collect();
    items.sort_by_key(|(k, _)| *k);
    let joined = items
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");
    format!("{}|{}", endpoint, joined)
}
