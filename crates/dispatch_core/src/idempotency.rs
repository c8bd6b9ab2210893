//! Time-bounded idempotency keys for ride creation.
//!
//! A retried "request ride" call carrying the same client key must get the
//! original ride back instead of triggering a second match. Entries expire
//! after a TTL (30 minutes by default) and are evicted lazily on lookup; the
//! table is also capacity-bounded, least recently used keys going first.
//!
//! The capacity bound wins over the TTL: past `capacity` live keys the oldest
//! one is forgotten early and a retry carrying it creates a fresh ride. Wire a
//! durable [`IdempotencyStore`](crate::persistence::IdempotencyStore) when
//! that matters; early evictions are logged and counted.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::types::RideId;

pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_IDEMPOTENCY_CAPACITY: usize = 100_000;

#[derive(Debug, Clone)]
struct Entry {
    ride_id: RideId,
    expires_at: DateTime<Utc>,
}

pub struct IdempotencyCache {
    entries: Mutex<LruCache<String, Entry>>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    early_evictions: AtomicU64,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration, capacity: NonZeroUsize) -> Self {
        Self::with_clock(ttl, capacity, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, capacity: NonZeroUsize, clock: Arc<dyn Clock>) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            clock,
            early_evictions: AtomicU64::new(0),
        }
    }

    /// Map `key` to `ride_id` until `now + ttl`. Empty keys are ignored.
    pub fn remember(&self, key: &str, ride_id: &RideId) {
        if key.is_empty() || ride_id.as_str().is_empty() {
            return;
        }
        let now = self.clock.now();
        let expires_at = now
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let evicted = entries.push(
            key.to_string(),
            Entry {
                ride_id: ride_id.clone(),
                expires_at,
            },
        );
        if let Some((evicted_key, entry)) = evicted {
            if evicted_key != key && now <= entry.expires_at {
                self.early_evictions.fetch_add(1, Ordering::Relaxed);
                warn!(
                    ride = %entry.ride_id,
                    capacity = entries.cap().get(),
                    "idempotency key evicted before expiry"
                );
            }
        }
    }

    /// Ride recorded under `key`, if present and unexpired.
    pub fn lookup(&self, key: &str) -> Option<RideId> {
        if key.is_empty() {
            return None;
        }
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            None => return None,
            Some(entry) if now <= entry.expires_at => return Some(entry.ride_id.clone()),
            Some(_) => {}
        }
        entries.pop(key);
        None
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unexpired keys dropped to make room for newer ones.
    pub fn early_evictions(&self) -> u64 {
        self.early_evictions.load(Ordering::Relaxed)
    }
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new(
            DEFAULT_IDEMPOTENCY_TTL,
            NonZeroUsize::new(DEFAULT_IDEMPOTENCY_CAPACITY).unwrap_or(NonZeroUsize::MIN),
        )
    }
}

impl std::fmt::Debug for IdempotencyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.len())
            .field("early_evictions", &self.early_evictions())
            .finish()
    }
}
