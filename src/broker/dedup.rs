//! Bounded-TTL "seen" set used for the dedup window.
//!
//! Keys are spread over independently locked stripes so that inserts for
//! different keys do not contend, while two inserts of the same key are
//! serialized by the stripe lock and exactly one of them wins.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

const STRIPES: usize = 16;

pub struct TtlSet<K> {
    ttl: Duration,
    capacity_per_stripe: usize,
    stripes: Vec<Mutex<HashMap<K, Instant>>>,
    hasher: RandomState,
}

impl<K: Hash + Eq + Clone> TtlSet<K> {
    /// Create a set that forgets keys after `ttl` and holds at most
    /// roughly `capacity` keys overall.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity_per_stripe = capacity.div_ceil(STRIPES).max(1);
        Self {
            ttl,
            capacity_per_stripe,
            stripes: (0..STRIPES).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn stripe(&self, key: &K) -> &Mutex<HashMap<K, Instant>> {
        let index = (self.hasher.hash_one(key) as usize) % self.stripes.len();
        &self.stripes[index]
    }

    /// Record a sighting of `key`.
    ///
    /// Returns `true` for the first sighting within the window and `false`
    /// for a duplicate.
    pub fn insert(&self, key: K) -> bool {
        let now = Instant::now();
        let mut seen = self
            .stripe(&key)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(at) = seen.get(&key) {
            if now.duration_since(*at) < self.ttl {
                return false;
            }
        }

        if seen.len() >= self.capacity_per_stripe {
            let ttl = self.ttl;
            seen.retain(|_, at| now.duration_since(*at) < ttl);
        }
        if seen.len() >= self.capacity_per_stripe {
            // Still full of live keys: drop the oldest to stay bounded.
            if let Some(oldest) = seen
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(k, _)| k.clone())
            {
                seen.remove(&oldest);
            }
        }

        seen.insert(key, now);
        true
    }

    /// Whether `key` was seen within the window.
    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        let seen = self
            .stripe(key)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        seen.get(key)
            .map(|at| now.duration_since(*at) < self.ttl)
            .unwrap_or(false)
    }

    /// Number of keys currently held, expired ones included until evicted.
    pub fn len(&self) -> usize {
        self.stripes
            .iter()
            .map(|s| s.lock().unwrap_or_else(|p| p.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
