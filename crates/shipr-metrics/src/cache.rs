use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};

use shipr_core::models::metrics::{EntityKind, MetricsPayload};
use shipr_core::Clock;

/// Identity of a metrics request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tenant: String,
    pub kind: EntityKind,
    pub id: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

struct Entry {
    payload: MetricsPayload,
    expires_at: DateTime<Utc>,
}

/// Computed payloads kept for a fixed time from when they were stored.
///
/// Expiry is purely time based; new activity does not invalidate an entry.
pub struct MetricsCache {
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    entries: Mutex<HashMap<CacheKey, Entry>>,
}

impl MetricsCache {
    pub fn new(clock: Arc<dyn Clock>, ttl: std::time::Duration) -> Self {
        Self {
            clock,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &CacheKey) -> Option<MetricsPayload> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.payload.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store `payload` under `key`. Entries that have expired by now are
    /// dropped first, so keys that are never read again do not pile up.
    pub fn insert(&self, key: CacheKey, payload: MetricsPayload) {
        let now = self.clock.now();
        let expires_at = now
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut entries = self.lock();
        drop_expired(&mut entries, now);
        entries.insert(
            key,
            Entry {
                payload,
                expires_at,
            },
        );
    }

    /// Drop expired entries; returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        drop_expired(&mut self.lock(), now)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

fn drop_expired(entries: &mut HashMap<CacheKey, Entry>, now: DateTime<Utc>) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| entry.expires_at > now);
    before - entries.len()
}
