use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::fingerprint::Fingerprint;
use crate::response::ResponseBody;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug)]
struct CacheEntry {
    resource: String,
    body: ResponseBody,
    stored_at: Instant,
}

/// Time-bounded map from fingerprint to a previously observed response body.
///
/// Expired entries are evicted lazily on lookup; there is no background
/// sweep. Callers only ever receive clones of stored bodies.
#[derive(Debug)]
pub struct ResponseCache {
    ttl: Mutex<Duration>,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: Mutex::new(ttl),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        *lock_unpoisoned(&self.ttl)
    }

    pub fn set_ttl(&self, ttl: Duration) {
        *lock_unpoisoned(&self.ttl) = ttl;
    }

    /// Returns the stored body while it is younger than the TTL; an entry
    /// whose age reached the TTL is removed and reported absent.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<ResponseBody> {
        let ttl = self.ttl();
        let mut entries = lock_unpoisoned(&self.entries);
        let entry = entries.get(fingerprint.as_str())?;
        if entry.stored_at.elapsed() >= ttl {
            entries.remove(fingerprint.as_str());
            return None;
        }
        Some(entry.body.clone())
    }

    /// Returns any stored body regardless of age.
    pub fn get_stale(&self, fingerprint: &Fingerprint) -> Option<ResponseBody> {
        lock_unpoisoned(&self.entries)
            .get(fingerprint.as_str())
            .map(|entry| entry.body.clone())
    }

    pub fn set(&self, fingerprint: &Fingerprint, body: ResponseBody) {
        lock_unpoisoned(&self.entries).insert(
            fingerprint.as_str().to_owned(),
            CacheEntry {
                resource: fingerprint.resource().to_owned(),
                body,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        lock_unpoisoned(&self.entries)
            .remove(fingerprint.as_str())
            .is_some()
    }

    /// Removes every entry for one method and URL, across query strings and
    /// bodies. Returns the number of removed entries.
    pub fn invalidate_resource(&self, resource: &str) -> usize {
        let mut entries = lock_unpoisoned(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| entry.resource != resource);
        before - entries.len()
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
