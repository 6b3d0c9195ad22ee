//! A map whose entries expire after a fixed time-to-live.
//!
//! Expired entries are invisible to readers as soon as their deadline passes
//! and are physically removed either lazily (on access) or by the periodic
//! purge task started with [`ExpiringMap::spawn_purger`]. A removal listener
//! is told whether each entry expired or was removed explicitly.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Whether reading an entry pushes its deadline back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationPolicy {
    NeverRenew,
    RenewOnRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Expired,
    ExplicitlyRemoved,
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

type Listener<K, V> = Box<dyn Fn(&K, &V, RemovalReason) + Send + Sync>;

pub struct ExpiringMap<K, V> {
    ttl: Duration,
    policy: ExpirationPolicy,
    entries: Mutex<HashMap<K, Entry<V>>>,
    on_removed: Option<Listener<K, V>>,
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, policy: ExpirationPolicy) -> Self {
        Self {
            ttl,
            policy,
            entries: Mutex::new(HashMap::new()),
            on_removed: None,
        }
    }

    /// Register a callback run after an entry leaves the map.
    pub fn with_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&K, &V, RemovalReason) + Send + Sync + 'static,
    {
        self.on_removed = Some(Box::new(listener));
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Entry<V>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, removed: Vec<(K, V)>, reason: RemovalReason) {
        if let Some(listener) = &self.on_removed {
            for (key, value) in &removed {
                listener(key, value, reason);
            }
        }
    }

    /// Insert or replace, restarting the entry's TTL.
    pub fn insert(&self, key: K, value: V) {
        let expires_at = Instant::now() + self.ttl;
        self.lock().insert(key, Entry { value, expires_at });
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.lock();

        match entries.get_mut(key) {
            None => return None,
            Some(entry) if entry.expires_at > now => {
                if self.policy == ExpirationPolicy::RenewOnRead {
                    entry.expires_at = now + self.ttl;
                }
                return Some(entry.value.clone());
            }
            Some(_) => {}
        }

        let removed = entries.remove(key).map(|e| (key.clone(), e.value));
        drop(entries);

        self.notify(removed.into_iter().collect(), RemovalReason::Expired);
        None
    }

    /// Return the live value for `key`, creating it with `make` if absent.
    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> V
    where
        F: FnOnce(&K) -> V,
    {
        let now = Instant::now();
        let mut entries = self.lock();

        let mut expired = None;
        if let Some(entry) = entries.get_mut(&key) {
            if entry.expires_at > now {
                if self.policy == ExpirationPolicy::RenewOnRead {
                    entry.expires_at = now + self.ttl;
                }
                return entry.value.clone();
            }
            expired = entries.remove(&key).map(|e| (key.clone(), e.value));
        }

        let value = make(&key);
        entries.insert(
            key,
            Entry {
                value: value.clone(),
                expires_at: now + self.ttl,
            },
        );
        drop(entries);

        self.notify(expired.into_iter().collect(), RemovalReason::Expired);
        value
    }

    /// True if a live entry exists. Does not renew.
    pub fn contains_key(&self, key: &K) -> bool {
        let now = Instant::now();
        self.lock()
            .get(key)
            .is_some_and(|entry| entry.expires_at > now)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = self.lock().remove(key).map(|e| e.value);
        if let Some(value) = &removed {
            self.notify(
                vec![(key.clone(), value.clone())],
                RemovalReason::ExplicitlyRemoved,
            );
        }
        removed
    }

    /// Keys of live entries.
    pub fn keys(&self) -> Vec<K> {
        let now = Instant::now();
        self.lock()
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Values of live entries.
    pub fn values(&self) -> Vec<V> {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone())
            .collect()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything without notifying the listener.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Physically remove expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();

        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();

        let removed: Vec<(K, V)> = expired
            .into_iter()
            .filter_map(|k| entries.remove(&k).map(|e| (k, e.value)))
            .collect();
        drop(entries);

        let count = removed.len();
        self.notify(removed, RemovalReason::Expired);
        count
    }
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Purge expired entries every `interval` until `shutdown` flips to true.
    pub fn spawn_purger(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let map = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = map.purge_expired();
                        if purged > 0 {
                            debug!(purged, "Purged expired entries");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
