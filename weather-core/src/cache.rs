//! In-memory TTL cache shared by every dispatcher call.
//!
//! Entries live in a `DashMap` behind `Arc`, so a reader holds either the
//! previous or the new complete value while a writer replaces it.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::{task::JoinHandle, time::Instant};
use tracing::debug;

use crate::model::{QueryKind, WeatherData};

/// Provider component of a key when the caller expressed no preference.
pub const ANY_PROVIDER: &str = "any";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub provider: String,
    pub location: String,
    pub kind: QueryKind,
    pub params: String,
}

impl CacheKey {
    /// The location is trimmed, lowercased and has inner whitespace collapsed,
    /// so "  New   York" and "new york" share an entry.
    pub fn new(
        preferred: Option<&str>,
        location: &str,
        kind: QueryKind,
        params: impl Into<String>,
    ) -> Self {
        Self {
            provider: preferred.unwrap_or(ANY_PROVIDER).to_string(),
            location: normalize_location(location),
            kind,
            params: params.into(),
        }
    }
}

fn normalize_location(location: &str) -> String {
    location
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedWeather {
    pub value: WeatherData,
    pub served_by: String,
    pub stored_at: Instant,
    pub ttl: Duration,
}

impl CachedWeather {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) <= self.ttl
    }
}

#[derive(Debug, Default)]
pub struct WeatherCache {
    entries: DashMap<CacheKey, Arc<CachedWeather>>,
}

impl WeatherCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh entry for `key`. A stale entry counts as a miss and is evicted,
    /// unless a writer replaced it with a fresh one in the meantime.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CachedWeather>> {
        let now = Instant::now();
        let entry = self.entries.get(key).map(|e| Arc::clone(e.value()))?;
        if entry.is_fresh(now) {
            return Some(entry);
        }

        if self.entries.remove_if(key, |_, current| !current.is_fresh(now)).is_some() {
            debug!(location = %key.location, kind = key.kind.as_str(), "evicted stale cache entry");
        }
        None
    }

    pub fn put(&self, key: CacheKey, value: WeatherData, served_by: &str, ttl: Duration) {
        let entry = CachedWeather {
            value,
            served_by: served_by.to_string(),
            stored_at: Instant::now(),
            ttl,
        };
        self.entries.insert(key, Arc::new(entry));
    }

    /// Remove every entry whose key matches; returns how many were removed.
    pub fn invalidate<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CacheKey) -> bool,
    {
        let mut removed = 0;
        self.entries.retain(|key, _| {
            let matched = predicate(key);
            if matched {
                removed += 1;
            }
            !matched
        });
        removed
    }

    /// Drop entries requested for, or answered by, `provider`.
    pub fn invalidate_provider(&self, provider: &str) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, entry| {
            let matched = key.provider == provider || entry.served_by == provider;
            if matched {
                removed += 1;
            }
            !matched
        });
        removed
    }

    /// Evict every expired entry.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let fresh = entry.is_fresh(now);
            if !fresh {
                removed += 1;
            }
            fresh
        });
        if removed > 0 {
            debug!(removed, "cache sweep");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Run [`WeatherCache::sweep`] every `interval` until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::point_at;

    fn key(location: &str) -> CacheKey {
        CacheKey::new(None, location, QueryKind::Current, "")
    }

    fn current(temp: f64) -> WeatherData {
        WeatherData::Current(point_at(0, temp))
    }

    #[test]
    fn keys_normalize_location() {
        assert_eq!(key("  New   York "), key("new york"));
        assert_ne!(
            CacheKey::new(Some("openmeteo"), "Rome", QueryKind::Current, ""),
            key("Rome")
        );
        assert_ne!(
            CacheKey::new(None, "Rome", QueryKind::Forecast, "days=3"),
            CacheKey::new(None, "Rome", QueryKind::Forecast, "days=5"),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = WeatherCache::new();
        cache.put(key("Rome"), current(20.0), "openmeteo", Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(59)).await;
        let hit = cache.get(&key("Rome")).expect("still fresh");
        assert_eq!(hit.served_by, "openmeteo");
        assert_eq!(hit.value, current(20.0));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&key("Rome")).is_none());
        // the stale read evicted it
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_only_removes_expired() {
        let cache = WeatherCache::new();
        cache.put(key("Rome"), current(1.0), "a", Duration::from_secs(10));
        cache.put(key("Oslo"), current(2.0), "a", Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("Oslo")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_evicts_periodically() {
        let cache = Arc::new(WeatherCache::new());
        cache.put(key("Rome"), current(1.0), "a", Duration::from_secs(5));
        let handle = cache.spawn_sweeper(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(cache.is_empty());
        handle.abort();
    }

    #[test]
    fn invalidation_by_predicate_and_provider() {
        let cache = WeatherCache::new();
        cache.put(key("Rome"), current(1.0), "openmeteo", Duration::from_secs(60));
        cache.put(key("Oslo"), current(2.0), "weatherapi", Duration::from_secs(60));
        cache.put(
            CacheKey::new(Some("weatherapi"), "Paris", QueryKind::Current, ""),
            current(3.0),
            "openweather",
            Duration::from_secs(60),
        );

        assert_eq!(cache.invalidate_provider("weatherapi"), 2);
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.invalidate(|k| k.location == "rome"), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_never_tear_values() {
        let cache = Arc::new(WeatherCache::new());
        let mut tasks = Vec::new();

        for writer in 0..4 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                for i in 0..200 {
                    let temp = f64::from(writer * 1000 + i);
                    // served_by always encodes the same number as the payload
                    cache.put(key("Rome"), current(temp), &temp.to_string(), Duration::from_secs(600));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                for _ in 0..200 {
                    if let Some(hit) = cache.get(&key("Rome")) {
                        let WeatherData::Current(point) = &hit.value else {
                            panic!("wrong payload kind");
                        };
                        assert_eq!(hit.served_by, point.temperature_c.to_string());
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(cache.len(), 1);
    }
}
