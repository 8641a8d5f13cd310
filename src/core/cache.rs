use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use serde_json::Value;

#[derive(Clone, Debug)]
struct CachedEntry {
    value: Value,
    timestamp: Instant,
}

/// Every cache key this subsystem derives from a task and its domain.
///
/// Anything cached under a key not listed here would survive invalidation,
/// so readers must only use these.
pub fn cache_keys(task_id: &str, domain: &str) -> Vec<String> {
    vec![
        report_key(task_id),
        format!("task:{}:backlinks", task_id),
        format!("task:{}:detection", task_id),
        harmful_key(domain),
        format!("domain:{}:latest", domain),
    ]
}

pub fn report_key(task_id: &str) -> String {
    format!("task:{}:report", task_id)
}

pub fn harmful_key(domain: &str) -> String {
    format!("domain:{}:harmful", domain)
}

/// In-process TTL cache for report snapshots.
pub struct ResultCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedEntry>>,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        if self.ttl.is_zero() {
            return None;
        }
        let entries = self.entries.lock().ok()?;
        entries.get(key).and_then(|entry| {
            if entry.timestamp.elapsed() < self.ttl {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    pub fn put(&self, key: impl Into<String>, value: Value) {
        if self.ttl.is_zero() {
            return;
        }
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                key.into(),
                CachedEntry {
                    value,
                    timestamp: Instant::now(),
                },
            );
        }
    }

    /// Drop every key derived from this task and domain. Returns how many
    /// entries were actually present.
    pub fn invalidate(&self, task_id: &str, domain: &str) -> usize {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache_keys(task_id, domain)
            .iter()
            .filter(|key| entries.remove(key.as_str()).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invalidate_purges_all_derived_keys() {
        let cache = ResultCache::new(Duration::from_secs(60));
        for key in cache_keys("t1", "example.com") {
            cache.put(key, json!({"stale": true}));
        }
        cache.put("task:t2:report", json!(1));
        assert_eq!(cache.invalidate("t1", "example.com"), 5);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&report_key("t1")).is_none());
        assert!(cache.get(&report_key("t2")).is_some());
    }

    #[test]
    fn zero_ttl_disables_cache() {
        let cache = ResultCache::new(Duration::ZERO);
        cache.put("task:t1:report", json!(1));
        assert!(cache.get("task:t1:report").is_none());
        assert!(cache.is_empty());
    }
}
