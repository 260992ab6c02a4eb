use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Configurator;
use crate::now_millis;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub point_id: String,
    pub value: f64,
    pub timestamp_ms: u64,
    pub version: u64,
    #[serde(default)]
    pub forced: bool,
    /// Unscaled board reading, as last reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<f64>,
}

/// Consistent copy of the cache taken under a single read lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Snapshot {
    pub version: u64,
    pub entries: BTreeMap<String, CacheEntry>,
}

impl Snapshot {
    pub fn get(&self, point_id: &str) -> Option<&CacheEntry> {
        self.entries.get(point_id)
    }

    pub fn value(&self, point_id: &str) -> Option<f64> {
        self.entries.get(point_id).map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("unknown board point '{0}'")]
    UnknownPoint(String),
}

#[derive(Debug, Default)]
struct CacheState {
    version: u64,
    entries: HashMap<String, CacheEntry>,
    forced: HashMap<String, f64>,
}

impl CacheState {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

/// Latest value of every configured board point.
///
/// Measured values are written only by the serial I/O worker through
/// [`update`](Self::update); every write bumps one global version counter so
/// readers can ask for "everything newer than what I last saw".
#[derive(Debug)]
pub struct BoardStateCache {
    known: HashSet<String>,
    state: RwLock<CacheState>,
}

impl BoardStateCache {
    pub fn new<I, S>(point_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: point_ids.into_iter().map(Into::into).collect(),
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn from_config(config: &Configurator) -> Self {
        Self::new(config.points().map(|p| p.id.clone()))
    }

    pub fn is_known(&self, point_id: &str) -> bool {
        self.known.contains(point_id)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a measured value. Returns the new version, or `None` when the
    /// point is not configured.
    pub fn update(&self, point_id: &str, value: f64, timestamp_ms: u64) -> Option<u64> {
        self.record(point_id, value, None, timestamp_ms)
    }

    /// Like [`update`](Self::update), keeping the board's unscaled reading
    /// alongside the engineering value.
    pub fn update_raw(&self, point_id: &str, value: f64, raw: f64, timestamp_ms: u64) -> Option<u64> {
        self.record(point_id, value, Some(raw), timestamp_ms)
    }

    fn record(&self, point_id: &str, value: f64, raw: Option<f64>, timestamp_ms: u64) -> Option<u64> {
        if !self.is_known(point_id) {
            warn!(point_id, "dropping reading for unconfigured board point");
            return None;
        }

        let mut state = self.write_state();
        let version = state.next_version();
        let pinned = state.forced.get(point_id).copied();
        state.entries.insert(
            point_id.to_string(),
            CacheEntry {
                point_id: point_id.to_string(),
                value: pinned.unwrap_or(value),
                timestamp_ms,
                version,
                forced: pinned.is_some(),
                raw,
            },
        );
        Some(version)
    }

    pub fn read(&self, point_id: &str) -> Option<CacheEntry> {
        self.read_state().entries.get(point_id).cloned()
    }

    pub fn read_all(&self) -> Snapshot {
        let state = self.read_state();
        Snapshot {
            version: state.version,
            entries: state
                .entries
                .iter()
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.read_state().version
    }

    /// Entries written after `version` that pass `filter`, oldest first.
    pub fn changed_since<F>(&self, version: u64, filter: F) -> Vec<CacheEntry>
    where
        F: Fn(&str) -> bool,
    {
        let state = self.read_state();
        let mut changed: Vec<CacheEntry> = state
            .entries
            .values()
            .filter(|e| e.version > version && filter(&e.point_id))
            .cloned()
            .collect();
        changed.sort_by_key(|e| e.version);
        changed
    }

    /// Pins a point to `value` until [`unforce`](Self::unforce). Board updates
    /// keep refreshing the timestamp and version while the value stays pinned.
    pub fn force(&self, point_id: &str, value: f64) -> Result<u64, CacheError> {
        if !self.is_known(point_id) {
            return Err(CacheError::UnknownPoint(point_id.to_string()));
        }

        let mut state = self.write_state();
        state.forced.insert(point_id.to_string(), value);
        let version = state.next_version();
        let timestamp_ms = now_millis();
        let entry = state
            .entries
            .entry(point_id.to_string())
            .or_insert_with(|| CacheEntry {
                point_id: point_id.to_string(),
                value,
                timestamp_ms,
                version,
                forced: true,
                raw: None,
            });
        entry.value = value;
        entry.version = version;
        entry.timestamp_ms = timestamp_ms;
        entry.forced = true;
        debug!(point_id, value, version, "point forced");
        Ok(version)
    }

    /// Releases a forced point. The pinned value stays visible until the
    /// board reports again. Returns whether the point was forced.
    pub fn unforce(&self, point_id: &str) -> Result<bool, CacheError> {
        if !self.is_known(point_id) {
            return Err(CacheError::UnknownPoint(point_id.to_string()));
        }

        let mut state = self.write_state();
        let was_forced = state.forced.remove(point_id).is_some();
        if let Some(entry) = state.entries.get_mut(point_id) {
            entry.forced = false;
        }
        Ok(was_forced)
    }

    pub fn is_forced(&self, point_id: &str) -> bool {
        self.read_state().forced.contains_key(point_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_point_is_dropped() {
        let cache = BoardStateCache::new(["space_temp"]);
        assert_eq!(cache.update("bogus", 1.0, 10), None);
        assert_eq!(cache.version(), 0);
        assert!(cache.read("bogus").is_none());
    }

    #[test]
    fn test_forced_value_survives_board_updates() {
        let cache = BoardStateCache::new(["space_temp"]);
        cache.update("space_temp", 20.0, 1);
        let forced_at = cache.force("space_temp", 30.0).unwrap();

        let v = cache.update("space_temp", 19.0, 2).unwrap();
        assert!(v > forced_at);
        let entry = cache.read("space_temp").unwrap();
        assert_eq!(entry.value, 30.0);
        assert_eq!(entry.timestamp_ms, 2);
        assert!(entry.forced);

        assert!(cache.unforce("space_temp").unwrap());
        assert!(!cache.is_forced("space_temp"));
        cache.update("space_temp", 18.5, 3);
        let entry = cache.read("space_temp").unwrap();
        assert_eq!(entry.value, 18.5);
        assert!(!entry.forced);
    }

    #[test]
    fn test_changed_since_filters_and_orders() {
        let cache = BoardStateCache::new(["a", "b", "c"]);
        cache.update("b", 1.0, 1);
        let mark = cache.update("a", 2.0, 2).unwrap();
        cache.update("c", 3.0, 3);
        cache.update("b", 4.0, 4);

        let changed = cache.changed_since(mark, |_| true);
        let ids: Vec<_> = changed.iter().map(|e| e.point_id.as_str()).collect();
        assert_eq!(ids, ["c", "b"]);

        let only_b = cache.changed_since(0, |id| id == "b");
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].value, 4.0);
    }

    #[test]
    fn test_update_with_raw_keeps_both_values() {
        let cache = BoardStateCache::new(["space_temp"]);
        cache.update_raw("space_temp", 21.5, 6_150.0, 7);
        let entry = cache.read("space_temp").unwrap();
        assert_eq!(entry.value, 21.5);
        assert_eq!(entry.raw, Some(6_150.0));

        cache.force("space_temp", 30.0).unwrap();
        cache.update_raw("space_temp", 22.0, 6_200.0, 8);
        let entry = cache.read("space_temp").unwrap();
        assert_eq!(entry.value, 30.0);
        assert_eq!(entry.raw, Some(6_200.0));
        assert!(entry.forced);
    }
}
