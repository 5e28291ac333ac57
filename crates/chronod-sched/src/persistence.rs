//! Durable state — two JSON documents, atomically rewritten.
//!
//! `schedules.json` holds every user's schedule definitions and
//! `cache.json` holds trigger/statistics state plus the boot instant it was
//! written under. Each flush writes a temp file and renames it over the old
//! document, so a crash mid-flush never leaves a torn file.

use chronod_core::{ChronodError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::registry::TriggerState;
use crate::schedule::ScheduleDef;

/// Trigger/statistics cache document.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheDoc {
    pub boot_ts: i64,
    #[serde(default)]
    pub states: BTreeMap<String, BTreeMap<String, TriggerState>>,
}

/// Schedule definitions document, user → name → definition.
pub type SchedulesDoc = BTreeMap<String, BTreeMap<String, ScheduleDef>>;

pub struct StateStore {
    schedules_path: PathBuf,
    cache_path: PathBuf,
}

impl StateStore {
    pub fn new(schedules_path: PathBuf, cache_path: PathBuf) -> Self {
        if let Some(dir) = schedules_path.parent() {
            std::fs::create_dir_all(dir).ok();
        }
        Self {
            schedules_path,
            cache_path,
        }
    }

    pub fn save_schedules(&self, defs: &SchedulesDoc) -> Result<()> {
        atomic_write_json(&self.schedules_path, defs)
    }

    pub fn load_schedules(&self) -> Result<SchedulesDoc> {
        load_json(&self.schedules_path)
    }

    pub fn save_cache(&self, doc: &CacheDoc) -> Result<()> {
        atomic_write_json(&self.cache_path, doc)
    }

    /// None when no cache exists yet (first start).
    pub fn load_cache(&self) -> Result<Option<CacheDoc>> {
        if !self.cache_path.exists() {
            return Ok(None);
        }
        load_json(&self.cache_path).map(Some)
    }
}

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| ChronodError::Persistence(format!("serialize {}: {e}", path.display())))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)
        .map_err(|e| ChronodError::Persistence(format!("write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| ChronodError::Persistence(format!("rename to {}: {e}", path.display())))?;
    Ok(())
}

fn load_json<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| ChronodError::Persistence(format!("read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| ChronodError::Persistence(format!("parse {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(tag: &str) -> (StateStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("chronod-test-store-{tag}"));
        std::fs::remove_dir_all(&dir).ok();
        let s = StateStore::new(dir.join("schedules.json"), dir.join("cache.json"));
        (s, dir)
    }

    #[test]
    fn test_roundtrip_schedules() {
        let (store, dir) = store("sched");
        let mut doc = SchedulesDoc::new();
        let def = ScheduleDef::validate(&json!({"schedule": true, "cmd": "/bin/true"})).unwrap();
        doc.entry("alice".into()).or_default().insert("job".into(), def);
        store.save_schedules(&doc).unwrap();

        let loaded = store.load_schedules().unwrap();
        assert_eq!(loaded["alice"]["job"].cmds, vec!["/bin/true"]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_roundtrip_cache() {
        let (store, dir) = store("cache");
        assert!(store.load_cache().unwrap().is_none());

        let mut doc = CacheDoc {
            boot_ts: 1234,
            states: BTreeMap::new(),
        };
        let mut st = TriggerState::default();
        st.next_ts = Some(999);
        st.stats.add("runs", 2.0);
        doc.states
            .entry("alice".into())
            .or_default()
            .insert("job".into(), st);
        store.save_cache(&doc).unwrap();

        let loaded = store.load_cache().unwrap().unwrap();
        assert_eq!(loaded.boot_ts, 1234);
        let st = &loaded.states["alice"]["job"];
        assert_eq!(st.next_ts, Some(999));
        assert_eq!(st.stats.total.get("runs"), 2.0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_files_yield_defaults() {
        let (store, dir) = store("empty");
        assert!(store.load_schedules().unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_flush_replaces_not_appends() {
        let (store, dir) = store("replace");
        let mut doc = SchedulesDoc::new();
        let def = ScheduleDef::validate(&json!({"schedule": true, "cmd": "a"})).unwrap();
        doc.entry("alice".into()).or_default().insert("one".into(), def);
        store.save_schedules(&doc).unwrap();

        doc.get_mut("alice").unwrap().remove("one");
        let def = ScheduleDef::validate(&json!({"schedule": true, "cmd": "b"})).unwrap();
        doc.get_mut("alice").unwrap().insert("two".into(), def);
        store.save_schedules(&doc).unwrap();

        let loaded = store.load_schedules().unwrap();
        assert!(!loaded["alice"].contains_key("one"));
        assert!(loaded["alice"].contains_key("two"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
