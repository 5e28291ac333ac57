//! Durable per-schedule trigger state and rolling statistics.
//!
//! The registry maps (user, schedule name) to a [`TriggerState`] and keeps
//! one calendar engine per calendar-ruled schedule. It never spawns
//! anything; the dispatcher reads effective timestamps from here and writes
//! results back.

use chrono::{NaiveDate, TimeZone};
use chronod_calendar::CalendarEngine;
use chronod_core::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::schedule::{ScheduleDef, ScheduleRule};

/// Identity of one schedule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScheduleKey {
    pub user: String,
    pub name: String,
}

impl ScheduleKey {
    pub fn new(user: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user, self.name)
    }
}

/// Counter names every window starts with.
pub const STAT_KEYS: [&str; 11] = [
    "runs",
    "triggered",
    "dates_run",
    "errors",
    "notify",
    "time_alerts",
    "terminations",
    "cmds",
    "runtime",
    "longest_runtime",
    "returned_stats",
];

/// One window of named numeric accumulators. Keys starting with `most_` or
/// named `longest_runtime` keep the maximum instead of summing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatWindow(pub BTreeMap<String, f64>);

impl StatWindow {
    pub fn add(&mut self, key: &str, amount: f64) {
        let slot = self.0.entry(key.to_string()).or_insert(0.0);
        if key.starts_with("most_") || key == "longest_runtime" {
            if amount > *slot {
                *slot = amount;
            }
        } else {
            *slot += amount;
        }
    }

    pub fn get(&self, key: &str) -> f64 {
        self.0.get(key).copied().unwrap_or(0.0)
    }
}

/// The four rolling windows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleStats {
    #[serde(default)]
    pub total: StatWindow,
    #[serde(default)]
    pub boot: StatWindow,
    #[serde(default)]
    pub lastday: StatWindow,
    #[serde(default)]
    pub today: StatWindow,
}

impl ScheduleStats {
    /// Feed one event into total/boot/today. `lastday` only ever receives
    /// data from the day rollover.
    pub fn add(&mut self, key: &str, amount: f64) {
        self.total.add(key, amount);
        self.boot.add(key, amount);
        self.today.add(key, amount);
    }
}

/// Cached firing times for the current day, avoiding a calendar rebuild on
/// same-day rescheduling.
#[derive(Debug, Clone)]
pub struct TodayCache {
    pub date: NaiveDate,
    pub times: Vec<u32>,
}

/// Durable state of one schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerState {
    /// Next computed trigger instant.
    #[serde(default)]
    pub next_ts: Option<i64>,
    /// Client-set override; the effective trigger is the earlier of the two.
    #[serde(default)]
    pub run_ts: Option<i64>,
    #[serde(default)]
    pub suspend_until: Option<i64>,
    #[serde(default)]
    pub skip_missed: bool,
    /// Consumed entries of the retry backoff table.
    #[serde(default)]
    pub retries: usize,
    /// Consecutive spawn failures.
    #[serde(default)]
    pub start_retries: usize,
    /// Consecutive failed runs, reported to notifiers and reset on success.
    #[serde(default)]
    pub consecutive_errors: u32,
    #[serde(default)]
    pub last_run: Option<i64>,
    #[serde(default)]
    pub last_success: Option<i64>,
    #[serde(default)]
    pub last_result: Option<Value>,
    #[serde(default)]
    pub last_run_date: Option<NaiveDate>,
    /// Runtime replacement of the configured rule (one-shots disable
    /// themselves here; jobs may request a rerun). Cleared on reload.
    #[serde(default)]
    pub rule_override: Option<ScheduleRule>,
    /// Recompute the trigger on the next scan.
    #[serde(default)]
    pub reload: bool,
    #[serde(default)]
    pub stats: ScheduleStats,
    #[serde(skip)]
    pub today_cache: Option<TodayCache>,
}

impl TriggerState {
    /// The instant this schedule should next fire, if any.
    pub fn effective_ts(&self) -> Option<i64> {
        match (self.next_ts, self.run_ts) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// All schedules the daemon knows about.
pub struct ScheduleRegistry {
    /// user → name → definition.
    pub defs: BTreeMap<String, BTreeMap<String, ScheduleDef>>,
    pub states: BTreeMap<String, BTreeMap<String, TriggerState>>,
    engines: HashMap<ScheduleKey, CalendarEngine>,
    /// Boot instant of the host, floor for min_uptime schedules.
    pub boot_ts: i64,
}

impl ScheduleRegistry {
    pub fn new(boot_ts: i64) -> Self {
        Self {
            defs: BTreeMap::new(),
            states: BTreeMap::new(),
            engines: HashMap::new(),
            boot_ts,
        }
    }

    pub fn def(&self, key: &ScheduleKey) -> Option<&ScheduleDef> {
        self.defs.get(&key.user)?.get(&key.name)
    }

    pub fn state(&self, key: &ScheduleKey) -> Option<&TriggerState> {
        self.states.get(&key.user)?.get(&key.name)
    }

    pub fn state_mut(&mut self, key: &ScheduleKey) -> &mut TriggerState {
        self.states
            .entry(key.user.clone())
            .or_default()
            .entry(key.name.clone())
            .or_default()
    }

    pub fn keys(&self) -> Vec<ScheduleKey> {
        self.defs
            .iter()
            .flat_map(|(user, names)| {
                names
                    .keys()
                    .map(|name| ScheduleKey::new(user.clone(), name.clone()))
            })
            .collect()
    }

    pub fn schedule_count(&self) -> usize {
        self.defs.values().map(BTreeMap::len).sum()
    }

    /// Replace one user's full schedule set. Invalid entries are skipped
    /// and reported; the rest of the batch still loads. Trigger state of
    /// surviving names is kept, state of removed names is dropped.
    pub fn set_user_schedules(
        &mut self,
        user: &str,
        raw: &serde_json::Map<String, Value>,
    ) -> Vec<(String, String)> {
        let mut warnings = Vec::new();
        let mut accepted = BTreeMap::new();
        for (name, value) in raw {
            match ScheduleDef::validate(value) {
                Ok(def) => {
                    accepted.insert(name.clone(), def);
                }
                Err(e) => {
                    tracing::warn!("schedule '{user}/{name}' rejected: {e}");
                    warnings.push((name.clone(), e.to_string()));
                }
            }
        }

        if let Some(states) = self.states.get_mut(user) {
            states.retain(|name, _| accepted.contains_key(name));
        }
        // Definitions changed, so every engine of this user is stale.
        self.engines.retain(|key, _| key.user != user);

        for name in accepted.keys() {
            let key = ScheduleKey::new(user, name.clone());
            let st = self.state_mut(&key);
            st.rule_override = None;
            st.reload = true;
            st.today_cache = None;
        }

        if accepted.is_empty() {
            self.defs.remove(user);
            self.states.remove(user);
        } else {
            self.defs.insert(user.to_string(), accepted);
        }
        warnings
    }

    /// Effective rule of a schedule: the runtime override wins.
    pub fn effective_rule(&self, key: &ScheduleKey) -> Option<ScheduleRule> {
        if let Some(st) = self.state(key) {
            if let Some(rule) = &st.rule_override {
                return Some(rule.clone());
            }
        }
        self.def(key)?.schedule.clone()
    }

    /// Recompute the next trigger. Calendar rules walk the calendar;
    /// one-shot rules fire once at the min-uptime floor and stay quiet
    /// after their override disables them.
    pub fn reload_trigger(&mut self, key: &ScheduleKey, now: i64) {
        let Some(def) = self.def(key).cloned() else {
            return;
        };
        let floor = now.max(self.boot_ts + def.min_uptime as i64);
        let rule = self.effective_rule(key);

        let mut next = match rule {
            None | Some(ScheduleRule::Once(false)) => None,
            Some(ScheduleRule::Once(true)) => Some(floor),
            Some(ScheduleRule::At(ts)) => Some(ts.max(floor)),
            Some(ScheduleRule::Calendar(_)) => {
                match self.engine_mut(key) {
                    Ok(Some(engine)) => engine.next_trigger(now.max(floor - 1)),
                    Ok(None) => None,
                    Err(e) => {
                        tracing::warn!("calendar rebuild failed for {key}: {e}");
                        None
                    }
                }
            }
        };

        if let Some(ts) = next {
            if def.random_delay > 0 {
                let jitter = rand::thread_rng().gen_range(0..=def.random_delay) as i64;
                next = Some(ts + jitter);
            }
        }

        let st = self.state_mut(key);
        st.next_ts = next;
        st.reload = false;
        st.today_cache = None;
    }

    /// Reschedule after a run, using the cached same-day firing list when
    /// possible so most reschedules avoid touching the calendar.
    pub fn reschedule_after_run(&mut self, key: &ScheduleKey, now: i64) {
        let Some(def) = self.def(key).cloned() else {
            return;
        };
        if let Some(ScheduleRule::Calendar(_)) = self.effective_rule(key) {
            if let Ok(tz) = def.timezone() {
                let local = tz.timestamp_opt(now, 0).single();
                if let Some(local) = local {
                    let today = local.date_naive();
                    let sod = chrono::Timelike::num_seconds_from_midnight(&local);
                    let cached = self
                        .state(key)
                        .and_then(|st| st.today_cache.clone())
                        .filter(|c| c.date == today);
                    let cache = match cached {
                        Some(c) => Some(c),
                        None => match self.engine_mut(key) {
                            Ok(Some(engine)) => engine
                                .today_times(now)
                                .map(|times| TodayCache { date: today, times }),
                            _ => None,
                        },
                    };
                    if let Some(cache) = cache {
                        if let Some(&next_sod) = cache.times.iter().find(|&&t| t > sod) {
                            let naive = today.and_hms_opt(
                                next_sod / 3600,
                                (next_sod / 60) % 60,
                                next_sod % 60,
                            );
                            if let Some(naive) = naive {
                                if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
                                    let st = self.state_mut(key);
                                    st.today_cache = Some(cache);
                                    st.next_ts = Some(dt.timestamp());
                                    return;
                                }
                            }
                        }
                        let st = self.state_mut(key);
                        st.today_cache = Some(cache);
                    }
                }
            }
        }
        self.reload_trigger(key, now);
    }

    /// Replace one definition in place, dropping its cached engine.
    pub fn replace_def(&mut self, key: &ScheduleKey, def: ScheduleDef) {
        self.defs
            .entry(key.user.clone())
            .or_default()
            .insert(key.name.clone(), def);
        self.engines.remove(key);
        let st = self.state_mut(key);
        st.rule_override = None;
        st.reload = true;
        st.today_cache = None;
    }

    /// Install or clear a runtime rule override, dropping the cached engine
    /// so an overriding recurrence line actually takes effect.
    pub fn set_rule_override(&mut self, key: &ScheduleKey, rule: Option<ScheduleRule>) {
        self.engines.remove(key);
        let st = self.state_mut(key);
        st.rule_override = rule;
        st.reload = true;
        st.today_cache = None;
    }

    /// Engines are built from the effective rule, so a runtime override of
    /// the recurrence line replaces the configured one.
    fn engine_mut(&mut self, key: &ScheduleKey) -> Result<Option<&mut CalendarEngine>> {
        if !self.engines.contains_key(key) {
            let Some(ScheduleRule::Calendar(line)) = self.effective_rule(key) else {
                return Ok(None);
            };
            let Some(def) = self.def(key) else {
                return Ok(None);
            };
            let mut engine = CalendarEngine::new(def.timezone()?, def.base_weekday);
            engine.add_schedule(&line)?;
            for (src, exc) in &def.exceptions {
                engine.add_exception(src, &exc.dest, exc.hour, exc.minute, exc.second, exc.duration)?;
            }
            self.engines.insert(key.clone(), engine);
        }
        Ok(self.engines.get_mut(key))
    }

    /// Move today's counters to lastday and clear today, for every
    /// schedule. Same-day caches are invalidated.
    pub fn day_rollover(&mut self) {
        for states in self.states.values_mut() {
            for st in states.values_mut() {
                st.stats.lastday = std::mem::take(&mut st.stats.today);
                st.today_cache = None;
            }
        }
    }

    /// Fold a finished run's numbers into the windows. Custom counters from
    /// a structured result are accepted as numbers under their own names.
    pub fn add_result_stats(&mut self, key: &ScheduleKey, custom: Option<&Value>, runtime: f64) {
        let now_date = chrono::Utc::now().date_naive();
        let st = self.state_mut(key);
        st.stats.add("runs", 1.0);
        st.stats.add("runtime", runtime);
        st.stats.add("longest_runtime", runtime);
        if st.last_run_date != Some(now_date) {
            st.last_run_date = Some(now_date);
            st.stats.add("dates_run", 1.0);
        }
        if let Some(Value::Object(map)) = custom {
            let mut any = false;
            for (k, v) in map {
                if let Some(n) = v.as_f64() {
                    st.stats.add(k, n);
                    any = true;
                }
            }
            if any {
                st.stats.add("returned_stats", 1.0);
            }
        }
    }

    /// Reconcile persisted state against the current boot. On reboot the
    /// boot windows reset, reload_at_boot schedules re-arm, and stale
    /// triggers are pushed forward instead of firing a burst of missed
    /// occurrences.
    pub fn apply_boot(&mut self, persisted_boot: Option<i64>, now: i64) -> bool {
        let rebooted = match persisted_boot {
            // 3s drift tolerance between two reads of the same boot instant.
            Some(prev) => (prev - self.boot_ts).abs() > 3,
            None => true,
        };
        if rebooted {
            for states in self.states.values_mut() {
                for st in states.values_mut() {
                    st.stats.boot = StatWindow::default();
                }
            }
        }
        for key in self.keys() {
            let reload_at_boot = self.def(&key).is_some_and(|d| d.reload_at_boot);
            let st = self.state_mut(&key);
            if rebooted && reload_at_boot {
                st.reload = true;
                continue;
            }
            match st.next_ts {
                Some(ts) if ts < now - 3600 => st.next_ts = Some(now + 300),
                Some(ts) if ts < now => {
                    st.next_ts = Some(now + 60);
                    st.reload = true;
                }
                _ => {}
            }
        }
        rebooted
    }
}

/// Boot instant of the host. Falls back to the daemon's own start when the
/// platform offers nothing better.
pub fn current_boot_ts() -> i64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(uptime) = std::fs::read_to_string("/proc/uptime") {
            if let Some(secs) = uptime
                .split_whitespace()
                .next()
                .and_then(|s| s.parse::<f64>().ok())
            {
                return chrono::Utc::now().timestamp() - secs as i64;
            }
        }
    }
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry_with(user: &str, name: &str, def: Value) -> ScheduleRegistry {
        let mut reg = ScheduleRegistry::new(1_000_000);
        let mut map = serde_json::Map::new();
        map.insert(name.to_string(), def);
        let warnings = reg.set_user_schedules(user, &map);
        assert!(warnings.is_empty(), "{warnings:?}");
        reg
    }

    #[test]
    fn test_once_rule_arms_at_floor() {
        let mut reg = registry_with("alice", "once", json!({"schedule": true, "cmd": "x"}));
        let key = ScheduleKey::new("alice", "once");
        reg.reload_trigger(&key, 2_000_000);
        assert_eq!(reg.state(&key).unwrap().next_ts, Some(2_000_000));
    }

    #[test]
    fn test_min_uptime_floor() {
        let mut reg = registry_with(
            "alice",
            "warm",
            json!({"schedule": true, "cmd": "x", "min_uptime": 600}),
        );
        let key = ScheduleKey::new("alice", "warm");
        // now is before boot + 600, so the floor wins.
        reg.reload_trigger(&key, 1_000_100);
        assert_eq!(reg.state(&key).unwrap().next_ts, Some(1_000_600));
    }

    #[test]
    fn test_fixed_timestamp_rule() {
        let mut reg = registry_with(
            "alice",
            "at",
            json!({"schedule": 5_000_000i64, "cmd": "x"}),
        );
        let key = ScheduleKey::new("alice", "at");
        reg.reload_trigger(&key, 2_000_000);
        assert_eq!(reg.state(&key).unwrap().next_ts, Some(5_000_000));
        // A fixed instant in the past fires as soon as possible.
        reg.reload_trigger(&key, 6_000_000);
        assert_eq!(reg.state(&key).unwrap().next_ts, Some(6_000_000));
    }

    #[test]
    fn test_override_disables_one_shot() {
        let mut reg = registry_with("alice", "once", json!({"schedule": true, "cmd": "x"}));
        let key = ScheduleKey::new("alice", "once");
        reg.state_mut(&key).rule_override = Some(ScheduleRule::Once(false));
        reg.reload_trigger(&key, 2_000_000);
        assert_eq!(reg.state(&key).unwrap().next_ts, None);
    }

    #[test]
    fn test_effective_ts_prefers_earlier() {
        let mut st = TriggerState::default();
        st.next_ts = Some(100);
        st.run_ts = Some(50);
        assert_eq!(st.effective_ts(), Some(50));
        st.run_ts = None;
        assert_eq!(st.effective_ts(), Some(100));
    }

    #[test]
    fn test_day_rollover_swaps_windows() {
        let mut reg = registry_with("alice", "job", json!({"schedule": true, "cmd": "x"}));
        let key = ScheduleKey::new("alice", "job");
        reg.state_mut(&key).stats.add("runs", 3.0);
        reg.day_rollover();
        let st = reg.state(&key).unwrap();
        assert_eq!(st.stats.lastday.get("runs"), 3.0);
        assert_eq!(st.stats.today.get("runs"), 0.0);
        // Lifetime and boot windows are untouched.
        assert_eq!(st.stats.total.get("runs"), 3.0);
        assert_eq!(st.stats.boot.get("runs"), 3.0);
    }

    #[test]
    fn test_most_keys_keep_maximum() {
        let mut w = StatWindow::default();
        w.add("most_latency", 10.0);
        w.add("most_latency", 4.0);
        w.add("most_latency", 25.0);
        assert_eq!(w.get("most_latency"), 25.0);
        w.add("latency", 10.0);
        w.add("latency", 4.0);
        assert_eq!(w.get("latency"), 14.0);
    }

    #[test]
    fn test_custom_result_stats() {
        let mut reg = registry_with("alice", "job", json!({"schedule": true, "cmd": "x"}));
        let key = ScheduleKey::new("alice", "job");
        reg.add_result_stats(&key, Some(&json!({"rows": 42, "most_batch": 7})), 1.5);
        let st = reg.state(&key).unwrap();
        assert_eq!(st.stats.total.get("rows"), 42.0);
        assert_eq!(st.stats.total.get("most_batch"), 7.0);
        assert_eq!(st.stats.total.get("returned_stats"), 1.0);
        assert_eq!(st.stats.total.get("runs"), 1.0);
        assert_eq!(st.stats.total.get("dates_run"), 1.0);
    }

    #[test]
    fn test_reboot_resets_boot_window_and_stale_triggers() {
        let mut reg = registry_with("alice", "job", json!({"schedule": true, "cmd": "x"}));
        let key = ScheduleKey::new("alice", "job");
        reg.state_mut(&key).stats.add("runs", 2.0);
        let now = 2_000_000;
        reg.state_mut(&key).next_ts = Some(now - 7200);

        // Persisted boot differs by more than the drift tolerance.
        let rebooted = reg.apply_boot(Some(900_000), now);
        assert!(rebooted);
        let st = reg.state(&key).unwrap();
        assert_eq!(st.stats.boot.get("runs"), 0.0);
        assert_eq!(st.stats.total.get("runs"), 2.0);
        // Stale by more than an hour: pushed five minutes out.
        assert_eq!(st.next_ts, Some(now + 300));
    }

    #[test]
    fn test_same_boot_within_drift() {
        let mut reg = registry_with("alice", "job", json!({"schedule": true, "cmd": "x"}));
        assert!(!reg.apply_boot(Some(1_000_002), 2_000_000));
    }

    #[test]
    fn test_batch_validation_reports_without_aborting() {
        let mut reg = ScheduleRegistry::new(0);
        let mut map = serde_json::Map::new();
        map.insert("good".into(), json!({"schedule": true, "cmd": "x"}));
        map.insert("bad".into(), json!({"schedule": "* *", "cmd": "x"}));
        let warnings = reg.set_user_schedules("alice", &map);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].0, "bad");
        assert_eq!(reg.schedule_count(), 1);
    }
}
