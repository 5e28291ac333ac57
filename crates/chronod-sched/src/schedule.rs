//! Schedule definitions and validation.
//!
//! Definitions arrive over the wire as loose JSON objects and are checked
//! field by field before anything touches the registry. A batch submission
//! validates every entry and reports per-schedule warnings without aborting
//! the rest of the batch.

use chrono_tz::Tz;
use chronod_calendar::CalendarEngine;
use chronod_core::{ChronodError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// What makes a schedule fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleRule {
    /// Recurrence line for the calendar engine.
    Calendar(String),
    /// `true` = run once as soon as possible, `false` = disabled.
    Once(bool),
    /// Run once at a fixed unix timestamp.
    At(i64),
}

/// Exception entry attached to a calendar rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExceptionDef {
    pub dest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
}

/// A validated schedule definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleRule>,
    /// IANA timezone name; UTC when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
    /// Week start day, 0 = Sunday .. 6 = Saturday.
    #[serde(default)]
    pub base_weekday: u32,
    /// Fire once when the daemon starts.
    #[serde(default)]
    pub reload_at_start: bool,
    /// Fire once after a detected reboot.
    #[serde(default)]
    pub reload_at_boot: bool,
    /// Allow clients to override the next run timestamp.
    #[serde(default)]
    pub allow_remote_time: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
    /// Soft wall-clock alert, seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_after: Option<u64>,
    /// Hard wall-clock kill, seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term_after: Option<u64>,
    /// Hard output-byte kill.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term_output: Option<u64>,
    /// Promote any stderr output to a hard failure.
    #[serde(default)]
    pub stderr_error: bool,
    /// Notifier key → notifier-specific config.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub notify: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Commands run sequentially; a failure short-circuits the rest.
    #[serde(default)]
    pub cmds: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Random jitter added to each computed trigger, seconds.
    #[serde(default)]
    pub random_delay: u64,
    /// Triggers never land earlier than boot + min_uptime.
    #[serde(default)]
    pub min_uptime: u64,
    /// Name of a schedule (same user) whose last run must have succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
    /// Retry delays consumed in order on consecutive failures, seconds.
    #[serde(default)]
    pub retry_freq: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Pending-queue cap; -1 = unlimited.
    #[serde(default = "default_max_queue")]
    pub max_queue: i64,
    /// Concurrent-run cap.
    #[serde(default = "default_max_running")]
    pub max_running: u32,
    /// Source date (YYYY-MM-DD) → redirect.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exceptions: BTreeMap<String, ExceptionDef>,
}

fn default_max_queue() -> i64 {
    -1
}
fn default_max_running() -> u32 {
    1
}

impl Default for ScheduleDef {
    fn default() -> Self {
        Self {
            schedule: None,
            tz: None,
            base_weekday: 0,
            reload_at_start: false,
            reload_at_boot: false,
            allow_remote_time: false,
            output_file: None,
            alert_after: None,
            term_after: None,
            term_output: None,
            stderr_error: false,
            notify: BTreeMap::new(),
            user: None,
            dir: None,
            cmds: Vec::new(),
            env: BTreeMap::new(),
            random_delay: 0,
            min_uptime: 0,
            depends_on: None,
            retry_freq: Vec::new(),
            password: None,
            max_queue: default_max_queue(),
            max_running: default_max_running(),
            exceptions: BTreeMap::new(),
        }
    }
}

const KNOWN_KEYS: [&str; 23] = [
    "schedule",
    "tz",
    "base_weekday",
    "reload_at_start",
    "reload_at_boot",
    "allow_remote_time",
    "output_file",
    "alert_after",
    "term_after",
    "term_output",
    "stderr_error",
    "notify",
    "user",
    "dir",
    "cmd",
    "cmds",
    "env",
    "random_delay",
    "min_uptime",
    "depends_on",
    "retry_freq",
    "password",
    "max_queue",
];

/// Keys stripped from definitions before they are sent to clients.
const SENSITIVE_KEYS: [&str; 5] = ["output_file", "dir", "cmds", "env", "password"];

impl ScheduleDef {
    /// Validate a loose JSON object into a definition. Unknown keys are
    /// rejected with a closest-match suggestion.
    pub fn validate(raw: &Value) -> Result<Self> {
        let obj = raw
            .as_object()
            .ok_or_else(|| ChronodError::Validation("schedule must be an object".into()))?;

        for key in obj.keys() {
            let k = key.as_str();
            if !KNOWN_KEYS.contains(&k)
                && k != "max_running"
                && k != "exceptions"
            {
                let mut msg = format!("unknown key '{k}'");
                if let Some(best) = closest_key(k) {
                    msg.push_str(&format!(", did you mean '{best}'?"));
                }
                return Err(ChronodError::Validation(msg));
            }
        }

        let mut def = ScheduleDef::default();

        if let Some(v) = obj.get("schedule") {
            def.schedule = Some(parse_rule(v)?);
        }
        if let Some(v) = obj.get("tz") {
            let tz = as_str(v, "tz")?;
            tz.parse::<Tz>().map_err(|_| {
                ChronodError::Validation(format!("unknown timezone '{tz}'"))
            })?;
            def.tz = Some(tz);
        }
        if let Some(v) = obj.get("base_weekday") {
            let n = as_u64(v, "base_weekday")?;
            if n > 6 {
                return Err(ChronodError::Validation(
                    "base_weekday must be 0 (Sunday) .. 6 (Saturday)".into(),
                ));
            }
            def.base_weekday = n as u32;
        }
        def.reload_at_start = get_bool(obj, "reload_at_start")?;
        def.reload_at_boot = get_bool(obj, "reload_at_boot")?;
        def.allow_remote_time = get_bool(obj, "allow_remote_time")?;
        def.stderr_error = get_bool(obj, "stderr_error")?;
        if let Some(v) = obj.get("output_file") {
            def.output_file = Some(PathBuf::from(as_str(v, "output_file")?));
        }
        if let Some(v) = obj.get("alert_after") {
            def.alert_after = Some(parse_duration_spec(v)?);
        }
        if let Some(v) = obj.get("term_after") {
            def.term_after = Some(parse_duration_spec(v)?);
        }
        if let Some(v) = obj.get("term_output") {
            def.term_output = Some(as_u64(v, "term_output")?);
        }
        if let Some(v) = obj.get("notify") {
            let map = v.as_object().ok_or_else(|| {
                ChronodError::Validation("notify must be an object".into())
            })?;
            def.notify = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        }
        if let Some(v) = obj.get("user") {
            def.user = Some(as_str(v, "user")?);
        }
        if let Some(v) = obj.get("dir") {
            def.dir = Some(PathBuf::from(as_str(v, "dir")?));
        }
        if let Some(v) = obj.get("cmd") {
            def.cmds.push(as_str(v, "cmd")?);
        }
        if let Some(v) = obj.get("cmds") {
            let list = v
                .as_array()
                .ok_or_else(|| ChronodError::Validation("cmds must be an array".into()))?;
            for c in list {
                def.cmds.push(as_str(c, "cmds")?);
            }
        }
        if let Some(v) = obj.get("env") {
            let map = v
                .as_object()
                .ok_or_else(|| ChronodError::Validation("env must be an object".into()))?;
            for (k, val) in map {
                def.env.insert(k.clone(), as_str(val, "env")?);
            }
        }
        if let Some(v) = obj.get("random_delay") {
            def.random_delay = parse_duration_spec(v)?;
        }
        if let Some(v) = obj.get("min_uptime") {
            def.min_uptime = parse_duration_spec(v)?;
            if def.min_uptime > 0 {
                // A schedule that waits for uptime implicitly re-arms at boot.
                def.reload_at_boot = true;
            }
        }
        if let Some(v) = obj.get("depends_on") {
            def.depends_on = Some(as_str(v, "depends_on")?);
        }
        if let Some(v) = obj.get("retry_freq") {
            let list = v.as_array().ok_or_else(|| {
                ChronodError::Validation("retry_freq must be an array".into())
            })?;
            for d in list {
                def.retry_freq.push(parse_duration_spec(d)?);
            }
        }
        if let Some(v) = obj.get("password") {
            def.password = Some(as_str(v, "password")?);
        }
        if let Some(v) = obj.get("max_queue") {
            def.max_queue = v.as_i64().ok_or_else(|| {
                ChronodError::Validation("max_queue must be an integer".into())
            })?;
        }
        if let Some(v) = obj.get("max_running") {
            let n = as_u64(v, "max_running")?;
            if n == 0 {
                return Err(ChronodError::Validation(
                    "max_running must be at least 1".into(),
                ));
            }
            def.max_running = n as u32;
        }
        if let Some(v) = obj.get("exceptions") {
            let map = v.as_object().ok_or_else(|| {
                ChronodError::Validation("exceptions must be an object".into())
            })?;
            for (src, e) in map {
                let exc: ExceptionDef = serde_json::from_value(e.clone()).map_err(|err| {
                    ChronodError::Validation(format!("bad exception for '{src}': {err}"))
                })?;
                def.exceptions.insert(src.clone(), exc);
            }
        }

        if def.cmds.is_empty() {
            return Err(ChronodError::Validation("no command configured".into()));
        }

        // Calendar rules and exceptions must parse before they are accepted.
        def.build_engine()?;
        Ok(def)
    }

    /// Timezone of this schedule, UTC when unset.
    pub fn timezone(&self) -> Result<Tz> {
        match &self.tz {
            Some(name) => name
                .parse()
                .map_err(|_| ChronodError::Validation(format!("unknown timezone '{name}'"))),
            None => Ok(Tz::UTC),
        }
    }

    /// Build a calendar engine for this definition, None for non-calendar
    /// rules.
    pub fn build_engine(&self) -> Result<Option<CalendarEngine>> {
        let Some(ScheduleRule::Calendar(line)) = &self.schedule else {
            if !self.exceptions.is_empty() {
                return Err(ChronodError::Validation(
                    "exceptions require a calendar schedule".into(),
                ));
            }
            return Ok(None);
        };
        let mut engine = CalendarEngine::new(self.timezone()?, self.base_weekday);
        engine.add_schedule(line)?;
        for (src, exc) in &self.exceptions {
            engine.add_exception(src, &exc.dest, exc.hour, exc.minute, exc.second, exc.duration)?;
        }
        Ok(Some(engine))
    }

    /// Definition as a client-visible JSON object with sensitive fields
    /// removed.
    pub fn safe_view(&self) -> Value {
        let mut v = serde_json::to_value(self).unwrap_or_else(|_| Value::Null);
        if let Some(obj) = v.as_object_mut() {
            for key in SENSITIVE_KEYS {
                obj.remove(key);
            }
            obj.insert("has_password".into(), Value::Bool(self.password.is_some()));
        }
        v
    }

    /// Merge a partial update over this definition, keeping `depends_on`
    /// protected, and revalidate the result.
    pub fn merge_update(&self, update: &serde_json::Map<String, Value>) -> Result<ScheduleDef> {
        let mut base = serde_json::to_value(self)
            .map_err(|e| ChronodError::Validation(format!("definition not serializable: {e}")))?;
        let Some(obj) = base.as_object_mut() else {
            return Err(ChronodError::Validation("definition not an object".into()));
        };
        for (k, v) in update {
            if k == "depends_on" {
                continue;
            }
            obj.insert(k.clone(), v.clone());
        }
        ScheduleDef::validate(&base)
    }
}

fn parse_rule(v: &Value) -> Result<ScheduleRule> {
    match v {
        Value::Bool(b) => Ok(ScheduleRule::Once(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(ScheduleRule::At)
            .ok_or_else(|| ChronodError::Validation("schedule timestamp out of range".into())),
        Value::String(s) => Ok(ScheduleRule::Calendar(s.clone())),
        _ => Err(ChronodError::Validation(
            "schedule must be a string, boolean, or timestamp".into(),
        )),
    }
}

fn as_str(v: &Value, key: &str) -> Result<String> {
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| ChronodError::Validation(format!("{key} must be a string")))
}

fn as_u64(v: &Value, key: &str) -> Result<u64> {
    v.as_u64()
        .ok_or_else(|| ChronodError::Validation(format!("{key} must be a non-negative integer")))
}

fn get_bool(obj: &serde_json::Map<String, Value>, key: &str) -> Result<bool> {
    match obj.get(key) {
        None => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(ChronodError::Validation(format!("{key} must be a boolean"))),
    }
}

/// Seconds from an integer, `NdNhNmNs` suffix form, or `HH:MM[:SS]`.
pub fn parse_duration_spec(v: &Value) -> Result<u64> {
    if let Some(n) = v.as_u64() {
        return Ok(n);
    }
    let Some(s) = v.as_str() else {
        return Err(ChronodError::Validation(
            "duration must be an integer or string".into(),
        ));
    };
    let s = s.trim().to_ascii_lowercase();
    if s.contains(':') {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(ChronodError::Validation(format!("bad duration '{s}'")));
        }
        let mut total = 0u64;
        for p in &parts {
            let n: u64 = p
                .parse()
                .map_err(|_| ChronodError::Validation(format!("bad duration '{s}'")))?;
            total = total * 60 + n;
        }
        // HH:MM without seconds.
        if parts.len() == 2 {
            total *= 60;
        }
        return Ok(total);
    }

    let mut total = 0u64;
    let mut num = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            num.push(c);
            continue;
        }
        let n: u64 = num
            .parse()
            .map_err(|_| ChronodError::Validation(format!("bad duration '{s}'")))?;
        num.clear();
        total += match c {
            'd' => n * 86400,
            'h' => n * 3600,
            'm' => n * 60,
            's' => n,
            _ => {
                return Err(ChronodError::Validation(format!(
                    "bad duration unit '{c}' in '{s}'"
                )));
            }
        };
    }
    if !num.is_empty() {
        total += num
            .parse::<u64>()
            .map_err(|_| ChronodError::Validation(format!("bad duration '{s}'")))?;
    }
    Ok(total)
}

/// Closest known key by edit distance, for typo suggestions.
fn closest_key(key: &str) -> Option<&'static str> {
    let mut best = None;
    let mut best_dist = usize::MAX;
    for candidate in KNOWN_KEYS.iter().chain(["max_running", "exceptions"].iter()) {
        let d = edit_distance(key, candidate);
        if d < best_dist {
            best_dist = d;
            best = Some(*candidate);
        }
    }
    (best_dist <= 3).then_some(best).flatten()
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        cur[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            cur[j] = (prev[j] + 1).min(cur[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_definition() {
        let def = ScheduleDef::validate(&json!({
            "schedule": "* * * * 8 0 0 * *",
            "cmd": "/usr/bin/true",
        }))
        .unwrap();
        assert_eq!(def.cmds, vec!["/usr/bin/true"]);
        assert_eq!(def.max_running, 1);
        assert_eq!(def.max_queue, -1);
        assert!(def.build_engine().unwrap().is_some());
    }

    #[test]
    fn test_rule_forms() {
        assert_eq!(parse_rule(&json!(true)).unwrap(), ScheduleRule::Once(true));
        assert_eq!(
            parse_rule(&json!(1767225600)).unwrap(),
            ScheduleRule::At(1767225600)
        );
        assert!(matches!(
            parse_rule(&json!("cron 0 8 * * *")).unwrap(),
            ScheduleRule::Calendar(_)
        ));
        assert!(parse_rule(&json!([1])).is_err());
    }

    #[test]
    fn test_unknown_key_suggestion() {
        let err = ScheduleDef::validate(&json!({
            "cmd": "x",
            "max_runing": 2,
        }))
        .unwrap_err();
        assert!(err.to_string().contains("max_running"), "{err}");
    }

    #[test]
    fn test_bad_calendar_rule_rejected() {
        assert!(ScheduleDef::validate(&json!({
            "schedule": "* * * 40 8 0 0 * *",
            "cmd": "x",
        }))
        .is_err());
    }

    #[test]
    fn test_min_uptime_implies_reload_at_boot() {
        let def = ScheduleDef::validate(&json!({
            "schedule": true,
            "cmd": "x",
            "min_uptime": "5m",
        }))
        .unwrap();
        assert_eq!(def.min_uptime, 300);
        assert!(def.reload_at_boot);
    }

    #[test]
    fn test_duration_forms() {
        assert_eq!(parse_duration_spec(&json!(90)).unwrap(), 90);
        assert_eq!(parse_duration_spec(&json!("1d2h3m4s")).unwrap(), 93784);
        assert_eq!(parse_duration_spec(&json!("01:30")).unwrap(), 5400);
        assert_eq!(parse_duration_spec(&json!("01:30:15")).unwrap(), 5415);
        assert!(parse_duration_spec(&json!("4x")).is_err());
    }

    #[test]
    fn test_safe_view_redacts() {
        let def = ScheduleDef::validate(&json!({
            "schedule": true,
            "cmd": "secret-binary --key abc",
            "env": {"TOKEN": "hunter2"},
            "dir": "/opt/secret",
            "output_file": "/var/log/secret.log",
            "password": "pw",
        }))
        .unwrap();
        let view = def.safe_view();
        let obj = view.as_object().unwrap();
        assert!(!obj.contains_key("cmds"));
        assert!(!obj.contains_key("env"));
        assert!(!obj.contains_key("dir"));
        assert!(!obj.contains_key("output_file"));
        assert!(!obj.contains_key("password"));
        assert_eq!(obj["has_password"], json!(true));
    }

    #[test]
    fn test_merge_update_protects_depends_on() {
        let def = ScheduleDef::validate(&json!({
            "schedule": true,
            "cmd": "x",
            "depends_on": "other",
        }))
        .unwrap();
        let update = json!({"depends_on": "evil", "max_running": 3});
        let merged = def.merge_update(update.as_object().unwrap()).unwrap();
        assert_eq!(merged.depends_on.as_deref(), Some("other"));
        assert_eq!(merged.max_running, 3);
    }

    #[test]
    fn test_exceptions_require_calendar() {
        assert!(ScheduleDef::validate(&json!({
            "schedule": true,
            "cmd": "x",
            "exceptions": {"2026-03-10": {"dest": "2026-03-12"}},
        }))
        .is_err());
    }
}
