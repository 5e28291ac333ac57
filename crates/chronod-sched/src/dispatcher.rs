//! The daemon's event loop.
//!
//! One cooperative loop owns the registry, the job table, and the client
//! table. Each iteration handles the day rollover, scans for elapsed
//! triggers, drains events, runs one admission pass to exhaustion, and
//! flushes dirty state on a fixed interval. Everything else in the crate is
//! a leaf this loop calls into.

use base64::Engine as _;
use chrono::{NaiveDate, Utc};
use chronod_core::{ChronodConfig, ChronodError, Result};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::ExitStatus;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::events::{ClientRequest, Event, OutputStream};
use crate::notify::{NotifyRecord, NotifyRouter};
use crate::persistence::{CacheDoc, StateStore};
use crate::registry::{current_boot_ts, ScheduleKey, ScheduleRegistry};
use crate::schedule::{ScheduleDef, ScheduleRule};
use crate::supervisor::{ProcessSupervisor, StartContext, TermReason};

/// Base loop wait when nothing is imminent.
const IDLE_WAIT_SECS: u64 = 3;
/// Spawn-failure backoff, consumed by consecutive start errors.
const START_BACKOFF: [i64; 4] = [30, 60, 300, 900];
/// Per-client monitor push budget per flush interval. Laggards lose chunks
/// rather than stalling the loop.
const PUSH_BUDGET: usize = 32 * 1024;

struct ClientState {
    user: String,
    tx: UnboundedSender<String>,
    /// Set after a malformed line; every later request is refused.
    revoked: bool,
    /// Receives schedule-change pushes.
    watching: bool,
    push_budget: usize,
}

/// A trigger that elapsed but has not started yet.
#[derive(Debug, Clone)]
struct PendingRun {
    key: ScheduleKey,
    trigger_ts: i64,
    /// Ad-hoc, requested over the wire.
    triggered: bool,
    data: Option<String>,
}

/// A client waiting to monitor the next run(s) of a schedule.
struct FutureAttach {
    key: ScheduleKey,
    client: u64,
    remaining: u32,
}

pub struct Daemon {
    config: ChronodConfig,
    registry: ScheduleRegistry,
    supervisor: ProcessSupervisor,
    notify: NotifyRouter,
    store: StateStore,
    events: UnboundedReceiver<Event>,
    events_tx: UnboundedSender<Event>,
    clients: BTreeMap<u64, ClientState>,
    pending: VecDeque<PendingRun>,
    future_attach: Vec<FutureAttach>,
    /// Exit statuses observed before the pipes finished draining.
    exited: BTreeMap<u64, ExitStatus>,
    today: NaiveDate,
    dirty: bool,
    last_flush: i64,
    stopping: bool,
    started_at: i64,
}

impl Daemon {
    pub fn new(config: ChronodConfig) -> Self {
        let (events_tx, events) = unbounded_channel();
        let boot_ts = current_boot_ts();
        let store = StateStore::new(config.schedules_path(), config.cache_path());
        Self {
            config,
            registry: ScheduleRegistry::new(boot_ts),
            supervisor: ProcessSupervisor::new(events_tx.clone()),
            notify: NotifyRouter::new(),
            store,
            events,
            events_tx,
            clients: BTreeMap::new(),
            pending: VecDeque::new(),
            future_attach: Vec::new(),
            exited: BTreeMap::new(),
            today: chrono::Local::now().date_naive(),
            dirty: false,
            last_flush: 0,
            stopping: false,
            started_at: Utc::now().timestamp(),
        }
    }

    /// Sender the gateway and signal watchers feed.
    pub fn event_sender(&self) -> UnboundedSender<Event> {
        self.events_tx.clone()
    }

    /// Load persisted state and arm every schedule.
    pub fn startup(&mut self) -> Result<()> {
        let now = Utc::now().timestamp();
        let schedules = self.store.load_schedules()?;
        for (user, names) in &schedules {
            let raw: serde_json::Map<String, Value> = names
                .iter()
                .filter_map(|(n, d)| serde_json::to_value(d).ok().map(|v| (n.clone(), v)))
                .collect();
            let warnings = self.registry.set_user_schedules(user, &raw);
            for (name, msg) in warnings {
                tracing::warn!("persisted schedule {user}/{name} dropped: {msg}");
            }
            for (name, msg) in self.notifier_warnings(user) {
                tracing::warn!("schedule {user}/{name}: {msg}");
            }
        }
        let cache = self.store.load_cache()?;
        let persisted_boot = cache.as_ref().map(|c| c.boot_ts);
        if let Some(cache) = cache {
            for (user, states) in cache.states {
                for (name, st) in states {
                    let key = ScheduleKey::new(user.clone(), name);
                    if self.registry.def(&key).is_some() {
                        *self.registry.state_mut(&key) = st;
                    }
                }
            }
        }
        let rebooted = self.registry.apply_boot(persisted_boot, now);
        if rebooted {
            tracing::info!("boot change detected, boot windows reset");
        }
        for key in self.registry.keys() {
            if self.registry.def(&key).is_some_and(|d| d.reload_at_start) {
                self.registry.state_mut(&key).run_ts = Some(now);
            }
            if self.registry.state(&key).is_none_or(|s| s.next_ts.is_none()) {
                self.registry.state_mut(&key).reload = true;
            }
        }
        self.dirty = true;
        tracing::info!(
            schedules = self.registry.schedule_count(),
            "daemon ready, state dir {}",
            self.config.state_dir.display()
        );
        Ok(())
    }

    pub async fn run(&mut self) -> Result<()> {
        self.startup()?;
        loop {
            let now = Utc::now().timestamp();
            self.check_day_rollover();
            self.scan_triggers(now);
            self.drain_exits(now);
            self.check_job_policies(now);
            self.admit_pending(now);
            self.flush_tick(now);
            if self.stopping {
                break;
            }

            let wait = self.loop_wait(now);
            tokio::select! {
                ev = self.events.recv() => match ev {
                    Some(ev) => self.handle_event(ev),
                    None => break,
                },
                _ = tokio::time::sleep(wait) => {}
            }
            // Drain whatever else queued up without waiting again.
            while let Ok(ev) = self.events.try_recv() {
                self.handle_event(ev);
            }
        }
        self.shutdown().await
    }

    async fn shutdown(&mut self) -> Result<()> {
        let ids: Vec<u64> = self.supervisor.jobs().map(|j| j.id).collect();
        for id in ids {
            self.supervisor.kill(id, TermReason::Requested);
        }
        // Give children a moment to die, then record what we saw.
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        let now = Utc::now().timestamp();
        for (id, status) in self.supervisor.poll_exits() {
            self.exited.insert(id, status);
        }
        let ids: Vec<u64> = self.exited.keys().copied().collect();
        for id in ids {
            if let Some(status) = self.exited.remove(&id) {
                self.finish_command(id, status, now);
            }
        }
        self.dirty = true;
        self.flush(now);
        tracing::info!("daemon stopped");
        Ok(())
    }

    fn loop_wait(&self, now: i64) -> std::time::Duration {
        if !self.pending.is_empty() || !self.exited.is_empty() {
            return std::time::Duration::from_millis(50);
        }
        let mut wait = IDLE_WAIT_SECS as i64;
        for key in self.registry.keys() {
            let Some(st) = self.registry.state(&key) else {
                continue;
            };
            if let Some(ts) = st.effective_ts() {
                // An elapsed trigger under suspension stays parked until the
                // suspension lapses; waking for it would spin the loop.
                let ts = match st.suspend_until {
                    Some(until) if until > now => ts.max(until),
                    _ => ts,
                };
                wait = wait.min((ts - now).max(0));
            }
        }
        if self.supervisor.total_running() > 0 {
            wait = wait.min(1);
        }
        std::time::Duration::from_secs(wait.clamp(0, IDLE_WAIT_SECS as i64) as u64)
    }

    // ---- iteration steps ------------------------------------------------

    fn check_day_rollover(&mut self) {
        let today = chrono::Local::now().date_naive();
        if today == self.today {
            return;
        }
        tracing::info!("day rollover {} -> {}", self.today, today);
        self.today = today;
        self.registry.day_rollover();
        // Schedules whose lookahead window found nothing get another try.
        for key in self.registry.keys() {
            let st = self.registry.state_mut(&key);
            if st.next_ts.is_none() {
                st.reload = true;
            }
        }
        self.dirty = true;
    }

    fn scan_triggers(&mut self, now: i64) {
        for key in self.registry.keys() {
            if self.registry.state(&key).is_some_and(|s| s.reload) {
                self.registry.reload_trigger(&key, now);
                self.dirty = true;
            }
            let Some(st) = self.registry.state(&key) else {
                continue;
            };
            let Some(eff) = st.effective_ts() else {
                continue;
            };
            if eff > now {
                continue;
            }
            if let Some(until) = st.suspend_until {
                if until > now {
                    if st.skip_missed {
                        // Silently drop occurrences elapsing under suspension.
                        self.consume_occurrence(&key, eff, now);
                    }
                    continue;
                }
                self.registry.state_mut(&key).suspend_until = None;
                self.dirty = true;
            }
            let Some(def) = self.registry.def(&key).cloned() else {
                continue;
            };
            let pending = self.pending_count(&key);
            let running = self.supervisor.running_count(&key);
            if queue_full(&def, pending, running) {
                tracing::warn!("{key}: occurrence at {eff} dropped, queue full");
                self.consume_occurrence(&key, eff, now);
                continue;
            }
            self.pending.push_back(PendingRun {
                key: key.clone(),
                trigger_ts: eff,
                triggered: false,
                data: None,
            });
            self.consume_occurrence(&key, eff, now);
        }
    }

    /// Advance past one elapsed occurrence: clear a consumed run_ts
    /// override, disable a one-shot rule, recompute next_ts.
    fn consume_occurrence(&mut self, key: &ScheduleKey, eff: i64, now: i64) {
        let one_shot = matches!(
            self.registry.effective_rule(key),
            Some(ScheduleRule::Once(true)) | Some(ScheduleRule::At(_))
        );
        let st = self.registry.state_mut(key);
        if st.run_ts == Some(eff) {
            st.run_ts = None;
        }
        if one_shot {
            // Disable at consumption, not at completion, so the scan cannot
            // re-enqueue the same one-shot while it runs.
            st.rule_override = Some(ScheduleRule::Once(false));
            st.next_ts = None;
        } else {
            self.registry.reschedule_after_run(key, now.max(eff));
        }
        self.dirty = true;
    }

    fn pending_count(&self, key: &ScheduleKey) -> u32 {
        self.pending.iter().filter(|p| &p.key == key).count() as u32
    }

    fn admit_pending(&mut self, now: i64) {
        loop {
            let mut admitted = false;
            let mut idx = 0;
            while idx < self.pending.len() {
                if self.supervisor.total_running() as usize >= self.config.max_procs {
                    return;
                }
                let run = self.pending[idx].clone();
                let Some(def) = self.registry.def(&run.key).cloned() else {
                    self.pending.remove(idx);
                    continue;
                };
                let cap = def
                    .max_running
                    .min(self.config.max_procs.saturating_sub(1).max(1) as u32);
                if self.supervisor.running_count(&run.key) >= cap {
                    idx += 1;
                    continue;
                }
                match self.dependency_gate(&run.key, &def) {
                    DepGate::Wait => {
                        idx += 1;
                        continue;
                    }
                    DepGate::Failed => {
                        self.pending.remove(idx);
                        self.record_start_failure(&run, &def, "dependency failed", now);
                        admitted = true;
                        continue;
                    }
                    DepGate::Clear => {}
                }
                self.pending.remove(idx);
                match self.start_run(&run, &def) {
                    Ok(job_id) => {
                        self.attach_future_monitors(&run.key, job_id);
                        if run.triggered {
                            self.registry.state_mut(&run.key).stats.add("triggered", 1.0);
                        }
                        let st = self.registry.state_mut(&run.key);
                        st.start_retries = 0;
                        st.last_run = Some(now);
                        self.dirty = true;
                    }
                    Err(e) => {
                        self.record_start_failure(&run, &def, &e.to_string(), now);
                    }
                }
                admitted = true;
            }
            if !admitted {
                return;
            }
        }
    }

    fn dependency_gate(&self, key: &ScheduleKey, def: &ScheduleDef) -> DepGate {
        let Some(dep_name) = &def.depends_on else {
            return DepGate::Clear;
        };
        let dep = ScheduleKey::new(key.user.clone(), dep_name.clone());
        if self.supervisor.running_count(&dep) > 0 {
            return DepGate::Wait;
        }
        let ok = self
            .registry
            .state(&dep)
            .and_then(|s| s.last_result.as_ref())
            .and_then(|r| r.get("success"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if ok {
            DepGate::Clear
        } else {
            DepGate::Failed
        }
    }

    fn start_run(&mut self, run: &PendingRun, def: &ScheduleDef) -> Result<u64> {
        let st = self.registry.state_mut(&run.key);
        let ctx = StartContext {
            last_result: st
                .last_result
                .as_ref()
                .and_then(|r| serde_json::to_string(r).ok()),
            last_ts: st.last_success.unwrap_or(0),
            curr_ts: run.trigger_ts,
            data: run.data.clone(),
        };
        let job_id =
            self.supervisor
                .start_job(run.key.clone(), def, run.trigger_ts, run.triggered, ctx)?;
        tracing::info!(job = job_id, "{}: started", run.key);
        Ok(job_id)
    }

    fn record_start_failure(&mut self, run: &PendingRun, def: &ScheduleDef, msg: &str, now: i64) {
        tracing::warn!("{}: start failed: {msg}", run.key);
        let prior = self
            .registry
            .state(&run.key)
            .map(|s| s.consecutive_errors)
            .unwrap_or(0);
        {
            let st = self.registry.state_mut(&run.key);
            st.stats.add("errors", 1.0);
            st.consecutive_errors += 1;
            if !run.triggered {
                let slot = st.start_retries.min(START_BACKOFF.len() - 1);
                st.run_ts = Some(now + START_BACKOFF[slot]);
                st.start_retries += 1;
            }
        }
        let data = json!({
            "success": false,
            "error": msg,
            "error_code": "process_start",
            "ts": now,
        });
        self.dispatch_notify(&run.key, def, prior, &data);
        self.registry.state_mut(&run.key).last_result = Some(data);
        self.dirty = true;
    }

    // ---- events ---------------------------------------------------------

    fn handle_event(&mut self, ev: Event) {
        match ev {
            Event::ClientConnected { client, user, tx } => {
                self.clients.insert(
                    client,
                    ClientState {
                        user,
                        tx,
                        revoked: false,
                        watching: false,
                        push_budget: PUSH_BUDGET,
                    },
                );
            }
            Event::ClientDisconnected { client } => {
                self.clients.remove(&client);
                self.future_attach.retain(|f| f.client != client);
                for job in self.supervisor.jobs_mut() {
                    job.monitors.retain(|&m| m != client);
                }
            }
            Event::ClientRequest { client, request } => match request {
                None => {
                    if let Some(state) = self.clients.get_mut(&client) {
                        state.revoked = true;
                        let line = error_line("malformed request", "protocol");
                        let _ = state.tx.send(line);
                    }
                }
                Some(req) => {
                    let revoked = self.clients.get(&client).map(|c| c.revoked).unwrap_or(true);
                    let response = if revoked {
                        error_line("access revoked for this connection", "access_revoked")
                    } else {
                        self.handle_request(client, req)
                    };
                    if let Some(state) = self.clients.get(&client) {
                        let _ = state.tx.send(response);
                    }
                }
            },
            Event::JobOutput { job, stream, data } => {
                let lines = self.supervisor.handle_output(job, stream, &data);
                self.push_monitor_lines(job, stream, &lines);
                self.check_output_limit(job);
            }
            Event::JobPipeClosed { job, stream } => {
                if let Some(rest) = self.supervisor.handle_pipe_closed(job, stream) {
                    self.push_monitor_lines(job, stream, &[rest]);
                }
            }
            Event::NotifyDelivered {
                schedule,
                notifier,
                ok,
            } => {
                self.notify.record(NotifyRecord {
                    ts: Utc::now().timestamp(),
                    schedule: schedule.to_string(),
                    notifier,
                    ok,
                });
            }
            Event::Shutdown => {
                self.stopping = true;
            }
        }
    }

    fn check_output_limit(&mut self, job_id: u64) {
        let Some(job) = self.supervisor.job(job_id) else {
            return;
        };
        let Some(def) = self.registry.def(&job.key) else {
            return;
        };
        if let Some(limit) = def.term_output {
            if job.bytes_read > limit && job.term_reason.is_none() {
                tracing::warn!(job = job_id, "{}: output limit exceeded", job.key);
                self.supervisor.kill(job_id, TermReason::Output);
            }
        }
    }

    /// Wall-clock policies for every running job.
    fn check_job_policies(&mut self, now: i64) {
        let mut kills = Vec::new();
        let mut alerts = Vec::new();
        for job in self.supervisor.jobs_mut() {
            let Some(def) = self.registry.defs.get(&job.key.user).and_then(|n| n.get(&job.key.name))
            else {
                continue;
            };
            let runtime = job.runtime(now);
            if let Some(term) = def.term_after {
                if runtime > term as i64 && job.term_reason.is_none() {
                    kills.push(job.id);
                    continue;
                }
            }
            if let Some(alert) = def.alert_after {
                if runtime > alert as i64 && !job.alerted {
                    job.alerted = true;
                    alerts.push(job.key.clone());
                }
            }
        }
        for id in kills {
            if let Some(key) = self.supervisor.job(id).map(|j| j.key.clone()) {
                tracing::warn!(job = id, "{key}: runtime limit exceeded");
            }
            self.supervisor.kill(id, TermReason::Runtime);
        }
        for key in alerts {
            tracing::warn!("{key}: runtime alert");
            let prior = self
                .registry
                .state(&key)
                .map(|s| s.consecutive_errors)
                .unwrap_or(0);
            let result = json!({
                "success": false,
                "error": "runtime alert threshold exceeded",
                "error_code": "process_time_alert",
                "ts": now,
            });
            if let Some(def) = self.registry.def(&key).cloned() {
                self.dispatch_notify(&key, &def, prior, &result);
            }
            let st = self.registry.state_mut(&key);
            st.stats.add("time_alerts", 1.0);
            st.last_result = Some(result);
            self.dirty = true;
        }
    }

    /// Observe exits and finalize jobs whose pipes have drained.
    fn drain_exits(&mut self, now: i64) {
        for (id, status) in self.supervisor.poll_exits() {
            self.exited.insert(id, status);
        }
        let ready: Vec<u64> = self
            .exited
            .keys()
            .copied()
            .filter(|id| {
                self.supervisor
                    .job(*id)
                    .map(|j| j.pipes_closed())
                    .unwrap_or(true)
            })
            .collect();
        for id in ready {
            if let Some(status) = self.exited.remove(&id) {
                self.finish_command(id, status, now);
            }
        }
    }

    /// A command finished. Either chain to the next command or complete the
    /// whole run.
    fn finish_command(&mut self, id: u64, status: ExitStatus, now: i64) {
        let Some(job) = self.supervisor.job(id) else {
            return;
        };
        let key = job.key.clone();
        let Some(def) = self.registry.def(&key).cloned() else {
            self.supervisor.finish_job(id);
            return;
        };
        let hard_stderr = def.stderr_error && job.stderr_seen;
        let success = status.success() && !hard_stderr && job.term_reason.is_none();

        if success && job.cmd_index + 1 < job.cmds.len() {
            self.registry.state_mut(&key).stats.add("cmds", 1.0);
            let st = self.registry.state_mut(&key);
            let ctx = StartContext {
                last_result: st
                    .last_result
                    .as_ref()
                    .and_then(|r| serde_json::to_string(r).ok()),
                last_ts: st.last_success.unwrap_or(0),
                curr_ts: self.supervisor.job(id).map(|j| j.trigger_ts).unwrap_or(now),
                data: self.supervisor.job(id).and_then(|j| j.data.clone()),
            };
            match self.supervisor.start_next_command(id, &def, &ctx) {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(job = id, "{key}: next command failed to start: {e}");
                    self.complete_run(id, &def, false, Some("process_start"), status, now);
                    return;
                }
            }
        }
        let error_code = if hard_stderr {
            Some("stderr_output")
        } else {
            self.supervisor.job(id).and_then(|j| j.term_reason).map(TermReason::code)
        };
        self.complete_run(id, &def, success, error_code, status, now);
    }

    fn complete_run(
        &mut self,
        id: u64,
        def: &ScheduleDef,
        exec_success: bool,
        error_code: Option<&str>,
        status: ExitStatus,
        now: i64,
    ) {
        let Some(job) = self.supervisor.finish_job(id) else {
            return;
        };
        let key = job.key.clone();
        let runtime = job.runtime(now);

        // The last stdout line may be a structured result.
        let adopted: Option<serde_json::Map<String, Value>> = job
            .last_line
            .as_deref()
            .and_then(|l| serde_json::from_str::<Value>(l).ok())
            .and_then(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            });

        let mut success = exec_success;
        if let Some(map) = &adopted {
            if let Some(s) = map.get("success").and_then(Value::as_bool) {
                success = success && s;
            }
        }

        let mut result = json!({
            "success": success,
            "exit_code": status.code(),
            "runtime": runtime,
            "ts": now,
            "triggered": job.triggered,
        });
        if let Some(code) = error_code {
            result["error_code"] = json!(code);
            result["error"] = json!(match code {
                "process_term_alert" => "runtime limit exceeded",
                "process_term_output" => "output limit exceeded",
                "stderr_output" => "wrote to stderr",
                _ => "terminated",
            });
        } else if !success {
            result["error"] = json!(format!("exit status {:?}", status.code()));
            result["error_code"] = json!("process_exit");
        }
        if job.stderr_seen && !def.stderr_error {
            result["stderr_warning"] = json!(true);
        }
        if let Some(map) = &adopted {
            if let Some(obj) = result.as_object_mut() {
                for (k, v) in map {
                    if k != "schedule" && k != "stats" {
                        obj.insert(k.clone(), v.clone());
                    }
                }
            }
        }

        let custom_stats = adopted.as_ref().and_then(|m| m.get("stats")).cloned();
        self.registry.add_result_stats(&key, custom_stats.as_ref(), runtime as f64);
        if error_code.is_some_and(|c| c.starts_with("process_term")) {
            self.registry.state_mut(&key).stats.add("terminations", 1.0);
        }

        let prior_errors = self
            .registry
            .state(&key)
            .map(|s| s.consecutive_errors)
            .unwrap_or(0);

        if success {
            let st = self.registry.state_mut(&key);
            st.last_run = Some(now);
            st.last_success = Some(now);
            st.retries = 0;
            st.start_retries = 0;
            st.consecutive_errors = 0;
            if job.triggered {
                self.append_triggered_log(def, &job.tail, false);
            }
            if prior_errors > 0 && !def.notify.is_empty() {
                self.dispatch_notify(&key, def, prior_errors, &result);
            }
            tracing::info!(job = id, runtime, "{key}: completed");
        } else {
            let st = self.registry.state_mut(&key);
            st.last_run = Some(now);
            st.consecutive_errors += 1;
            st.stats.add("errors", 1.0);
            self.preserve_error_output(def, &job.tail, job.triggered);
            tracing::warn!(job = id, runtime, "{key}: failed");

            if !job.triggered {
                let retries = self.registry.state(&key).map(|s| s.retries).unwrap_or(0);
                if retries < def.retry_freq.len() {
                    let delay = def.retry_freq[retries] as i64;
                    let st = self.registry.state_mut(&key);
                    st.run_ts = Some(now + delay);
                    st.retries += 1;
                    tracing::info!("{key}: retry in {delay}s");
                } else {
                    if !def.retry_freq.is_empty() {
                        result["error"] = json!("Retry limit reached.");
                    }
                    self.registry.state_mut(&key).retries = 0;
                    self.dispatch_notify(&key, def, prior_errors, &result);
                }
            } else {
                self.dispatch_notify(&key, def, prior_errors, &result);
            }
        }

        // A structured result may replace the schedule rule.
        if let Some(req) = adopted.as_ref().and_then(|m| m.get("schedule")) {
            self.apply_schedule_replacement(&key, def, req);
        }

        self.registry.state_mut(&key).last_result = Some(result);
        self.dirty = true;
    }

    /// Honor a job-requested schedule replacement: an object merges over the
    /// definition, a string replaces the recurrence line, `true` reruns now,
    /// an integer reruns at that timestamp.
    fn apply_schedule_replacement(&mut self, key: &ScheduleKey, def: &ScheduleDef, req: &Value) {
        let outcome = match req {
            Value::Object(map) => match def.merge_update(map) {
                Ok(new_def) => {
                    self.registry.replace_def(key, new_def);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Value::String(line) => {
                self.registry
                    .set_rule_override(key, Some(ScheduleRule::Calendar(line.clone())));
                Ok(())
            }
            Value::Bool(run_again) => {
                self.registry
                    .set_rule_override(key, Some(ScheduleRule::Once(*run_again)));
                if !run_again {
                    self.registry.state_mut(key).next_ts = None;
                }
                Ok(())
            }
            Value::Number(n) => match n.as_i64() {
                Some(ts) => {
                    self.registry.set_rule_override(key, Some(ScheduleRule::At(ts)));
                    Ok(())
                }
                None => Err(ChronodError::Validation("timestamp out of range".into())),
            },
            _ => Err(ChronodError::Validation("unsupported schedule value".into())),
        };
        match outcome {
            Ok(()) => {
                self.dirty = true;
                self.push_schedule_change(&key.user);
            }
            Err(e) => tracing::warn!("{key}: schedule replacement rejected: {e}"),
        }
    }

    fn preserve_error_output(&self, def: &ScheduleDef, tail: &[u8], triggered: bool) {
        let Some(base) = &def.output_file else {
            return;
        };
        let suffix = if triggered { ".triggered.err" } else { ".err" };
        let dest = err_path(base, suffix);
        let outcome = if triggered {
            // Ad-hoc runs never wrote the output file; keep their tail.
            std::fs::write(&dest, tail)
        } else {
            std::fs::copy(base, &dest).map(|_| ())
        };
        if let Err(e) = outcome {
            tracing::warn!("could not keep error output {}: {e}", dest.display());
        }
    }

    fn append_triggered_log(&self, def: &ScheduleDef, tail: &[u8], _error: bool) {
        let Some(base) = &def.output_file else {
            return;
        };
        let dest = err_path(base, ".triggered.log");
        let outcome = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&dest)
            .and_then(|mut f| std::io::Write::write_all(&mut f, tail));
        if let Err(e) = outcome {
            tracing::warn!("could not append {}: {e}", dest.display());
        }
    }

    /// Kick off deliveries for a result. The router runs them as spawned
    /// tasks; completions come back as [`Event::NotifyDelivered`].
    fn dispatch_notify(&mut self, key: &ScheduleKey, def: &ScheduleDef, prior: u32, data: &Value) {
        if def.notify.is_empty() {
            return;
        }
        let info = self.server_info();
        let display = key.name.clone();
        let sent = self
            .notify
            .dispatch(&def.notify, prior, &info, key, &display, data, &self.events_tx);
        if sent > 0 {
            self.registry.state_mut(key).stats.add("notify", sent as f64);
        }
    }

    // ---- monitors and pushes -------------------------------------------

    fn push_monitor_lines(&mut self, job_id: u64, stream: OutputStream, lines: &[String]) {
        let Some(job) = self.supervisor.job(job_id) else {
            return;
        };
        if job.monitors.is_empty() || lines.is_empty() {
            return;
        }
        let monitors = job.monitors.clone();
        let schedule = job.key.to_string();
        for line in lines {
            let encoded = base64::engine::general_purpose::STANDARD.encode(line.as_bytes());
            let push = json!({
                "push": "output",
                "job": job_id,
                "schedule": schedule,
                "stream": stream.as_str(),
                "data_b64": encoded,
            })
            .to_string();
            for client in &monitors {
                if let Some(state) = self.clients.get_mut(client) {
                    if state.push_budget < push.len() {
                        continue;
                    }
                    state.push_budget -= push.len();
                    let _ = state.tx.send(push.clone());
                }
            }
        }
    }

    fn push_schedule_change(&mut self, user: &str) {
        let push = json!({"push": "schedules", "user": user}).to_string();
        for state in self.clients.values() {
            if state.watching && !state.revoked {
                let _ = state.tx.send(push.clone());
            }
        }
    }

    fn attach_future_monitors(&mut self, key: &ScheduleKey, job_id: u64) {
        let mut attach = Vec::new();
        self.future_attach.retain_mut(|f| {
            if &f.key != key {
                return true;
            }
            attach.push(f.client);
            f.remaining -= 1;
            f.remaining > 0
        });
        if let Some(job) = self.supervisor.job_mut(job_id) {
            for client in attach {
                if !job.monitors.contains(&client) {
                    job.monitors.push(client);
                }
            }
        }
    }

    // ---- client requests -------------------------------------------------

    fn handle_request(&mut self, client: u64, req: ClientRequest) -> String {
        match req {
            ClientRequest::GetServerInfo => {
                let mut info = self.server_info();
                info["success"] = json!(true);
                info.to_string()
            }
            ClientRequest::GetSchedules { user, watch } => {
                let user = self.resolve_user(client, user);
                if watch {
                    if let Some(state) = self.clients.get_mut(&client) {
                        state.watching = true;
                    }
                }
                let mut out = serde_json::Map::new();
                if let Some(names) = self.registry.defs.get(&user) {
                    for name in names.keys().cloned().collect::<Vec<_>>() {
                        let key = ScheduleKey::new(user.clone(), name.clone());
                        out.insert(name, self.schedule_view(&key));
                    }
                }
                json!({"success": true, "user": user, "schedules": out}).to_string()
            }
            ClientRequest::GetSchedule { user, name } => {
                let user = self.resolve_user(client, user);
                let key = ScheduleKey::new(user, name);
                if self.registry.def(&key).is_none() {
                    return error_line("no such schedule", "not_found");
                }
                json!({"success": true, "schedule": self.schedule_view(&key)}).to_string()
            }
            ClientRequest::SetSchedules { user, schedules } => {
                let user = self.resolve_user(client, user);
                let mut warnings = self.registry.set_user_schedules(&user, &schedules);
                warnings.extend(self.notifier_warnings(&user));
                self.dirty = true;
                self.push_schedule_change(&user);
                let warn_json: Vec<Value> = warnings
                    .into_iter()
                    .map(|(name, msg)| json!({"schedule": name, "warning": msg}))
                    .collect();
                json!({
                    "success": true,
                    "loaded": self.registry.defs.get(&user).map(BTreeMap::len).unwrap_or(0),
                    "warnings": warn_json,
                })
                .to_string()
            }
            ClientRequest::Reload { user } => {
                let user = self.resolve_user(client, user);
                let mut count = 0;
                for key in self.registry.keys() {
                    if key.user != user {
                        continue;
                    }
                    self.registry.set_rule_override(&key, None);
                    count += 1;
                }
                self.dirty = true;
                json!({"success": true, "reloaded": count}).to_string()
            }
            ClientRequest::TriggerRun {
                user,
                name,
                data,
                password,
            } => {
                let user = self.resolve_user(client, user);
                let key = ScheduleKey::new(user, name);
                let Some(def) = self.registry.def(&key).cloned() else {
                    return error_line("no such schedule", "not_found");
                };
                if let Err(line) = check_password(&def, password.as_deref()) {
                    return line;
                }
                let pending = self.pending_count(&key);
                let running = self.supervisor.running_count(&key);
                if queue_full(&def, pending, running) {
                    return error_line("queue full", "queue_full");
                }
                self.pending.push_back(PendingRun {
                    key: key.clone(),
                    trigger_ts: Utc::now().timestamp(),
                    triggered: true,
                    data,
                });
                json!({"success": true, "queued": true}).to_string()
            }
            ClientRequest::SetNextRunTime {
                user,
                name,
                ts,
                password,
            } => {
                let user = self.resolve_user(client, user);
                let key = ScheduleKey::new(user, name);
                let Some(def) = self.registry.def(&key).cloned() else {
                    return error_line("no such schedule", "not_found");
                };
                if !def.allow_remote_time {
                    return error_line("schedule does not allow remote time", "not_allowed");
                }
                if let Err(line) = check_password(&def, password.as_deref()) {
                    return line;
                }
                self.registry.state_mut(&key).run_ts = Some(ts);
                self.dirty = true;
                json!({"success": true, "run_ts": ts}).to_string()
            }
            ClientRequest::TestNotifications { user, name } => {
                let user = self.resolve_user(client, user);
                let key = ScheduleKey::new(user, name);
                let Some(def) = self.registry.def(&key).cloned() else {
                    return error_line("no such schedule", "not_found");
                };
                if def.notify.is_empty() {
                    return error_line("no notifiers configured", "not_found");
                }
                let data = json!({"success": true, "test": true, "ts": Utc::now().timestamp()});
                self.dispatch_notify(&key, &def, 0, &data);
                json!({"success": true, "notifiers": def.notify.len()}).to_string()
            }
            ClientRequest::SuspendSchedule {
                user,
                name,
                until,
                skip_missed,
            } => {
                let user = self.resolve_user(client, user);
                let key = ScheduleKey::new(user, name);
                if self.registry.def(&key).is_none() {
                    return error_line("no such schedule", "not_found");
                }
                let st = self.registry.state_mut(&key);
                if until <= 0 {
                    st.suspend_until = None;
                    st.skip_missed = false;
                } else {
                    st.suspend_until = Some(until);
                    st.skip_missed = skip_missed;
                }
                self.dirty = true;
                json!({"success": true}).to_string()
            }
            ClientRequest::GetRunOutput {
                user,
                name,
                error,
                triggered,
                stream,
            } => {
                let user = self.resolve_user(client, user);
                let key = ScheduleKey::new(user, name);
                let Some(def) = self.registry.def(&key).cloned() else {
                    return error_line("no such schedule", "not_found");
                };
                let Some(base) = &def.output_file else {
                    return error_line("schedule has no output file", "no_output_file");
                };
                let path = match (error, triggered) {
                    (false, false) => base.clone(),
                    (true, false) => err_path(base, ".err"),
                    (false, true) => err_path(base, ".triggered.log"),
                    (true, true) => err_path(base, ".triggered.err"),
                };
                let content = std::fs::read(&path).unwrap_or_default();
                let tail_start = content.len().saturating_sub(crate::supervisor::TAIL_CAP);
                if stream {
                    if let Some(job_id) = self.supervisor.find_by_key(&key) {
                        if let Some(job) = self.supervisor.job_mut(job_id) {
                            if !job.monitors.contains(&client) {
                                job.monitors.push(client);
                            }
                        }
                    }
                }
                json!({
                    "success": true,
                    "path": path.display().to_string(),
                    "data_b64": base64::engine::general_purpose::STANDARD
                        .encode(&content[tail_start..]),
                })
                .to_string()
            }
            ClientRequest::AttachProcess {
                user,
                name,
                pid,
                job,
                future_attach,
            } => {
                let user = self.resolve_user(client, user);
                if let (Some(name), Some(n)) = (&name, future_attach) {
                    if n == 0 {
                        return error_line("future_attach must be positive", "validation");
                    }
                    self.future_attach.push(FutureAttach {
                        key: ScheduleKey::new(user, name.clone()),
                        client,
                        remaining: n,
                    });
                    return json!({"success": true, "future": n}).to_string();
                }
                let job_id = job
                    .or_else(|| pid.and_then(|p| self.supervisor.find_by_pid(p)))
                    .or_else(|| {
                        name.as_ref().and_then(|n| {
                            self.supervisor
                                .find_by_key(&ScheduleKey::new(user.clone(), n.clone()))
                        })
                    });
                let Some(job_id) = job_id else {
                    return error_line("no matching running job", "not_found");
                };
                let tail = self
                    .supervisor
                    .job(job_id)
                    .map(|j| j.tail.clone())
                    .unwrap_or_default();
                if let Some(j) = self.supervisor.job_mut(job_id) {
                    if !j.monitors.contains(&client) {
                        j.monitors.push(client);
                    }
                }
                json!({
                    "success": true,
                    "job": job_id,
                    "tail_b64": base64::engine::general_purpose::STANDARD.encode(&tail),
                })
                .to_string()
            }
            ClientRequest::DetachProcess { user, name, job } => {
                let user = self.resolve_user(client, user);
                let mut detached = 0;
                for j in self.supervisor.jobs_mut() {
                    let matches = match (&name, job) {
                        (_, Some(id)) => j.id == id,
                        (Some(n), None) => j.key.user == user && &j.key.name == n,
                        (None, None) => true,
                    };
                    if matches {
                        let before = j.monitors.len();
                        j.monitors.retain(|&m| m != client);
                        detached += before - j.monitors.len();
                    }
                }
                match (&name, job) {
                    (Some(n), None) => {
                        let key = ScheduleKey::new(user, n.clone());
                        self.future_attach
                            .retain(|f| !(f.client == client && f.key == key));
                    }
                    (None, None) => self.future_attach.retain(|f| f.client != client),
                    _ => {}
                }
                json!({"success": true, "detached": detached}).to_string()
            }
        }
    }

    fn resolve_user(&self, client: u64, user: Option<String>) -> String {
        user.unwrap_or_else(|| {
            self.clients
                .get(&client)
                .map(|c| c.user.clone())
                .unwrap_or_default()
        })
    }

    /// Non-fatal notifier config problems across a user's loaded schedules.
    fn notifier_warnings(&self, user: &str) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Some(names) = self.registry.defs.get(user) {
            for (name, def) in names {
                for msg in self.notify.validate_configs(&def.notify) {
                    out.push((name.clone(), msg));
                }
            }
        }
        out
    }

    /// Client-facing view of one schedule: redacted definition plus trigger
    /// state and statistics.
    fn schedule_view(&self, key: &ScheduleKey) -> Value {
        let Some(def) = self.registry.def(key) else {
            return Value::Null;
        };
        let mut v = def.safe_view();
        if let Some(obj) = v.as_object_mut() {
            if let Some(st) = self.registry.state(key) {
                obj.insert("next_ts".into(), json!(st.effective_ts()));
                obj.insert("suspend_until".into(), json!(st.suspend_until));
                obj.insert("last_run".into(), json!(st.last_run));
                obj.insert("last_success".into(), json!(st.last_success));
                obj.insert("last_result".into(), st.last_result.clone().unwrap_or(Value::Null));
                obj.insert("consecutive_errors".into(), json!(st.consecutive_errors));
                obj.insert(
                    "stats".into(),
                    serde_json::to_value(&st.stats).unwrap_or(Value::Null),
                );
            }
            obj.insert("running".into(), json!(self.supervisor.running_count(key)));
        }
        v
    }

    fn server_info(&self) -> Value {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        json!({
            "server": "chronod",
            "version": env!("CARGO_PKG_VERSION"),
            "host": host,
            "pid": std::process::id(),
            "boot_ts": self.registry.boot_ts,
            "started_at": self.started_at,
            "schedules": self.registry.schedule_count(),
            "running": self.supervisor.total_running(),
            "pending": self.pending.len(),
            "max_procs": self.config.max_procs,
        })
    }

    // ---- persistence and signals ----------------------------------------

    fn flush_tick(&mut self, now: i64) {
        if now - self.last_flush < self.config.flush_secs as i64 {
            return;
        }
        self.last_flush = now;
        for state in self.clients.values_mut() {
            state.push_budget = PUSH_BUDGET;
        }
        if self.config.stop_signal_path().exists() {
            let _ = std::fs::remove_file(self.config.stop_signal_path());
            tracing::info!("stop signal received");
            self.stopping = true;
        } else if self.config.reload_signal_path().exists() {
            let _ = std::fs::remove_file(self.config.reload_signal_path());
            tracing::info!("reload signal received");
            self.stopping = true;
        }
        self.flush(now);
    }

    fn flush(&mut self, _now: i64) {
        if !self.dirty {
            return;
        }
        let schedules = self.registry.defs.clone();
        let cache = CacheDoc {
            boot_ts: self.registry.boot_ts,
            states: self.registry.states.clone(),
        };
        // Flush failures are retried on the next cycle, never fatal.
        let mut ok = true;
        if let Err(e) = self.store.save_schedules(&schedules) {
            tracing::warn!("schedule flush failed: {e}");
            ok = false;
        }
        if let Err(e) = self.store.save_cache(&cache) {
            tracing::warn!("cache flush failed: {e}");
            ok = false;
        }
        if ok {
            self.dirty = false;
        }
    }
}

enum DepGate {
    Clear,
    Wait,
    Failed,
}

/// The pending queue refuses new occurrences only when it is at its cap and
/// the schedule is already running at its concurrency limit.
fn queue_full(def: &ScheduleDef, pending: u32, running: u32) -> bool {
    def.max_queue >= 0 && pending as i64 >= def.max_queue && running >= def.max_running
}

fn check_password(def: &ScheduleDef, given: Option<&str>) -> std::result::Result<(), String> {
    match &def.password {
        None => Ok(()),
        Some(expected) if given == Some(expected.as_str()) => Ok(()),
        Some(_) => Err(error_line("bad password", "bad_password")),
    }
}

fn error_line(msg: &str, code: &str) -> String {
    json!({"success": false, "error": msg, "error_code": code}).to_string()
}

fn err_path(base: &PathBuf, suffix: &str) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> ChronodConfig {
        let mut config = ChronodConfig::default();
        config.state_dir = std::env::temp_dir().join(format!(
            "chronod-dispatch-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        std::fs::create_dir_all(&config.state_dir).unwrap();
        config
    }

    fn daemon_with(def: Value) -> (Daemon, ScheduleKey) {
        let mut daemon = Daemon::new(test_config());
        let mut map = serde_json::Map::new();
        map.insert("job".to_string(), def);
        let warnings = daemon.registry.set_user_schedules("alice", &map);
        assert!(warnings.is_empty(), "{warnings:?}");
        (daemon, ScheduleKey::new("alice", "job"))
    }

    #[test]
    fn test_queue_full_matrix() {
        let def = ScheduleDef {
            max_queue: 0,
            max_running: 1,
            ..ScheduleDef::default()
        };
        // Nothing running yet: the first trigger is admissible.
        assert!(!queue_full(&def, 0, 0));
        // One running, none pending, cap 0: a second trigger is refused.
        assert!(queue_full(&def, 0, 1));

        let unlimited = ScheduleDef::default();
        assert!(!queue_full(&unlimited, 50, 10));
    }

    #[test]
    fn test_scan_enqueues_due_one_shot_exactly_once() {
        let now = Utc::now().timestamp();
        let (mut daemon, key) = daemon_with(json!({
            "schedule": now - 10,
            "cmd": "true",
        }));
        daemon.registry.state_mut(&key).reload = true;
        daemon.scan_triggers(now);
        assert_eq!(daemon.pending.len(), 1);
        assert_eq!(daemon.pending[0].key, key);
        // The one-shot disabled itself at consumption.
        daemon.scan_triggers(now + 1);
        assert_eq!(daemon.pending.len(), 1);
        assert_eq!(
            daemon.registry.state(&key).unwrap().rule_override,
            Some(ScheduleRule::Once(false))
        );
    }

    #[test]
    fn test_suspension_skips_missed_occurrences() {
        let now = Utc::now().timestamp();
        let (mut daemon, key) = daemon_with(json!({
            "schedule": now - 10,
            "cmd": "true",
        }));
        daemon.registry.state_mut(&key).reload = true;
        {
            let st = daemon.registry.state_mut(&key);
            st.suspend_until = Some(now + 3600);
            st.skip_missed = true;
        }
        daemon.scan_triggers(now);
        assert!(daemon.pending.is_empty());
        // The occurrence was consumed, not deferred.
        assert_eq!(daemon.registry.state(&key).unwrap().next_ts, None);
    }

    #[test]
    fn test_suspension_without_skip_defers() {
        let now = Utc::now().timestamp();
        let (mut daemon, key) = daemon_with(json!({
            "schedule": now - 10,
            "cmd": "true",
        }));
        daemon.registry.state_mut(&key).reload = true;
        daemon.registry.state_mut(&key).suspend_until = Some(now + 60);
        daemon.scan_triggers(now);
        assert!(daemon.pending.is_empty());
        assert!(daemon.registry.state(&key).unwrap().effective_ts().is_some());
        // Suspension lapses and the deferred occurrence fires.
        daemon.registry.state_mut(&key).suspend_until = Some(now - 1);
        daemon.scan_triggers(now);
        assert_eq!(daemon.pending.len(), 1);
    }

    #[test]
    fn test_malformed_request_revokes_connection() {
        let (mut daemon, _key) = daemon_with(json!({
            "schedule": false,
            "cmd": "true",
        }));
        let (tx, mut rx) = unbounded_channel();
        daemon.handle_event(Event::ClientConnected {
            client: 1,
            user: "alice".to_string(),
            tx,
        });
        daemon.handle_event(Event::ClientRequest {
            client: 1,
            request: None,
        });
        let line = rx.try_recv().unwrap();
        assert!(line.contains(r#""success":false"#));

        daemon.handle_event(Event::ClientRequest {
            client: 1,
            request: Some(ClientRequest::GetServerInfo),
        });
        let line = rx.try_recv().unwrap();
        assert!(line.contains("access_revoked"));
    }

    #[test]
    fn test_get_schedules_redacts_sensitive_fields() {
        let (mut daemon, _key) = daemon_with(json!({
            "schedule": false,
            "cmd": "echo secret",
            "password": "hunter2",
            "env": {"TOKEN": "abc"},
        }));
        let (tx, _rx) = unbounded_channel();
        daemon.handle_event(Event::ClientConnected {
            client: 1,
            user: "alice".to_string(),
            tx,
        });
        let line = daemon.handle_request(
            1,
            ClientRequest::GetSchedules {
                user: None,
                watch: false,
            },
        );
        let v: Value = serde_json::from_str(&line).unwrap();
        let sched = &v["schedules"]["job"];
        assert!(sched.get("cmds").is_none());
        assert!(sched.get("env").is_none());
        assert!(sched.get("password").is_none());
        assert_eq!(sched["has_password"], json!(true));
    }

    #[test]
    fn test_set_next_run_time_requires_permission() {
        let (mut daemon, key) = daemon_with(json!({
            "schedule": false,
            "cmd": "true",
        }));
        let line = daemon.handle_request(
            1,
            ClientRequest::SetNextRunTime {
                user: Some("alice".to_string()),
                name: "job".to_string(),
                ts: 9_999_999_999,
                password: None,
            },
        );
        assert!(line.contains("not_allowed"));
        assert_eq!(daemon.registry.state(&key).and_then(|s| s.run_ts), None);
    }

    #[test]
    fn test_trigger_run_checks_password() {
        let (mut daemon, _key) = daemon_with(json!({
            "schedule": false,
            "cmd": "true",
            "password": "hunter2",
        }));
        let refused = daemon.handle_request(
            1,
            ClientRequest::TriggerRun {
                user: Some("alice".to_string()),
                name: "job".to_string(),
                data: None,
                password: Some("wrong".to_string()),
            },
        );
        assert!(refused.contains("bad_password"));
        assert!(daemon.pending.is_empty());

        let ok = daemon.handle_request(
            1,
            ClientRequest::TriggerRun {
                user: Some("alice".to_string()),
                name: "job".to_string(),
                data: Some("full".to_string()),
                password: Some("hunter2".to_string()),
            },
        );
        assert!(ok.contains(r#""queued":true"#));
        assert_eq!(daemon.pending.len(), 1);
        assert!(daemon.pending[0].triggered);
    }

    #[test]
    fn test_loop_wait_idles_through_suspension() {
        let now = Utc::now().timestamp();
        let (mut daemon, key) = daemon_with(json!({
            "schedule": now - 10,
            "cmd": "true",
        }));
        daemon.registry.state_mut(&key).reload = true;
        daemon.registry.state_mut(&key).suspend_until = Some(now + 3600);
        daemon.scan_triggers(now);
        assert!(daemon.pending.is_empty());
        // The deferred trigger has elapsed, but the suspension holds it;
        // the loop waits its normal idle interval instead of spinning.
        let wait = daemon.loop_wait(now);
        assert_eq!(wait, std::time::Duration::from_secs(IDLE_WAIT_SECS));
    }

    #[test]
    fn test_set_schedules_warns_on_unknown_notifier() {
        let (mut daemon, _key) = daemon_with(json!({
            "schedule": false,
            "cmd": "true",
        }));
        let mut map = serde_json::Map::new();
        map.insert(
            "pinger".to_string(),
            json!({
                "schedule": false,
                "cmd": "true",
                "notify": {"pager": {}},
            }),
        );
        let line = daemon.handle_request(
            1,
            ClientRequest::SetSchedules {
                user: Some("alice".to_string()),
                schedules: map,
            },
        );
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["success"], json!(true));
        let warnings = v["warnings"].as_array().unwrap();
        assert!(warnings
            .iter()
            .any(|w| w["schedule"] == json!("pinger")
                && w["warning"].as_str().unwrap().contains("pager")));
    }

    #[test]
    fn test_runtime_alert_records_result() {
        let now = Utc::now().timestamp();
        let (mut daemon, key) = daemon_with(json!({
            "schedule": false,
            "cmd": "sleep 60",
            "alert_after": 5,
        }));
        daemon.supervisor.insert_stub_job(7, key.clone(), now - 10);
        daemon.check_job_policies(now);
        let st = daemon.registry.state(&key).unwrap();
        let result = st.last_result.as_ref().unwrap();
        assert_eq!(result["error_code"], json!("process_time_alert"));
        assert_eq!(result["success"], json!(false));
        assert_eq!(st.stats.today.get("time_alerts"), 1.0);
        // One alert per run, not one per policy sweep.
        daemon.check_job_policies(now + 1);
        let st = daemon.registry.state(&key).unwrap();
        assert_eq!(st.stats.today.get("time_alerts"), 1.0);
    }

    #[test]
    fn test_retry_backoff_consumes_table_then_resets() {
        let def = ScheduleDef {
            retry_freq: vec![60, 300],
            ..ScheduleDef::default()
        };
        // Mirror of the completion path's retry arithmetic.
        let mut retries = 0usize;
        let now = 1000;
        let mut delays = Vec::new();
        for _ in 0..3 {
            if retries < def.retry_freq.len() {
                delays.push(now + def.retry_freq[retries] as i64);
                retries += 1;
            } else {
                retries = 0;
            }
        }
        assert_eq!(delays, vec![1060, 1300]);
        assert_eq!(retries, 0);
    }

    #[test]
    fn test_err_path_suffixes() {
        let base = PathBuf::from("/var/log/job.out");
        assert_eq!(err_path(&base, ".err"), PathBuf::from("/var/log/job.out.err"));
        assert_eq!(
            err_path(&base, ".triggered.log"),
            PathBuf::from("/var/log/job.out.triggered.log")
        );
    }
}
