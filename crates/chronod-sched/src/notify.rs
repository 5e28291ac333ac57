//! Notification routing.
//!
//! Notifiers are collaborators behind a narrow contract: validate a config
//! up front, deliver a result payload later. Deliveries run as spawned
//! tasks and report back through the event channel, so a slow endpoint
//! never stalls the dispatcher loop. The daemon ships a tracing notifier
//! and a webhook notifier; anything heavier (mail, chat services) lives
//! outside and plugs into the same trait.

use async_trait::async_trait;
use chronod_core::{ChronodError, Result};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::events::Event;
use crate::registry::ScheduleKey;

/// Everything a notifier gets told about one delivery. Owned, because the
/// delivery outlives the dispatch call that produced it.
pub struct NotifyEvent {
    /// Notifier key the schedule configured.
    pub key: String,
    pub config: Value,
    /// Consecutive failures before this event, for escalation decisions.
    pub prior_errors: u32,
    pub server_info: Value,
    pub schedule_key: ScheduleKey,
    pub name: String,
    pub display_name: String,
    pub data: Value,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Check a config when a schedule loads. Ok(Some(_)) is a non-fatal
    /// warning.
    fn validate(&self, config: &Value) -> Result<Option<String>>;

    async fn notify(&self, event: &NotifyEvent) -> Result<()>;
}

/// Writes deliveries to the daemon log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn validate(&self, _config: &Value) -> Result<Option<String>> {
        Ok(None)
    }

    async fn notify(&self, event: &NotifyEvent) -> Result<()> {
        let success = event
            .data
            .get("success")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if success {
            tracing::info!(
                schedule = %event.schedule_key,
                "notification: '{}' succeeded",
                event.display_name
            );
        } else {
            let error = event
                .data
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            tracing::warn!(
                schedule = %event.schedule_key,
                prior_errors = event.prior_errors,
                "notification: '{}' failed: {error}",
                event.display_name
            );
        }
        Ok(())
    }
}

/// Posts the result payload as JSON to a configured URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn validate(&self, config: &Value) -> Result<Option<String>> {
        let url = config
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ChronodError::Validation("webhook notify needs a 'url'".into()))?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Ok(Some(format!("webhook url '{url}' is not http(s)")));
        }
        Ok(None)
    }

    async fn notify(&self, event: &NotifyEvent) -> Result<()> {
        let url = event
            .config
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ChronodError::Validation("webhook notify needs a 'url'".into()))?;
        let payload = json!({
            "user": event.schedule_key.user,
            "schedule": event.name,
            "display_name": event.display_name,
            "prior_errors": event.prior_errors,
            "server": event.server_info,
            "result": event.data,
        });
        let resp = self
            .client
            .post(url)
            .json(&payload)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| ChronodError::Execution(format!("webhook send failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(ChronodError::Execution(format!(
                "webhook returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// A finished (or failed) delivery kept for inspection.
#[derive(Debug, Clone)]
pub struct NotifyRecord {
    pub ts: i64,
    pub schedule: String,
    pub notifier: String,
    pub ok: bool,
}

/// Routes deliveries to registered notifiers by key.
pub struct NotifyRouter {
    notifiers: BTreeMap<String, Arc<dyn Notifier>>,
    history: Vec<NotifyRecord>,
}

impl NotifyRouter {
    pub fn new() -> Self {
        let mut router = Self {
            notifiers: BTreeMap::new(),
            history: Vec::new(),
        };
        router.register("log", Arc::new(LogNotifier));
        router.register("webhook", Arc::new(WebhookNotifier::new()));
        router
    }

    pub fn register(&mut self, key: &str, notifier: Arc<dyn Notifier>) {
        self.notifiers.insert(key.to_string(), notifier);
    }

    /// Validate every notifier config of a definition, returning warnings.
    pub fn validate_configs(&self, configs: &BTreeMap<String, Value>) -> Vec<String> {
        let mut warnings = Vec::new();
        for (key, config) in configs {
            match self.notifiers.get(key) {
                None => warnings.push(format!("unknown notifier '{key}'")),
                Some(n) => match n.validate(config) {
                    Ok(Some(w)) => warnings.push(format!("{key}: {w}")),
                    Ok(None) => {}
                    Err(e) => warnings.push(format!("{key}: {e}")),
                },
            }
        }
        warnings
    }

    /// Spawn one delivery per configured notifier. Completions arrive on
    /// the event channel as [`Event::NotifyDelivered`]. Returns how many
    /// deliveries were started.
    pub fn dispatch(
        &self,
        configs: &BTreeMap<String, Value>,
        prior_errors: u32,
        server_info: &Value,
        schedule_key: &ScheduleKey,
        display_name: &str,
        data: &Value,
        events: &UnboundedSender<Event>,
    ) -> usize {
        let mut sent = 0;
        for (key, config) in configs {
            let Some(notifier) = self.notifiers.get(key) else {
                tracing::warn!("schedule {schedule_key} names unknown notifier '{key}'");
                continue;
            };
            let event = NotifyEvent {
                key: key.clone(),
                config: config.clone(),
                prior_errors,
                server_info: server_info.clone(),
                schedule_key: schedule_key.clone(),
                name: schedule_key.name.clone(),
                display_name: display_name.to_string(),
                data: data.clone(),
            };
            let notifier = Arc::clone(notifier);
            let notifier_key = key.clone();
            let events = events.clone();
            tokio::spawn(async move {
                let ok = match notifier.notify(&event).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(
                            "notifier '{notifier_key}' failed for {}: {e}",
                            event.schedule_key
                        );
                        false
                    }
                };
                let _ = events.send(Event::NotifyDelivered {
                    schedule: event.schedule_key,
                    notifier: notifier_key,
                    ok,
                });
            });
            sent += 1;
        }
        sent
    }

    /// Note a finished delivery in the bounded history.
    pub fn record(&mut self, rec: NotifyRecord) {
        self.history.push(rec);
        if self.history.len() > 100 {
            self.history.remove(0);
        }
    }

    pub fn history(&self) -> &[NotifyRecord] {
        &self.history
    }
}

impl Default for NotifyRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_validate() {
        let n = WebhookNotifier::new();
        assert!(n.validate(&json!({})).is_err());
        assert!(n.validate(&json!({"url": "https://example.com/hook"})).unwrap().is_none());
        // Odd scheme is a warning, not an error.
        assert!(n.validate(&json!({"url": "ftp://example.com"})).unwrap().is_some());
    }

    #[test]
    fn test_validate_configs_reports_unknown() {
        let router = NotifyRouter::new();
        let mut configs = BTreeMap::new();
        configs.insert("log".to_string(), json!({}));
        configs.insert("pager".to_string(), json!({}));
        let warnings = router.validate_configs(&configs);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("pager"));
    }

    #[tokio::test]
    async fn test_log_notifier_accepts_failure_payloads() {
        // Failure payloads carry string error fields the log path reads.
        let event = NotifyEvent {
            key: "log".to_string(),
            config: json!({}),
            prior_errors: 2,
            server_info: json!({}),
            schedule_key: ScheduleKey::new("alice", "job"),
            name: "job".to_string(),
            display_name: "job".to_string(),
            data: json!({"success": false, "error": "exit status 1"}),
        };
        assert!(LogNotifier.notify(&event).await.is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_completes_through_events() {
        let mut router = NotifyRouter::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut configs = BTreeMap::new();
        configs.insert("log".to_string(), json!({}));
        let key = ScheduleKey::new("alice", "job");
        let sent = router.dispatch(
            &configs,
            0,
            &json!({}),
            &key,
            "job",
            &json!({"success": true}),
            &tx,
        );
        assert_eq!(sent, 1);
        match rx.recv().await.unwrap() {
            Event::NotifyDelivered { schedule, notifier, ok } => {
                assert_eq!(schedule, key);
                assert_eq!(notifier, "log");
                assert!(ok);
                router.record(NotifyRecord {
                    ts: 0,
                    schedule: schedule.to_string(),
                    notifier,
                    ok,
                });
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(router.history().len(), 1);
        assert!(router.history()[0].ok);
    }
}
