//! Typed events flowing into the dispatcher loop.
//!
//! Every task outside the loop (gateway readers, job pipe readers, signal
//! watchers) communicates through these variants; nothing else touches the
//! daemon's state.

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::registry::ScheduleKey;

/// Which child pipe a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// One dispatcher event.
#[derive(Debug)]
pub enum Event {
    ClientConnected {
        client: u64,
        user: String,
        tx: UnboundedSender<String>,
    },
    ClientRequest {
        client: u64,
        /// None when the line was not a valid request; revokes access.
        request: Option<ClientRequest>,
    },
    ClientDisconnected {
        client: u64,
    },
    JobOutput {
        job: u64,
        stream: OutputStream,
        data: Vec<u8>,
    },
    /// A child pipe reached end of file.
    JobPipeClosed {
        job: u64,
        stream: OutputStream,
    },
    /// A spawned notifier delivery finished.
    NotifyDelivered {
        schedule: ScheduleKey,
        notifier: String,
        ok: bool,
    },
    Shutdown,
}

/// Control protocol requests. The wire format is one JSON object per line
/// with an `action` field naming the variant.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    GetServerInfo,
    GetSchedules {
        #[serde(default)]
        user: Option<String>,
        /// Also push schedule-change notifications to this client.
        #[serde(default)]
        watch: bool,
    },
    GetSchedule {
        #[serde(default)]
        user: Option<String>,
        name: String,
    },
    SetSchedules {
        #[serde(default)]
        user: Option<String>,
        schedules: serde_json::Map<String, Value>,
    },
    Reload {
        #[serde(default)]
        user: Option<String>,
    },
    TriggerRun {
        #[serde(default)]
        user: Option<String>,
        name: String,
        #[serde(default)]
        data: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    SetNextRunTime {
        #[serde(default)]
        user: Option<String>,
        name: String,
        ts: i64,
        #[serde(default)]
        password: Option<String>,
    },
    TestNotifications {
        #[serde(default)]
        user: Option<String>,
        name: String,
    },
    SuspendSchedule {
        #[serde(default)]
        user: Option<String>,
        name: String,
        /// Unix timestamp the suspension lapses at; 0 resumes now.
        until: i64,
        /// Silently skip occurrences that elapse while suspended.
        #[serde(default)]
        skip_missed: bool,
    },
    GetRunOutput {
        #[serde(default)]
        user: Option<String>,
        name: String,
        /// Fetch the error copy instead of the last normal output.
        #[serde(default)]
        error: bool,
        /// Fetch the ad-hoc run copy.
        #[serde(default)]
        triggered: bool,
        /// Keep following a currently running job.
        #[serde(default)]
        stream: bool,
    },
    AttachProcess {
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        job: Option<u64>,
        /// Attach to this many future runs instead of a current one.
        #[serde(default)]
        future_attach: Option<u32>,
    },
    DetachProcess {
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        job: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_tag_dispatch() {
        let req: ClientRequest =
            serde_json::from_str(r#"{"action":"get_server_info"}"#).unwrap();
        assert!(matches!(req, ClientRequest::GetServerInfo));

        let req: ClientRequest = serde_json::from_str(
            r#"{"action":"trigger_run","name":"backup","data":"full"}"#,
        )
        .unwrap();
        match req {
            ClientRequest::TriggerRun { name, data, .. } => {
                assert_eq!(name, "backup");
                assert_eq!(data.as_deref(), Some("full"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_action_is_an_error() {
        assert!(serde_json::from_str::<ClientRequest>(r#"{"action":"format_disk"}"#).is_err());
        assert!(serde_json::from_str::<ClientRequest>(r#"{"no_action":true}"#).is_err());
    }
}
