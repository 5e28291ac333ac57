//! Wire format helpers.
//!
//! One JSON object per line; requests carry an `action` field, responses a
//! `success` field. Anything that fails to decode is reported as `None` and
//! the dispatcher revokes the connection.

use chronod_sched::ClientRequest;

/// Decode one request line. Empty lines are ignored by the caller; anything
/// else either parses or costs the client its access.
pub fn decode_line(line: &str) -> Option<ClientRequest> {
    serde_json::from_str(line).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_valid_actions() {
        assert!(matches!(
            decode_line(r#"{"action":"get_server_info"}"#),
            Some(ClientRequest::GetServerInfo)
        ));
        assert!(matches!(
            decode_line(r#"{"action":"suspend_schedule","name":"backup","until":0}"#),
            Some(ClientRequest::SuspendSchedule { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_line("not json").is_none());
        assert!(decode_line(r#"{"action":"rm_rf"}"#).is_none());
        assert!(decode_line(r#"{"name":"backup"}"#).is_none());
    }
}
