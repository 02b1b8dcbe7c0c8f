//! Server-sent-event wire framing (spec §6, §10.6). Pure string formatting —
//! no socket code lives in this crate; an external HTTP layer is responsible
//! for writing the frames this module produces onto a connection.

use serde::Serialize;

/// One `event: <name>\ndata: <json>\n\n` frame. `id` is optional per the SSE
/// spec and is only set when the caller wants clients to resume with
/// `Last-Event-ID`.
pub fn encode_event<T: Serialize>(event: &str, payload: &T, id: Option<&str>) -> Result<String, serde_json::Error> {
    let data = serde_json::to_string(payload)?;
    let mut frame = String::new();
    if let Some(id) = id {
        frame.push_str("id: ");
        frame.push_str(id);
        frame.push('\n');
    }
    frame.push_str("event: ");
    frame.push_str(event);
    frame.push('\n');
    for line in data.split('\n') {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    Ok(frame)
}

/// A `: <comment>\n\n` keep-alive frame, sent periodically so idle SSE
/// connections aren't reaped by intermediate proxies.
pub fn encode_keepalive(comment: &str) -> String {
    format!(": {}\n\n", comment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NodeUpdateEvent;
    use crate::enums::NodeStatus;
    use chrono::Utc;

    #[test]
    fn encodes_a_single_line_json_frame() {
        let event = NodeUpdateEvent {
            node_id: "node-1".into(),
            status: NodeStatus::Online,
            metrics: Default::default(),
            updated_at: Utc::now(),
        };
        let frame = encode_event("node_update", &event, None).unwrap();
        assert!(frame.starts_with("event: node_update\n"));
        assert!(frame.contains("data: {"));
        assert!(frame.ends_with("\n\n"));
        assert!(!frame.contains("id: "));
    }

    #[test]
    fn includes_id_when_given() {
        let frame = encode_event("ping", &serde_json::json!({}), Some("42")).unwrap();
        assert!(frame.starts_with("id: 42\n"));
    }

    #[test]
    fn keepalive_is_a_comment_frame() {
        let frame = encode_keepalive("keepalive");
        assert_eq!(frame, ": keepalive\n\n");
    }
}
