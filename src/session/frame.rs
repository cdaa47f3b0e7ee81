//! Outbound SSE frame encoding.

use futures_util::{Stream, StreamExt};

use crate::Result;
use crate::types::StreamEvent;

/// Encode one event as an SSE frame: `data: <json>\n\n`.
pub fn encode_frame(event: &StreamEvent) -> Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(event)?))
}

/// A standalone `error` frame, for requests rejected before a session opens.
pub fn error_frame(message: &str) -> String {
    encode_frame(&StreamEvent::error(message)).unwrap_or_else(|_| {
        // Only reachable if serialising a plain string fails.
        "data: {\"type\":\"error\",\"message\":\"internal error\",\"timestamp\":0}\n\n".to_string()
    })
}

/// Encode a stream of events into SSE frames.
pub fn sse_frames<S>(events: S) -> impl Stream<Item = String> + Send
where
    S: Stream<Item = StreamEvent> + Send,
{
    events.map(|event| encode_frame(&event).unwrap_or_else(|e| error_frame(&e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_data_line_with_blank_terminator() {
        let frame = encode_frame(&StreamEvent::Heartbeat { timestamp: 7 }).unwrap();
        assert_eq!(frame, "data: {\"type\":\"heartbeat\",\"timestamp\":7}\n\n");
    }

    #[test]
    fn error_frame_is_parseable() {
        let frame = error_frame("server busy");
        let body = frame
            .strip_prefix("data: ")
            .and_then(|f| f.strip_suffix("\n\n"))
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "server busy");
    }

    #[tokio::test]
    async fn sse_frames_preserves_order() {
        let events = futures_util::stream::iter(vec![
            StreamEvent::Token {
                content: "a".into(),
                timestamp: 1,
            },
            StreamEvent::Token {
                content: "b".into(),
                timestamp: 2,
            },
        ]);
        let frames: Vec<String> = sse_frames(events).collect().await;
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("\"content\":\"a\""));
        assert!(frames[1].contains("\"content\":\"b\""));
    }
}
