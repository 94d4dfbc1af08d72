//! The response stream's line protocol.
//!
//! The body is newline-delimited frames of the form `<code>:<json>`:
//!
//! - `a0:` a JSON string holding a text delta
//! - `a2:` an array of objects; either a heartbeat or generated images
//! - `ad:` the terminal object with finish reason and usage
//! - `a3:` an explicit error payload
//!
//! Unknown prefixes and blank lines are ignored.

use serde_json::Value;

use arena_core::events::Usage;
use arena_core::{ArenaError, Result};

/// The exact keepalive line. Compared literally, not structurally.
const HEARTBEAT_LINE: &str = r#"a2:[{"type":"heartbeat"}]"#;

/// Sentinel delta value signalling a service-side failure.
const ERROR_SENTINEL: &str = "hasArenaError";

/// One decoded frame. The terminal frame carries no conversation id; the
/// engine owns that.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// Incremental text.
    Text(String),
    /// Generated image URLs.
    Images(Vec<String>),
    /// Terminal frame.
    Finish {
        /// Finish reason, when reported.
        finish_reason: Option<String>,
        /// Token usage, when reported.
        usage: Option<Usage>,
    },
}

/// Parse a frame payload. A payload that fails to parse is a protocol
/// violation, not a serialization problem on our side.
fn frame_json(code: &str, payload: &str) -> Result<Value> {
    serde_json::from_str(payload)
        .map_err(|e| ArenaError::Protocol(format!("malformed {code} frame: {e}")))
}

/// Decode one line. `Ok(None)` means the line carries no event (blank,
/// heartbeat, unknown prefix, empty delta).
pub fn decode_frame(line: &str) -> Result<Option<Frame>> {
    if let Some(payload) = line.strip_prefix("a0:") {
        let chunk = frame_json("a0", payload)?;
        return match chunk.as_str() {
            Some(ERROR_SENTINEL) => Err(ArenaError::Protocol(
                "stream reported hasArenaError".into(),
            )),
            Some(text) if !text.is_empty() => Ok(Some(Frame::Text(text.to_string()))),
            _ => Ok(None),
        };
    }

    if line.starts_with("a2:") {
        if line == HEARTBEAT_LINE {
            return Ok(None);
        }
        let payload = &line[3..];
        let items = frame_json("a2", payload)?;
        let urls: Vec<String> = items
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|item| item.get("image")?.as_str())
                    .filter(|url| !url.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        return Ok(if urls.is_empty() {
            None
        } else {
            Some(Frame::Images(urls))
        });
    }

    if let Some(payload) = line.strip_prefix("ad:") {
        let finish = frame_json("ad", payload)?;
        let finish_reason = finish
            .get("finishReason")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let usage = finish.get("usage").and_then(Usage::from_wire);
        return Ok(Some(Frame::Finish {
            finish_reason,
            usage,
        }));
    }

    if let Some(payload) = line.strip_prefix("a3:") {
        return Err(ArenaError::Protocol(format!("stream error: {payload}")));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn text_delta_round_trip() {
        assert_eq!(
            decode_frame(r#"a0:"Hello, ""#).unwrap(),
            Some(Frame::Text("Hello, ".to_string()))
        );
    }

    #[test]
    fn empty_delta_yields_nothing() {
        assert_eq!(decode_frame(r#"a0:"""#).unwrap(), None);
    }

    #[test]
    fn error_sentinel_in_delta_is_protocol_error() {
        assert_matches!(
            decode_frame(r#"a0:"hasArenaError""#),
            Err(ArenaError::Protocol(_))
        );
    }

    #[test]
    fn heartbeat_yields_nothing() {
        assert_eq!(decode_frame(r#"a2:[{"type":"heartbeat"}]"#).unwrap(), None);
    }

    #[test]
    fn image_batch_collects_urls() {
        let line = r#"a2:[{"image":"https://img.test/a.png"},{"other":1},{"image":"https://img.test/b.png"}]"#;
        assert_eq!(
            decode_frame(line).unwrap(),
            Some(Frame::Images(vec![
                "https://img.test/a.png".to_string(),
                "https://img.test/b.png".to_string(),
            ]))
        );
    }

    #[test]
    fn image_array_without_urls_yields_nothing() {
        assert_eq!(decode_frame(r#"a2:[{"type":"status"}]"#).unwrap(), None);
    }

    #[test]
    fn finish_frame_with_usage() {
        let line = r#"ad:{"finishReason":"stop","usage":{"promptTokens":3,"completionTokens":4}}"#;
        let frame = decode_frame(line).unwrap().unwrap();
        assert_matches!(frame, Frame::Finish { ref finish_reason, usage: Some(usage) } => {
            assert_eq!(finish_reason.as_deref(), Some("stop"));
            assert_eq!(usage.total_tokens, 7);
        });
    }

    #[test]
    fn finish_frame_without_usage() {
        let frame = decode_frame(r#"ad:{"finishReason":"stop"}"#).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Finish {
                finish_reason: Some("stop".to_string()),
                usage: None,
            }
        );
    }

    #[test]
    fn explicit_error_frame() {
        assert_matches!(
            decode_frame(r#"a3:{"message":"boom"}"#),
            Err(ArenaError::Protocol(_))
        );
    }

    #[test]
    fn unknown_prefixes_are_ignored() {
        assert_eq!(decode_frame("b7:whatever").unwrap(), None);
        assert_eq!(decode_frame("").unwrap(), None);
        assert_eq!(decode_frame("f:{}").unwrap(), None);
    }

    #[test]
    fn malformed_json_is_a_protocol_error() {
        assert_matches!(decode_frame("a0:not-json"), Err(ArenaError::Protocol(_)));
        assert_matches!(decode_frame("a2:[{broken"), Err(ArenaError::Protocol(_)));
        assert_matches!(decode_frame("ad:{broken"), Err(ArenaError::Protocol(_)));
    }
}
