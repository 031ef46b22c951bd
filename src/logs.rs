//! Console log tail for an instance.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::engine::ContainerEngine;
use crate::error::{ManagerError, Result};
use crate::lifecycle::engine_error;
use crate::registry::Registry;

/// Lines fetched when the caller does not say.
pub const DEFAULT_TAIL_LINES: usize = 100;

static LEADING_CONTROL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\x00-\x1F\x7F-\x9F]+").expect("static control-char pattern is valid")
});

/// One normalised console record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    /// Engine-assigned timestamp, when one was present and parseable.
    pub timestamp: Option<DateTime<Utc>>,
    pub message: String,
}

/// Reads instance logs straight from the engine.
pub struct LogReader {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<Registry>,
}

impl LogReader {
    pub fn new(engine: Arc<dyn ContainerEngine>, registry: Arc<Registry>) -> Self {
        Self { engine, registry }
    }

    /// Up to `max_lines` most recent lines, oldest first, with engine
    /// framing and timestamps stripped.
    pub async fn tail(&self, id: &str, max_lines: usize) -> Result<Vec<String>> {
        Ok(self
            .tail_records(id, max_lines)
            .await?
            .into_iter()
            .map(|r| r.message)
            .collect())
    }

    /// Like [`tail`](Self::tail) but keeps the engine timestamp.
    pub async fn tail_records(&self, id: &str, max_lines: usize) -> Result<Vec<LogRecord>> {
        let (container_id, label) = match self.registry.resolve(id).await? {
            Some(instance) if instance.is_active() => (instance.id, instance.name),
            Some(_) => return Err(ManagerError::instance_not_found(id)),
            None => (id.to_string(), id.to_string()),
        };

        let raw = self
            .engine
            .stream_logs(&container_id, max_lines, true)
            .await
            .map_err(|e| engine_error("logs", &label, e))?;

        let mut records = parse_records(&raw);
        if records.len() > max_lines {
            records.drain(..records.len() - max_lines);
        }
        Ok(records)
    }
}

/// Split an engine log payload into records.
pub fn parse_records(raw: &[u8]) -> Vec<LogRecord> {
    let text = String::from_utf8_lossy(&demux(raw)).into_owned();
    text.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .map(normalise)
        .filter(|r| !(r.message.is_empty() && r.timestamp.is_none()))
        .collect()
}

/// Strip the 8-byte multiplexing headers (stream type, three zero bytes,
/// big-endian length) if the payload uses them. TTY output is returned as is.
fn demux(raw: &[u8]) -> Vec<u8> {
    if !looks_framed(raw) {
        return raw.to_vec();
    }
    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;
    while looks_framed(rest) {
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = (8 + len).min(rest.len());
        out.extend_from_slice(&rest[8..end]);
        rest = &rest[end..];
    }
    out.extend_from_slice(rest);
    out
}

fn looks_framed(raw: &[u8]) -> bool {
    raw.len() >= 8 && raw[0] <= 2 && raw[1..4] == [0, 0, 0]
}

fn normalise(line: &str) -> LogRecord {
    let line = LEADING_CONTROL.replace(line, "");
    if let Some((first, rest)) = line.split_once(' ')
        && let Ok(ts) = DateTime::parse_from_rfc3339(first)
    {
        return LogRecord {
            timestamp: Some(ts.with_timezone(&Utc)),
            message: rest.to_string(),
        };
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(&line) {
        return LogRecord {
            timestamp: Some(ts.with_timezone(&Utc)),
            message: String::new(),
        };
    }
    LogRecord {
        timestamp: None,
        message: line.into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use crate::engine::EngineOp;
    use crate::error::EngineError;
    use crate::testing::TestHarness;

    fn framed(stream: u8, payload: &str) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload.as_bytes());
        out
    }

    #[test]
    fn test_parse_multiplexed_with_timestamps() {
        let mut raw = framed(1, "2025-03-01T10:00:00.000000001Z [Server] Starting\n");
        raw.extend(framed(2, "2025-03-01T10:00:01Z Done (3.2s)!\n"));

        let records = parse_records(&raw);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "[Server] Starting");
        assert_eq!(records[1].message, "Done (3.2s)!");
        assert!(records[0].timestamp.unwrap() < records[1].timestamp.unwrap());
    }

    #[test]
    fn test_parse_tty_output_strips_control_prefix() {
        let raw = b"\x1b\x07hello\r\n\x01plain line\n";
        let messages: Vec<String> = parse_records(raw).into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["hello".to_string(), "plain line".to_string()]);
    }

    #[test]
    fn test_message_without_timestamp_kept_whole() {
        let records = parse_records(b"not-a-time but text\n");
        assert_eq!(records[0].timestamp, None);
        assert_eq!(records[0].message, "not-a-time but text");
    }

    #[tokio::test]
    async fn test_tail_oldest_first_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let h = TestHarness::new(dir.path());
        let instance = h
            .lifecycle
            .create("alpha", None, &HashMap::new())
            .await
            .unwrap();
        for i in 0..5 {
            h.engine.push_log(&instance.id, &format!("line {}", i));
        }

        let lines = h.logs.tail("alpha", 3).await.unwrap();
        assert_eq!(lines, vec!["line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn test_tail_missing_container() {
        let dir = tempfile::tempdir().unwrap();
        let h = TestHarness::new(dir.path());
        let instance = h
            .lifecycle
            .create("alpha", None, &HashMap::new())
            .await
            .unwrap();
        h.engine.forget_container(&instance.id);

        let err = h.logs.tail("alpha", 10).await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound { .. }));

        h.engine.fail_next(
            EngineOp::Logs,
            EngineError::Unavailable {
                reason: "socket closed".to_string(),
            },
        );
        let err = h.logs.tail("ghost", 10).await.unwrap_err();
        assert!(matches!(err, ManagerError::EngineUnavailable { .. }));
    }
}
