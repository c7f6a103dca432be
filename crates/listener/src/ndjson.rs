//! Newline-delimited JSON delivery stream.

use std::path::Path;

use async_trait::async_trait;
use pipeline::{Delivery, DeliveryId, EventSource, MalformedEvent, Timestamp};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, error};

#[derive(Deserialize)]
struct Envelope {
    delivery_id: Option<String>,
    event: Option<String>,
    payload: Option<serde_json::Value>,
    received_at: Option<String>,
}

/// [`EventSource`] over NDJSON lines. Blank lines are skipped; the stream
/// ends at EOF or on the first read error.
pub struct NdjsonEventSource<R> {
    lines: Lines<R>,
    line_no: u64,
}

impl<R> NdjsonEventSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

impl NdjsonEventSource<BufReader<tokio::fs::File>> {
    /// Opens a replay file.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl NdjsonEventSource<BufReader<tokio::io::Stdin>> {
    /// Reads deliveries from standard input.
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

fn frame(line_no: u64, line: &str) -> Result<Delivery, MalformedEvent> {
    let envelope: Envelope = serde_json::from_str(line)
        .map_err(|e| MalformedEvent::invalid(format!("line {line_no}"), e.to_string()))?;

    let delivery_id = envelope
        .delivery_id
        .and_then(DeliveryId::new)
        .ok_or_else(|| MalformedEvent::missing("delivery_id"))?;
    let event = envelope
        .event
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| MalformedEvent::missing("event"))?;
    let payload = envelope
        .payload
        .filter(|p| p.is_object())
        .ok_or_else(|| MalformedEvent::missing("payload"))?;

    let mut delivery = Delivery::new(delivery_id, event, payload);
    if let Some(raw) = envelope.received_at {
        delivery.received_at = Timestamp::parse_rfc3339(&raw).ok_or_else(|| {
            MalformedEvent::invalid("received_at", format!("'{raw}' is not an RFC 3339 timestamp"))
        })?;
    }
    Ok(delivery)
}

#[async_trait]
impl<R> EventSource for NdjsonEventSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_delivery(&mut self) -> Option<Result<Delivery, MalformedEvent>> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!(lines = self.line_no, "Delivery stream ended");
                    return None;
                }
                Err(e) => {
                    error!(error = %e, line = self.line_no + 1, "Failed to read delivery stream");
                    return None;
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(frame(self.line_no, &line));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(input: &'static str) -> NdjsonEventSource<BufReader<&'static [u8]>> {
        NdjsonEventSource::new(BufReader::new(input.as_bytes()))
    }

    #[tokio::test]
    async fn reads_envelopes_and_skips_blank_lines() {
        let mut src = source(concat!(
            r#"{"delivery_id":"abc-1","event":"pull_request","payload":{"action":"opened"}}"#,
            "\n\n",
            r#"{"delivery_id":"abc-2","event":"push","payload":{},"received_at":"2026-01-02T03:04:05Z"}"#,
            "\n"
        ));

        let first = src.next_delivery().await.unwrap().unwrap();
        assert_eq!(first.delivery_id.as_str(), "abc-1");
        assert_eq!(first.action(), Some("opened"));

        let second = src.next_delivery().await.unwrap().unwrap();
        assert_eq!(second.event, "push");
        assert_eq!(
            second.received_at,
            Timestamp::parse_rfc3339("2026-01-02T03:04:05Z").unwrap()
        );

        assert!(src.next_delivery().await.is_none());
    }

    #[tokio::test]
    async fn bad_lines_are_reported_and_the_stream_continues() {
        let mut src = source(concat!(
            "not json\n",
            r#"{"event":"push","payload":{}}"#,
            "\n",
            r#"{"delivery_id":"abc-3","event":"push","payload":{}}"#,
            "\n"
        ));

        let err = src.next_delivery().await.unwrap().unwrap_err();
        assert_eq!(err.field, "line 1");
        let err = src.next_delivery().await.unwrap().unwrap_err();
        assert_eq!(err, MalformedEvent::missing("delivery_id"));
        let ok = src.next_delivery().await.unwrap().unwrap();
        assert_eq!(ok.delivery_id.as_str(), "abc-3");
    }

    #[tokio::test]
    async fn replays_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.ndjson");
        std::fs::write(
            &path,
            "{\"delivery_id\":\"abc-1\",\"event\":\"release\",\"payload\":{}}\n",
        )
        .unwrap();

        let mut src = NdjsonEventSource::open(&path).await.unwrap();
        assert_eq!(
            src.next_delivery().await.unwrap().unwrap().event,
            "release"
        );
        assert!(src.next_delivery().await.is_none());
    }
}
