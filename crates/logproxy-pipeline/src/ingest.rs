//! Line reader feeding the event bus.

use std::io;

use chrono::{DateTime, Utc};
use logproxy_core::config::IngestConfig;
use logproxy_core::LogEvent;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{error, info, warn};

use crate::bus::Publisher;

/// Why ingestion stopped.
#[derive(Debug)]
pub enum IngestEnd {
    EndOfInput,
    ReadError(io::Error),
    /// The broadcaster side of the bus went away.
    BusClosed,
}

#[derive(Debug)]
pub struct IngestReport {
    pub lines: u64,
    pub truncated: u64,
    pub end: IngestEnd,
}

/// Reads records from `reader` and publishes one [`LogEvent`] per line.
///
/// The publisher is closed exactly once, when [`Ingestor::run`] returns.
pub struct Ingestor<R> {
    reader: R,
    publisher: Publisher,
    max_line_bytes: usize,
    echo: bool,
    last_timestamp: Option<DateTime<Utc>>,
}

impl<R: AsyncBufRead + Unpin> Ingestor<R> {
    pub fn new(reader: R, publisher: Publisher, config: &IngestConfig) -> Self {
        Self {
            reader,
            publisher,
            max_line_bytes: config.max_line_bytes.max(1),
            echo: config.echo,
            last_timestamp: None,
        }
    }

    /// Run until end of input, a read error, or the bus closing. Never
    /// restarts the read loop.
    pub async fn run(mut self) -> IngestReport {
        let mut buf = Vec::with_capacity(256);
        let mut lines = 0u64;
        let mut truncated = 0u64;

        let end = loop {
            buf.clear();
            // One spare byte so a CR right before the newline never counts
            // against the limit.
            let keep = self.max_line_bytes.saturating_add(1);
            let mut was_truncated = match read_record(&mut self.reader, &mut buf, keep).await {
                Ok(Some(was_truncated)) => was_truncated,
                Ok(None) => break IngestEnd::EndOfInput,
                Err(e) => {
                    error!(error = %e, "failed to read input, closing event bus");
                    break IngestEnd::ReadError(e);
                }
            };

            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            if buf.len() > self.max_line_bytes {
                buf.truncate(self.max_line_bytes);
                was_truncated = true;
            }
            if was_truncated {
                truncated += 1;
                warn!(
                    limit = self.max_line_bytes,
                    "input line exceeds limit, remainder discarded"
                );
            }

            let text = String::from_utf8_lossy(&buf).into_owned();
            if self.echo {
                info!(target: "logproxy::stdin", "{text}");
            }

            let event = LogEvent::at(self.stamp(), text);
            if self.publisher.publish(event).await.is_err() {
                warn!("event bus closed by receiver, stopping ingestion");
                break IngestEnd::BusClosed;
            }
            lines += 1;
        };

        self.publisher.close();
        match &end {
            IngestEnd::EndOfInput => info!(lines, truncated, "end of input, event bus closed"),
            IngestEnd::ReadError(_) | IngestEnd::BusClosed => {
                info!(lines, truncated, "ingestion stopped")
            }
        }

        IngestReport {
            lines,
            truncated,
            end,
        }
    }

    /// Wall clock, clamped so timestamps never go backwards.
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }
}

/// Read one newline-terminated record into `buf`, keeping at most `max`
/// bytes. Bytes past the cap are consumed and discarded.
///
/// Returns `None` at end of input with nothing read, otherwise whether the
/// record was truncated. The trailing `\n` is not stored.
async fn read_record<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> io::Result<Option<bool>> {
    let mut truncated = false;
    let mut read_any = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read_any.then_some(truncated));
        }
        read_any = true;

        let newline = available.iter().position(|&b| b == b'\n');
        let line_len = newline.unwrap_or(available.len());
        let take = line_len.min(max.saturating_sub(buf.len()));
        buf.extend_from_slice(&available[..take]);
        truncated |= take < line_len;

        match newline {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(Some(truncated));
            }
            None => reader.consume(line_len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{self, BusReceiver};

    fn config(max_line_bytes: usize) -> IngestConfig {
        IngestConfig {
            max_line_bytes,
            echo: false,
        }
    }

    async fn collect(rx: &mut BusReceiver) -> Vec<LogEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn texts(events: &[LogEvent]) -> Vec<&str> {
        events.iter().map(|e| e.text.as_str()).collect()
    }

    #[tokio::test]
    async fn every_line_becomes_an_event_including_empty_ones() {
        let (publisher, mut rx) = bus::channel(16);
        let input: &[u8] = b"first\n\nwindows\r\nno newline at end";

        let report = Ingestor::new(input, publisher, &config(1024)).run().await;

        assert_eq!(report.lines, 4);
        assert!(matches!(report.end, IngestEnd::EndOfInput));
        let events = collect(&mut rx).await;
        assert_eq!(texts(&events), ["first", "", "windows", "no newline at end"]);
        assert!(events
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_fatal() {
        let (publisher, mut rx) = bus::channel(16);
        let input: &[u8] = b"ok \xff\xfe end\nnext\n";

        let report = Ingestor::new(input, publisher, &config(1024)).run().await;

        assert_eq!(report.lines, 2);
        let events = collect(&mut rx).await;
        assert_eq!(events[0].text, "ok \u{FFFD}\u{FFFD} end");
        assert_eq!(events[1].text, "next");
    }

    #[tokio::test]
    async fn oversized_lines_are_truncated_and_the_rest_skipped() {
        let (publisher, mut rx) = bus::channel(16);
        let input: &[u8] = b"abcdefghij\nxy\n";

        let report = Ingestor::new(input, publisher, &config(4)).run().await;

        assert_eq!(report.lines, 2);
        assert_eq!(report.truncated, 1);
        let events = collect(&mut rx).await;
        assert_eq!(texts(&events), ["abcd", "xy"]);
    }

    #[tokio::test]
    async fn crlf_line_exactly_at_limit_is_not_truncated() {
        let (publisher, mut rx) = bus::channel(16);
        let input: &[u8] = b"abc\r\nabcd\r\n";

        let report = Ingestor::new(input, publisher, &config(3)).run().await;

        assert_eq!(report.lines, 2);
        assert_eq!(report.truncated, 1);
        let events = collect(&mut rx).await;
        assert_eq!(texts(&events), ["abc", "abc"]);
    }

    #[tokio::test]
    async fn truncation_spans_reader_buffer_boundaries() {
        let (publisher, mut rx) = bus::channel(16);
        let long = "z".repeat(10_000);
        let data = format!("{long}\ntail\n");
        let reader = tokio::io::BufReader::with_capacity(64, data.as_bytes());

        let report = Ingestor::new(reader, publisher, &config(100)).run().await;

        assert_eq!(report.truncated, 1);
        let events = collect(&mut rx).await;
        assert_eq!(events[0].text.len(), 100);
        assert_eq!(events[1].text, "tail");
    }

    #[tokio::test]
    async fn read_error_closes_the_bus_after_publishing_what_was_read() {
        let (publisher, mut rx) = bus::channel(16);
        let mock = tokio_test::io::Builder::new()
            .read(b"before\n")
            .read_error(io::Error::new(io::ErrorKind::Other, "device gone"))
            .build();
        let reader = tokio::io::BufReader::new(mock);

        let report = Ingestor::new(reader, publisher, &config(1024)).run().await;

        assert_eq!(report.lines, 1);
        match report.end {
            IngestEnd::ReadError(e) => assert_eq!(e.to_string(), "device gone"),
            other => panic!("expected read error, got {other:?}"),
        }
        let events = collect(&mut rx).await;
        assert_eq!(texts(&events), ["before"]);
    }

    #[tokio::test]
    async fn stops_when_receiver_is_gone() {
        let (publisher, rx) = bus::channel(1);
        drop(rx);
        let input: &[u8] = b"nobody listening\n";

        let report = Ingestor::new(input, publisher, &config(1024)).run().await;

        assert_eq!(report.lines, 0);
        assert!(matches!(report.end, IngestEnd::BusClosed));
    }

    #[tokio::test]
    async fn empty_input_closes_immediately() {
        let (publisher, mut rx) = bus::channel(1);
        let input: &[u8] = b"";

        let report = Ingestor::new(input, publisher, &config(1024)).run().await;

        assert_eq!(report.lines, 0);
        assert!(rx.recv().await.is_none());
    }
}
