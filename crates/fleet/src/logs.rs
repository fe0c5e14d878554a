//! Build-log buffering and live streaming.
//!
//! Each build job owns a [`LogBuffer`]. The executor appends timestamped
//! lines; subscribers get the full back-log and then live lines over a
//! bounded broadcast channel. Back-pressure is per subscriber: a reader
//! that falls more than the channel capacity behind is dropped, never the
//! writer.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Live-stream capacity per subscriber before it is dropped as too slow.
const STREAM_CAPACITY: usize = 256;

/// One timestamped log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub line: String,
}

/// Append-only log of one build, with live subscribers.
pub struct LogBuffer {
    lines: Mutex<Vec<LogLine>>,
    live: broadcast::Sender<LogLine>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBuffer {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            lines: Mutex::new(Vec::new()),
            live,
        }
    }

    /// Append a line, stamping it now. Lines within one buffer observe
    /// insertion order.
    pub fn append(&self, line: impl Into<String>) {
        let entry = LogLine {
            at: Utc::now(),
            line: line.into(),
        };
        // The lock is held across the send so a subscriber created in
        // `subscribe` can never miss a line between back-log and live.
        let mut lines = self.lines.lock().expect("log lock");
        lines.push(entry.clone());
        let _ = self.live.send(entry);
    }

    /// Append every line of a multi-line chunk.
    pub fn append_block(&self, block: &str) {
        for line in block.lines() {
            if !line.is_empty() {
                self.append(line);
            }
        }
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().expect("log lock").clone()
    }

    pub fn tail(&self, count: usize) -> Vec<String> {
        let lines = self.lines.lock().expect("log lock");
        lines
            .iter()
            .rev()
            .take(count)
            .rev()
            .map(|l| l.line.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().expect("log lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe: back-log first, then live lines.
    pub fn subscribe(&self) -> LogStream {
        let lines = self.lines.lock().expect("log lock");
        let receiver = self.live.subscribe();
        LogStream {
            backlog: lines.iter().cloned().collect(),
            receiver,
            dropped: false,
        }
    }
}

/// A subscriber's view of a log: back-log, then live.
pub struct LogStream {
    backlog: VecDeque<LogLine>,
    receiver: broadcast::Receiver<LogLine>,
    dropped: bool,
}

impl LogStream {
    /// Next line, or `None` when the writer is gone or this subscriber
    /// fell too far behind and was dropped.
    pub async fn next(&mut self) -> Option<LogLine> {
        if let Some(line) = self.backlog.pop_front() {
            return Some(line);
        }
        if self.dropped {
            return None;
        }
        match self.receiver.recv().await {
            Ok(line) => Some(line),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "log subscriber lagged; dropping it");
                self.dropped = true;
                None
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Drain whatever is immediately available.
    pub fn drain_ready(&mut self) -> Vec<LogLine> {
        let mut out: Vec<LogLine> = self.backlog.drain(..).collect();
        while let Ok(line) = self.receiver.try_recv() {
            out.push(line);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_tail() {
        let buffer = LogBuffer::new();
        buffer.append("cloning repository");
        buffer.append("configuring defconfig");
        buffer.append("make -j7");

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.tail(2), vec!["configuring defconfig", "make -j7"]);
    }

    #[tokio::test]
    async fn subscriber_sees_backlog_then_live() {
        let buffer = LogBuffer::new();
        buffer.append("line 1");
        buffer.append("line 2");

        let mut stream = buffer.subscribe();
        buffer.append("line 3");

        assert_eq!(stream.next().await.expect("line").line, "line 1");
        assert_eq!(stream.next().await.expect("line").line, "line 2");
        assert_eq!(stream.next().await.expect("line").line, "line 3");
    }

    #[tokio::test]
    async fn lines_are_in_monotone_order() {
        let buffer = LogBuffer::new();
        for i in 0..100 {
            buffer.append(format!("line {}", i));
        }
        let lines = buffer.lines();
        for window in lines.windows(2) {
            assert!(window[0].at <= window[1].at);
        }
        assert_eq!(lines[99].line, "line 99");
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_not_the_writer() {
        let buffer = LogBuffer::new();
        let mut stream = buffer.subscribe();

        // Overflow the live channel while the subscriber sleeps.
        for i in 0..(STREAM_CAPACITY + 50) {
            buffer.append(format!("line {}", i));
        }

        // The writer was never blocked.
        assert_eq!(buffer.len(), STREAM_CAPACITY + 50);

        // The lagged subscriber is dropped after the (empty) backlog.
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn append_block_splits_lines() {
        let buffer = LogBuffer::new();
        buffer.append_block("first\nsecond\n\nthird\n");
        assert_eq!(buffer.len(), 3);
    }

    #[tokio::test]
    async fn drain_ready_collects_available_lines() {
        let buffer = LogBuffer::new();
        buffer.append("a");
        let mut stream = buffer.subscribe();
        buffer.append("b");
        let drained = stream.drain_ready();
        assert_eq!(
            drained.iter().map(|l| l.line.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }
}
