//! Live log fan-out for deployments.
//!
//! Each deployment keeps an append-only bounded buffer of lines plus a set
//! of live subscribers, each with its own bounded queue. Producers never
//! wait: a subscriber that falls behind past its queue capacity is dropped
//! rather than stalling the pipeline.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Extra queue slots beyond the replay buffer, so a fresh subscriber always
/// has room for the full replay plus a burst of live lines.
const SUBSCRIBER_HEADROOM: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    Line(String),
    /// The deployment reached a state after which no more lines will come.
    Closed,
}

struct DeploymentLog {
    buffer: VecDeque<String>,
    subscribers: Vec<mpsc::Sender<LogEvent>>,
    closed: bool,
}

impl DeploymentLog {
    fn new() -> Self {
        Self {
            buffer: VecDeque::new(),
            subscribers: Vec::new(),
            closed: false,
        }
    }
}

pub struct LogBroadcaster {
    streams: Mutex<HashMap<i64, DeploymentLog>>,
    capacity: usize,
}

impl LogBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append a line and fan it out. Slow or gone subscribers are dropped
    /// inline; this never blocks.
    pub fn append(&self, deployment_id: i64, line: impl Into<String>) {
        let line = line.into();
        let mut streams = match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let log = streams.entry(deployment_id).or_insert_with(DeploymentLog::new);
        if log.buffer.len() == self.capacity {
            log.buffer.pop_front();
        }
        log.buffer.push_back(line.clone());
        log.subscribers
            .retain(|tx| tx.try_send(LogEvent::Line(line.clone())).is_ok());
    }

    /// Subscribe to a deployment's log stream. The current buffer contents
    /// are replayed immediately and in order, then live lines follow. For
    /// an already-closed deployment the replay ends with `Closed`.
    pub fn subscribe(&self, deployment_id: i64) -> mpsc::Receiver<LogEvent> {
        let (tx, rx) = mpsc::channel(self.capacity + SUBSCRIBER_HEADROOM);
        let mut streams = match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let log = streams.entry(deployment_id).or_insert_with(DeploymentLog::new);
        for line in &log.buffer {
            // Capacity covers the whole buffer; this cannot fail for a
            // fresh channel.
            let _ = tx.try_send(LogEvent::Line(line.clone()));
        }
        if log.closed {
            let _ = tx.try_send(LogEvent::Closed);
        } else {
            log.subscribers.push(tx);
        }
        rx
    }

    /// Mark a deployment's stream as finished and notify all subscribers.
    /// The buffer is retained so late subscribers still get a replay.
    pub fn close(&self, deployment_id: i64) {
        let mut streams = match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(log) = streams.get_mut(&deployment_id) {
            log.closed = true;
            for tx in log.subscribers.drain(..) {
                let _ = tx.try_send(LogEvent::Closed);
            }
        }
    }

    /// The last `n` buffered lines, newline-joined. Used to attach a log
    /// tail to failed deployment records.
    pub fn tail(&self, deployment_id: i64, n: usize) -> String {
        let streams = match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match streams.get(&deployment_id) {
            Some(log) => {
                let skip = log.buffer.len().saturating_sub(n);
                log.buffer
                    .iter()
                    .skip(skip)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            None => String::new(),
        }
    }

    /// Drop a deployment's buffer and subscriber list entirely.
    pub fn evict(&self, deployment_id: i64) {
        let mut streams = match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        streams.remove(&deployment_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::Receiver<LogEvent>) -> Vec<LogEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn subscribe_replays_buffer_before_live_lines() {
        let logs = LogBroadcaster::new(100);
        for i in 1..=5 {
            logs.append(1, format!("line {}", i));
        }
        let mut rx = logs.subscribe(1);
        logs.append(1, "line 6");

        let events = drain(&mut rx);
        let expected: Vec<LogEvent> = (1..=6)
            .map(|i| LogEvent::Line(format!("line {}", i)))
            .collect();
        assert_eq!(events, expected);
    }

    #[tokio::test]
    async fn buffer_evicts_oldest_lines_first() {
        let logs = LogBroadcaster::new(3);
        for i in 1..=5 {
            logs.append(1, format!("line {}", i));
        }
        let mut rx = logs.subscribe(1);
        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                LogEvent::Line("line 3".into()),
                LogEvent::Line("line 4".into()),
                LogEvent::Line("line 5".into()),
            ]
        );
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_not_awaited() {
        let logs = LogBroadcaster::new(4);
        let mut rx = logs.subscribe(1);
        // Fill well past the subscriber queue without ever receiving.
        for i in 0..(4 + SUBSCRIBER_HEADROOM + 10) {
            logs.append(1, format!("line {}", i));
        }
        // The producer never blocked; the receiver eventually sees a closed
        // channel because it was dropped from the subscriber list.
        let mut received = 0;
        loop {
            match rx.try_recv() {
                Ok(_) => received += 1,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
                Err(mpsc::error::TryRecvError::Empty) => panic!("sender should be gone"),
            }
        }
        assert_eq!(received, 4 + SUBSCRIBER_HEADROOM);
    }

    #[tokio::test]
    async fn close_notifies_live_subscribers() {
        let logs = LogBroadcaster::new(10);
        let mut rx = logs.subscribe(1);
        logs.append(1, "final line");
        logs.close(1);
        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![LogEvent::Line("final line".into()), LogEvent::Closed]
        );
    }

    #[tokio::test]
    async fn late_subscriber_to_closed_stream_gets_replay_then_closed() {
        let logs = LogBroadcaster::new(10);
        logs.append(1, "a");
        logs.append(1, "b");
        logs.close(1);
        let mut rx = logs.subscribe(1);
        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                LogEvent::Line("a".into()),
                LogEvent::Line("b".into()),
                LogEvent::Closed
            ]
        );
    }

    #[tokio::test]
    async fn tail_returns_last_n_lines() {
        let logs = LogBroadcaster::new(10);
        for i in 1..=5 {
            logs.append(1, format!("line {}", i));
        }
        assert_eq!(logs.tail(1, 2), "line 4\nline 5");
        assert_eq!(logs.tail(1, 100), "line 1\nline 2\nline 3\nline 4\nline 5");
        assert_eq!(logs.tail(99, 10), "");
    }

    #[tokio::test]
    async fn streams_are_isolated_per_deployment() {
        let logs = LogBroadcaster::new(10);
        logs.append(1, "one");
        logs.append(2, "two");
        let mut rx1 = logs.subscribe(1);
        let mut rx2 = logs.subscribe(2);
        assert_eq!(drain(&mut rx1), vec![LogEvent::Line("one".into())]);
        assert_eq!(drain(&mut rx2), vec![LogEvent::Line("two".into())]);
    }
}
