// events.rs — Run state-change notifications for presentation collaborators.
//
// Every run publishes what happens to it as a `RunEvent`. The `EventLog` is
// append-only and numbers events globally, so a dashboard can subscribe from
// any point, replay what it missed, and then follow live events without gaps
// or duplicates. Without a retention bound the in-memory history grows with
// every event; a long-lived process sets one with `with_retention` and relies
// on its sinks for the full record. Notification sinks (a JSONL log file, ...) see every event;
// a failing sink is logged and never affects a run.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use mesh_audit::{ApprovalDecision, RunState, StepKind, StepOutcome};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::error::RunError;

/// Capacity of the live channel; slower subscribers skip ahead.
const LIVE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum RunEvent {
    RunCreated {
        run_id: String,
        ticket_id: String,
        tenant: String,
        timestamp: DateTime<Utc>,
    },

    StateChanged {
        run_id: String,
        from: RunState,
        to: RunState,
        timestamp: DateTime<Utc>,
    },

    StepRecorded {
        run_id: String,
        seq: u64,
        label: String,
        kind: StepKind,
        outcome: StepOutcome,
        timestamp: DateTime<Utc>,
    },

    ApprovalRecorded {
        run_id: String,
        seq: u64,
        actor: String,
        decision: ApprovalDecision,
        timestamp: DateTime<Utc>,
    },

    RunSealed {
        run_id: String,
        terminal_state: RunState,
        final_hash: String,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::RunCreated { run_id, .. }
            | RunEvent::StateChanged { run_id, .. }
            | RunEvent::StepRecorded { run_id, .. }
            | RunEvent::ApprovalRecorded { run_id, .. }
            | RunEvent::RunSealed { run_id, .. } => run_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            RunEvent::RunCreated { .. } => "run_created",
            RunEvent::StateChanged { .. } => "state_changed",
            RunEvent::StepRecorded { .. } => "step_recorded",
            RunEvent::ApprovalRecorded { .. } => "approval_recorded",
            RunEvent::RunSealed { .. } => "run_sealed",
        }
    }
}

/// An event with its position in the global stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// Receives every published event.
pub trait NotificationSink: Send + Sync {
    /// Errors are logged by the event log and otherwise ignored.
    fn send(&self, event: &SequencedEvent) -> Result<(), RunError>;
}

/// Appends events as JSONL to a file.
pub struct LogSink {
    path: PathBuf,
}

impl LogSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl NotificationSink for LogSink {
    fn send(&self, event: &SequencedEvent) -> Result<(), RunError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| RunError::Io { path, source }
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err(&self.path))?;
        let json = serde_json::to_string(event)?;
        writeln!(file, "{}", json).map_err(io_err(&self.path))?;
        Ok(())
    }
}

/// Backlog from a starting point plus the live tail after it.
pub struct Subscription {
    pub backlog: Vec<SequencedEvent>,
    pub live: broadcast::Receiver<SequencedEvent>,
}

impl Subscription {
    /// Backlog followed by live events as one stream.
    ///
    /// A subscriber that falls more than the channel capacity behind skips
    /// the events it missed; it can fetch them again with
    /// [`EventLog::subscribe_from`].
    pub fn into_stream(self) -> impl Stream<Item = SequencedEvent> + Send + 'static {
        tokio_stream::iter(self.backlog).chain(BroadcastStream::new(self.live).filter_map(
            |item| match item {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(error = %e, "event subscriber lagged");
                    None
                }
            },
        ))
    }
}

struct History {
    events: VecDeque<SequencedEvent>,
    next_seq: u64,
}

/// Append-only, globally sequenced event stream.
///
/// History is kept in memory. By default nothing is dropped; with
/// [`with_retention`](Self::with_retention) only the most recent events are
/// kept, while sequence numbers keep counting from where they were.
pub struct EventLog {
    history: Mutex<History>,
    retention: Option<usize>,
    live: broadcast::Sender<SequencedEvent>,
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl EventLog {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            history: Mutex::new(History {
                events: VecDeque::new(),
                next_seq: 0,
            }),
            retention: None,
            live,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Keep at most `max_events` in memory, dropping the oldest first.
    pub fn with_retention(mut self, max_events: usize) -> Self {
        self.retention = Some(max_events.max(1));
        self
    }

    /// Append an event and return its sequence number.
    pub fn publish(&self, event: RunEvent) -> u64 {
        let sequenced = {
            let mut history = self.lock();
            let sequenced = SequencedEvent {
                seq: history.next_seq,
                event,
            };
            history.next_seq += 1;
            history.events.push_back(sequenced.clone());
            if let Some(max) = self.retention {
                while history.events.len() > max {
                    history.events.pop_front();
                }
            }
            // Sent under the lock so a concurrent subscriber sees each event
            // exactly once, either in its backlog or live.
            let _ = self.live.send(sequenced.clone());
            sequenced
        };
        for sink in &self.sinks {
            if let Err(e) = sink.send(&sequenced) {
                tracing::warn!("notification sink error: {}", e);
            }
        }
        sequenced.seq
    }

    /// Retained events with `seq >= from`, plus a receiver for everything
    /// after them.
    pub fn subscribe_from(&self, from: u64) -> Subscription {
        let history = self.lock();
        let live = self.live.subscribe();
        Subscription {
            backlog: history
                .events
                .iter()
                .filter(|e| e.seq >= from)
                .cloned()
                .collect(),
            live,
        }
    }

    /// Every retained event published for one run, in order.
    pub fn for_run(&self, run_id: &str) -> Vec<SequencedEvent> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.event.run_id() == run_id)
            .cloned()
            .collect()
    }

    /// Sequence number the next event will get.
    pub fn next_seq(&self) -> u64 {
        self.lock().next_seq
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn created(run_id: &str) -> RunEvent {
        RunEvent::RunCreated {
            run_id: run_id.to_string(),
            ticket_id: "ZD-1".to_string(),
            tenant: "acme".to_string(),
            timestamp: Utc::now(),
        }
    }

    fn changed(run_id: &str, from: RunState, to: RunState) -> RunEvent {
        RunEvent::StateChanged {
            run_id: run_id.to_string(),
            from,
            to,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn events_serialize_with_flat_type_tag() {
        let event = SequencedEvent {
            seq: 4,
            event: changed("r1", RunState::Created, RunState::Classifying),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event_type":"state_changed""#));
        assert!(json.contains(r#""seq":4"#));
        let back: SequencedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn publish_numbers_events_and_filters_by_run() {
        let log = EventLog::new();
        assert_eq!(log.publish(created("a")), 0);
        assert_eq!(log.publish(created("b")), 1);
        assert_eq!(log.publish(changed("a", RunState::Created, RunState::Classifying)), 2);
        let a: Vec<u64> = log.for_run("a").iter().map(|e| e.seq).collect();
        assert_eq!(a, vec![0, 2]);
        assert_eq!(log.len(), 3);
    }

    #[tokio::test]
    async fn subscriber_gets_backlog_then_live_events() {
        let log = EventLog::new();
        log.publish(created("a"));
        log.publish(created("b"));
        let subscription = log.subscribe_from(1);
        assert_eq!(subscription.backlog.len(), 1);

        let mut stream = Box::pin(subscription.into_stream());
        log.publish(changed("b", RunState::Created, RunState::Classifying));

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(second.event.event_type(), "state_changed");
    }

    #[test]
    fn subscribing_past_the_end_has_empty_backlog() {
        let log = EventLog::new();
        log.publish(created("a"));
        assert!(log.subscribe_from(99).backlog.is_empty());
    }

    #[test]
    fn log_sink_appends_every_event() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("events.jsonl");
        let log = EventLog::new().with_sink(Box::new(LogSink::new(&path)));
        log.publish(created("a"));
        log.publish(changed("a", RunState::Created, RunState::Classifying));

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("run_created"));
    }

    #[test]
    fn retention_drops_oldest_and_keeps_numbering() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = EventLog::new()
            .with_retention(2)
            .with_sink(Box::new(LogSink::new(&path)));
        for run in ["a", "b", "c", "d"] {
            log.publish(created(run));
        }

        assert_eq!(log.len(), 2);
        assert_eq!(log.next_seq(), 4);
        let backlog: Vec<u64> = log.subscribe_from(0).backlog.iter().map(|e| e.seq).collect();
        assert_eq!(backlog, vec![2, 3]);
        assert!(log.for_run("a").is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 4);
    }

    struct FailingSink;

    impl NotificationSink for FailingSink {
        fn send(&self, _event: &SequencedEvent) -> Result<(), RunError> {
            Err(RunError::TaskFailed("sink offline".into()))
        }
    }

    #[test]
    fn failing_sink_does_not_block_publishing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = EventLog::new()
            .with_sink(Box::new(FailingSink))
            .with_sink(Box::new(LogSink::new(&path)));
        assert_eq!(log.publish(created("a")), 0);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }
}
