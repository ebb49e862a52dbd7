//! AQ-010: Progress events and the sinks that receive them.
//!
//! `ProgressSink::emit` is synchronous and must not block: the engine calls
//! it inline from the execution loop. Sink failures are logged and dropped.

pub mod eventlog;

use crate::core::types::StepId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Progress event emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    PlanGenerated {
        plan_id: String,
        intent: String,
        steps: usize,
    },
    StepStarted {
        plan_id: String,
        step_id: StepId,
        description: String,
        attempt: u32,
    },
    StepCompleted {
        plan_id: String,
        step_id: StepId,
        row_count: usize,
        elapsed_ms: u64,
    },
    StepError {
        plan_id: String,
        step_id: StepId,
        error: String,
        will_retry: bool,
    },
    StepSkipped {
        plan_id: String,
        step_id: StepId,
        reason: String,
    },
    PlanRefined {
        plan_id: String,
        added: Vec<StepId>,
        modified: Vec<StepId>,
        removed: Vec<StepId>,
    },
    PlanCompleted {
        plan_id: String,
        successful_steps: u32,
        failed_steps: u32,
        final_sql: Option<String>,
        has_chart: bool,
    },
}

impl ProgressEvent {
    /// The wire name of the event (`plan_generated`, `step_started`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            Self::PlanGenerated { .. } => "plan_generated",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepError { .. } => "step_error",
            Self::StepSkipped { .. } => "step_skipped",
            Self::PlanRefined { .. } => "plan_refined",
            Self::PlanCompleted { .. } => "plan_completed",
        }
    }
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

/// Observer for engine progress.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Forwards events over an unbounded channel. A dropped receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TimestampedEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimestampedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(TimestampedEvent {
            ts: eventlog::now_iso8601(),
            event,
        });
    }
}

/// Appends events to a JSONL file from a dedicated writer thread.
///
/// `emit` only queues the event. Dropping the sink closes the queue and
/// waits until every queued event is on disk.
#[derive(Debug)]
pub struct JsonlSink {
    tx: Option<mpsc::UnboundedSender<TimestampedEvent>>,
    writer: Option<std::thread::JoinHandle<()>>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<TimestampedEvent>();
        let target = path.clone();
        let spawned = std::thread::Builder::new()
            .name("stepql-events".to_string())
            .spawn(move || {
                while let Some(event) = rx.blocking_recv() {
                    if let Err(e) = eventlog::append_timestamped(&target, &event) {
                        tracing::warn!(path = %target.display(), error = %e, "cannot append progress event");
                    }
                }
            });

        match spawned {
            Ok(writer) => Self {
                tx: Some(tx),
                writer: Some(writer),
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot start event writer; events will be dropped");
                Self {
                    tx: None,
                    writer: None,
                }
            }
        }
    }
}

impl ProgressSink for JsonlSink {
    fn emit(&self, event: ProgressEvent) {
        let Some(ref tx) = self.tx else {
            return;
        };
        let _ = tx.send(TimestampedEvent {
            ts: eventlog::now_iso8601(),
            event,
        });
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        self.tx = None;
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

/// Logs events through `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: ProgressEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(event = event.name(), "{}", json),
            Err(_) => tracing::info!(event = event.name(), "progress"),
        }
    }
}

/// Delivers each event to several sinks in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn ProgressSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ProgressSink for FanoutSink {
    fn emit(&self, event: ProgressEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(plan_id: &str) -> ProgressEvent {
        ProgressEvent::PlanCompleted {
            plan_id: plan_id.to_string(),
            successful_steps: 2,
            failed_steps: 0,
            final_sql: Some("SELECT 1".to_string()),
            has_chart: false,
        }
    }

    #[test]
    fn test_aq010_event_serde_tag() {
        let json = serde_json::to_string(&completed("p-1")).unwrap();
        assert!(json.contains("\"event\":\"plan_completed\""));
        assert!(json.contains("\"plan_id\":\"p-1\""));
    }

    #[test]
    fn test_aq010_event_names_match_tags() {
        let events = vec![
            ProgressEvent::PlanGenerated {
                plan_id: "p".into(),
                intent: "i".into(),
                steps: 1,
            },
            ProgressEvent::StepStarted {
                plan_id: "p".into(),
                step_id: 1,
                description: "d".into(),
                attempt: 1,
            },
            ProgressEvent::StepError {
                plan_id: "p".into(),
                step_id: 1,
                error: "e".into(),
                will_retry: true,
            },
            completed("p"),
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], event.name());
        }
    }

    #[test]
    fn test_aq010_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(completed("a"));
        sink.emit(completed("b"));
        let first = rx.try_recv().unwrap();
        assert_eq!(first.event, completed("a"));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_aq010_channel_sink_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        // must not panic or block
        sink.emit(completed("a"));
    }

    #[test]
    fn test_aq010_jsonl_sink_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = JsonlSink::new(&path);
        sink.emit(completed("p"));
        drop(sink);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("plan_completed"));
        assert!(content.contains("\"ts\":"));
    }

    #[tokio::test]
    async fn test_aq010_jsonl_sink_writes_off_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs").join("events.jsonl");
        let sink = JsonlSink::new(&path);
        for i in 0..50 {
            sink.emit(completed(&format!("p{}", i)));
        }
        drop(sink);

        let events = eventlog::read_events(&path).unwrap();
        assert_eq!(events.len(), 50);
        assert_eq!(events[0].event, completed("p0"));
        assert_eq!(events[49].event, completed("p49"));
    }

    #[test]
    fn test_aq010_jsonl_sink_unwritable_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        // a directory cannot be opened for append
        let sink = JsonlSink::new(dir.path());
        sink.emit(completed("p"));
        drop(sink);
    }

    #[test]
    fn test_aq010_fanout() {
        let (a, mut rx_a) = ChannelSink::new();
        let (b, mut rx_b) = ChannelSink::new();
        let fanout = FanoutSink::new().with(a).with(b).with(NullSink);
        assert_eq!(fanout.len(), 3);
        fanout.emit(completed("p"));
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }
}
