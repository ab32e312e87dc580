//! Run events and their fan-out to observers.
//!
//! Each run owns an append-only in-memory log, the source of truth for its
//! event history. Subscribers keep their own cursor into the log and are woken
//! through a `watch` channel carrying the latest sequence number, so a
//! subscriber that joins late still sees every event exactly once and a slow
//! one never holds up the run. The log closes after the terminal event.
//!
//! Every event is also pushed, as JSON, onto a lossy global `broadcast`
//! firehose for dashboard-wide WebSocket clients.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};

use crate::run::RunId;
use crate::store::EventJournal;

/// Capacity of the global firehose. Receivers that fall further behind skip ahead.
const FIREHOSE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    PhaseStarted,
    PhaseChunk,
    PhaseCompleted,
    RevisionRound,
    RunCompleted,
    RunFailed,
    RunCancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::PhaseStarted => "phase_started",
            Self::PhaseChunk => "phase_chunk",
            Self::PhaseCompleted => "phase_completed",
            Self::RevisionRound => "revision_round",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
            Self::RunCancelled => "run_cancelled",
        }
    }

    /// The last event a run emits.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted | Self::RunFailed | Self::RunCancelled
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observable step of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub run_id: RunId,
    /// Starts at 1, strictly increasing per run.
    pub seq: u64,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Default)]
struct RunLog {
    events: Vec<Event>,
    closed: bool,
}

struct RunChannel {
    log: Mutex<RunLog>,
    notify: watch::Sender<u64>,
}

impl RunChannel {
    fn new(log: RunLog) -> Self {
        let latest = log.events.last().map(|e| e.seq).unwrap_or(0);
        let (notify, _) = watch::channel(latest);
        Self {
            log: Mutex::new(log),
            notify,
        }
    }

    fn log(&self) -> MutexGuard<'_, RunLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-run event logs plus the global firehose.
pub struct EventBroadcaster {
    channels: Mutex<HashMap<RunId, Arc<RunChannel>>>,
    firehose: broadcast::Sender<String>,
    journal: Option<Arc<dyn EventJournal>>,
}

impl EventBroadcaster {
    pub fn new(journal: Option<Arc<dyn EventJournal>>) -> Self {
        let (firehose, _) = broadcast::channel(FIREHOSE_CAPACITY);
        Self {
            channels: Mutex::new(HashMap::new()),
            firehose,
            journal,
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<RunId, Arc<RunChannel>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channel(&self, run_id: RunId) -> Arc<RunChannel> {
        self.channels()
            .entry(run_id)
            .or_insert_with(|| Arc::new(RunChannel::new(RunLog::default())))
            .clone()
    }

    /// Create the event log of a run so observers can subscribe before it starts.
    pub fn open(&self, run_id: RunId) {
        self.channel(run_id);
    }

    /// Append an event to the run's log and wake its subscribers.
    ///
    /// Returns `None` when the run's log is already closed.
    pub fn emit(
        &self,
        run_id: RunId,
        kind: EventKind,
        phase: Option<&str>,
        payload: serde_json::Value,
    ) -> Option<Event> {
        let channel = self.channel(run_id);

        let event = {
            let mut log = channel.log();
            if log.closed {
                tracing::warn!(run_id = %run_id, kind = %kind, "Dropping event for closed run");
                return None;
            }

            let event = Event {
                run_id,
                seq: log.events.len() as u64 + 1,
                kind,
                phase: phase.map(str::to_string),
                timestamp: Utc::now(),
                payload,
            };

            if let Some(journal) = &self.journal
                && let Err(e) = journal.append(&event)
            {
                tracing::warn!(run_id = %run_id, seq = event.seq, error = %e, "Failed to journal event");
            }

            log.events.push(event.clone());
            if kind.is_terminal() {
                log.closed = true;
            }
            channel.notify.send_replace(event.seq);
            event
        };

        match serde_json::to_string(&event) {
            Ok(json) => {
                let _ = self.firehose.send(json);
            }
            Err(e) => tracing::warn!(error = %e, "Failed to serialize event for firehose"),
        }

        tracing::debug!(run_id = %run_id, seq = event.seq, kind = %kind, "Emitted event");
        Some(event)
    }

    /// Subscribe to a run from its first event. `None` if the run has no log.
    pub fn subscribe(&self, run_id: RunId) -> Option<Subscription> {
        let channel = self.channels().get(&run_id).cloned()?;
        Some(Subscription::new(channel))
    }

    /// Snapshot of a run's events so far.
    pub fn events(&self, run_id: RunId) -> Option<Vec<Event>> {
        let channel = self.channels().get(&run_id).cloned()?;
        let events = channel.log().events.clone();
        Some(events)
    }

    pub fn is_closed(&self, run_id: RunId) -> Option<bool> {
        let channel = self.channels().get(&run_id).cloned()?;
        let closed = channel.log().closed;
        Some(closed)
    }

    /// Forget a run's log. Existing subscribers read what was logged, then end.
    pub fn remove(&self, run_id: RunId) {
        let Some(channel) = self.channels().remove(&run_id) else {
            return;
        };
        let seq = {
            let mut log = channel.log();
            log.closed = true;
            log.events.len() as u64
        };
        channel.notify.send_replace(seq);
    }

    pub fn subscribe_firehose(&self) -> broadcast::Receiver<String> {
        self.firehose.subscribe()
    }

    pub fn firehose(&self) -> broadcast::Sender<String> {
        self.firehose.clone()
    }
}

/// A reader over one run's event log with its own cursor.
pub struct Subscription {
    channel: Arc<RunChannel>,
    rx: watch::Receiver<u64>,
    cursor: usize,
}

impl Subscription {
    fn new(channel: Arc<RunChannel>) -> Self {
        let rx = channel.notify.subscribe();
        Self {
            channel,
            rx,
            cursor: 0,
        }
    }

    /// A finished subscription over stored events, used for runs no longer in memory.
    pub fn replay(events: Vec<Event>) -> Self {
        Self::new(Arc::new(RunChannel::new(RunLog {
            events,
            closed: true,
        })))
    }

    /// Next event in sequence order. `None` once the terminal event has been
    /// delivered.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            {
                let log = self.channel.log();
                if let Some(event) = log.events.get(self.cursor) {
                    self.cursor += 1;
                    return Some(event.clone());
                }
                if log.closed {
                    return None;
                }
            }
            // The sender lives in `channel`, so this only fails if it was dropped.
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Event> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|event| (event, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    fn emit(b: &EventBroadcaster, run_id: RunId, kind: EventKind) -> Option<Event> {
        b.emit(run_id, kind, Some("a"), json!({}))
    }

    #[test]
    fn test_sequence_starts_at_one_and_increases() {
        let b = EventBroadcaster::new(None);
        let run_id = RunId::new();
        let seqs: Vec<u64> = (0..5)
            .map(|_| emit(&b, run_id, EventKind::PhaseChunk).unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

        let other = RunId::new();
        assert_eq!(emit(&b, other, EventKind::RunStarted).unwrap().seq, 1);
    }

    #[test]
    fn test_terminal_event_closes_log() {
        let b = EventBroadcaster::new(None);
        let run_id = RunId::new();
        emit(&b, run_id, EventKind::RunStarted);
        emit(&b, run_id, EventKind::RunCompleted);
        assert_eq!(b.is_closed(run_id), Some(true));
        assert!(emit(&b, run_id, EventKind::PhaseChunk).is_none());
        assert_eq!(b.events(run_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_full_history() {
        let b = EventBroadcaster::new(None);
        let run_id = RunId::new();
        emit(&b, run_id, EventKind::RunStarted);
        emit(&b, run_id, EventKind::PhaseStarted);
        emit(&b, run_id, EventKind::RunCompleted);

        let events: Vec<Event> = b.subscribe(run_id).unwrap().into_stream().collect().await;
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_live_subscriber_is_woken() {
        let b = Arc::new(EventBroadcaster::new(None));
        let run_id = RunId::new();
        b.open(run_id);
        let sub = b.subscribe(run_id).unwrap();

        let reader = tokio::spawn(async move { sub.into_stream().collect::<Vec<_>>().await });

        let producer = b.clone();
        tokio::spawn(async move {
            for _ in 0..10 {
                emit(&producer, run_id, EventKind::PhaseChunk);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            emit(&producer, run_id, EventKind::RunCompleted);
        });

        let events = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(events.len(), 11);
        assert!(events.windows(2).all(|w| w[1].seq == w[0].seq + 1));
        assert_eq!(events.last().unwrap().kind, EventKind::RunCompleted);
    }

    #[tokio::test]
    async fn test_removed_run_keeps_existing_subscribers() {
        let b = EventBroadcaster::new(None);
        let run_id = RunId::new();
        emit(&b, run_id, EventKind::RunStarted);
        emit(&b, run_id, EventKind::RunCancelled);
        let mut sub = b.subscribe(run_id).unwrap();
        b.remove(run_id);

        assert!(b.subscribe(run_id).is_none());
        assert_eq!(sub.next().await.unwrap().seq, 1);
        assert_eq!(sub.next().await.unwrap().kind, EventKind::RunCancelled);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_removing_an_open_log_ends_waiting_subscribers() {
        let b = Arc::new(EventBroadcaster::new(None));
        let run_id = RunId::new();
        b.open(run_id);
        let sub = b.subscribe(run_id).unwrap();
        let reader = tokio::spawn(async move { sub.into_stream().collect::<Vec<_>>().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        b.remove(run_id);

        let events = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(events.is_empty());
        assert!(b.subscribe(run_id).is_none());
    }

    #[tokio::test]
    async fn test_replay_subscription_ends() {
        let b = EventBroadcaster::new(None);
        let run_id = RunId::new();
        let stored = vec![
            emit(&b, run_id, EventKind::RunStarted).unwrap(),
            emit(&b, run_id, EventKind::RunFailed).unwrap(),
        ];
        let replayed: Vec<Event> = Subscription::replay(stored.clone()).into_stream().collect().await;
        assert_eq!(replayed, stored);
    }

    #[tokio::test]
    async fn test_firehose_receives_json() {
        let b = EventBroadcaster::new(None);
        let mut rx = b.subscribe_firehose();
        let run_id = RunId::new();
        emit(&b, run_id, EventKind::RunStarted);

        let json = rx.recv().await.unwrap();
        let event: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event.run_id, run_id);
        assert_eq!(event.kind, EventKind::RunStarted);
    }

    struct RecordingJournal {
        seqs: Mutex<Vec<u64>>,
        fail: bool,
    }

    impl EventJournal for RecordingJournal {
        fn append(&self, event: &Event) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::InvalidFileName("x".into()));
            }
            self.seqs.lock().unwrap().push(event.seq);
            Ok(())
        }
    }

    #[test]
    fn test_journal_sees_every_event_in_order() {
        let journal = Arc::new(RecordingJournal {
            seqs: Mutex::new(Vec::new()),
            fail: false,
        });
        let b = EventBroadcaster::new(Some(journal.clone()));
        let run_id = RunId::new();
        for _ in 0..3 {
            emit(&b, run_id, EventKind::PhaseChunk);
        }
        assert_eq!(*journal.seqs.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_journal_failure_does_not_drop_event() {
        let journal = Arc::new(RecordingJournal {
            seqs: Mutex::new(Vec::new()),
            fail: true,
        });
        let b = EventBroadcaster::new(Some(journal));
        let run_id = RunId::new();
        assert!(emit(&b, run_id, EventKind::RunStarted).is_some());
        assert_eq!(b.events(run_id).unwrap().len(), 1);
    }
}
