/// Workflow Event Stream - append-only, per-workflow ordered log
///
/// The orchestrator holds the only `EventSink`; any number of `EventLog`
/// readers can snapshot the log, read a tail from an index, or subscribe to
/// a cursor that yields every event in order. Entries are never rewritten or
/// reordered once appended. The stream closes after a terminal event, or
/// when the sink is dropped.

use autocoder_common::types::WorkflowEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AppendError {
    #[error("event stream is closed")]
    Closed,
    #[error("event for step {got} after step {last}")]
    OutOfOrder { last: u32, got: u32 },
}

struct Shared {
    events: RwLock<Vec<WorkflowEvent>>,
    len_tx: watch::Sender<usize>,
    closed: AtomicBool,
}

impl Shared {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Wake cursors waiting for more events
        self.len_tx.send_modify(|_| {});
    }
}

pub struct EventStream;

impl EventStream {
    /// Create a stream: one writer handle, one cloneable reader handle
    pub fn new() -> (EventSink, EventLog) {
        let (len_tx, _) = watch::channel(0usize);
        let shared = Arc::new(Shared {
            events: RwLock::new(Vec::new()),
            len_tx,
            closed: AtomicBool::new(false),
        });
        (
            EventSink { shared: shared.clone() },
            EventLog { shared },
        )
    }
}

/// Sole writer of a workflow's event stream
pub struct EventSink {
    shared: Arc<Shared>,
}

impl EventSink {
    /// Append an event; returns its index in the log
    pub fn append(&self, event: WorkflowEvent) -> Result<usize, AppendError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(AppendError::Closed);
        }

        let terminal = event.is_terminal();
        let index = {
            let mut events = self.shared.events.write().map_err(|_| AppendError::Closed)?;
            if let Some(last) = events.last() {
                if event.step < last.step {
                    return Err(AppendError::OutOfOrder {
                        last: last.step,
                        got: event.step,
                    });
                }
            }
            events.push(event);
            events.len() - 1
        };

        self.shared.len_tx.send_replace(index + 1);
        if terminal {
            self.shared.close();
        }
        Ok(index)
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Read handle on a workflow's event stream
#[derive(Clone)]
pub struct EventLog {
    shared: Arc<Shared>,
}

impl EventLog {
    pub fn snapshot(&self) -> Vec<WorkflowEvent> {
        self.shared.events.read().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events from index `from` onwards
    pub fn tail(&self, from: usize) -> Vec<WorkflowEvent> {
        self.shared
            .events
            .read()
            .map(|e| e.iter().skip(from).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.shared.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<WorkflowEvent> {
        self.shared.events.read().ok().and_then(|e| e.last().cloned())
    }

    /// Cursor over every event from the start of the stream
    pub fn subscribe(&self) -> EventCursor {
        self.subscribe_from(0)
    }

    /// Cursor starting at index `from`
    pub fn subscribe_from(&self, from: usize) -> EventCursor {
        EventCursor {
            shared: self.shared.clone(),
            rx: self.shared.len_tx.subscribe(),
            next: from,
        }
    }
}

/// Ordered, lossless subscription to an event stream
pub struct EventCursor {
    shared: Arc<Shared>,
    rx: watch::Receiver<usize>,
    next: usize,
}

impl EventCursor {
    /// Next event, waiting for it if necessary; `None` once the stream is
    /// closed and drained.
    pub async fn next(&mut self) -> Option<WorkflowEvent> {
        loop {
            self.rx.borrow_and_update();

            let event = self
                .shared
                .events
                .read()
                .ok()
                .and_then(|e| e.get(self.next).cloned());
            if let Some(event) = event {
                self.next += 1;
                return Some(event);
            }

            if self.shared.closed.load(Ordering::SeqCst) {
                return None;
            }

            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Index of the next event this cursor will yield
    pub fn position(&self) -> usize {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autocoder_common::types::{Status, StepKind};

    #[test]
    fn test_append_and_tail() {
        let (sink, log) = EventStream::new();
        sink.append(WorkflowEvent::new(Status::Executing, 1)).unwrap();
        sink.append(WorkflowEvent::new(Status::Failed, 1)).unwrap();
        sink.append(WorkflowEvent::new(Status::FixRequest, 2).with_kind(StepKind::FixRequest))
            .unwrap();

        assert_eq!(log.len(), 3);
        let tail = log.tail(1);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].status, Status::Failed);
        assert_eq!(tail[1].step, 2);
        assert!(!log.is_closed());
    }

    #[test]
    fn test_out_of_order_rejected() {
        let (sink, log) = EventStream::new();
        sink.append(WorkflowEvent::new(Status::Executing, 2)).unwrap();
        let err = sink.append(WorkflowEvent::new(Status::Executing, 1)).unwrap_err();
        assert_eq!(err, AppendError::OutOfOrder { last: 2, got: 1 });
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_closed_after_terminal() {
        let (sink, log) = EventStream::new();
        sink.append(WorkflowEvent::new(Status::Executing, 1)).unwrap();
        sink.append(WorkflowEvent::new(Status::Completed, 1)).unwrap();

        assert!(log.is_closed());
        assert_eq!(
            sink.append(WorkflowEvent::new(Status::Executing, 2)),
            Err(AppendError::Closed)
        );
        assert_eq!(log.last().map(|e| e.status), Some(Status::Completed));
    }

    #[tokio::test]
    async fn test_cursor_sees_every_event_in_order() {
        let (sink, log) = EventStream::new();
        let mut cursor = log.subscribe();

        let writer = tokio::spawn(async move {
            for step in 1..=3 {
                sink.append(WorkflowEvent::new(Status::Executing, step)).unwrap();
                tokio::task::yield_now().await;
                sink.append(WorkflowEvent::new(Status::Failed, step)).unwrap();
            }
            sink.append(WorkflowEvent::new(Status::Exhausted, 3)).unwrap();
        });

        let mut seen = Vec::new();
        while let Some(event) = cursor.next().await {
            seen.push((event.step, event.status));
        }
        writer.await.unwrap();

        assert_eq!(seen.len(), 7);
        assert_eq!(seen.last(), Some(&(3, Status::Exhausted)));
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[tokio::test]
    async fn test_cursor_ends_when_sink_dropped() {
        let (sink, log) = EventStream::new();
        sink.append(WorkflowEvent::new(Status::Executing, 1)).unwrap();
        drop(sink);

        let mut cursor = log.subscribe();
        assert!(cursor.next().await.is_some());
        assert!(cursor.next().await.is_none());
    }

    #[tokio::test]
    async fn test_late_subscriber_from_index() {
        let (sink, log) = EventStream::new();
        sink.append(WorkflowEvent::new(Status::Executing, 1)).unwrap();
        sink.append(WorkflowEvent::new(Status::Completed, 1)).unwrap();

        let mut cursor = log.subscribe_from(1);
        assert_eq!(cursor.next().await.map(|e| e.status), Some(Status::Completed));
        assert!(cursor.next().await.is_none());
        assert_eq!(cursor.position(), 2);
    }
}
