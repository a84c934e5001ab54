use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::runtime::event::{ExecutionEvent, Outcome};

/// Append-only, per-execution event log.
///
/// Appends from the task thread keep their order; any number of subscribers
/// replay the log from the beginning. The journal closes on its first
/// terminal event and drops everything appended afterwards.
pub struct EventJournal {
    execution_id: String,
    state: Mutex<JournalState>,
    appended: watch::Sender<usize>,
}

#[derive(Default)]
struct JournalState {
    events: Vec<ExecutionEvent>,
    closed: bool,
}

impl EventJournal {
    pub fn new(execution_id: impl Into<String>) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            execution_id: execution_id.into(),
            state: Mutex::new(JournalState::default()),
            appended,
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Returns `false` when the event arrived after the terminal event.
    pub fn append(&self, event: ExecutionEvent) -> bool {
        let len = {
            let mut state = self.state.lock();
            if state.closed {
                debug!(
                    execution_id = %self.execution_id,
                    event = event.kind(),
                    "dropping event reported after terminal state"
                );
                return false;
            }
            state.closed = event.is_terminal();
            state.events.push(event);
            state.events.len()
        };
        self.appended.send_replace(len);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn since(&self, cursor: usize) -> Vec<ExecutionEvent> {
        let state = self.state.lock();
        state.events.get(cursor..).map(<[_]>::to_vec).unwrap_or_default()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        let state = self.state.lock();
        match state.events.last() {
            Some(ExecutionEvent::Terminal(outcome)) => Some(outcome.clone()),
            _ => None,
        }
    }

    /// Streams every event from the start of the log up to and including the
    /// terminal event.
    pub fn subscribe(self: &Arc<Self>) -> BoxStream<'static, ExecutionEvent> {
        let journal = Arc::clone(self);
        let updates = self.appended.subscribe();
        stream::unfold(
            (journal, updates, 0usize, false),
            |(journal, mut updates, cursor, finished)| async move {
                if finished {
                    return None;
                }
                loop {
                    let batch = journal.since(cursor);
                    if !batch.is_empty() {
                        let finished = batch.iter().any(ExecutionEvent::is_terminal);
                        let next = cursor + batch.len();
                        return Some((batch, (journal, updates, next, finished)));
                    }
                    if journal.is_closed() || updates.changed().await.is_err() {
                        return None;
                    }
                }
            },
        )
        .flat_map(stream::iter)
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::WirePayload;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_replay_history_and_end_at_terminal() {
        let journal = Arc::new(EventJournal::new("exec-1"));
        journal.append(ExecutionEvent::Started);

        let reader = journal.subscribe();
        let writer = Arc::clone(&journal);
        tokio::spawn(async move {
            writer.append(ExecutionEvent::Status {
                status: "halfway".into(),
            });
            writer.append(ExecutionEvent::Terminal(Outcome::Completed {
                result: WirePayload::from_value(json!(5)),
            }));
        });

        let events: Vec<_> = reader.collect().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ExecutionEvent::Started);
        assert!(events[2].is_terminal());
    }

    #[test]
    fn events_after_terminal_are_dropped() {
        let journal = EventJournal::new("exec-2");
        assert!(journal.append(ExecutionEvent::Terminal(Outcome::cancelled("stop"))));
        assert!(!journal.append(ExecutionEvent::Started));
        assert_eq!(journal.len(), 1);
        assert_eq!(journal.outcome(), Some(Outcome::cancelled("stop")));
    }
}
