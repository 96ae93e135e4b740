//! Engine lifecycle notifications.
//!
//! Observers are optional. The engine calls them synchronously at fixed
//! points and never depends on what they do.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Which search produced a [`SearchFinished`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchKind {
    Knowledge,
    Personal,
    Hybrid,
    Context,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestStarted {
    pub document_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestFinished {
    pub document_id: String,
    pub chunks: usize,
    pub elapsed: Duration,

    /// Error message when the ingest failed and nothing was committed.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchStarted {
    pub kind: SearchKind,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchFinished {
    pub kind: SearchKind,
    pub query: String,
    pub results: usize,
    pub elapsed: Duration,
    pub cached: bool,

    /// Error message when the search failed. Every started search finishes.
    pub error: Option<String>,
}

/// Receives engine events. Every method defaults to a no-op.
pub trait EngineObserver: Send + Sync {
    fn on_ingest_started(&self, _event: &IngestStarted) {}
    fn on_ingest_finished(&self, _event: &IngestFinished) {}
    fn on_search_started(&self, _event: &SearchStarted) {}
    fn on_search_finished(&self, _event: &SearchFinished) {}
}

/// Any engine event, as delivered by [`ChannelObserver`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    IngestStarted(IngestStarted),
    IngestFinished(IngestFinished),
    SearchStarted(SearchStarted),
    SearchFinished(SearchFinished),
}

/// Forwards events into a bounded channel. When the channel is full or
/// closed the event is dropped; the engine never waits on a consumer.
pub struct ChannelObserver {
    sender: mpsc::Sender<EngineEvent>,
}

impl ChannelObserver {
    /// Observer plus the receiving end of a channel holding `capacity` events.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    fn send(&self, event: EngineEvent) {
        let _ = self.sender.try_send(event);
    }
}

impl EngineObserver for ChannelObserver {
    fn on_ingest_started(&self, event: &IngestStarted) {
        self.send(EngineEvent::IngestStarted(event.clone()));
    }

    fn on_ingest_finished(&self, event: &IngestFinished) {
        self.send(EngineEvent::IngestFinished(event.clone()));
    }

    fn on_search_started(&self, event: &SearchStarted) {
        self.send(EngineEvent::SearchStarted(event.clone()));
    }

    fn on_search_finished(&self, event: &SearchFinished) {
        self.send(EngineEvent::SearchFinished(event.clone()));
    }
}

/// Fan-out to every registered observer.
#[derive(Clone, Default)]
pub(crate) struct Observers(Vec<Arc<dyn EngineObserver>>);

impl Observers {
    pub(crate) fn push(&mut self, observer: Arc<dyn EngineObserver>) {
        self.0.push(observer);
    }

    pub(crate) fn ingest_started(&self, event: IngestStarted) {
        self.0.iter().for_each(|o| o.on_ingest_started(&event));
    }

    pub(crate) fn ingest_finished(&self, event: IngestFinished) {
        self.0.iter().for_each(|o| o.on_ingest_finished(&event));
    }

    pub(crate) fn search_started(&self, event: SearchStarted) {
        self.0.iter().for_each(|o| o.on_search_started(&event));
    }

    pub(crate) fn search_finished(&self, event: SearchFinished) {
        self.0.iter().for_each(|o| o.on_search_finished(&event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_channel_observer_drops_when_full() {
        let (observer, mut receiver) = ChannelObserver::new(1);
        let mut observers = Observers::default();
        observers.push(Arc::new(observer));

        observers.ingest_started(IngestStarted {
            document_id: "a".to_string(),
        });
        observers.ingest_started(IngestStarted {
            document_id: "b".to_string(),
        });

        assert_eq!(
            receiver.try_recv().unwrap(),
            EngineEvent::IngestStarted(IngestStarted {
                document_id: "a".to_string()
            })
        );
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (observer, receiver) = ChannelObserver::new(4);
        drop(receiver);
        observer.on_search_started(&SearchStarted {
            kind: SearchKind::Knowledge,
            query: "q".to_string(),
        });
    }
}
