//! Observable store events.
//!
//! The store surfaces a handful of advisory events — dimension adaptations,
//! upgrade suggestions, index pressure, entry-point churn, auto-retain
//! activity. Subscribers receive them over a plain [`std::sync::mpsc`]
//! channel obtained from [`EventBus::subscribe`]; events are advisory and
//! never block the operation that produced them. Every event is also
//! mirrored to `tracing` at debug level.

use std::sync::Mutex;
use std::sync::mpsc::{Receiver, Sender, channel};

/// What kind of adaptation the dimension adapter performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptKind {
    /// Leading components kept, vector renormalized.
    Truncated,
    /// Extended with low-magnitude noise.
    NoisePadded,
    /// Extended with zeros.
    ZeroPadded,
}

/// Advisory events emitted by the store.
#[derive(Debug, Clone)]
pub enum Event {
    /// A vector was reshaped on the write or query path.
    DimAdapted {
        kind: AdaptKind,
        from: usize,
        to: usize,
        id: String,
    },
    /// More than 80% of recently seen vectors share a new dimension;
    /// the caller may want to migrate the store. Never acted on
    /// automatically.
    DimUpgradeSuggested { from: usize, to: usize },
    /// The IVF pending buffer is large relative to the trained population.
    IvfRetrainRecommended { pending: usize, assigned: usize },
    /// An HNSW insert was promoted to the new entry point.
    HnswEntryChanged { key: u32, layer: usize },
    /// Auto-retain extracted facts from a session window.
    AutoRetainFired { session_id: String, retained: usize },
    /// Auto-retain failed; the failure was logged and swallowed.
    AutoRetainError { session_id: String, message: String },
}

/// Fan-out distributor for [`Event`]s.
///
/// Disconnected receivers are pruned on the next emit.
#[derive(Default)]
pub(crate) struct EventBus {
    senders: Mutex<Vec<Sender<Event>>>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = channel();
        self.senders.lock().unwrap().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: Event) {
        tracing::debug!(?event, "store event");
        let mut senders = self.senders.lock().unwrap();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_receives_events() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        bus.emit(Event::DimUpgradeSuggested { from: 384, to: 768 });
        match rx.try_recv().unwrap() {
            Event::DimUpgradeSuggested { from, to } => {
                assert_eq!((from, to), (384, 768));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let bus = EventBus::new();
        drop(bus.subscribe());
        bus.emit(Event::HnswEntryChanged { key: 1, layer: 2 });
        assert!(bus.senders.lock().unwrap().is_empty());
    }
}
