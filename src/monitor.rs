//! Engine event stream.
//!
//! Firings, retractions, and structural refinements are published to
//! subscribers over bounded channels. Publishing never blocks the engine: a
//! full stream simply drops the event, and a disconnected stream is pruned
//! on the next publish. Events carry owned copies of resolved data, never
//! live handles into the network.

use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::engine::ActionId;
use crate::fact::Fact;

/// What happened.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// An action fired for a complete match.
    Fired {
        rule: String,
        action: ActionId,
        facts: Vec<Fact>,
    },
    /// A previously reported match was retracted.
    Retracted {
        rule: String,
        action: ActionId,
        facts: Vec<Fact>,
    },
    /// A fringe candidate was grafted under an unsplit leaf.
    FringeCreated {
        rule: String,
        depth: usize,
        feature: String,
    },
    /// A refinement was committed as a permanent discriminator.
    SplitCommitted {
        rule: String,
        depth: usize,
    },
    /// A branch stopped refining.
    UnsplitCommitted {
        rule: String,
        depth: usize,
    },
    /// A rule (and any anchored value node) was excised.
    RuleExcised {
        rule: String,
    },
}

/// One published engine event.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub at: DateTime<Utc>,
    /// Engine step at publish time.
    pub step: u64,
    pub kind: EventKind,
}

/// Sending half held by the engine.
#[derive(Debug)]
pub(crate) struct EventSink {
    tx: Sender<EngineEvent>,
}

impl EventSink {
    /// Publishes without blocking. Returns false when the subscriber is
    /// gone and the sink should be pruned.
    pub(crate) fn publish(&self, event: EngineEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            // Backpressure drops the event but keeps the subscription.
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Receiving half handed to a subscriber.
#[derive(Debug)]
pub struct EventStream {
    rx: Receiver<EngineEvent>,
}

impl EventStream {
    /// Next event if one is already queued.
    #[must_use]
    pub fn try_next(&self) -> Option<EngineEvent> {
        self.rx.try_recv().ok()
    }

    /// Blocks up to `timeout` for the next event.
    #[must_use]
    pub fn next_timeout(&self, timeout: Duration) -> Option<EngineEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Drains everything currently queued.
    #[must_use]
    pub fn drain(&self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Creates a connected sink/stream pair with the given buffer capacity.
pub(crate) fn channel(capacity: usize) -> (EventSink, EventStream) {
    let (tx, rx) = bounded(capacity.max(1));
    (EventSink { tx }, EventStream { rx })
}
