//! Broadcast + history event store for operator views.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::{StreamExt, future};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::{RelayEvent, SessionId, config::DEFAULT_EVENT_HISTORY};

/// Live channel capacity. Slow subscribers past this lag and skip events.
const CHANNEL_CAPACITY: usize = 10_000;

/// Event store with broadcast and history support.
///
/// An operator view that (re)attaches receives the retained history and
/// then switches to live events without a gap.
pub struct EventStore {
    history: RwLock<VecDeque<RelayEvent>>,
    limit: usize,
    sender: broadcast::Sender<RelayEvent>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    /// Create a store with the default history limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_EVENT_HISTORY)
    }

    /// Create a store keeping at most `limit` events of history.
    #[must_use]
    pub fn with_history_limit(limit: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            history: RwLock::new(VecDeque::with_capacity(limit.min(64))),
            limit,
            sender,
        }
    }

    /// Push an event to live subscribers and history.
    pub fn push(&self, event: RelayEvent) {
        // Held across the send so `history_plus_stream` never sees an event twice.
        let mut history = self
            .history
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let _ = self.sender.send(event.clone());

        if self.limit == 0 {
            return;
        }
        while history.len() >= self.limit {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Get a receiver for live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of the retained history.
    #[must_use]
    pub fn history(&self) -> Vec<RelayEvent> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Stream that yields history first, then live events.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, RelayEvent> {
        let (history, rx) = {
            let guard = self.history.read().unwrap_or_else(PoisonError::into_inner);
            (guard.iter().cloned().collect::<Vec<_>>(), self.sender.subscribe())
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(
            |res: Result<RelayEvent, BroadcastStreamRecvError>| async move {
                match res {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event subscriber lagged");
                        None
                    }
                }
            },
        );

        Box::pin(hist.chain(live))
    }

    /// Events for a single session, ending after its `Disconnected` event.
    #[must_use]
    pub fn session_stream(
        &self,
        session_id: SessionId,
    ) -> futures::stream::BoxStream<'static, RelayEvent> {
        let events = self
            .history_plus_stream()
            .filter(move |event| future::ready(event.session_id() == Some(&session_id)))
            .boxed();

        futures::stream::unfold(Some(events), |state| async move {
            let mut events = state?;
            let event = events.next().await?;
            let rest = (!matches!(event, RelayEvent::Disconnected { .. })).then_some(events);
            Some((event, rest))
        })
        .boxed()
    }
}
