//! Event hub for live view changes
//!
//! One broadcast channel per materializer. Emission is a no-op until the
//! backlog has been replayed, so subscribers only hear about live changes.

use crate::barrier::SyncBarrier;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

/// Kinds of view change notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    HomeAdd,
    InboxAdd,
    InboxRemove,
    VotesAdd,
    VotesRemove,
    FollowsAdd,
    FollowsRemove,
    /// A followed identity posted recently
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
}

#[derive(Debug)]
pub struct EventHub {
    tx: broadcast::Sender<ViewEvent>,
    barrier: Arc<SyncBarrier>,
}

impl EventHub {
    pub fn new(capacity: usize, barrier: Arc<SyncBarrier>) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, barrier }
    }

    pub fn emit(&self, kind: EventKind) {
        if !self.barrier.is_backlog_replayed() {
            return;
        }
        // No subscribers is not an error
        if self.tx.send(ViewEvent { kind }).is_err() {
            debug!(?kind, "No event subscribers");
        }
    }

    /// Live events until the returned stream is dropped
    pub fn subscribe(&self) -> impl Stream<Item = ViewEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|event| async move {
            match event {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    warn!("Event subscriber lagged, {} events dropped", n);
                    None
                }
            }
        })
    }
}
