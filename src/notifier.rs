//! Fan-out of progress events to every connected real-time client.
//!
//! Each connection registers the sending half of a bounded channel; the
//! connection task drains the receiving half into its socket. A recipient
//! whose channel is closed or full at delivery time is dropped from the set
//! without affecting the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::download::ProgressSink;
use crate::models::ProgressEvent;

/// Messages a single subscriber may have queued before it is considered
/// stalled and dropped.
pub const SUBSCRIBER_BUFFER: usize = 64;

pub type SubscriberId = u64;

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a ProgressEvent,
}

#[derive(Default)]
pub struct Notifier {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<Arc<str>>>>,
    next_id: AtomicU64,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, connection: mpsc::Sender<Arc<str>>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, connection);
        tracing::debug!(subscriber = id, "subscriber connected");
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.lock().remove(&id).is_some();
        if removed {
            tracing::debug!(subscriber = id, "subscriber disconnected");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Serializes `event` once and offers it to every subscriber. Returns how
    /// many subscribers accepted it.
    pub fn broadcast(&self, event: &ProgressEvent) -> usize {
        let message: Arc<str> = match serde_json::to_string(&Envelope {
            kind: "download_progress",
            data: event,
        }) {
            Ok(message) => message.into(),
            Err(err) => {
                tracing::error!(download = event.id, "failed to serialize progress event: {err}");
                return 0;
            }
        };

        let mut delivered = 0;
        self.subscribers.lock().retain(|id, connection| {
            match connection.try_send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(subscriber = *id, "dropping closed subscriber");
                    false
                }
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(subscriber = *id, "dropping stalled subscriber");
                    false
                }
            }
        });
        delivered
    }
}

impl ProgressSink for Notifier {
    fn publish(&self, event: &ProgressEvent) {
        self.broadcast(event);
    }
}
