//! In-process event bus.
//!
//! Subscribers receive batches synchronously on the publisher's thread.
//! Writers that do I/O should subscribe through [`ChannelSubscriber`] so
//! the publishing task only pays for a queue push.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;

use crate::error::AppError;
use crate::models::{RecordKind, ResultBatch};
use crate::traits::{EventBus, Subscriber};

type Registrations = HashMap<String, Vec<(RecordKind, Arc<dyn Subscriber>)>>;

#[derive(Clone, Default)]
pub struct LocalEventBus {
    channels: Arc<RwLock<Registrations>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of subscribers registered on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for LocalEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("LocalEventBus")
            .field("channels", &channels.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EventBus for LocalEventBus {
    fn publish(&self, channel: &str, batch: Arc<ResultBatch>) -> usize {
        // Snapshot so subscribers run without the lock held.
        let targets: Vec<Arc<dyn Subscriber>> = {
            let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
            match channels.get(channel) {
                Some(subs) => subs
                    .iter()
                    .filter(|(kind, _)| batch.kinds().any(|k| k == *kind))
                    .map(|(_, sub)| Arc::clone(sub))
                    .collect(),
                None => Vec::new(),
            }
        };

        for subscriber in &targets {
            subscriber.on_event(channel, Arc::clone(&batch));
        }

        tracing::debug!(%channel, deliveries = targets.len(), "Batch published");
        targets.len()
    }

    fn subscribe(
        &self,
        channel: &str,
        kind: RecordKind,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<(), AppError> {
        if channel.trim().is_empty() {
            return Err(AppError::ConfigError(
                "Channel name must not be empty".to_string(),
            ));
        }
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_string())
            .or_default()
            .push((kind, subscriber));
        tracing::debug!(%channel, %kind, "Subscriber registered");
        Ok(())
    }
}

/// Forwards every batch into an unbounded queue drained by another task.
#[derive(Debug, Clone)]
pub struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<Arc<ResultBatch>>,
}

impl ChannelSubscriber {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Arc<ResultBatch>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Subscriber for ChannelSubscriber {
    fn on_event(&self, channel: &str, batch: Arc<ResultBatch>) {
        if self.tx.send(batch).is_err() {
            tracing::debug!(%channel, "Receiver dropped, batch discarded");
        }
    }
}
