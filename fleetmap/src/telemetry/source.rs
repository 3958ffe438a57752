//! Real-time data source contract.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use super::TelemetryEntity;

/// Capacity of a subscription channel.
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 256;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Source {source_id} unavailable: {reason}")]
    Unavailable { source_id: String, reason: String },

    #[error("Source {source_id} returned malformed data: {reason}")]
    Malformed { source_id: String, reason: String },
}

/// A producer of entity deltas keyed by id.
///
/// `snapshot` returns the full current state; `subscribe` opens a stream of
/// partial updates. Transport is up to the implementation.
pub trait RealtimeSource<E: TelemetryEntity>: Send + Sync {
    fn id(&self) -> &str;

    fn snapshot(&self) -> BoxFuture<'_, Result<Vec<E>, SourceError>>;

    fn subscribe(&self) -> mpsc::Receiver<Vec<E>>;
}

/// A source fed by the host through [`ChannelSource::publish`].
#[derive(Debug)]
pub struct ChannelSource<E> {
    id: String,
    current: Mutex<Vec<E>>,
    subscribers: Mutex<Vec<mpsc::Sender<Vec<E>>>>,
}

impl<E: TelemetryEntity> ChannelSource<E> {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            current: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Replace what `snapshot` returns.
    pub fn set_snapshot(&self, items: Vec<E>) {
        *self.current.lock() = items;
    }

    /// Deliver a delta to every live subscriber. Returns how many received it.
    pub fn publish(&self, items: Vec<E>) -> usize {
        {
            let mut current = self.current.lock();
            for item in &items {
                match current.iter_mut().find(|c| c.entity_id() == item.entity_id()) {
                    Some(existing) => *existing = item.clone(),
                    None => current.push(item.clone()),
                }
            }
        }

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        let mut delivered = 0;
        for tx in subscribers.iter() {
            match tx.try_send(items.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(source = %self.id, error = %e, "Subscriber lagging, delta dropped"),
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

impl<E: TelemetryEntity> RealtimeSource<E> for ChannelSource<E> {
    fn id(&self) -> &str {
        &self.id
    }

    fn snapshot(&self) -> BoxFuture<'_, Result<Vec<E>, SourceError>> {
        let items = self.current.lock().clone();
        Box::pin(async move { Ok(items) })
    }

    fn subscribe(&self) -> mpsc::Receiver<Vec<E>> {
        let (tx, rx) = mpsc::channel(DEFAULT_SUBSCRIPTION_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{AlertSeverity, Alert};
    use chrono::Utc;

    fn alert(id: &str, message: &str) -> Alert {
        Alert {
            id: id.to_string(),
            severity: AlertSeverity::Warning,
            message: message.to_string(),
            position: None,
            vehicle_id: None,
            raised_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_and_snapshot() {
        let source = ChannelSource::<Alert>::new("alerts");
        let mut rx = source.subscribe();

        assert_eq!(source.publish(vec![alert("a1", "late")]), 1);
        assert_eq!(rx.recv().await.unwrap()[0].id, "a1");

        source.publish(vec![alert("a1", "very late")]);
        let snapshot = source.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].message, "very late");
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let source = ChannelSource::<Alert>::new("alerts");
        let rx = source.subscribe();
        assert_eq!(source.subscriber_count(), 1);
        drop(rx);
        assert_eq!(source.subscriber_count(), 0);
        assert_eq!(source.publish(vec![alert("a1", "x")]), 0);
    }
}
