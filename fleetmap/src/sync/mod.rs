//! Offline mutation sync.
//!
//! Mutations captured while offline are persisted in the store's action
//! queue and delivered by [`SyncQueueManager`] once the network is back.
//! Retryable failures back off per [`RetryPolicy`]; actions sharing an
//! ordering key (see [`OrderingRules`]) are delivered strictly in order.

mod client;
mod manager;
mod network;
mod ordering;
mod policy;

pub use client::{
    classify_status, DeliveryError, HttpMutationClient, MutationClient, DEFAULT_REQUEST_TIMEOUT,
};
pub use manager::{
    SyncConfig, SyncEvent, SyncQueueManager, SyncReport, SyncTrigger, DEFAULT_PERIODIC_INTERVAL,
    EVENT_CHANNEL_CAPACITY,
};
pub use network::NetworkState;
pub use ordering::{OrderingRule, OrderingRules};
pub use policy::{
    RetryPolicy, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_BACKOFF_MS,
};

use thiserror::Error;

use crate::store::StoreError;

/// Errors from the sync queue.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Client error: {0}")]
    Client(String),
}
