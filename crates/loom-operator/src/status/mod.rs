//! Event-driven status manager
//!
//! Collects status events on an in-memory channel, aggregates them per
//! tenant, and performs batched status-subresource updates to minimize API
//! calls. One background worker owns the pending map; producers only touch
//! the channel.

mod manager;
mod types;

pub use manager::{
    KubeNodeStatusClient, NodeStatusClient, StatusManager, StatusManagerOptions,
    DEFAULT_BATCH_SIZE, DEFAULT_EVENT_BUFFER, DEFAULT_FLUSH_INTERVAL,
};
pub use types::{EventPayload, MetricsPayload, NodeKey, StatusEvent, StatusUpdate};

#[cfg(test)]
pub use manager::MockNodeStatusClient;
