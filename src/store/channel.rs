//! JSON pub/sub channel over the store's publish/subscribe transport.
//!
//! Channels are a liveness optimization, never a correctness backstop:
//! delivery is best-effort to whoever is subscribed at publish time.

use crate::error::Result;
use crate::store::{Store, Subscription};
use std::sync::Arc;

/// Reserved message that completes every live subscription to a channel.
const CLOSE_MESSAGE: &str = "relayq-channel-close";

#[derive(Clone)]
pub struct Channel {
    store: Arc<dyn Store>,
    name: String,
}

impl Channel {
    pub fn new(store: Arc<dyn Store>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send(&self, message: &serde_json::Value) -> Result<()> {
        let wire = serde_json::to_string(message)?;
        self.store.publish(&self.name, &wire).await
    }

    /// Close the channel: every subscriber's stream completes.
    pub async fn close(&self) -> Result<()> {
        self.store.publish(&self.name, CLOSE_MESSAGE).await
    }

    pub async fn subscribe(&self) -> Result<ChannelSubscription> {
        let inner = self.store.subscribe(&self.name).await?;
        Ok(ChannelSubscription { inner })
    }
}

/// A live subscription yielding JSON messages until the channel is closed
/// or the subscription is dropped.
pub struct ChannelSubscription {
    inner: Subscription,
}

impl ChannelSubscription {
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        let wire = self.inner.recv().await?;
        if wire == CLOSE_MESSAGE {
            return None;
        }
        match serde_json::from_str(&wire) {
            Ok(value) => Some(value),
            // Non-JSON publishers still get through as raw strings.
            Err(_) => Some(serde_json::Value::String(wire)),
        }
    }
}
