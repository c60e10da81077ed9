//! # Typed Pub/Sub Channels
//!
//! `publish(message)` and `listen(handler)` resolve the channel from the
//! message type through the [`TypeRegistry`](crate::registry::TypeRegistry),
//! never from a caller-supplied string. A type without channel metadata fails
//! at the call site with a [`ConfigurationError`](crate::ConfigurationError).
//!
//! Delivery is at-most-once per subscriber and fire-and-forget: no
//! acknowledgment, no redelivery. Handlers must tolerate duplicates and gaps.

use crate::codec::Codec;
use crate::error::{ChannelError, StoreError};
use crate::store::{Delivery, StoreBackend};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::type_name;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Publishes and subscribes typed messages over the store's topics.
#[derive(Clone)]
pub struct ChannelRegistry {
    backend: Arc<dyn StoreBackend>,
    codec: Arc<Codec>,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry").finish_non_exhaustive()
    }
}

impl ChannelRegistry {
    pub fn new(backend: Arc<dyn StoreBackend>, codec: Arc<Codec>) -> Self {
        Self { backend, codec }
    }

    /// Publishes `message` on its declared channel.
    ///
    /// Returns the number of subscribers reached. Zero is not an error.
    pub fn publish<T>(&self, message: &T) -> Result<usize, ChannelError>
    where
        T: Serialize + 'static,
    {
        let channel = self.codec.registry().channel_of::<T>()?;
        let payload = self.codec.encode(message)?;
        let reached = self.backend.publish(channel, payload)?;

        debug!(
            "📤 Published {} on '{}' to {} subscriber(s)",
            type_name::<T>(),
            channel,
            reached
        );
        Ok(reached)
    }

    /// Non-blocking form of [`publish`](Self::publish).
    pub async fn publish_async<T>(&self, message: T) -> Result<usize, ChannelError>
    where
        T: Serialize + Send + 'static,
    {
        let registry = self.clone();
        tokio::task::spawn_blocking(move || registry.publish(&message))
            .await
            .map_err(StoreError::from)?
    }

    /// Subscribes `handler` to every message of type `T`.
    ///
    /// The subscription is live when this returns; messages are then drained
    /// on a spawned task, so this must be called from within a tokio runtime.
    /// Undecodable messages are logged and skipped.
    pub fn listen<T, F>(&self, handler: F) -> Result<Listener, ChannelError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.listen_async(move |message: T| {
            handler(message);
            std::future::ready(())
        })
    }

    /// Like [`listen`](Self::listen), but awaits `handler` for each message
    /// before taking the next one.
    pub fn listen_async<T, F, Fut>(&self, handler: F) -> Result<Listener, ChannelError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let channel = self.codec.registry().channel_of::<T>()?.to_string();
        let mut subscription = self.backend.subscribe(&channel)?;
        let codec = self.codec.clone();
        let task_channel = channel.clone();

        let task = tokio::spawn(async move {
            while let Some(delivery) = subscription.recv().await {
                match delivery {
                    Delivery::Message(bytes) => match codec.decode::<T>(&bytes) {
                        Ok(message) => handler(message).await,
                        Err(e) => {
                            error!("❌ Dropping undecodable message on '{}': {}", task_channel, e)
                        }
                    },
                    Delivery::Lagged(skipped) => {
                        warn!("⚠️ Listener on '{}' lagged, {} message(s) lost", task_channel, skipped)
                    }
                }
            }
            debug!("Channel '{}' closed", task_channel);
        });

        debug!("👂 Listening for {} on '{}'", type_name::<T>(), channel);
        Ok(Listener { channel, task })
    }
}

/// Handle to a running subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Listener {
    channel: String,
    task: JoinHandle<()>,
}

impl Listener {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    pub fn close(self) {}
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
