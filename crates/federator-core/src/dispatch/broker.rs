//! Correlation-id addressed delivery channels for callback replies

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc};
use tracing::debug;

use crate::error::{Error, Result};

/// A reply as it sits on a channel
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// The payload itself
    Inline(Value),
    /// Key of a payload parked in the blob store
    Stored(String),
}

/// Receiving side of one open connection to a channel
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery, or `None` once the channel is gone
    async fn next(&mut self) -> Option<Delivery>;
}

#[async_trait]
pub trait CallbackBroker: Send + Sync {
    /// Create the channel for a correlation id. Must happen before the
    /// request that triggers replies is sent.
    async fn provision(&self, id: &str) -> Result<()>;

    /// Enqueue a delivery. Fails if the channel was never provisioned.
    async fn publish(&self, id: &str, delivery: Delivery) -> Result<()>;

    /// Open a connection to a provisioned channel. Deliveries not yet
    /// consumed survive closing and reopening.
    async fn open(&self, id: &str) -> Result<Box<dyn DeliveryStream>>;

    async fn delete(&self, id: &str) -> Result<()>;
}

struct Channel {
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>,
}

/// In-process broker; each channel is an unbounded queue
#[derive(Default)]
pub struct LocalBroker {
    channels: RwLock<HashMap<String, Channel>>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_provisioned(&self, id: &str) -> bool {
        self.channels.read().await.contains_key(id)
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

struct LocalStream {
    receiver: OwnedMutexGuard<mpsc::UnboundedReceiver<Delivery>>,
}

#[async_trait]
impl DeliveryStream for LocalStream {
    async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

#[async_trait]
impl CallbackBroker for LocalBroker {
    async fn provision(&self, id: &str) -> Result<()> {
        let mut channels = self.channels.write().await;
        if !channels.contains_key(id) {
            let (sender, receiver) = mpsc::unbounded_channel();
            channels.insert(
                id.to_string(),
                Channel {
                    sender,
                    receiver: Arc::new(Mutex::new(receiver)),
                },
            );
            debug!(correlation_id = %id, "Provisioned delivery channel");
        }
        Ok(())
    }

    async fn publish(&self, id: &str, delivery: Delivery) -> Result<()> {
        let channels = self.channels.read().await;
        let channel = channels
            .get(id)
            .ok_or_else(|| Error::Broker(format!("No delivery channel for {}", id)))?;
        channel
            .sender
            .send(delivery)
            .map_err(|_| Error::Broker(format!("Delivery channel {} is closed", id)))
    }

    async fn open(&self, id: &str) -> Result<Box<dyn DeliveryStream>> {
        let receiver = {
            let channels = self.channels.read().await;
            let channel = channels
                .get(id)
                .ok_or_else(|| Error::Broker(format!("No delivery channel for {}", id)))?;
            Arc::clone(&channel.receiver)
        };
        Ok(Box::new(LocalStream {
            receiver: receiver.lock_owned().await,
        }))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        if self.channels.write().await.remove(id).is_some() {
            debug!(correlation_id = %id, "Deleted delivery channel");
        }
        Ok(())
    }
}
