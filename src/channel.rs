use std::future::Future;

use futures_lite::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::BasicProperties;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RpcOptions;
use crate::error::{BusError, Result};
use crate::rpc::Rpc;

/// Options applied to a published message.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Ask the broker to write the message to disk.
    pub persistent: bool,
    /// MIME type stamped on the message.
    pub content_type: String,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            persistent: true,
            content_type: "application/json".to_string(),
        }
    }
}

impl PublishOptions {
    fn properties(&self) -> BasicProperties {
        let delivery_mode = if self.persistent { 2 } else { 1 };
        BasicProperties::default()
            .with_delivery_mode(delivery_mode)
            .with_content_type(self.content_type.as_str().into())
    }
}

/// Declare options for subscription and responder queues. Unset fields take
/// defaults derived from how the queue is used.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub durable: Option<bool>,
    pub exclusive: Option<bool>,
    pub auto_delete: Option<bool>,
}

impl QueueOptions {
    /// Defaults for a subscription queue. A named queue is durable and
    /// shared, so competing consumers can split the work and messages
    /// survive a broker restart. An anonymous queue is exclusive to this
    /// connection and cleaned up with it. `auto_delete` only defaults on
    /// when the queue resolved exclusive.
    pub(crate) fn resolve_for(&self, queue: &str) -> QueueDeclareOptions {
        if queue.is_empty() {
            let exclusive = self.exclusive.unwrap_or(true);
            QueueDeclareOptions {
                exclusive,
                durable: self.durable.unwrap_or(false),
                auto_delete: self.auto_delete.unwrap_or(exclusive),
                ..QueueDeclareOptions::default()
            }
        } else {
            QueueDeclareOptions {
                durable: self.durable.unwrap_or(true),
                exclusive: self.exclusive.unwrap_or(false),
                auto_delete: self.auto_delete.unwrap_or(false),
                ..QueueDeclareOptions::default()
            }
        }
    }

    /// Defaults for a responder queue: transient and shared unless the
    /// caller says otherwise.
    pub(crate) fn resolve_plain(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: self.durable.unwrap_or(false),
            exclusive: self.exclusive.unwrap_or(false),
            auto_delete: self.auto_delete.unwrap_or(false),
            ..QueueDeclareOptions::default()
        }
    }
}

/// One delivered message plus its acknowledgment surface.
///
/// Acknowledging is the consumer's responsibility. The bus only acks on its
/// own when it discards a message the consumer was never shown.
pub struct Inbound<T> {
    /// Topic key the message was published under.
    pub routing_key: String,
    /// Decoded payload (or the raw bytes for raw subscriptions).
    pub payload: T,
    delivery: Delivery,
}

impl<T> Inbound<T> {
    /// Payload bytes exactly as they came off the wire.
    pub fn raw(&self) -> &[u8] {
        &self.delivery.data
    }

    /// Wire properties of the delivery.
    pub fn properties(&self) -> &BasicProperties {
        &self.delivery.properties
    }

    /// Tell the broker this message is done. Consumes the envelope, so a
    /// message cannot be acknowledged twice.
    pub async fn ack(self) -> Result<()> {
        self.delivery
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Consume(format!("Failed to acknowledge message: {}", e)))
    }
}

/// One application-facing channel on the bus: publish/subscribe on the topic
/// exchange, plus an RPC endpoint sharing the same broker channel.
pub struct BusChannel {
    channel: lapin::Channel,
    exchange: String,
    rpc: Rpc,
}

impl BusChannel {
    pub(crate) fn new(channel: lapin::Channel, exchange: String, rpc_options: RpcOptions) -> Self {
        let rpc = Rpc::new(channel.clone(), rpc_options);
        BusChannel {
            channel,
            exchange,
            rpc,
        }
    }

    /// Name of the topic exchange this channel publishes on.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Request/reply endpoint bound to this channel.
    pub fn rpc(&self) -> &Rpc {
        &self.rpc
    }

    /// The underlying broker channel, for operations this layer does not
    /// wrap.
    pub fn inner(&self) -> &lapin::Channel {
        &self.channel
    }

    /// JSON-encode `message` and publish it under `key` on the topic
    /// exchange. Fire-and-forget: delivery is not awaited beyond the wire
    /// write.
    pub async fn publish<T: Serialize>(&self, key: &str, message: &T) -> Result<()> {
        self.publish_with(key, message, PublishOptions::default()).await
    }

    pub async fn publish_with<T: Serialize>(
        &self,
        key: &str,
        message: &T,
        options: PublishOptions,
    ) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.publish_bytes(key, &payload, options).await
    }

    /// Publish bytes as-is. The caller owns the encoding.
    pub async fn publish_raw(&self, key: &str, payload: &[u8]) -> Result<()> {
        self.publish_bytes(key, payload, PublishOptions::default()).await
    }

    async fn publish_bytes(&self, key: &str, payload: &[u8], options: PublishOptions) -> Result<()> {
        self.channel
            .basic_publish(
                &self.exchange,
                key,
                BasicPublishOptions::default(),
                payload,
                options.properties(),
            )
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        debug!(exchange = %self.exchange, key, bytes = payload.len(), "published");
        Ok(())
    }

    /// Bind `queue` to `key` on the topic exchange and feed each decoded
    /// message to `consumer`. An empty `queue` asks the broker for a fresh
    /// private name. The consumer sees one message at a time (prefetch 1)
    /// and acknowledges through the [`Inbound`] it is handed; messages that
    /// fail JSON decoding are acked and dropped before it ever sees them.
    pub async fn subscribe<T, F, Fut>(&self, key: &str, queue: &str, consumer: F) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Inbound<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe_with(key, queue, QueueOptions::default(), consumer).await
    }

    pub async fn subscribe_with<T, F, Fut>(
        &self,
        key: &str,
        queue: &str,
        options: QueueOptions,
        consumer: F,
    ) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Inbound<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let queue_name = self.bind_subscription(key, queue, &options).await?;
        let deliveries = self.start_consumer(&queue_name).await?;
        tokio::spawn(run_subscription(
            deliveries,
            queue_name,
            |data: &[u8]| serde_json::from_slice::<T>(data),
            consumer,
        ));
        Ok(())
    }

    /// Subscribe without decoding: the consumer gets the payload bytes
    /// as-is, whatever they contain.
    pub async fn subscribe_raw<F, Fut>(&self, key: &str, queue: &str, consumer: F) -> Result<()>
    where
        F: Fn(Inbound<Vec<u8>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let queue_name = self.bind_subscription(key, queue, &QueueOptions::default()).await?;
        let deliveries = self.start_consumer(&queue_name).await?;
        tokio::spawn(run_subscription(
            deliveries,
            queue_name,
            |data: &[u8]| Ok::<_, serde_json::Error>(data.to_vec()),
            consumer,
        ));
        Ok(())
    }

    async fn bind_subscription(&self, key: &str, queue: &str, options: &QueueOptions) -> Result<String> {
        self.channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Queue {
                queue: queue.to_string(),
                detail: format!("Failed to set prefetch: {}", e),
            })?;

        let declared = self
            .channel
            .queue_declare(queue, options.resolve_for(queue), FieldTable::default())
            .await
            .map_err(|e| BusError::Queue {
                queue: queue.to_string(),
                detail: format!("Failed to declare queue: {}", e),
            })?;
        let queue_name = declared.name().as_str().to_string();

        self.channel
            .queue_bind(
                &queue_name,
                &self.exchange,
                key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Queue {
                queue: queue_name.clone(),
                detail: format!("Failed to bind queue: {}", e),
            })?;

        info!(queue = %queue_name, key, exchange = %self.exchange, "subscription bound");
        Ok(queue_name)
    }

    async fn start_consumer(&self, queue_name: &str) -> Result<lapin::Consumer> {
        let tag = format!("sub-{}", &Uuid::new_v4().to_string()[..8]);
        self.channel
            .basic_consume(
                queue_name,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::Consume(format!("Failed to start consumer on \"{}\": {}", queue_name, e))
            })
    }
}

/// Ack a message the consumer will never see, so it does not sit unacked
/// against the prefetch window forever.
pub(crate) async fn ack_discard(delivery: &Delivery, queue: &str) {
    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        error!(queue = %queue, error = %e, "failed to acknowledge a discarded message");
    }
}

async fn run_subscription<T, D, F, Fut>(
    mut deliveries: lapin::Consumer,
    queue: String,
    decode: D,
    consumer: F,
) where
    T: Send + 'static,
    D: Fn(&[u8]) -> serde_json::Result<T> + Send + 'static,
    F: Fn(Inbound<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    while let Some(delivery) = deliveries.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(queue = %queue, error = %e, "subscription consumer failed");
                break;
            }
        };

        let routing_key = delivery.routing_key.as_str().to_string();
        if routing_key.is_empty() {
            // Topic routing always stamps a key; this wandered in from
            // outside the pub/sub contract.
            debug!(queue = %queue, "discarding a delivery without a routing key");
            ack_discard(&delivery, &queue).await;
            continue;
        }

        let payload = match decode(&delivery.data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(queue = %queue, routing_key = %routing_key, error = %e, "discarding a message that failed JSON decoding");
                ack_discard(&delivery, &queue).await;
                continue;
            }
        };

        consumer(Inbound {
            routing_key,
            payload,
            delivery,
        })
        .await;
    }
    info!(queue = %queue, "subscription consumer stopped");
}
