mod correlation;
mod reply_queue;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_lite::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::BasicProperties;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{ack_discard, QueueOptions};
use crate::config::RpcOptions;
use crate::error::{BusError, Result};
use correlation::{CorrelationMap, RouteOutcome};
use reply_queue::ReplyQueueSlot;

/// Cadence of the expired-call sweep on the reply consumer.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Request/reply endpoint of one channel.
///
/// Every request sent through this endpoint multiplexes its reply over a
/// single exclusive, broker-named queue, declared lazily by whichever
/// caller needs it first. Replies find their way back through the
/// correlation id stamped on each request.
pub struct Rpc {
    channel: lapin::Channel,
    options: RpcOptions,
    slot: ReplyQueueSlot,
    pending: Arc<CorrelationMap>,
}

impl Rpc {
    pub(crate) fn new(channel: lapin::Channel, options: RpcOptions) -> Self {
        Rpc {
            channel,
            options,
            slot: ReplyQueueSlot::new(),
            pending: Arc::new(CorrelationMap::new()),
        }
    }

    /// Name of the private reply queue, once it has come up.
    pub fn reply_queue_name(&self) -> Option<String> {
        self.slot.ready_name()
    }

    /// Send `message` to `queue` and await the decoded reply.
    pub async fn request<T, R>(&self, queue: &str, message: &T) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(message)?;
        let body = self.exchange_request(queue, &payload, false).await?;
        serde_json::from_slice(&body).map_err(|e| BusError::Decode(e.to_string()))
    }

    /// Send bytes as-is and get the reply bytes as-is.
    pub async fn request_raw(&self, queue: &str, payload: &[u8]) -> Result<Vec<u8>> {
        self.exchange_request(queue, payload, true).await
    }

    async fn exchange_request(&self, queue: &str, payload: &[u8], raw: bool) -> Result<Vec<u8>> {
        let reply_queue = self.resolve_reply_queue().await?;
        let (correlation_id, reply_rx) = self.pending.register(raw, self.options.reply_ttl);

        let properties = BasicProperties::default()
            .with_correlation_id(correlation_id.as_str().into())
            .with_reply_to(reply_queue.as_str().into());
        let sent = self
            .channel
            .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
            .await;
        if let Err(e) = sent {
            self.pending.remove(&correlation_id);
            return Err(BusError::Publish(e.to_string()));
        }
        debug!(queue, correlation_id = %correlation_id, "request sent");

        match tokio::time::timeout(self.options.reply_ttl, reply_rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(BusError::ReplyChannelClosed),
            Err(_elapsed) => {
                self.pending.remove(&correlation_id);
                Err(BusError::ReplyTimeout(self.options.reply_ttl))
            }
        }
    }

    /// Bring up, or join, the shared reply queue.
    async fn resolve_reply_queue(&self) -> Result<String> {
        self.slot.resolve(&self.options, || self.declare_reply_queue()).await
    }

    /// One generation's declaration: an exclusive broker-named queue plus
    /// the no-ack consumer that owns every reply on it.
    async fn declare_reply_queue(&self) -> Result<String> {
        let declared = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    durable: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Queue {
                queue: String::new(),
                detail: format!("Failed to declare private reply queue: {}", e),
            })?;
        let name = declared.name().as_str().to_string();

        let tag = format!("rpc-reply-{}", &Uuid::new_v4().to_string()[..8]);
        let deliveries = self
            .channel
            .basic_consume(
                &name,
                &tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::Consume(format!(
                    "Failed to consume private reply queue \"{}\": {}",
                    name, e
                ))
            })?;

        tokio::spawn(run_reply_loop(deliveries, Arc::clone(&self.pending), name.clone()));
        info!(queue = %name, "private reply queue up");
        Ok(name)
    }

    /// Serve requests arriving on `queue`: decode each one, run `handler`,
    /// send its reply to the embedded return address, then ack. One request
    /// at a time (prefetch 1).
    ///
    /// A handler error is logged and the request acked without a reply; the
    /// caller is left to its timeout, exactly as if nobody was serving.
    pub async fn accept<Req, Rep, F, Fut>(&self, queue: &str, handler: F) -> Result<()>
    where
        Req: DeserializeOwned + Send + 'static,
        Rep: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rep>> + Send + 'static,
    {
        self.accept_with(queue, QueueOptions::default(), handler).await
    }

    pub async fn accept_with<Req, Rep, F, Fut>(
        &self,
        queue: &str,
        options: QueueOptions,
        handler: F,
    ) -> Result<()>
    where
        Req: DeserializeOwned + Send + 'static,
        Rep: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rep>> + Send + 'static,
    {
        let deliveries = self.setup_responder(queue, &options).await?;
        tokio::spawn(run_responder(
            self.channel.clone(),
            deliveries,
            queue.to_string(),
            |data: &[u8]| serde_json::from_slice::<Req>(data),
            |reply: &Rep| serde_json::to_vec(reply),
            handler,
        ));
        Ok(())
    }

    /// Serve raw requests: the handler gets the payload bytes as-is and
    /// answers with bytes sent as-is.
    pub async fn accept_raw<F, Fut>(&self, queue: &str, handler: F) -> Result<()>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
    {
        let deliveries = self.setup_responder(queue, &QueueOptions::default()).await?;
        tokio::spawn(run_responder(
            self.channel.clone(),
            deliveries,
            queue.to_string(),
            |data: &[u8]| Ok::<_, serde_json::Error>(data.to_vec()),
            |reply: &Vec<u8>| Ok::<_, serde_json::Error>(reply.clone()),
            handler,
        ));
        Ok(())
    }

    async fn setup_responder(&self, queue: &str, options: &QueueOptions) -> Result<lapin::Consumer> {
        self.channel
            .queue_declare(queue, options.resolve_plain(), FieldTable::default())
            .await
            .map_err(|e| BusError::Queue {
                queue: queue.to_string(),
                detail: format!("Failed to declare queue: {}", e),
            })?;

        self.channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Queue {
                queue: queue.to_string(),
                detail: format!("Failed to set prefetch: {}", e),
            })?;

        let tag = format!("rpc-{}", &Uuid::new_v4().to_string()[..8]);
        self.channel
            .basic_consume(queue, &tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| BusError::Consume(format!("Failed to consume \"{}\": {}", queue, e)))
    }
}

/// Owns the reply consumer: routes each reply to its pending call and
/// periodically sweeps out calls whose callers are long gone.
async fn run_reply_loop(mut deliveries: lapin::Consumer, pending: Arc<CorrelationMap>, queue: String) {
    let mut sweeper = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            delivery = deliveries.next() => match delivery {
                Some(Ok(delivery)) => route_reply(&pending, &delivery),
                Some(Err(e)) => warn!(queue = %queue, error = %e, "reply consumer error"),
                None => break,
            },
            _ = sweeper.tick() => {
                let evicted = pending.sweep_expired();
                if evicted > 0 {
                    debug!(queue = %queue, evicted, "swept expired pending calls");
                }
            }
        }
    }
    info!(queue = %queue, "reply consumer stopped");
}

fn route_reply(pending: &CorrelationMap, delivery: &Delivery) {
    let correlation_id = match delivery.properties.correlation_id() {
        Some(id) => id.as_str().to_string(),
        None => {
            debug!("discarding a reply without a correlation id");
            return;
        }
    };
    match pending.complete(&correlation_id, &delivery.data) {
        RouteOutcome::Completed => debug!(correlation_id = %correlation_id, "reply routed"),
        RouteOutcome::Unknown => {
            debug!(correlation_id = %correlation_id, "discarding a reply with no pending call")
        }
        RouteOutcome::Malformed => {
            warn!(correlation_id = %correlation_id, "ignoring a reply that failed JSON decoding")
        }
        RouteOutcome::Gone => {
            debug!(correlation_id = %correlation_id, "reply arrived after the caller gave up")
        }
    }
}

async fn run_responder<Req, Rep, D, E, F, Fut>(
    channel: lapin::Channel,
    mut deliveries: lapin::Consumer,
    queue: String,
    decode: D,
    encode: E,
    handler: F,
) where
    Req: Send + 'static,
    Rep: Send + 'static,
    D: Fn(&[u8]) -> serde_json::Result<Req> + Send + 'static,
    E: Fn(&Rep) -> serde_json::Result<Vec<u8>> + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Rep>> + Send + 'static,
{
    while let Some(delivery) = deliveries.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(queue = %queue, error = %e, "responder consumer failed");
                break;
            }
        };

        let (reply_to, correlation_id) = match rpc_reply_address(&delivery) {
            Some(address) => address,
            None => {
                // Not an RPC request; without a return address there is
                // nothing to do but drop it.
                debug!(queue = %queue, "discarding a request without reply_to and correlation_id");
                ack_discard(&delivery, &queue).await;
                continue;
            }
        };

        let request = match decode(&delivery.data) {
            Ok(request) => request,
            Err(e) => {
                warn!(queue = %queue, error = %e, "discarding a request that failed JSON decoding");
                ack_discard(&delivery, &queue).await;
                continue;
            }
        };

        match handler(request).await {
            Ok(reply) => match encode(&reply) {
                Ok(body) => {
                    let properties =
                        BasicProperties::default().with_correlation_id(correlation_id.as_str().into());
                    let sent = channel
                        .basic_publish("", &reply_to, BasicPublishOptions::default(), &body, properties)
                        .await;
                    if let Err(e) = sent {
                        error!(queue = %queue, reply_to = %reply_to, error = %e, "failed to send reply");
                    }
                }
                Err(e) => error!(queue = %queue, error = %e, "failed to serialize reply"),
            },
            Err(e) => {
                warn!(queue = %queue, correlation_id = %correlation_id, error = %e, "request handler failed, request dropped");
            }
        }

        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            error!(queue = %queue, error = %e, "failed to acknowledge a request");
        }
    }
    info!(queue = %queue, "responder stopped");
}

/// Both RPC headers, or nothing.
fn rpc_reply_address(delivery: &Delivery) -> Option<(String, String)> {
    let reply_to = delivery.properties.reply_to().as_ref()?;
    let correlation_id = delivery.properties.correlation_id().as_ref()?;
    Some((reply_to.as_str().to_string(), correlation_id.as_str().to_string()))
}
