//! End-to-end tests against a live RabbitMQ.
//!
//! Start a broker (for example `docker run -p 5672:5672 rabbitmq:3`), point
//! `AMQP_ADDR` at it if it is not on localhost, then run:
//!
//! ```text
//! cargo test --test e2e -- --ignored
//! ```

use std::time::Duration;

use lapin::options::BasicPublishOptions;
use lapin::BasicProperties;
use rabbitbus::{BusConfig, BusError, Inbound, MessageBus, QueueOptions};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

fn test_bus() -> MessageBus {
    let _ = tracing_subscriber::fmt::try_init();
    let mut config = BusConfig::from_env().expect("config");
    config.exchange = format!("bus-test-{}", Uuid::new_v4());
    MessageBus::from_config(config)
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn request_reply_roundtrip() {
    let bus = test_bus();
    let channel = bus.channel().await.expect("channel");
    let queue = format!("rpc-echo-{}", Uuid::new_v4());

    channel
        .rpc()
        .accept(&queue, |message: String| async move { Ok(format!("{}REPLY", message)) })
        .await
        .expect("accept");

    let reply: String = channel.rpc().request(&queue, &"Sup?").await.expect("request");
    assert_eq!(reply, "Sup?REPLY");
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn concurrent_requests_share_one_reply_queue() {
    let bus = test_bus();
    let channel = bus.channel().await.expect("channel");
    let queue = format!("rpc-concurrent-{}", Uuid::new_v4());

    channel
        .rpc()
        .accept(&queue, |message: String| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(format!("{}REPLY", message))
        })
        .await
        .expect("accept");

    let (one, two) = tokio::join!(
        channel.rpc().request::<_, String>(&queue, &"one"),
        channel.rpc().request::<_, String>(&queue, &"two"),
    );
    assert_eq!(one.expect("first reply"), "oneREPLY");
    assert_eq!(two.expect("second reply"), "twoREPLY");

    // both calls rode the same broker-named private queue
    let name = channel.rpc().reply_queue_name().expect("reply queue ready");
    assert!(name.starts_with("amq.gen"), "queue name {}", name);
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn pubsub_delivers_on_the_topic_key() {
    let bus = test_bus();
    let channel = bus.channel().await.expect("channel");

    let (tx, mut rx) = mpsc::channel::<(String, Value)>(8);
    channel
        .subscribe("a.b", "", move |inbound: Inbound<Value>| {
            let probe = tx.clone();
            async move {
                let _ = probe.send((inbound.routing_key.clone(), inbound.payload.clone())).await;
                let _ = inbound.ack().await;
            }
        })
        .await
        .expect("subscribe");

    channel.publish("a.b", &json!({"x": 1})).await.expect("publish");

    let (key, payload) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery timed out")
        .expect("subscription closed");
    assert_eq!(key, "a.b");
    assert_eq!(payload, json!({"x": 1}));
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn malformed_json_never_reaches_the_consumer() {
    let bus = test_bus();
    let channel = bus.channel().await.expect("channel");

    let (tx, mut rx) = mpsc::channel::<Value>(8);
    channel
        .subscribe("bad.payload", "", move |inbound: Inbound<Value>| {
            let probe = tx.clone();
            async move {
                let _ = probe.send(inbound.payload.clone()).await;
                let _ = inbound.ack().await;
            }
        })
        .await
        .expect("subscribe");

    channel.publish_raw("bad.payload", b"{not json").await.expect("raw publish");
    channel.publish("bad.payload", &json!({"ok": true})).await.expect("publish");

    // prefetch is 1, so the malformed message was acked and dropped before
    // the well-formed one could arrive
    let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery timed out")
        .expect("subscription closed");
    assert_eq!(seen, json!({"ok": true}));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn deliveries_without_a_routing_key_are_dropped() {
    let bus = test_bus();
    let channel = bus.channel().await.expect("channel");
    let queue = format!("sub-keyless-{}", Uuid::new_v4());

    let (tx, mut rx) = mpsc::channel::<(String, Value)>(8);
    let options = QueueOptions {
        durable: Some(false),
        auto_delete: Some(true),
        ..QueueOptions::default()
    };
    channel
        .subscribe_with("keyless.test", &queue, options, move |inbound: Inbound<Value>| {
            let probe = tx.clone();
            async move {
                let _ = probe.send((inbound.routing_key.clone(), inbound.payload.clone())).await;
                let _ = inbound.ack().await;
            }
        })
        .await
        .expect("subscribe");

    // route a message in through the fanout side door so it arrives with an
    // empty routing key
    channel
        .inner()
        .queue_bind(&queue, "amq.fanout", "", Default::default(), Default::default())
        .await
        .expect("fanout bind");
    channel
        .inner()
        .basic_publish(
            "amq.fanout",
            "",
            BasicPublishOptions::default(),
            br#"{"keyless": true}"#,
            BasicProperties::default(),
        )
        .await
        .expect("fanout publish");

    // the keyless delivery is acked and dropped; the keyed one arrives
    channel.publish("keyless.test", &json!({"keyed": true})).await.expect("publish");

    let (key, payload) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery timed out")
        .expect("subscription closed");
    assert_eq!(key, "keyless.test");
    assert_eq!(payload, json!({"keyed": true}));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn responder_ignores_requests_missing_rpc_metadata() {
    let bus = test_bus();
    let channel = bus.channel().await.expect("channel");
    let queue = format!("rpc-metadata-{}", Uuid::new_v4());

    let (tx, mut rx) = mpsc::channel::<String>(8);
    channel
        .rpc()
        .accept(&queue, move |message: String| {
            let probe = tx.clone();
            async move {
                let _ = probe.send(message.clone()).await;
                Ok(format!("{}REPLY", message))
            }
        })
        .await
        .expect("accept");

    // no reply_to, no correlation_id: the handler must never see it
    channel
        .inner()
        .basic_publish("", &queue, BasicPublishOptions::default(), b"\"bare\"", BasicProperties::default())
        .await
        .expect("bare publish");

    let reply: String = channel.rpc().request(&queue, &"real").await.expect("request");
    assert_eq!(reply, "realREPLY");

    assert_eq!(rx.recv().await.expect("handler ran"), "real");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn a_stray_reply_does_not_disturb_the_bus() {
    let bus = test_bus();
    let channel = bus.channel().await.expect("channel");
    let queue = format!("rpc-stray-{}", Uuid::new_v4());

    channel
        .rpc()
        .accept(&queue, |message: String| async move { Ok(format!("{}REPLY", message)) })
        .await
        .expect("accept");

    let first: String = channel.rpc().request(&queue, &"first").await.expect("request");
    assert_eq!(first, "firstREPLY");

    // inject a reply whose correlation id nobody is waiting on
    let reply_queue = channel.rpc().reply_queue_name().expect("reply queue ready");
    channel
        .inner()
        .basic_publish(
            "",
            &reply_queue,
            BasicPublishOptions::default(),
            b"\"stray\"",
            BasicProperties::default().with_correlation_id(Uuid::new_v4().to_string().as_str().into()),
        )
        .await
        .expect("stray publish");

    // the endpoint keeps working
    let second: String = channel.rpc().request(&queue, &"second").await.expect("request");
    assert_eq!(second, "secondREPLY");
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn requests_to_an_unserved_queue_time_out() {
    let mut config = BusConfig::from_env().expect("config");
    config.exchange = format!("bus-test-{}", Uuid::new_v4());
    config.rpc.reply_ttl = Duration::from_millis(500);
    let bus = MessageBus::from_config(config);
    let channel = bus.channel().await.expect("channel");

    // routable but never answered
    let queue = format!("rpc-nobody-{}", Uuid::new_v4());
    channel
        .inner()
        .queue_declare(&queue, Default::default(), Default::default())
        .await
        .expect("declare");

    let err = channel.rpc().request::<_, String>(&queue, &"hello").await.unwrap_err();
    assert!(matches!(err, BusError::ReplyTimeout(_)), "got {}", err);
}
