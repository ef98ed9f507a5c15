use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use rabbitmq_dispatch::retry::retry_with_backoff;
use rabbitmq_dispatch::{
    Acknowledger, Backoff, Broker, ConnectionState, ConsumerLoop, DeliveryTag, LoopState, Message,
    MessageHandler, Payload, ReportPublisher, RetryConfig, Session, WorkerConfig, WorkerError,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Ack(DeliveryTag),
    Nack(DeliveryTag, bool),
}

type Outbox = mpsc::UnboundedSender<Result<Message, WorkerError>>;

/// In-memory broker state shared between the fake and the test driving it.
#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<Call>>,
    reports: Mutex<Vec<(String, Value)>>,
    outbox: Mutex<Option<Outbox>>,
    unsettled: Mutex<HashMap<DeliveryTag, Vec<u8>>>,
    next_tag: AtomicU64,
    pulled: AtomicUsize,
    connect_attempts: AtomicU32,
}

impl Shared {
    /// Queues `body` under a fresh tag; it is pushed right away when a consumer is attached.
    fn deliver(&self, body: &[u8], redelivered: bool) -> DeliveryTag {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        self.unsettled.lock().unwrap().insert(tag, body.to_vec());
        let mut message = Message::new(tag, body.to_vec());
        message.redelivered = redelivered;
        if let Some(outbox) = self.outbox.lock().unwrap().as_ref() {
            let _ = outbox.send(Ok(message));
        }
        tag
    }
}

#[derive(Clone)]
struct FakeChannel(Arc<Shared>);

#[async_trait]
impl Acknowledger for FakeChannel {
    async fn ack(&self, tag: DeliveryTag) -> Result<(), WorkerError> {
        self.0.calls.lock().unwrap().push(Call::Ack(tag));
        self.0.unsettled.lock().unwrap().remove(&tag);
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), WorkerError> {
        self.0.calls.lock().unwrap().push(Call::Nack(tag, requeue));
        let body = self.0.unsettled.lock().unwrap().remove(&tag);
        if let (true, Some(body)) = (requeue, body) {
            self.0.deliver(&body, true);
        }
        Ok(())
    }
}

#[async_trait]
impl ReportPublisher for FakeChannel {
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), WorkerError> {
        let value: Value = serde_json::from_slice(body)?;
        self.0.reports.lock().unwrap().push((queue.to_string(), value));
        Ok(())
    }
}

struct FakeBroker {
    shared: Arc<Shared>,
    sessions_left: u32,
    /// Connection attempts that fail at the start of every `connect`.
    flaky_attempts: u32,
    state: ConnectionState,
}

#[async_trait]
impl Broker for FakeBroker {
    type Acker = FakeChannel;
    type Publisher = FakeChannel;

    async fn connect(&mut self, _config: &WorkerConfig) -> Result<Session<FakeChannel, FakeChannel>, WorkerError> {
        self.state = ConnectionState::Connecting;
        if self.sessions_left == 0 {
            self.state = ConnectionState::Disconnected;
            return Err(WorkerError::Connection {
                attempts: 1,
                source: Box::new(WorkerError::from("connection refused")),
            });
        }

        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30)).without_jitter();
        let flaky = self.flaky_attempts;
        let shared = self.shared.clone();
        retry_with_backoff(&backoff, 5, |attempt| {
            shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt > flaky {
                    Ok(())
                } else {
                    Err(WorkerError::from("connection refused"))
                }
            }
        })
        .await?;
        self.sessions_left -= 1;

        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.outbox.lock().unwrap() = Some(tx);
        // Anything the last session left unsettled comes back first.
        let leftovers: Vec<Vec<u8>> = self.shared.unsettled.lock().unwrap().drain().map(|(_, body)| body).collect();
        for body in leftovers {
            self.shared.deliver(&body, true);
        }

        let shared = self.shared.clone();
        let deliveries = stream::unfold(rx, move |mut rx| {
            let shared = shared.clone();
            async move {
                let item = rx.recv().await?;
                shared.pulled.fetch_add(1, Ordering::SeqCst);
                Some((item, rx))
            }
        })
        .boxed();

        self.state = ConnectionState::Connected;
        Ok(Session {
            acker: FakeChannel(self.shared.clone()),
            publisher: FakeChannel(self.shared.clone()),
            deliveries,
        })
    }

    async fn stop_consuming(&mut self) {
        self.shared.outbox.lock().unwrap().take();
    }

    fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    async fn close(&mut self) {
        self.state = ConnectionState::Closing;
        self.shared.outbox.lock().unwrap().take();
        self.state = ConnectionState::Disconnected;
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}

/// Test-side view of the fake broker.
#[derive(Clone)]
struct BrokerHandle(Arc<Shared>);

impl BrokerHandle {
    fn publish(&self, body: &str) -> DeliveryTag {
        self.0.deliver(body.as_bytes(), false)
    }

    /// Simulates the connection dropping: the delivery stream ends.
    fn disconnect(&self) {
        self.0.outbox.lock().unwrap().take();
    }

    fn calls(&self) -> Vec<Call> {
        self.0.calls.lock().unwrap().clone()
    }

    fn reports(&self) -> Vec<(String, Value)> {
        self.0.reports.lock().unwrap().clone()
    }

    fn pulled(&self) -> usize {
        self.0.pulled.load(Ordering::SeqCst)
    }

    fn connect_attempts(&self) -> u32 {
        self.0.connect_attempts.load(Ordering::SeqCst)
    }

    fn connected(&self) -> bool {
        self.0.outbox.lock().unwrap().is_some()
    }
}

fn fake_broker(sessions: u32, flaky_attempts: u32) -> (FakeBroker, BrokerHandle) {
    let shared = Arc::new(Shared::default());
    let broker = FakeBroker {
        shared: shared.clone(),
        sessions_left: sessions,
        flaky_attempts,
        state: ConnectionState::Disconnected,
    };
    (broker, BrokerHandle(shared))
}

/// Records payloads; `{"fail": true}` errors, `{"hang": true}` never returns,
/// and with a gate every call waits for a permit.
#[derive(Default)]
struct TestHandler {
    seen: Mutex<Vec<Value>>,
    running: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl TestHandler {
    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Default::default()
        }
    }

    fn seen(&self) -> Vec<Value> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for TestHandler {
    async fn handle_message(&self, payload: Payload) -> Result<(), WorkerError> {
        self.seen.lock().unwrap().push(Value::Object(payload.clone()));
        self.running.fetch_add(1, Ordering::SeqCst);
        if payload.contains_key("hang") {
            std::future::pending::<()>().await;
        }
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        if payload.contains_key("fail") {
            return Err(WorkerError::from("handler failed"));
        }
        Ok(())
    }

    fn handler_name(&self) -> &str {
        "TestHandler"
    }
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn config() -> WorkerConfig {
    WorkerConfig::builder("requests")
        .report_queue("responses")
        .max_concurrency(4)
        .shutdown_timeout(Duration::from_secs(2))
        .build()
}

#[tokio::test]
async fn valid_message_is_handled_and_acked_once() {
    let (broker, handle) = fake_broker(1, 0);
    let handler = Arc::new(TestHandler::default());
    let mut consumer = ConsumerLoop::new(broker, handler.clone(), config());
    let (stop, stopped) = oneshot::channel::<()>();

    let driver = async {
        eventually("connection", || handle.connected()).await;
        let tag = handle.publish(r#"{"x":1}"#);
        eventually("ack", || handle.calls() == vec![Call::Ack(tag)]).await;
        stop.send(()).unwrap();
    };
    let (result, ()) = tokio::join!(consumer.run(async { let _ = stopped.await; }), driver);

    result.unwrap();
    assert_eq!(handler.seen(), vec![json!({"x": 1})]);
    assert_eq!(handle.calls(), vec![Call::Ack(1)]);
    assert!(handle.reports().is_empty());
    assert_eq!(consumer.sink().stats().accepted, 0);
    assert_eq!(consumer.state(), LoopState::Closed);
    assert_eq!(consumer.broker().state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn malformed_message_is_rejected_and_reported() {
    let (broker, handle) = fake_broker(1, 0);
    let handler = Arc::new(TestHandler::default());
    let mut consumer = ConsumerLoop::new(broker, handler.clone(), config());
    let (stop, stopped) = oneshot::channel::<()>();

    let driver = async {
        eventually("connection", || handle.connected()).await;
        handle.publish("not-json");
        eventually("nack", || !handle.calls().is_empty()).await;
        stop.send(()).unwrap();
    };
    let (result, ()) = tokio::join!(consumer.run(async { let _ = stopped.await; }), driver);

    result.unwrap();
    assert!(handler.seen().is_empty());
    assert_eq!(handle.calls(), vec![Call::Nack(1, false)]);

    let reports = handle.reports();
    assert_eq!(reports.len(), 1);
    let (queue, report) = &reports[0];
    assert_eq!(queue, "responses");
    assert_eq!(report["kind"], "decode");
    assert_eq!(report["original_message"], "not-json");
    assert!(report["reason"].as_str().unwrap().contains("Invalid JSON"));
}

#[tokio::test]
async fn failing_handler_is_retried_then_poisoned() {
    let (broker, handle) = fake_broker(1, 0);
    let handler = Arc::new(TestHandler::default());
    let config = WorkerConfig::builder("requests")
        .retry_config(RetryConfig::new(2))
        .build();
    let mut consumer = ConsumerLoop::new(broker, handler.clone(), config);
    let (stop, stopped) = oneshot::channel::<()>();

    let driver = async {
        eventually("connection", || handle.connected()).await;
        handle.publish(r#"{"fail":true}"#);
        eventually("poisoning", || handle.calls().contains(&Call::Nack(3, false))).await;
        stop.send(()).unwrap();
    };
    let (result, ()) = tokio::join!(consumer.run(async { let _ = stopped.await; }), driver);

    result.unwrap();
    // max_retries + 1 deliveries, each redelivery under a new tag
    assert_eq!(handler.seen().len(), 3);
    assert_eq!(
        handle.calls(),
        vec![Call::Nack(1, true), Call::Nack(2, true), Call::Nack(3, false)]
    );
    let reports = handle.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, "requests_report");
    assert_eq!(reports[0].1["kind"], "handler");
    assert_eq!(reports[0].1["attempts"], 3);
    assert!(reports[0].1["first_failed_at"].is_string());
    assert_eq!(reports[0].1["reason"], "Messaging setup or configuration error: handler failed");
}

#[tokio::test]
async fn full_pool_blocks_the_receive_loop_without_dropping() {
    let (broker, handle) = fake_broker(1, 0);
    let gate = Arc::new(Semaphore::new(0));
    let handler = Arc::new(TestHandler::gated(gate.clone()));
    let config = WorkerConfig::builder("requests").max_concurrency(2).build();
    let mut consumer = ConsumerLoop::new(broker, handler.clone(), config);
    let (stop, stopped) = oneshot::channel::<()>();

    let driver = async {
        eventually("connection", || handle.connected()).await;
        for i in 0..5 {
            handle.publish(&json!({ "n": i }).to_string());
        }
        eventually("two busy workers", || handler.running.load(Ordering::SeqCst) == 2).await;
        eventually("third delivery pulled", || handle.pulled() == 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.pulled(), 3, "receive loop must wait for a free worker");
        assert!(handle.calls().is_empty());

        gate.add_permits(5);
        eventually("all acks", || handle.calls().len() == 5).await;
        stop.send(()).unwrap();
    };
    let (result, ()) = tokio::join!(consumer.run(async { let _ = stopped.await; }), driver);

    result.unwrap();
    let mut calls = handle.calls();
    calls.sort_by_key(|call| match call {
        Call::Ack(tag) | Call::Nack(tag, _) => *tag,
    });
    assert_eq!(calls, (1..=5).map(Call::Ack).collect::<Vec<_>>());
    assert_eq!(handler.seen().len(), 5);
}

#[tokio::test]
async fn lost_connection_is_reestablished_without_duplicate_acks() {
    let (broker, handle) = fake_broker(2, 0);
    let handler = Arc::new(TestHandler::default());
    let mut consumer = ConsumerLoop::new(broker, handler.clone(), config());
    let (stop, stopped) = oneshot::channel::<()>();

    let driver = async {
        eventually("connection", || handle.connected()).await;
        handle.publish(r#"{"id":"a"}"#);
        eventually("first ack", || handle.calls() == vec![Call::Ack(1)]).await;

        handle.disconnect();
        eventually("reconnect", || handle.connect_attempts() == 2 && handle.connected()).await;

        let tag = handle.publish(r#"{"id":"b"}"#);
        eventually("second ack", || handle.calls().contains(&Call::Ack(tag))).await;
        stop.send(()).unwrap();
    };
    let (result, ()) = tokio::join!(consumer.run(async { let _ = stopped.await; }), driver);

    result.unwrap();
    assert_eq!(handler.seen(), vec![json!({"id": "a"}), json!({"id": "b"})]);
    assert_eq!(handle.calls(), vec![Call::Ack(1), Call::Ack(2)]);
}

#[tokio::test]
async fn in_flight_message_is_redelivered_after_reconnect() {
    let (broker, handle) = fake_broker(2, 0);
    let gate = Arc::new(Semaphore::new(0));
    let handler = Arc::new(TestHandler::gated(gate.clone()));
    let mut consumer = ConsumerLoop::new(broker, handler.clone(), config());
    let (stop, stopped) = oneshot::channel::<()>();

    let driver = async {
        eventually("connection", || handle.connected()).await;
        let first = handle.publish(r#"{"id":"a"}"#);
        eventually("handler start", || handler.running.load(Ordering::SeqCst) == 1).await;

        handle.disconnect();
        eventually("reconnect", || handle.connect_attempts() == 2 && handle.connected()).await;
        // the unsettled message comes back under a new tag
        eventually("redelivery", || handler.running.load(Ordering::SeqCst) == 2).await;

        gate.add_permits(2);
        eventually("redelivery ack", || handle.calls().contains(&Call::Ack(first + 1))).await;
        eventually("old handler done", || handler.running.load(Ordering::SeqCst) == 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.send(()).unwrap();
        first
    };
    let (result, first) = tokio::join!(consumer.run(async { let _ = stopped.await; }), driver);

    result.unwrap();
    // the outcome from the lost session never reaches the broker
    assert!(!handle.calls().contains(&Call::Ack(first)));
    assert_eq!(handle.calls(), vec![Call::Ack(first + 1)]);
    assert_eq!(handler.seen(), vec![json!({"id": "a"}), json!({"id": "a"})]);
    assert!(handle.0.unsettled.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn connect_retries_follow_the_backoff_schedule() {
    let (broker, handle) = fake_broker(1, 2);
    let handler = Arc::new(TestHandler::default());
    let mut consumer = ConsumerLoop::new(broker, handler.clone(), config());
    let (stop, stopped) = oneshot::channel::<()>();
    let started = tokio::time::Instant::now();

    let driver = async {
        eventually("connection", || handle.connected()).await;
        let waited = started.elapsed();
        // two failures: 1s then 2s of backoff
        assert!(waited >= Duration::from_secs(3), "{:?}", waited);
        assert!(waited < Duration::from_secs(4), "{:?}", waited);
        assert_eq!(handle.connect_attempts(), 3);
        stop.send(()).unwrap();
    };
    let (result, ()) = tokio::join!(consumer.run(async { let _ = stopped.await; }), driver);
    result.unwrap();
}

#[tokio::test]
async fn exhausted_connection_retries_are_fatal() {
    let (broker, _handle) = fake_broker(0, 0);
    let mut consumer = ConsumerLoop::new(broker, Arc::new(TestHandler::default()), config());

    let result = consumer.run(std::future::pending::<()>()).await;

    assert!(matches!(result, Err(WorkerError::Connection { .. })));
    assert_eq!(consumer.state(), LoopState::Closed);
}

#[tokio::test]
async fn shutdown_abandons_handlers_that_outlive_the_timeout() {
    let (broker, handle) = fake_broker(1, 0);
    let handler = Arc::new(TestHandler::default());
    let config = WorkerConfig::builder("requests")
        .shutdown_timeout(Duration::from_millis(100))
        .build();
    let mut consumer = ConsumerLoop::new(broker, handler.clone(), config);
    let (stop, stopped) = oneshot::channel::<()>();

    let driver = async {
        eventually("connection", || handle.connected()).await;
        handle.publish(r#"{"hang":true}"#);
        handle.publish(r#"{"quick":true}"#);
        eventually("quick ack", || handle.calls() == vec![Call::Ack(2)]).await;
        stop.send(()).unwrap();
    };
    let (result, ()) = tokio::join!(consumer.run(async { let _ = stopped.await; }), driver);

    result.unwrap();
    assert_eq!(consumer.state(), LoopState::Closed);
    // the hung message is left for the broker to redeliver
    assert_eq!(handle.calls(), vec![Call::Ack(2)]);
    assert!(handle.0.unsettled.lock().unwrap().contains_key(&1));
}

#[tokio::test]
async fn shutdown_waits_for_running_handlers() {
    let (broker, handle) = fake_broker(1, 0);
    let gate = Arc::new(Semaphore::new(0));
    let handler = Arc::new(TestHandler::gated(gate.clone()));
    let mut consumer = ConsumerLoop::new(broker, handler.clone(), config());
    let (stop, stopped) = oneshot::channel::<()>();

    let driver = async {
        eventually("connection", || handle.connected()).await;
        handle.publish(r#"{"slow":true}"#);
        eventually("handler start", || handler.running.load(Ordering::SeqCst) == 1).await;
        stop.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.add_permits(1);
    };
    let (result, ()) = tokio::join!(consumer.run(async { let _ = stopped.await; }), driver);

    result.unwrap();
    assert_eq!(handle.calls(), vec![Call::Ack(1)]);
}
