// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Worker Lifecycle and Dispatch
//!
//! The `Worker` turns registered consumer descriptors into live
//! subscriptions: it validates the descriptors, declares queues and
//! bindings, subscribes in manual-ack mode, and dispatches each delivery to
//! a fresh handler instance on the bounded work pool. Handler outcomes are
//! enqueued as acknowledgement actions on the waiter, which executes them on
//! the main loop. `run` returns after a shutdown signal once in-flight work
//! has drained or the graceful-exit budget has elapsed.
//!
//! Deliveries in flight when a channel is lost are redelivered by the
//! broker after recovery, so handlers must be idempotent.

use crate::ack::{AckPolicy, Acknowledger, ChannelAcknowledger};
use crate::broker::Broker;
use crate::channel::ChannelBroker;
use crate::config::Config;
use crate::consumer::ConsumerDef;
use crate::errors::WorkerError;
use crate::message::{DeliveryInfo, Message, Properties};
use crate::reporter::{self, ErrorReporter};
use crate::serializer::Serializer;
use crate::tracer::{self, Tracer};
use crate::waiter::{Action, RunStatus, Waiter, WaiterHandle};
use futures_util::StreamExt;
use lapin::options::{BasicCancelOptions, BasicConsumeOptions, QueueBindOptions};
use lapin::types::FieldTable;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Byte cost of the `-<uuid>` suffix appended to the consumer-tag prefix
const CONSUMER_TAG_SUFFIX_LEN: usize = 37;
/// AMQP hard limit on consumer tags and queue names
const AMQP_NAME_LIMIT: usize = 255;
/// Fixed interval between resubscription attempts after a channel loss
const RESUBSCRIBE_INTERVAL: Duration = Duration::from_secs(1);

/// Callback invoked once after every consumer is set up, in registration
/// order.
pub type SetupCallback = Box<dyn FnOnce() -> Result<(), WorkerError> + Send + Sync>;

/// Bounded pool of in-flight work: a cancellation token stopping dispatch,
/// a tracker for draining, permits bounding parallel handlers, and abort
/// handles for the stragglers.
pub(crate) struct WorkPool {
    cancel: CancellationToken,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkPool {
    pub(crate) fn new(pool_size: usize) -> Arc<WorkPool> {
        Arc::new(WorkPool {
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            handles: Mutex::new(vec![]),
        })
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn permits(&self) -> Arc<Semaphore> {
        self.permits.clone()
    }

    /// Spawns a tracked task, keeping its handle for forced termination.
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.tracker.spawn(future);
        let mut handles = self.handles.lock().unwrap();
        handles.retain(|entry| !entry.is_finished());
        handles.push(handle);
    }

    /// Stops dispatch, waits for in-flight work within the graceful budget,
    /// then aborts whatever is left.
    pub(crate) async fn shutdown(&self, graceful: Duration) {
        self.cancel.cancel();
        self.tracker.close();

        if tokio::time::timeout(graceful, self.tracker.wait()).await.is_err() {
            let outstanding = {
                let handles = self.handles.lock().unwrap();
                let outstanding = handles
                    .iter()
                    .filter(|handle| !handle.is_finished())
                    .count();
                for handle in handles.iter() {
                    handle.abort();
                }
                outstanding
            };
            warn!(outstanding, "graceful exit timeout elapsed, aborting work");
            self.tracker.wait().await;
        }
    }
}

/// Hosts the registered consumers against one broker connection.
pub struct Worker {
    broker: Broker,
    consumers: Vec<ConsumerDef>,
    setup_callbacks: Vec<SetupCallback>,
    tracers: Vec<Arc<dyn Tracer>>,
    reporters: Vec<Arc<dyn ErrorReporter>>,
    policies: Vec<Arc<dyn AckPolicy>>,
}

impl Worker {
    pub fn new(
        broker: Broker,
        consumers: Vec<ConsumerDef>,
        setup_callbacks: Vec<SetupCallback>,
    ) -> Worker {
        Worker {
            broker,
            consumers,
            setup_callbacks,
            tracers: vec![],
            reporters: vec![],
            policies: vec![],
        }
    }

    /// Adds a handler middleware, composed left-to-right at subscription.
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracers.push(tracer);
        self
    }

    /// Adds an error reporter to the failure fan-out.
    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    /// Appends a policy to the failure-acknowledgement chain.
    pub fn ack_policy(mut self, policy: Arc<dyn AckPolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    /// Runs the worker until a shutdown signal arrives, then drains and
    /// disconnects.
    pub async fn run(&mut self) -> Result<(), WorkerError> {
        let status = RunStatus::new();
        let (waiter, handle) = Waiter::new(self.policies.clone(), status.clone());
        Waiter::register_signal_handlers(&handle).map_err(|err| {
            WorkerError::Configuration(format!("failed to install signal handlers: {err}"))
        })?;
        self.run_with_waiter(waiter, handle, status).await
    }

    /// The body of `run`, with the waiter injected so callers that drive
    /// shutdown themselves can do so without OS signals.
    pub(crate) async fn run_with_waiter(
        &mut self,
        mut waiter: Waiter,
        handle: WaiterHandle,
        status: Arc<RunStatus>,
    ) -> Result<(), WorkerError> {
        let config = self.broker.config();
        validate_consumers(&config, &self.consumers)?;

        if self.broker.connection().is_err() {
            self.broker.connect().await?;
        }

        let pool = WorkPool::new(config.consumer_pool_size);
        let enabled = enabled_consumers(&config, &self.consumers);
        if let Err(err) = self.setup(&enabled, &config, &pool, &handle, &status).await {
            self.broker.stop(&pool).await;
            return Err(err);
        }

        info!(consumers = enabled.len(), "worker started");
        waiter.wait().await;

        self.broker.stop(&pool).await;
        Ok(())
    }

    /// Subscribes every enabled consumer, then runs the setup callbacks once
    /// in registration order.
    async fn setup(
        &mut self,
        enabled: &[ConsumerDef],
        config: &Arc<Config>,
        pool: &Arc<WorkPool>,
        handle: &WaiterHandle,
        status: &RunStatus,
    ) -> Result<(), WorkerError> {
        for consumer in enabled {
            self.subscribe(consumer, config, pool, handle, status)
                .await?;
        }
        for callback in self.setup_callbacks.drain(..) {
            callback()?;
        }
        Ok(())
    }

    /// Declares and binds one consumer's queue, subscribes in manual-ack
    /// mode, and spawns its consume loop on the pool.
    async fn subscribe(
        &self,
        consumer: &ConsumerDef,
        config: &Arc<Config>,
        pool: &Arc<WorkPool>,
        handle: &WaiterHandle,
        status: &RunStatus,
    ) -> Result<(), WorkerError> {
        let mut channel_broker = self.broker.channel_broker()?;
        let channel = channel_broker.channel().await?;

        let queue = self
            .broker
            .declare_queue(&channel, &consumer.queue, consumer.queue_arguments.clone())
            .await?;
        self.broker
            .bind_queue(&channel, &queue, &consumer.routing_keys)
            .await?;

        let tag = consumer_tag(&config.consumer_tag_prefix);
        let subscription = match channel
            .basic_consume(
                &queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(subscription) => subscription,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    consumer = consumer.name,
                    "error to create the consumer"
                );
                return Err(WorkerError::Subscribe(consumer.name.clone()));
            }
        };
        info!(consumer = consumer.name, queue, tag, "consumer subscribed");

        let runtime = ConsumerRuntime {
            config: config.clone(),
            name: consumer.name.clone(),
            queue,
            routing_keys: consumer.routing_keys.clone(),
            serializer: consumer
                .serializer
                .clone()
                .unwrap_or_else(|| config.serializers.default_serializer()),
            factory: consumer.factory.clone(),
            tracers: self.tracers.clone(),
            reporters: self.reporters.clone(),
            tag,
            in_flight: status.register_consumer(&consumer.name),
            handle: handle.clone(),
            pool: pool.clone(),
        };
        pool.spawn(runtime.consume(channel_broker, subscription));
        Ok(())
    }
}

/// Everything one consume loop needs, owned by its task.
struct ConsumerRuntime {
    config: Arc<Config>,
    name: String,
    queue: String,
    routing_keys: Vec<String>,
    serializer: Arc<dyn Serializer>,
    factory: crate::consumer::HandlerFactory,
    tracers: Vec<Arc<dyn Tracer>>,
    reporters: Vec<Arc<dyn ErrorReporter>>,
    tag: String,
    in_flight: Arc<AtomicUsize>,
    handle: WaiterHandle,
    pool: Arc<WorkPool>,
}

impl ConsumerRuntime {
    /// Consumes deliveries until cancelled, resubscribing on the fixed
    /// interval when the channel is lost.
    async fn consume(self, mut channel_broker: ChannelBroker, mut subscription: lapin::Consumer) {
        let cancel = self.pool.cancellation();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if channel_broker.active() {
                        if let Ok(channel) = channel_broker.channel().await {
                            if let Err(err) = channel
                                .basic_cancel(&self.tag, BasicCancelOptions::default())
                                .await
                            {
                                debug!(error = err.to_string(), "error cancelling subscription");
                            }
                        }
                    }
                    break;
                }
                next = subscription.next() => match next {
                    Some(Ok(delivery)) => {
                        if !self.dispatch(delivery, &cancel).await {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        error!(
                            error = err.to_string(),
                            consumer = self.name,
                            "consumer delivery error, resubscribing"
                        );
                        match self.resubscribe(&mut channel_broker, &cancel).await {
                            Some(next_subscription) => subscription = next_subscription,
                            None => break,
                        }
                    }
                    None => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        warn!(consumer = self.name, "consumer stream ended, resubscribing");
                        match self.resubscribe(&mut channel_broker, &cancel).await {
                            Some(next_subscription) => subscription = next_subscription,
                            None => break,
                        }
                    }
                },
            }
        }
    }

    /// Hands one delivery to a fresh handler on the pool. Returns false when
    /// shutdown started while waiting for a permit.
    async fn dispatch(&self, delivery: lapin::message::Delivery, cancel: &CancellationToken) -> bool {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return false,
            permit = self.permits_acquire() => match permit {
                Some(permit) => permit,
                None => return false,
            },
        };

        let info = DeliveryInfo {
            consumer: self.name.clone(),
            queue: self.queue.clone(),
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
        };
        let properties = Properties::from_amqp(&delivery.properties);
        let acknowledger: Arc<dyn Acknowledger> =
            Arc::new(ChannelAcknowledger::new(delivery.acker.clone()));
        let message = Message::new(
            info.clone(),
            properties.clone(),
            delivery.data,
            self.serializer.clone(),
        );
        let handler = tracer::compose(&self.tracers, &self.name, (self.factory)());

        let name = self.name.clone();
        let handle = self.handle.clone();
        let reporters = self.reporters.clone();
        let in_flight = self.in_flight.clone();
        in_flight.fetch_add(1, Ordering::SeqCst);

        self.pool.spawn(async move {
            debug!(
                consumer = name,
                routing_key = info.routing_key,
                delivery_tag = info.delivery_tag,
                "received delivery"
            );

            match handler.handle(&message).await {
                Ok(()) => {
                    handle.send_action(Action::ack(name, info, properties, acknowledger));
                }
                Err(err) => {
                    let err = Arc::new(err);
                    // The nack action goes first so a reporter failure can
                    // never lose the message.
                    handle.send_action(Action::nack(
                        name.clone(),
                        info,
                        properties,
                        err.clone(),
                        acknowledger,
                    ));
                    reporter::fan_out(&reporters, &message, &name, &err).await;
                }
            }

            in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        });

        true
    }

    async fn permits_acquire(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        self.pool.permits().acquire_owned().await.ok()
    }

    /// Reopens the channel and re-creates the subscription, retrying on the
    /// fixed interval until it succeeds or shutdown starts. Bindings are
    /// re-applied additively; the declarative diff already ran at setup.
    async fn resubscribe(
        &self,
        channel_broker: &mut ChannelBroker,
        cancel: &CancellationToken,
    ) -> Option<lapin::Consumer> {
        'retry: loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(RESUBSCRIBE_INTERVAL) => {}
            }

            if let Err(err) = channel_broker.reconnect().await {
                warn!(
                    error = err.to_string(),
                    consumer = self.name,
                    "channel reopen failed, retrying"
                );
                continue;
            }
            let channel = match channel_broker.channel().await {
                Ok(channel) => channel,
                Err(_) => continue,
            };

            for key in &self.routing_keys {
                if let Err(err) = channel
                    .queue_bind(
                        &self.queue,
                        &self.config.exchange,
                        key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                {
                    warn!(error = err.to_string(), "rebind failed, retrying");
                    continue 'retry;
                }
            }

            match channel
                .basic_consume(
                    &self.queue,
                    &self.tag,
                    BasicConsumeOptions {
                        no_local: false,
                        no_ack: false,
                        exclusive: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
            {
                Ok(subscription) => {
                    info!(consumer = self.name, queue = self.queue, "resubscribed");
                    return Some(subscription);
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        consumer = self.name,
                        "resubscribe failed, retrying"
                    );
                }
            }
        }
    }
}

/// Builds a unique consumer tag from the configured prefix.
fn consumer_tag(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// Validates descriptors before any broker-side declaration: duplicate
/// queues, oversized queue names after the namespace prefix, and consumer
/// tags that would exceed the AMQP 255-byte limit are all refused.
fn validate_consumers(config: &Config, consumers: &[ConsumerDef]) -> Result<(), WorkerError> {
    if config.consumer_tag_prefix.len() + CONSUMER_TAG_SUFFIX_LEN > AMQP_NAME_LIMIT {
        return Err(WorkerError::Configuration(format!(
            "consumer tag prefix `{}` yields tags over {AMQP_NAME_LIMIT} bytes",
            config.consumer_tag_prefix
        )));
    }

    let mut queues = HashSet::new();
    for consumer in consumers {
        let queue = config.namespaced(&consumer.queue);
        if queue.len() > AMQP_NAME_LIMIT {
            return Err(WorkerError::Configuration(format!(
                "queue name `{queue}` exceeds {AMQP_NAME_LIMIT} bytes"
            )));
        }
        if !queues.insert(queue.clone()) {
            return Err(WorkerError::Configuration(format!(
                "duplicate queue name `{queue}`"
            )));
        }
    }

    Ok(())
}

/// Applies consumer-group enablement: without a configured group every
/// consumer runs; with one, only the group's members run, and an unknown
/// group enables nothing.
fn enabled_consumers(config: &Config, consumers: &[ConsumerDef]) -> Vec<ConsumerDef> {
    let Some(group) = &config.consumer_group else {
        return consumers.to_vec();
    };

    match config.consumer_groups.get(group) {
        Some(members) => consumers
            .iter()
            .filter(|consumer| members.contains(&consumer.name))
            .cloned()
            .collect(),
        None => {
            warn!(group, "unknown consumer group, no consumers enabled");
            vec![]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{Handler, HandlerFactory};
    use crate::errors::HandlerError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct Noop;

    #[async_trait]
    impl Handler for Noop {
        async fn handle(&self, _message: &Message) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn factory() -> HandlerFactory {
        Arc::new(|| Box::new(Noop) as Box<dyn Handler>)
    }

    #[test]
    fn tags_carry_the_prefix_and_a_uuid() {
        let tag = consumer_tag("warren");
        let suffix = tag.strip_prefix("warren-").expect("prefix");
        assert!(Uuid::parse_str(suffix).is_ok());
        assert_eq!(tag.len(), "warren".len() + CONSUMER_TAG_SUFFIX_LEN);
    }

    #[test]
    fn longest_legal_prefix_is_accepted() {
        let prefix = "p".repeat(AMQP_NAME_LIMIT - CONSUMER_TAG_SUFFIX_LEN);
        let config = Config::new().consumer_tag_prefix(&prefix);
        validate_consumers(&config, &[]).unwrap();
        assert_eq!(consumer_tag(&prefix).len(), AMQP_NAME_LIMIT);
    }

    #[test]
    fn oversized_prefix_is_refused_at_setup() {
        let prefix = "p".repeat(AMQP_NAME_LIMIT - CONSUMER_TAG_SUFFIX_LEN + 1);
        let config = Config::new().consumer_tag_prefix(&prefix);
        let err = validate_consumers(&config, &[]).unwrap_err();
        assert!(matches!(err, WorkerError::Configuration(_)));
    }

    #[test]
    fn duplicate_queues_are_refused() {
        let config = Config::new();
        let consumers = vec![
            ConsumerDef::new("first", "orders", factory()),
            ConsumerDef::new("second", "orders", factory()),
        ];
        let err = validate_consumers(&config, &consumers).unwrap_err();
        assert!(matches!(err, WorkerError::Configuration(_)));
    }

    #[test]
    fn oversized_namespaced_queue_is_refused() {
        let config = Config::new().namespace("team");
        let consumers = vec![ConsumerDef::new(
            "big",
            &"q".repeat(AMQP_NAME_LIMIT),
            factory(),
        )];
        let err = validate_consumers(&config, &consumers).unwrap_err();
        assert!(matches!(err, WorkerError::Configuration(_)));
    }

    #[test]
    fn all_consumers_run_without_a_group() {
        let config = Config::new();
        let consumers = vec![
            ConsumerDef::new("orders", "orders", factory()),
            ConsumerDef::new("billing", "billing", factory()),
        ];
        assert_eq!(enabled_consumers(&config, &consumers).len(), 2);
    }

    #[test]
    fn group_members_only_when_a_group_is_active() {
        let config = Config::new()
            .consumer_group("billing")
            .register_consumer_group("billing", vec!["billing".to_owned()]);
        let consumers = vec![
            ConsumerDef::new("orders", "orders", factory()),
            ConsumerDef::new("billing", "billing", factory()),
        ];

        let enabled = enabled_consumers(&config, &consumers);
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name(), "billing");
    }

    #[test]
    fn unknown_group_enables_nothing() {
        let config = Config::new().consumer_group("missing");
        let consumers = vec![ConsumerDef::new("orders", "orders", factory())];
        assert!(enabled_consumers(&config, &consumers).is_empty());
    }

    #[tokio::test]
    async fn pool_drains_handlers_that_finish_in_budget() {
        let pool = WorkPool::new(4);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        pool.spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        });

        pool.shutdown(Duration::from_secs(2)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn pool_aborts_handlers_past_the_budget() {
        let pool = WorkPool::new(4);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        pool.spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            flag.store(true, Ordering::SeqCst);
        });

        let started = std::time::Instant::now();
        pool.shutdown(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!finished.load(Ordering::SeqCst));
    }
}

/// Integration tests requiring a running RabbitMQ instance.
///
/// Run with: AMQP_URL=amqp://localhost:5672 cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::consumer::{Handler, HandlerFactory};
    use crate::errors::HandlerError;
    use crate::message::Properties;
    use crate::serializer::Body;
    use crate::waiter::Signal;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn amqp_url() -> String {
        std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".to_string())
    }

    struct Forwarding {
        tx: mpsc::UnboundedSender<(String, Body)>,
    }

    #[async_trait]
    impl Handler for Forwarding {
        async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
            let body = message.body()?;
            let _ = self
                .tx
                .send((message.delivery().routing_key.clone(), body));
            Ok(())
        }
    }

    fn forwarding_factory(tx: mpsc::UnboundedSender<(String, Body)>) -> HandlerFactory {
        Arc::new(move || Box::new(Forwarding { tx: tx.clone() }) as Box<dyn Handler>)
    }

    fn test_config(suffix: &str) -> Config {
        Config::new()
            .uri(&amqp_url())
            .exchange(&format!("warren-test-{suffix}"))
            .namespace(&format!("it-{suffix}"))
            .prefetch(10)
            .consumer_pool_size(4)
            .graceful_exit_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn delivers_and_acks_a_published_message() {
        let suffix = Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let broker = Broker::new(test_config(&suffix));
        let consumers = vec![ConsumerDef::new("orders", "orders", forwarding_factory(tx))
            .routing_key("a.b")];
        let mut worker = Worker::new(broker, consumers, vec![]);

        let status = RunStatus::new();
        let (waiter, handle) = Waiter::new(vec![], status.clone());
        let stopper = handle.clone();
        let run = tokio::spawn(async move {
            worker.run_with_waiter(waiter, handle, status).await
        });

        let mut publisher_broker = Broker::new(test_config(&suffix));
        publisher_broker.connect().await.expect("connect publisher");
        tokio::time::sleep(Duration::from_millis(200)).await;
        publisher_broker
            .publisher()
            .unwrap()
            .publish_json("a.b", &json!({"x": 1}), Properties::default())
            .await
            .expect("publish");

        let (routing_key, body) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for delivery")
                .expect("channel closed");
        assert_eq!(routing_key, "a.b");
        assert_eq!(body, Body::Json(json!({"x": 1})));

        stopper.send_signal(Signal::Term);
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("worker should stop")
            .unwrap()
            .unwrap();
        publisher_broker.disconnect().await;
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn wait_exchange_redelivers_after_the_ttl() {
        let suffix = Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let config = test_config(&suffix).wait_exchange(&format!("warren-test-wait-{suffix}"));
        let broker = Broker::new(config.clone());
        let consumers = vec![ConsumerDef::new("orders", "orders", forwarding_factory(tx))
            .routing_key("a.b")];
        let mut worker = Worker::new(broker, consumers, vec![]);

        let status = RunStatus::new();
        let (waiter, handle) = Waiter::new(vec![], status.clone());
        let stopper = handle.clone();
        let run = tokio::spawn(async move {
            worker.run_with_waiter(waiter, handle, status).await
        });

        let mut publisher_broker = Broker::new(config);
        publisher_broker.connect().await.expect("connect publisher");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let published_at = std::time::Instant::now();
        publisher_broker
            .publisher()
            .unwrap()
            .publish_wait(
                "a.b",
                &Body::Json(json!({"delayed": true})),
                Properties {
                    expiration: Some(500),
                    ..Properties::default()
                },
                Default::default(),
            )
            .await
            .expect("publish_wait");

        let (routing_key, body) =
            tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for delayed delivery")
                .expect("channel closed");
        assert!(published_at.elapsed() >= Duration::from_millis(500));
        assert_eq!(routing_key, "a.b");
        assert_eq!(body, Body::Json(json!({"delayed": true})));

        stopper.send_signal(Signal::Term);
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("worker should stop")
            .unwrap()
            .unwrap();
        publisher_broker.disconnect().await;
    }
}
