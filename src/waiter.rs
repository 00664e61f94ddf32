// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Signal and Action Multiplexer
//!
//! The `Waiter` is the single serialisation point for acknowledgement
//! traffic and the place where shutdown is decided. Signal listeners do
//! nothing but forward a token into the signal channel; worker tasks enqueue
//! ack/nack actions into the action channel; one select loop drains both, so
//! every broker acknowledgement runs here, in action-enqueue order, and a
//! shutdown signal competes fairly with pending actions.
//!
//! The loop starts in a waiting state once handlers are registered, spins on
//! actions and status dumps, and leaves only on a shutdown signal.

use crate::ack::{acknowledge_failure, AckPolicy, Acknowledger};
use crate::errors::HandlerError;
use crate::message::{DeliveryInfo, Properties};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Process signals observed by the waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Quit,
    Term,
    Int,
    Usr2,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Quit => "QUIT",
            Signal::Term => "TERM",
            Signal::Int => "INT",
            Signal::Usr2 => "USR2",
        }
    }

    /// Whether this signal requests a graceful shutdown.
    pub fn is_shutdown(&self) -> bool {
        !matches!(self, Signal::Usr2)
    }
}

/// What happened to the delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Ack,
    Nack,
}

/// One acknowledgement decision, produced on a worker task and executed by
/// the waiter on the channel that received the delivery.
pub struct Action {
    pub kind: ActionKind,
    pub consumer: String,
    pub delivery: DeliveryInfo,
    pub properties: Properties,
    pub error: Option<Arc<HandlerError>>,
    pub(crate) acknowledger: Arc<dyn Acknowledger>,
}

impl Action {
    pub(crate) fn ack(
        consumer: String,
        delivery: DeliveryInfo,
        properties: Properties,
        acknowledger: Arc<dyn Acknowledger>,
    ) -> Action {
        Action {
            kind: ActionKind::Ack,
            consumer,
            delivery,
            properties,
            error: None,
            acknowledger,
        }
    }

    pub(crate) fn nack(
        consumer: String,
        delivery: DeliveryInfo,
        properties: Properties,
        error: Arc<HandlerError>,
        acknowledger: Arc<dyn Acknowledger>,
    ) -> Action {
        Action {
            kind: ActionKind::Nack,
            consumer,
            delivery,
            properties,
            error: Some(error),
            acknowledger,
        }
    }
}

/// Live view of the running consumers, dumped on USR2.
#[derive(Default)]
pub struct RunStatus {
    consumers: Mutex<Vec<ConsumerStatus>>,
}

struct ConsumerStatus {
    label: String,
    in_flight: Arc<AtomicUsize>,
}

impl RunStatus {
    pub fn new() -> Arc<RunStatus> {
        Arc::new(RunStatus::default())
    }

    /// Registers a consumer label and returns its in-flight counter.
    pub(crate) fn register_consumer(&self, label: &str) -> Arc<AtomicUsize> {
        let in_flight = Arc::new(AtomicUsize::new(0));
        self.consumers.lock().unwrap().push(ConsumerStatus {
            label: label.to_owned(),
            in_flight: in_flight.clone(),
        });
        in_flight
    }

    fn dump(&self) {
        let consumers = self.consumers.lock().unwrap();
        info!(consumers = consumers.len(), "status dump");
        for consumer in consumers.iter() {
            info!(
                consumer = consumer.label,
                in_flight = consumer.in_flight.load(Ordering::SeqCst),
                "consumer status"
            );
        }
    }
}

/// Write side of the waiter's channels, cloned into signal listeners and
/// worker tasks.
#[derive(Clone)]
pub(crate) struct WaiterHandle {
    signal_tx: mpsc::UnboundedSender<Signal>,
    action_tx: mpsc::UnboundedSender<Action>,
}

impl WaiterHandle {
    pub(crate) fn send_signal(&self, signal: Signal) {
        let _ = self.signal_tx.send(signal);
    }

    pub(crate) fn send_action(&self, action: Action) {
        if self.action_tx.send(action).is_err() {
            warn!("action dropped: waiter is gone");
        }
    }
}

/// The signal/action select loop.
pub struct Waiter {
    signal_rx: mpsc::UnboundedReceiver<Signal>,
    action_rx: mpsc::UnboundedReceiver<Action>,
    policies: Vec<Arc<dyn AckPolicy>>,
    status: Arc<RunStatus>,
}

impl Waiter {
    pub(crate) fn new(
        policies: Vec<Arc<dyn AckPolicy>>,
        status: Arc<RunStatus>,
    ) -> (Waiter, WaiterHandle) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        (
            Waiter {
                signal_rx,
                action_rx,
                policies,
                status,
            },
            WaiterHandle {
                signal_tx,
                action_tx,
            },
        )
    }

    /// Spawns the signal listener tasks. Each listener only forwards a
    /// token, so the handling context stays trivially reentrant-safe; the
    /// decisions all happen in [`Waiter::wait`].
    #[cfg(unix)]
    pub(crate) fn register_signal_handlers(handle: &WaiterHandle) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, token) in [
            (SignalKind::quit(), Signal::Quit),
            (SignalKind::terminate(), Signal::Term),
            (SignalKind::interrupt(), Signal::Int),
            (SignalKind::user_defined2(), Signal::Usr2),
        ] {
            let mut stream = signal(kind)?;
            let handle = handle.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    handle.send_signal(token);
                }
            });
        }
        Ok(())
    }

    /// Platforms without QUIT/USR2 get ctrl-c as INT.
    #[cfg(not(unix))]
    pub(crate) fn register_signal_handlers(handle: &WaiterHandle) -> std::io::Result<()> {
        let handle = handle.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                handle.send_signal(Signal::Int);
            }
        });
        Ok(())
    }

    /// Blocks until a shutdown signal arrives, executing acknowledgement
    /// actions and status dumps as they come in.
    pub async fn wait(&mut self) {
        loop {
            tokio::select! {
                signal = self.signal_rx.recv() => match signal {
                    Some(signal) if signal.is_shutdown() => {
                        info!(signal = signal.name(), "received shutdown signal");
                        break;
                    }
                    Some(Signal::Usr2) => self.status.dump(),
                    Some(other) => warn!(signal = other.name(), "ignoring signal"),
                    None => break,
                },
                action = self.action_rx.recv() => match action {
                    Some(action) => self.execute(action).await,
                    None => break,
                },
            }
        }
    }

    async fn execute(&self, action: Action) {
        match action.kind {
            ActionKind::Ack => {
                if let Err(err) = action.acknowledger.ack().await {
                    error!(
                        error = err.to_string(),
                        consumer = action.consumer,
                        delivery_tag = action.delivery.delivery_tag,
                        "error acknowledging delivery"
                    );
                }
            }
            ActionKind::Nack => {
                let error = action
                    .error
                    .unwrap_or_else(|| Arc::new(HandlerError::failed("handler failed")));
                acknowledge_failure(
                    &self.policies,
                    &action.delivery,
                    &action.properties,
                    action.acknowledger.as_ref(),
                    &error,
                )
                .await;
            }
        }
    }
}
