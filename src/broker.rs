// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Broker Connection Management
//!
//! The `Broker` owns the process-wide AMQP connection: it connects with a
//! fixed one-second retry interval, installs the connection error hook,
//! optionally starts the HTTP management API client (verifying credentials
//! at startup), and constructs the publisher. Queue declaration applies the
//! configured namespace prefix; binding applies the declarative diff that
//! converges a queue onto exactly the desired routing-key set.

use crate::channel::ChannelBroker;
use crate::config::Config;
use crate::errors::WorkerError;
use crate::management::{Binding, BindingsApi, ManagementClient};
use crate::publisher::Publisher;
use crate::worker::WorkPool;
use futures_util::future::BoxFuture;
use lapin::options::{QueueBindOptions, QueueDeclareOptions};
use lapin::types::{FieldTable, LongString};
use lapin::{Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Fixed interval between connection attempts
const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Owns the adapter connection and the broker-side declarations.
pub struct Broker {
    config: Arc<Config>,
    connection: Option<Arc<Connection>>,
    management: Option<Arc<dyn BindingsApi>>,
    publisher: Option<Arc<Publisher>>,
}

impl Broker {
    pub fn new(config: Config) -> Broker {
        Broker {
            config: Arc::new(config),
            connection: None,
            management: None,
            publisher: None,
        }
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.clone()
    }

    /// The open connection, or a connection error when `connect` has not
    /// succeeded yet.
    pub fn connection(&self) -> Result<Arc<Connection>, WorkerError> {
        self.connection.clone().ok_or(WorkerError::Connection)
    }

    /// The publisher constructed by `connect`.
    pub fn publisher(&self) -> Result<Arc<Publisher>, WorkerError> {
        self.publisher.clone().ok_or(WorkerError::Connection)
    }

    /// Opens the connection, retrying on the fixed one-second interval up to
    /// the configured attempt budget, then starts the management client and
    /// the publisher.
    pub async fn connect(&mut self) -> Result<(), WorkerError> {
        let uri = self.config.amqp_uri()?;
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.config.connection_name.clone()));

        debug!("creating amqp connection...");
        let mut attempt = 0;
        let connection = loop {
            attempt += 1;
            match Connection::connect_uri(uri.clone(), options.clone()).await {
                Ok(connection) => break connection,
                Err(err) if attempt < self.config.connection_attempts => {
                    warn!(
                        error = err.to_string(),
                        attempt,
                        "failure to connect, retrying"
                    );
                    tokio::time::sleep(RECONNECT_INTERVAL).await;
                }
                Err(err) => {
                    error!(error = err.to_string(), "failure to connect");
                    return Err(WorkerError::Connection);
                }
            }
        };
        debug!("amqp connected");

        connection.on_error(|err| {
            if let lapin::Error::ProtocolError(ref amqp) = err {
                error!(
                    reply_code = amqp.get_id(),
                    reply_text = amqp.get_message().to_string(),
                    "connection closed by broker"
                );
            } else {
                error!(error = err.to_string(), "connection error");
            }
        });

        let connection = Arc::new(connection);

        if self.config.management_api {
            let client = ManagementClient::new(&self.config)?;
            client.verify_credentials().await?;
            self.management = Some(Arc::new(client));
        }

        self.publisher = Some(Arc::new(Publisher::new(
            connection.clone(),
            self.config.clone(),
        )));
        self.connection = Some(connection);
        Ok(())
    }

    /// Runs a scoped block against a connected broker, guaranteeing
    /// `disconnect` on any exit path.
    pub async fn connected<T>(
        &mut self,
        scope: impl for<'a> FnOnce(&'a Broker) -> BoxFuture<'a, Result<T, WorkerError>>,
    ) -> Result<T, WorkerError> {
        self.connect().await?;
        let result = scope(&*self).await;
        self.disconnect().await;
        result
    }

    /// Closes the connection and drops the publisher and management client.
    pub async fn disconnect(&mut self) {
        self.publisher = None;
        self.management = None;
        if let Some(connection) = self.connection.take() {
            if connection.status().connected() {
                if let Err(err) = connection.close(200, "shutdown").await {
                    debug!(error = err.to_string(), "error closing connection");
                }
            }
        }
    }

    /// Opens a fresh channel holder bound to this connection.
    pub fn channel_broker(&self) -> Result<ChannelBroker, WorkerError> {
        Ok(ChannelBroker::new(self.connection()?, self.config.clone()))
    }

    /// Declares a durable queue, prefixing the configured namespace.
    /// Arguments are passed through verbatim. Returns the broker-side name.
    pub async fn declare_queue(
        &self,
        channel: &Channel,
        name: &str,
        arguments: FieldTable,
    ) -> Result<String, WorkerError> {
        let queue = self.config.namespaced(name);
        debug!(queue, "declaring queue");

        match channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to declare the queue");
                Err(WorkerError::from_declare(
                    &queue,
                    err,
                    WorkerError::DeclareQueue(queue.clone()),
                ))
            }
            _ => Ok(queue),
        }
    }

    /// Converges a queue's bindings on the main exchange to exactly the
    /// desired routing keys: stale keys are unbound first (when the
    /// management API is enabled), then every desired key is bound.
    pub async fn bind_queue(
        &self,
        channel: &Channel,
        queue: &str,
        routing_keys: &[String],
    ) -> Result<(), WorkerError> {
        if let Some(api) = &self.management {
            let existing = api.bindings(queue).await?;
            for stale in stale_routing_keys(&existing, routing_keys, &self.config.exchange) {
                info!(queue, routing_key = stale, "unbinding stale routing key");
                match channel
                    .queue_unbind(queue, &self.config.exchange, &stale, FieldTable::default())
                    .await
                {
                    Err(err) => {
                        error!(
                            error = err.to_string(),
                            queue, "error to unbind routing key"
                        );
                        return Err(WorkerError::UnbindQueue(
                            queue.to_owned(),
                            self.config.exchange.clone(),
                        ));
                    }
                    _ => {}
                }
            }
        }

        for key in routing_keys {
            debug!(
                queue,
                exchange = self.config.exchange,
                routing_key = key,
                "binding queue"
            );
            match channel
                .queue_bind(
                    queue,
                    &self.config.exchange,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), queue, "error to bind queue");
                    return Err(WorkerError::BindQueue(
                        queue.to_owned(),
                        self.config.exchange.clone(),
                    ));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Drains in-flight work and closes the connection: the pool stops
    /// dispatching, outstanding handlers get the graceful-exit budget, and
    /// stragglers are aborted.
    pub(crate) async fn stop(&mut self, pool: &WorkPool) {
        pool.shutdown(self.config.graceful_exit_timeout).await;
        self.disconnect().await;
        info!("broker stopped");
    }
}

/// Routing keys currently bound on the main exchange that are not in the
/// desired set. Bindings from other exchanges (including the default
/// exchange's implicit binding) are left untouched.
fn stale_routing_keys(existing: &[Binding], desired: &[String], exchange: &str) -> Vec<String> {
    existing
        .iter()
        .filter(|binding| binding.source == exchange)
        .filter(|binding| !desired.contains(&binding.routing_key))
        .map(|binding| binding.routing_key.clone())
        .collect()
}
