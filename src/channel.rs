// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module holds the per-consumer channel state. A `ChannelBroker` owns
//! one channel, the declaration of the main topic exchange on it, and the
//! family of wait exchanges used for delayed delivery. Channels are never
//! shared across consumer tasks; when the adapter reports the channel
//! closed, cached handles are dropped and the next accessor reopens and
//! redeclares transparently.

use crate::config::Config;
use crate::errors::WorkerError;
use lapin::options::{
    BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{Channel, Connection, ExchangeKind};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Queue-declaration argument naming the exchange expired messages are
/// dead-lettered to
pub const DEAD_LETTER_EXCHANGE_HEADER: &str = "x-dead-letter-exchange";

/// Per-task channel holder: the channel, the main topic exchange and the
/// wait-exchange family declared on it.
pub struct ChannelBroker {
    connection: Arc<Connection>,
    config: Arc<Config>,
    channel: Option<Channel>,
    default_wait_exchange: Option<String>,
    wait_exchanges: HashMap<String, String>,
}

impl ChannelBroker {
    pub fn new(connection: Arc<Connection>, config: Arc<Config>) -> ChannelBroker {
        ChannelBroker {
            connection,
            config,
            channel: None,
            default_wait_exchange: None,
            wait_exchanges: HashMap::new(),
        }
    }

    /// Whether a channel is held and the adapter reports it open.
    pub fn active(&self) -> bool {
        self.channel
            .as_ref()
            .map(|channel| channel.status().connected())
            .unwrap_or(false)
    }

    /// The held channel, reopened and redeclared on demand.
    pub async fn channel(&mut self) -> Result<Channel, WorkerError> {
        if !self.active() {
            self.open().await?;
        }
        self.channel.clone().ok_or(WorkerError::Channel)
    }

    /// Closes the channel if active, drops every cached handle and reopens.
    pub async fn reconnect(&mut self) -> Result<(), WorkerError> {
        if let Some(channel) = self.channel.take() {
            if channel.status().connected() {
                if let Err(err) = channel.close(200, "reconnect").await {
                    debug!(error = err.to_string(), "error closing stale channel");
                }
            }
        }
        self.default_wait_exchange = None;
        self.wait_exchanges.clear();
        self.open().await
    }

    /// Opens a channel with the configured prefetch and confirm mode, and
    /// declares the main topic exchange on it.
    async fn open(&mut self) -> Result<(), WorkerError> {
        debug!("creating amqp channel...");
        let channel = match self.connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                return Err(WorkerError::Channel);
            }
        };
        debug!("channel created");

        if self.config.prefetch > 0 {
            if let Err(err) = channel
                .basic_qos(self.config.prefetch, BasicQosOptions::default())
                .await
            {
                error!(error = err.to_string(), "error to configure qos");
                return Err(WorkerError::Channel);
            }
        }

        if self.config.publisher_confirms || self.config.force_publisher_confirms {
            if let Err(err) = channel.confirm_select(ConfirmSelectOptions::default()).await {
                error!(error = err.to_string(), "error to enable confirm mode");
                return Err(WorkerError::Channel);
            }
        }

        Self::declare_main_exchange(&channel, &self.config).await?;
        self.channel = Some(channel);
        Ok(())
    }

    /// Declares the main topic exchange idempotently. `durable` is forced on
    /// and merged with the configured arguments; an AMQP 406 close frame is
    /// wrapped as a configuration-mismatch fault and surfaced, not retried.
    async fn declare_main_exchange(channel: &Channel, config: &Config) -> Result<(), WorkerError> {
        debug!(exchange = config.exchange, "declaring main exchange");

        match channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                config.exchange_arguments.clone(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = config.exchange,
                    "error to declare the exchange"
                );
                Err(WorkerError::from_declare(
                    &config.exchange,
                    err,
                    WorkerError::DeclareExchange(config.exchange.clone()),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Resolves the wait exchange for a message expiration, declaring it on
    /// demand. `None` selects the default fanout wait exchange; `Some(ms)`
    /// selects the per-expiration exchange for that TTL.
    pub async fn wait_exchange_for(
        &mut self,
        expiration: Option<u64>,
    ) -> Result<String, WorkerError> {
        let base = self.config.wait_exchange.clone().ok_or_else(|| {
            WorkerError::Configuration("publish_wait requires a configured wait exchange".to_owned())
        })?;
        let queue_base = self.config.wait_queue.clone().unwrap_or_else(|| base.clone());

        match expiration {
            None => {
                if self.default_wait_exchange.is_none() {
                    self.declare_wait_pair(&base, &queue_base).await?;
                    self.default_wait_exchange = Some(base.clone());
                }
                Ok(base)
            }
            Some(ms) => {
                let suffix = ms.to_string();
                if let Some(existing) = self.wait_exchanges.get(&suffix) {
                    return Ok(existing.clone());
                }
                let exchange = format!("{base}-{suffix}");
                let queue = format!("{queue_base}-{suffix}");
                self.declare_wait_pair(&exchange, &queue).await?;
                self.wait_exchanges.insert(suffix, exchange.clone());
                Ok(exchange)
            }
        }
    }

    /// Declares one wait exchange and its single bound queue. The queue
    /// carries `x-dead-letter-exchange` pointing at the main exchange, so
    /// expired messages re-enter it with their original routing key.
    async fn declare_wait_pair(&mut self, exchange: &str, queue: &str) -> Result<(), WorkerError> {
        let channel = self.channel().await?;
        debug!(exchange, queue, "declaring wait exchange");

        match channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange, "error to declare the wait exchange"
                );
                return Err(WorkerError::from_declare(
                    exchange,
                    err,
                    WorkerError::DeclareExchange(exchange.to_owned()),
                ));
            }
            _ => {}
        }

        let mut arguments = std::collections::BTreeMap::new();
        arguments.insert(
            ShortString::from(DEAD_LETTER_EXCHANGE_HEADER),
            AMQPValue::LongString(LongString::from(self.config.exchange.clone())),
        );

        match channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::from(arguments),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue, "error to declare the wait queue"
                );
                return Err(WorkerError::from_declare(
                    queue,
                    err,
                    WorkerError::DeclareQueue(queue.to_owned()),
                ));
            }
            _ => {}
        }

        match channel
            .queue_bind(
                queue,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue, exchange, "error to bind the wait queue"
                );
                Err(WorkerError::BindQueue(
                    queue.to_owned(),
                    exchange.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }
}
