// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Acknowledgement Plumbing and Failure Policies
//!
//! Every delivery carries an [`Acknowledger`] bound to the channel it
//! arrived on, so ack, nack and reject always run against the delivering
//! channel. When a handler fails, the ordered [`AckPolicy`] chain decides
//! what happens to the message: each policy either claims the decision
//! (having issued the broker call) or defers to the next one, and the
//! terminal [`NackOnAllFailures`] policy always claims with a
//! nack-without-requeue.

use crate::errors::{HandlerError, WorkerError};
use crate::message::{DeliveryInfo, Properties};
use async_trait::async_trait;
use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions};
use std::sync::Arc;
use tracing::{error, warn};

/// Issues broker acknowledgements for one delivery, on the channel that
/// delivered it.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), WorkerError>;
    async fn nack(&self, requeue: bool) -> Result<(), WorkerError>;
    async fn reject(&self, requeue: bool) -> Result<(), WorkerError>;
}

/// Adapter-backed acknowledger wrapping the delivery's acker.
pub(crate) struct ChannelAcknowledger {
    acker: Acker,
}

impl ChannelAcknowledger {
    pub(crate) fn new(acker: Acker) -> ChannelAcknowledger {
        ChannelAcknowledger { acker }
    }
}

#[async_trait]
impl Acknowledger for ChannelAcknowledger {
    async fn ack(&self) -> Result<(), WorkerError> {
        match self.acker.ack(BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error to ack message");
                Err(WorkerError::Ack)
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, requeue: bool) -> Result<(), WorkerError> {
        match self
            .acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to nack message");
                Err(WorkerError::Nack)
            }
            _ => Ok(()),
        }
    }

    async fn reject(&self, requeue: bool) -> Result<(), WorkerError> {
        match self.acker.reject(BasicRejectOptions { requeue }).await {
            Err(err) => {
                error!(error = err.to_string(), "error to reject message");
                Err(WorkerError::Reject)
            }
            _ => Ok(()),
        }
    }
}

/// One link of the failure-acknowledgement chain.
///
/// A policy inspects the failed delivery and either issues the appropriate
/// broker call and returns `true` to claim the decision, or returns `false`
/// to defer to the next policy.
#[async_trait]
pub trait AckPolicy: Send + Sync {
    async fn handle(
        &self,
        delivery: &DeliveryInfo,
        properties: &Properties,
        acknowledger: &dyn Acknowledger,
        error: &HandlerError,
    ) -> Result<bool, WorkerError>;
}

/// Terminal policy: nack without requeue, always claims.
pub struct NackOnAllFailures;

#[async_trait]
impl AckPolicy for NackOnAllFailures {
    async fn handle(
        &self,
        delivery: &DeliveryInfo,
        _properties: &Properties,
        acknowledger: &dyn Acknowledger,
        error: &HandlerError,
    ) -> Result<bool, WorkerError> {
        warn!(
            consumer = delivery.consumer,
            delivery_tag = delivery.delivery_tag,
            error = error.to_string(),
            "nacking failed message"
        );
        acknowledger.nack(false).await?;
        Ok(true)
    }
}

/// Walks the policy chain in order, stopping at the first claim. The
/// terminal nack runs when every configured policy defers, so a failed
/// delivery can never be left unacknowledged.
pub(crate) async fn acknowledge_failure(
    policies: &[Arc<dyn AckPolicy>],
    delivery: &DeliveryInfo,
    properties: &Properties,
    acknowledger: &dyn Acknowledger,
    error: &HandlerError,
) {
    for policy in policies {
        match policy.handle(delivery, properties, acknowledger, error).await {
            Ok(true) => return,
            Ok(false) => continue,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    delivery_tag = delivery.delivery_tag,
                    "acknowledgement policy failed"
                );
                return;
            }
        }
    }

    if let Err(err) = NackOnAllFailures
        .handle(delivery, properties, acknowledger, error)
        .await
    {
        error!(
            error = err.to_string(),
            delivery_tag = delivery.delivery_tag,
            "terminal nack failed"
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every acknowledgement issued against it.
    #[derive(Default)]
    pub(crate) struct RecordingAcknowledger {
        pub(crate) calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Acknowledger for RecordingAcknowledger {
        async fn ack(&self) -> Result<(), WorkerError> {
            self.calls.lock().unwrap().push("ack".to_owned());
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<(), WorkerError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("nack(requeue={requeue})"));
            Ok(())
        }

        async fn reject(&self, requeue: bool) -> Result<(), WorkerError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("reject(requeue={requeue})"));
            Ok(())
        }
    }

    pub(crate) fn delivery() -> DeliveryInfo {
        DeliveryInfo {
            consumer: "orders".to_owned(),
            queue: "orders".to_owned(),
            exchange: "warren".to_owned(),
            routing_key: "a.b".to_owned(),
            delivery_tag: 7,
            redelivered: false,
        }
    }

    struct Deferring;

    #[async_trait]
    impl AckPolicy for Deferring {
        async fn handle(
            &self,
            _delivery: &DeliveryInfo,
            _properties: &Properties,
            _acknowledger: &dyn Acknowledger,
            _error: &HandlerError,
        ) -> Result<bool, WorkerError> {
            Ok(false)
        }
    }

    struct RequeueOnTransient;

    #[async_trait]
    impl AckPolicy for RequeueOnTransient {
        async fn handle(
            &self,
            _delivery: &DeliveryInfo,
            _properties: &Properties,
            acknowledger: &dyn Acknowledger,
            error: &HandlerError,
        ) -> Result<bool, WorkerError> {
            if error.to_string().contains("transient") {
                acknowledger.reject(true).await?;
                return Ok(true);
            }
            Ok(false)
        }
    }

    #[tokio::test]
    async fn empty_chain_falls_back_to_terminal_nack() {
        let acknowledger = RecordingAcknowledger::default();
        acknowledge_failure(
            &[],
            &delivery(),
            &Properties::default(),
            &acknowledger,
            &HandlerError::failed("boom"),
        )
        .await;

        assert_eq!(
            *acknowledger.calls.lock().unwrap(),
            vec!["nack(requeue=false)"]
        );
    }

    #[tokio::test]
    async fn first_claim_wins_and_stops_the_chain() {
        let acknowledger = RecordingAcknowledger::default();
        let policies: Vec<Arc<dyn AckPolicy>> = vec![
            Arc::new(Deferring),
            Arc::new(RequeueOnTransient),
            Arc::new(NackOnAllFailures),
        ];

        acknowledge_failure(
            &policies,
            &delivery(),
            &Properties::default(),
            &acknowledger,
            &HandlerError::failed("transient network blip"),
        )
        .await;

        assert_eq!(
            *acknowledger.calls.lock().unwrap(),
            vec!["reject(requeue=true)"]
        );
    }

    #[tokio::test]
    async fn deferring_policies_reach_the_terminal_nack() {
        let acknowledger = RecordingAcknowledger::default();
        let policies: Vec<Arc<dyn AckPolicy>> =
            vec![Arc::new(Deferring), Arc::new(RequeueOnTransient)];

        acknowledge_failure(
            &policies,
            &delivery(),
            &Properties::default(),
            &acknowledger,
            &HandlerError::failed("schema violation"),
        )
        .await;

        assert_eq!(
            *acknowledger.calls.lock().unwrap(),
            vec!["nack(requeue=false)"]
        );
    }
}
