//! Subscription worker: broker session lifecycle and the relay pipeline.
//!
//! The worker moves through `Disconnected -> Connecting -> Subscribed` and
//! back to `Disconnected` when the session drops, waiting an exponential
//! backoff before the next connect. While subscribed it processes one message
//! at a time: decode, forward, retry transient failures, then acknowledge.
//!
//! Acknowledgement follows the outcome of the dispatch:
//!
//! | outcome                          | acked |
//! |----------------------------------|-------|
//! | payload failed to decode         | yes   |
//! | forwarded                        | yes   |
//! | permanently rejected             | yes   |
//! | retry budget exhausted           | yes   |
//! | interrupted by shutdown          | no    |

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use rand::{Rng, thread_rng};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{self, DecodeError};
use crate::config::AppConfig;
use crate::models::DetectionEvent;
use crate::mqtt::{BrokerConnector, BrokerError, BrokerSession, InboundMessage};
use crate::relay::{EventForwarder, RelayError};

/// Connection lifecycle of the subscription worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The session ended and automatic reconnect is disabled.
    #[error("broker connection lost and automatic reconnect is disabled: {0}")]
    ConnectionLost(#[source] BrokerError),
}

/// Exponential backoff: `base * 2^attempt` plus jitter, never above `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Extra random delay as a fraction of the computed backoff
    pub jitter_factor: f64,
}

impl BackoffPolicy {
    /// Delay before the retry following `attempt` consecutive failures (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_secs_f64() * 1_000.0;
        let max_ms = self.max.as_secs_f64() * 1_000.0;
        let backoff = (base_ms * 2_f64.powi(attempt.min(30) as i32)).min(max_ms);

        let jitter = if self.jitter_factor > 0.0 && backoff > 0.0 {
            thread_rng().gen_range(0.0..(self.jitter_factor * backoff))
        } else {
            0.0
        };

        Duration::from_secs_f64((backoff + jitter).min(max_ms) / 1_000.0)
    }
}

/// Bounded retry budget for forwarding one message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per message, including the first
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubscriptionSettings {
    pub reconnect: BackoffPolicy,
    pub retry: RetryPolicy,
    pub automatic_reconnect: bool,
}

impl SubscriptionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let jitter_factor = config.relay.jitter_factor;
        Self {
            reconnect: BackoffPolicy {
                base: Duration::from_millis(config.mqtt.reconnect_base_ms),
                max: Duration::from_millis(config.mqtt.reconnect_max_ms),
                jitter_factor,
            },
            retry: RetryPolicy {
                max_attempts: config.relay.max_attempts,
                backoff: BackoffPolicy {
                    base: Duration::from_millis(config.relay.retry_base_ms),
                    max: Duration::from_millis(config.relay.retry_max_ms),
                    jitter_factor,
                },
            },
            automatic_reconnect: config.mqtt.automatic_reconnect,
        }
    }
}

/// Result of pushing one inbound message through the pipeline.
#[derive(Debug)]
pub enum DispatchOutcome {
    Forwarded(DetectionEvent),
    Discarded(DecodeError),
    Rejected(RelayError),
    Exhausted(RelayError),
    /// Shutdown arrived while the message was still failing.
    Interrupted(RelayError),
}

impl DispatchOutcome {
    pub fn should_ack(&self) -> bool {
        !matches!(self, DispatchOutcome::Interrupted(_))
    }
}

enum SessionEnd {
    Shutdown,
    Lost(BrokerError),
}

/// Owns one topic subscription and relays its messages sequentially.
pub struct SubscriptionManager<C: BrokerConnector> {
    connector: C,
    forwarder: Arc<dyn EventForwarder>,
    settings: SubscriptionSettings,
    state: watch::Sender<ConnectionState>,
}

impl<C: BrokerConnector> SubscriptionManager<C> {
    pub fn new(
        connector: C,
        forwarder: Arc<dyn EventForwarder>,
        settings: SubscriptionSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            forwarder,
            settings,
            state,
        }
    }

    /// Observe connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_replace(next);
    }

    /// Run until `shutdown` fires, reconnecting as configured.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SubscriptionError> {
        info!(topic = %self.connector.topic(), "Starting subscription worker");
        let mut consecutive_failures: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = self.connector.connect() => result,
            };

            let failure = match connected {
                Ok(session) => {
                    consecutive_failures = 0;
                    self.set_state(ConnectionState::Subscribed);
                    info!(topic = %self.connector.topic(), "Subscription active");

                    match self.serve_session(session, &shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(err) => err,
                    }
                }
                Err(err) => err,
            };

            self.set_state(ConnectionState::Disconnected);

            if !self.settings.automatic_reconnect {
                error!(error = %failure, "Broker connection failed; automatic reconnect disabled");
                return Err(SubscriptionError::ConnectionLost(failure));
            }

            let delay = self.settings.reconnect.delay(consecutive_failures);
            consecutive_failures = consecutive_failures.saturating_add(1);
            counter!("relay_reconnects_total").increment(1);
            warn!(
                error = %failure,
                attempt = consecutive_failures,
                delay_ms = delay.as_millis() as u64,
                "Broker connection unavailable, reconnecting"
            );

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Subscription worker stopped");
        Ok(())
    }

    async fn serve_session(
        &self,
        mut session: C::Session,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        let end = loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break SessionEnd::Shutdown,
                received = session.recv() => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(err) => break SessionEnd::Lost(err),
            };

            let outcome = self.dispatch(&message, shutdown).await;

            if outcome.should_ack() {
                if let Err(err) = session.ack(&message).await {
                    break SessionEnd::Lost(err);
                }
            } else {
                debug!(pkid = message.pkid, "Leaving message unacknowledged for redelivery");
                break SessionEnd::Shutdown;
            }
        };

        if let Err(err) = session.disconnect().await {
            debug!(error = %err, "Broker session did not disconnect cleanly");
        }
        end
    }

    /// Decode and forward one message, retrying transient relay failures.
    ///
    /// A forward attempt already in flight is never cancelled; shutdown only
    /// prevents further retries.
    pub(crate) async fn dispatch(
        &self,
        message: &InboundMessage,
        shutdown: &CancellationToken,
    ) -> DispatchOutcome {
        counter!("relay_messages_received_total").increment(1);

        let event = match codec::decode(&message.payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(topic = %message.topic, error = %err, "Discarding undecodable message");
                counter!("relay_messages_dropped_total", "reason" => "decode").increment(1);
                return DispatchOutcome::Discarded(err);
            }
        };

        let idempotency_key = uuid::Uuid::new_v4().to_string();
        let max_attempts = self.settings.retry.max_attempts.max(1);
        let mut attempt: u32 = 1;

        loop {
            let started = Instant::now();
            let result = self.forwarder.forward(&event, &idempotency_key).await;
            histogram!("relay_forward_duration_ms")
                .record(started.elapsed().as_secs_f64() * 1_000.0);

            let err = match result {
                Ok(acknowledged) => {
                    counter!("relay_forward_success_total").increment(1);
                    info!(
                        id = ?acknowledged.id,
                        state = %acknowledged.state,
                        attempt,
                        "Detection relayed"
                    );
                    return DispatchOutcome::Forwarded(acknowledged);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                warn!(error = %err, attempt, "Collector rejected detection, dropping");
                counter!("relay_messages_dropped_total", "reason" => "rejected").increment(1);
                return DispatchOutcome::Rejected(err);
            }

            if attempt >= max_attempts {
                error!(error = %err, attempts = attempt, "Retry budget exhausted, dropping detection");
                counter!("relay_messages_dropped_total", "reason" => "exhausted").increment(1);
                return DispatchOutcome::Exhausted(err);
            }

            if shutdown.is_cancelled() {
                return DispatchOutcome::Interrupted(err);
            }

            let delay = self.settings.retry.backoff.delay(attempt - 1);
            counter!("relay_forward_retry_total", "kind" => err.kind()).increment(1);
            warn!(
                error = %err,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Forward failed, retrying"
            );

            tokio::select! {
                _ = shutdown.cancelled() => return DispatchOutcome::Interrupted(err),
                _ = sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
