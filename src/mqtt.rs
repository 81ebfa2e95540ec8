//! Broker session abstraction and its `rumqttc` implementation.
//!
//! A [`BrokerConnector`] produces one [`BrokerSession`] per connection
//! attempt. The MQTT session polls the client event loop on its own task so
//! keep-alives keep flowing while the relay worker waits on a slow collector;
//! publishes reach the worker through a bounded channel.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, Publish,
    QoS, SubscribeReasonCode,
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, MqttConfig};

const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Failures of the broker session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker refused connection: {0}")]
    Refused(String),
    #[error("broker rejected subscription to '{0}'")]
    SubscribeRejected(String),
    #[error("broker handshake did not complete within {0:?}")]
    Timeout(Duration),
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
    #[error("mqtt client request failed: {0}")]
    Client(String),
}

/// A message received on the subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Packet id the broker expects in the acknowledgement
    pub pkid: u16,
    pub qos: QoS,
}

impl From<Publish> for InboundMessage {
    fn from(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
            pkid: publish.pkid,
            qos: publish.qos,
        }
    }
}

/// Opens subscribed sessions against a broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    type Session: BrokerSession;

    /// Connect and subscribe; resolves once both are confirmed.
    async fn connect(&self) -> Result<Self::Session, BrokerError>;

    /// Topic this connector subscribes to, for logging.
    fn topic(&self) -> &str;
}

/// One live, subscribed broker session.
#[async_trait]
pub trait BrokerSession: Send {
    /// Next inbound message, in arrival order.
    async fn recv(&mut self) -> Result<InboundMessage, BrokerError>;

    /// Acknowledge a message so the broker will not redeliver it.
    async fn ack(&mut self, message: &InboundMessage) -> Result<(), BrokerError>;

    /// Release the session.
    async fn disconnect(self) -> Result<(), BrokerError>;
}

/// Map a configured QoS level onto the MQTT enum.
pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// `rumqttc` backed connector using a clean session and manual acks.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    host: String,
    port: u16,
    client_id: String,
    topic: String,
    credentials: Option<(String, String)>,
    qos: QoS,
    keep_alive: Duration,
    connection_timeout: Duration,
    channel_capacity: usize,
}

impl MqttConnector {
    pub fn from_config(config: &MqttConfig) -> Result<Self, ConfigError> {
        let endpoint = config.endpoint()?;
        let qos = qos_from_level(config.qos).ok_or(ConfigError::InvalidMqttQos { value: config.qos })?;

        let credentials = config.username.as_ref().map(|username| {
            (
                username.clone(),
                config.password.clone().unwrap_or_default(),
            )
        });

        Ok(Self {
            host: endpoint.host,
            port: endpoint.port,
            client_id: config.client_id.clone(),
            topic: config.topic.clone(),
            credentials,
            qos,
            keep_alive: config.keep_alive(),
            connection_timeout: config.connection_timeout(),
            channel_capacity: config.channel_capacity,
        })
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true)
            .set_manual_acks(true);

        if let Some((username, password)) = &self.credentials {
            options.set_credentials(username, password);
        }
        options
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    type Session = MqttSession;

    async fn connect(&self) -> Result<MqttSession, BrokerError> {
        let (client, mut event_loop) = AsyncClient::new(self.options(), self.channel_capacity);

        // Queued now, sent right after CONNACK.
        client
            .subscribe(&self.topic, self.qos)
            .await
            .map_err(|e| BrokerError::Client(e.to_string()))?;

        let mut early = Vec::new();
        let handshake = handshake(&mut event_loop, &self.topic, &mut early);
        tokio::time::timeout(self.connection_timeout, handshake)
            .await
            .map_err(|_| BrokerError::Timeout(self.connection_timeout))??;

        info!(host = %self.host, port = self.port, topic = %self.topic, "subscribed to broker");

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let pump = tokio::spawn(pump(event_loop, early, tx));

        Ok(MqttSession {
            client,
            inbound: rx,
            pump,
        })
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}

/// Drive the event loop until both CONNACK and SUBACK arrive.
async fn handshake(
    event_loop: &mut EventLoop,
    topic: &str,
    early: &mut Vec<Publish>,
) -> Result<(), BrokerError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    return Err(BrokerError::Refused(format!("{:?}", ack.code)));
                }
                debug!("broker accepted connection");
            }
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    return Err(BrokerError::SubscribeRejected(topic.to_string()));
                }
                return Ok(());
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => early.push(publish),
            Ok(_) => {}
            Err(rumqttc::ConnectionError::ConnectionRefused(code)) => {
                return Err(BrokerError::Refused(format!("{code:?}")));
            }
            Err(e) => return Err(BrokerError::ConnectionLost(e.to_string())),
        }
    }
}

/// Forward publishes to the worker until the connection ends.
///
/// Returns after the first connection error so the subscription worker,
/// not `rumqttc`, decides when and how to reconnect.
async fn pump(
    mut event_loop: EventLoop,
    early: Vec<Publish>,
    tx: mpsc::Sender<Result<InboundMessage, BrokerError>>,
) {
    for publish in early {
        if tx.send(Ok(publish.into())).await.is_err() {
            return;
        }
    }

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                if tx.send(Ok(publish.into())).await.is_err() {
                    return;
                }
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                let _ = tx
                    .send(Err(BrokerError::ConnectionLost(
                        "broker sent DISCONNECT".to_string(),
                    )))
                    .await;
                return;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => return,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt event loop failed");
                let _ = tx.send(Err(BrokerError::ConnectionLost(e.to_string()))).await;
                return;
            }
        }
    }
}

/// Live `rumqttc` session.
pub struct MqttSession {
    client: AsyncClient,
    inbound: mpsc::Receiver<Result<InboundMessage, BrokerError>>,
    pump: JoinHandle<()>,
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn recv(&mut self) -> Result<InboundMessage, BrokerError> {
        match self.inbound.recv().await {
            Some(item) => item,
            None => Err(BrokerError::ConnectionLost(
                "event loop stopped".to_string(),
            )),
        }
    }

    async fn ack(&mut self, message: &InboundMessage) -> Result<(), BrokerError> {
        if message.qos == QoS::AtMostOnce {
            return Ok(());
        }

        let mut publish = Publish::new(&message.topic, message.qos, Vec::new());
        publish.pkid = message.pkid;

        self.client
            .ack(&publish)
            .await
            .map_err(|e| BrokerError::Client(e.to_string()))
    }

    async fn disconnect(mut self) -> Result<(), BrokerError> {
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| BrokerError::Client(e.to_string()));

        if tokio::time::timeout(DISCONNECT_GRACE, &mut self.pump)
            .await
            .is_err()
        {
            self.pump.abort();
        }
        result
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
