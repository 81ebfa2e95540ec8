//! End-to-end relay tests: a scripted broker session feeding the subscription
//! worker, which forwards over real HTTP into a live collector.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{Router, extract::Request, middleware::Next, response::Response};
use chrono::NaiveDate;
use rumqttc::QoS;
use sea_orm::{ConnectOptions, Database};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use trainwatch::{
    codec,
    migration::{Migrator, MigratorTrait},
    models::DetectionEvent,
    mqtt::{BrokerConnector, BrokerError, BrokerSession, InboundMessage},
    relay::{EventForwarder, RelayClient},
    server::{AppState, create_app},
    subscription::{BackoffPolicy, RetryPolicy, SubscriptionManager, SubscriptionSettings},
};
use url::Url;

async fn collector_state() -> AppState {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).min_connections(1);
    let db = Database::connect(options).await.unwrap();
    Migrator::up(&db, None).await.unwrap();
    AppState::new(db)
}

async fn spawn_collector(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn relay_client(addr: SocketAddr, timeout: Duration) -> Arc<dyn EventForwarder> {
    let endpoint = Url::parse(&format!("http://{addr}/api/train/detection")).unwrap();
    Arc::new(RelayClient::new(endpoint, timeout).unwrap())
}

fn settings() -> SubscriptionSettings {
    let backoff = BackoffPolicy {
        base: Duration::from_millis(10),
        max: Duration::from_millis(50),
        jitter_factor: 0.0,
    };
    SubscriptionSettings {
        reconnect: backoff,
        retry: RetryPolicy {
            max_attempts: 4,
            backoff,
        },
        automatic_reconnect: true,
    }
}

fn message(pkid: u16, minute: u32, rounds: u32, relay: &str) -> InboundMessage {
    let observed = NaiveDate::from_ymd_opt(2024, 4, 2)
        .unwrap()
        .and_hms_opt(6, minute, 0)
        .unwrap();
    InboundMessage {
        topic: "train/detection".to_string(),
        payload: codec::encode(&DetectionEvent::new("approaching", rounds, relay, observed)),
        pkid,
        qos: QoS::AtLeastOnce,
    }
}

/// Broker double: one session whose messages come from a channel.
struct ChannelConnector {
    inbound: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    acked: Arc<Mutex<Vec<u16>>>,
}

struct ChannelSession {
    inbound: mpsc::Receiver<InboundMessage>,
    acked: Arc<Mutex<Vec<u16>>>,
}

#[async_trait]
impl BrokerConnector for ChannelConnector {
    type Session = ChannelSession;

    async fn connect(&self) -> Result<ChannelSession, BrokerError> {
        let inbound = self.inbound.lock().unwrap().take();
        match inbound {
            Some(inbound) => Ok(ChannelSession {
                inbound,
                acked: self.acked.clone(),
            }),
            None => std::future::pending().await,
        }
    }

    fn topic(&self) -> &str {
        "train/detection"
    }
}

#[async_trait]
impl BrokerSession for ChannelSession {
    async fn recv(&mut self) -> Result<InboundMessage, BrokerError> {
        match self.inbound.recv().await {
            Some(message) => Ok(message),
            None => std::future::pending().await,
        }
    }

    async fn ack(&mut self, message: &InboundMessage) -> Result<(), BrokerError> {
        self.acked.lock().unwrap().push(message.pkid);
        Ok(())
    }

    async fn disconnect(self) -> Result<(), BrokerError> {
        Ok(())
    }
}

async fn wait_for_acks(acked: &Arc<Mutex<Vec<u16>>>, count: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while acked.lock().unwrap().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("messages were not acknowledged in time");
}

#[tokio::test]
async fn bridge_relays_messages_into_collector_in_order() {
    let state = collector_state().await;
    let queries = state.queries.clone();
    let addr = spawn_collector(create_app(state)).await;

    let (tx, rx) = mpsc::channel(8);
    let acked = Arc::new(Mutex::new(Vec::new()));
    let connector = ChannelConnector {
        inbound: Mutex::new(Some(rx)),
        acked: acked.clone(),
    };
    let manager = SubscriptionManager::new(
        connector,
        relay_client(addr, Duration::from_secs(2)),
        settings(),
    );

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(manager.run(shutdown.clone()));

    tx.send(message(1, 10, 3, "activated")).await.unwrap();
    tx.send(InboundMessage {
        payload: b"garbage".to_vec(),
        ..message(2, 0, 0, "activated")
    })
    .await
    .unwrap();
    tx.send(message(3, 20, 7, "not_activated")).await.unwrap();
    tx.send(message(4, 30, 1, "activated")).await.unwrap();

    wait_for_acks(&acked, 4).await;
    shutdown.cancel();
    worker.await.unwrap().unwrap();

    assert_eq!(*acked.lock().unwrap(), vec![1, 2, 3, 4]);

    let history = queries.history().await.unwrap();
    let rounds: Vec<u32> = history.iter().map(|e| e.rounds).collect();
    assert_eq!(rounds, vec![1, 7, 3]);

    let stats = queries.stats().await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.activated, 2);
    assert_eq!(stats.not_activated, 1);
    assert_eq!(stats.max_rounds, 7);
}

#[tokio::test]
async fn slow_acknowledgement_is_retried_without_duplicate() {
    let state = collector_state().await;
    let queries = state.queries.clone();

    // The first ingestion commits, then answers after the relay has given up.
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let app = create_app(state).layer(axum::middleware::from_fn(
        move |request: Request, next: Next| {
            let counter = counter.clone();
            async move {
                let response: Response = next.run(request).await;
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(400)).await;
                }
                response
            }
        },
    ));
    let addr = spawn_collector(app).await;

    let (tx, rx) = mpsc::channel(8);
    let acked = Arc::new(Mutex::new(Vec::new()));
    let connector = ChannelConnector {
        inbound: Mutex::new(Some(rx)),
        acked: acked.clone(),
    };
    let manager = SubscriptionManager::new(
        connector,
        relay_client(addr, Duration::from_millis(100)),
        settings(),
    );

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(manager.run(shutdown.clone()));

    tx.send(message(9, 5, 4, "activated")).await.unwrap();
    wait_for_acks(&acked, 1).await;
    shutdown.cancel();
    worker.await.unwrap().unwrap();

    assert!(calls.load(Ordering::SeqCst) >= 2);
    let history = queries.history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].rounds, 4);
}
