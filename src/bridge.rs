//! Bridge assembly: MQTT subscription feeding the relay client.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AppConfig;
use crate::mqtt::MqttConnector;
use crate::relay::{EventForwarder, RelayClient};
use crate::subscription::{SubscriptionManager, SubscriptionSettings};

/// Build the subscription pipeline from `config` and run it until
/// `shutdown` fires.
pub async fn run_bridge(config: AppConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let connector =
        MqttConnector::from_config(&config.mqtt).context("Invalid MQTT configuration")?;
    let relay = RelayClient::from_config(&config.relay).context("Invalid relay configuration")?;

    info!(
        broker = %config.mqtt.broker_url,
        topic = %config.mqtt.topic,
        collector = %relay.endpoint(),
        max_attempts = config.relay.max_attempts,
        "Starting MQTT bridge"
    );

    let forwarder: Arc<dyn EventForwarder> = Arc::new(relay);
    let manager = SubscriptionManager::new(
        connector,
        forwarder,
        SubscriptionSettings::from_config(&config),
    );

    let mut state = manager.subscribe_state();
    let state_logger = tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            tracing::debug!(state = ?current, "Subscription state changed");
        }
    });

    let result = manager.run(shutdown).await;
    state_logger.abort();

    result.context("Subscription worker stopped")
}
