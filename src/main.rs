use color_eyre::{eyre::eyre, Result};
use ecos_bus::config::BusConfig;
use ecos_bus::transport::{BusEvent, Channel, Connector, TopicFilter};
use ecos_bus::{DeviceBus, MemoryBroker, MqttConnector, Role, TransportSession};
use serde_json::{json, Map};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = BusConfig::load().await?;
    let namespace = config
        .topics
        .namespace()
        .map_err(|e| eyre!("Invalid topic root: {}", e))?;
    let connector: Arc<dyn Connector> = if config.broker.is_memory() {
        info!("Using in-process broker");
        Arc::new(MemoryBroker::new().with_history_limit(0))
    } else {
        Arc::new(MqttConnector::new(config.broker.mqtt_settings()))
    };

    let session = TransportSession::new(connector, namespace, config.validation.validator());
    let bus = DeviceBus::new(session.clone(), Arc::new(config.permissions()));

    let endpoint = config.broker.endpoint()?;
    session
        .connect(&endpoint, config.broker.credentials().as_ref())
        .await
        .map_err(|e| eyre!("Failed to connect to {}: {}", endpoint, e))?;

    let shutdown = CancellationToken::new();

    let mut fleet = session
        .subscribe_filter(&TopicFilter::fleet(Channel::Telemetry))
        .await
        .map_err(|e| eyre!("Failed to subscribe to fleet telemetry: {}", e))?;
    let fleet_handle = tokio::spawn(async move {
        while let Some(telemetry) = fleet.recv().await {
            info!(
                project_code = telemetry.address.project_code(),
                device_id = telemetry.address.device_id(),
                "{}",
                telemetry.record
            );
        }
        debug!("fleet subscription closed");
    });

    let mut events = session.events();
    let events_handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(BusEvent::ValidationFailed { topic, error }) => {
                    warn!(%topic, %error, "invalid message dropped")
                }
                Ok(BusEvent::LinkLost { reason }) => error!(%reason, "broker link lost"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event listener fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut simulators = Vec::new();
    if config.simulator.enabled {
        for profile in config.simulator.devices.clone() {
            match bus.simulate(Role::Admin, profile, config.simulator.interval()) {
                Ok(simulator) => simulators.push(simulator.spawn(shutdown.clone())),
                Err(e) => warn!("Skipping simulated device: {}", e),
            }
        }
    }
    info!(
        devices = bus.registry().len(),
        active = bus.registry().list_active().len(),
        "Device registry ready"
    );

    if let Some(device) = bus.registry().list_active().first() {
        let mut params = Map::new();
        params.insert("reason".to_string(), json!("gateway startup"));
        match bus
            .send_command(Role::Operator, &device.project_code, &device.device_id, "identify", params)
            .await
        {
            Ok(envelope) => info!(device_id = %device.device_id, action = %envelope.action, "Demo command sent"),
            Err(e) => warn!(device_id = %device.device_id, "Demo command failed: {}", e),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
    info!("Shutting down");

    shutdown.cancel();
    for simulator in simulators {
        if let Some(published) = join_logged("simulator", simulator).await {
            debug!(published, "simulator joined");
        }
    }
    session.disconnect().await;
    join_logged("fleet subscription", fleet_handle).await;
    events_handle.abort();

    let status = session.status();
    info!(
        sent = status.messages_sent,
        received = status.messages_received,
        validation_failures = status.validation_failures,
        "Session closed"
    );
    Ok(())
}

/// Waits for a worker task; a panic or cancellation is logged, not raised.
async fn join_logged<T>(task: &str, handle: JoinHandle<T>) -> Option<T> {
    match handle.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(task, "Task failed: {}", e);
            None
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_logged_keeps_value() {
        let handle = tokio::spawn(async { 3u64 });
        assert_eq!(join_logged("simulator", handle).await, Some(3));
    }

    #[tokio::test]
    async fn test_join_logged_swallows_task_failure() {
        let handle: JoinHandle<()> = tokio::spawn(async { panic!("fleet task died") });
        assert_eq!(join_logged("fleet subscription", handle).await, None);

        let pending = tokio::spawn(std::future::pending::<()>());
        pending.abort();
        assert_eq!(join_logged("fleet subscription", pending).await, None);
    }
}
