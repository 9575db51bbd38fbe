mod config;
mod device;
mod mqtt;
mod publisher;

use std::time::Duration;
use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rumqttc::AsyncClient;
use tokio::{signal, time};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use crate::config::Config;
use crate::device::Device;
use crate::publisher::Schedule;

const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();
    config.validate()?;

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let device = match config.device_id {
        Some(id) => Device::new(id),
        None => Device::random(&mut rng),
    };
    let client_id = config.client_id(&mut rng);
    info!(
        host = %config.host,
        port = config.port,
        %client_id,
        device_id = device.id(),
        topic = %config.topic,
        status_topic = %config.status_topic(),
        "Starting simulated device"
    );

    let (client, eventloop) = AsyncClient::new(config.mqtt_options(client_id), 10);

    let mut driver = tokio::spawn(mqtt::drive(eventloop, client.clone(), config.status_topic(), config.qos));
    let mut readings = tokio::spawn(publisher::publish_readings(
        client.clone(),
        device,
        rng,
        Schedule {
            topic: config.topic.clone(),
            qos: config.qos,
            interval: config.interval(),
            count: config.count,
        },
    ));

    let (outcome, disconnect_sent) = tokio::select! {
        joined = &mut driver => {
            // The event loop went down with its task, there is nothing left to send DISCONNECT on
            readings.abort();
            return joined.map_err(anyhow::Error::from).and_then(|driven| driven).context("connection task stopped");
        },
        joined = &mut readings => match joined {
            Ok(Ok(())) => (Ok(()), true),
            Ok(Err(err)) => (Err(err), false),
            Err(err) => (Err(anyhow::Error::from(err).context("publisher task stopped")), false),
        },
        interrupted = signal::ctrl_c() => {
            interrupted?;
            info!("Interrupted, disconnecting");
            readings.abort();
            (Ok(()), false)
        },
    };
    if let Err(err) = &outcome {
        warn!(error = ?err, "Publisher stopped, disconnecting");
    }

    let wind_down = async {
        if !disconnect_sent {
            mqtt::request_disconnect(&client, DISCONNECT_GRACE).await;
        }
        // Keep polling so the DISCONNECT actually reaches the broker
        match time::timeout(DISCONNECT_GRACE, driver).await {
            Ok(joined) => joined.map_err(anyhow::Error::from).and_then(|driven| driven),
            Err(_) => {
                warn!("Timed out waiting for the broker to see our DISCONNECT");
                Ok(())
            },
        }
    };
    tokio::select! {
        wound_down = wind_down => wound_down?,
        _ = signal::ctrl_c() => warn!("Interrupted again, not waiting for the broker"),
    }
    outcome
}
