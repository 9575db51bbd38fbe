use std::future::Future;
use std::time::Duration;
use anyhow::{Context, Result};
use rand::Rng;
use rumqttc::{AsyncClient, QoS};
use tokio::time;
use tracing::{debug, info};
use crate::device::{self, Device};

/// Where readings end up. Implemented by the MQTT client, and by a recorder in tests.
pub trait ReadingSink {
    fn send(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

impl ReadingSink for AsyncClient {
    async fn send(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()> {
        self.publish(topic, qos, false, payload).await?;
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        self.disconnect().await?;
        Ok(())
    }
}

pub struct Schedule {
    pub topic: String,
    pub qos: QoS,
    pub interval: Duration,
    pub count: Option<u64>,
}

/// Publishes the current reading on every tick, then lets the device drift.
/// The first reading goes out immediately. With a `count`, the sink is closed
/// once that many readings were sent.
pub async fn publish_readings<S, R>(sink: S, mut device: Device, mut rng: R, schedule: Schedule) -> Result<()>
where
    S: ReadingSink,
    R: Rng,
{
    let mut interval = time::interval(schedule.interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    let mut sent = 0u64;
    loop {
        if schedule.count.is_some_and(|count| sent >= count) {
            info!(sent, "Reading limit reached");
            return sink.close().await;
        }
        interval.tick().await;

        let reading = device.reading();
        let payload = device::payload(&reading).context("serializing reading")?;
        sink.send(&schedule.topic, schedule.qos, payload).await?;
        debug!(topic = %schedule.topic, id = reading.id, temp = reading.temp, bat = reading.bat, "Published reading");
        sent += 1;

        device.drift(&mut rng);
    }
}
