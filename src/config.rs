use std::time::Duration;
use anyhow::{ensure, Result};
use clap::Parser;
use rand::Rng;
use rumqttc::{MqttOptions, QoS};
use crate::device::MAX_DEVICE_ID;

#[derive(Parser, Debug, Clone)]
#[command(name = "dce-sim", version)]
#[command(about = "Publishes simulated DCE telemetry to an MQTT broker and logs its status topic")]
pub struct Config {
    /// MQTT broker host
    #[arg(long, short = 'H', env = "MQTT_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// MQTT broker port
    #[arg(long, short, env = "MQTT_PORT", default_value_t = 1883)]
    pub port: u16,

    /// Client ID (random when omitted)
    #[arg(long, short, env = "MQTT_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Username for authentication
    #[arg(long, short, env = "MQTT_USERNAME")]
    pub username: Option<String>,

    /// Password for authentication, needs a username
    #[arg(long, short = 'P', env = "MQTT_PASSWORD", requires = "username")]
    pub password: Option<String>,

    /// Keep alive interval in seconds
    #[arg(long, short, default_value_t = 60, value_parser = clap::value_parser!(u64).range(5..))]
    pub keep_alive: u64,

    /// Topic the readings are published to
    #[arg(long, short, default_value = "zink/dce/test01/json")]
    pub topic: String,

    /// Topic to subscribe to, defaults to `<topic>/status`
    #[arg(long, short)]
    pub status_topic: Option<String>,

    /// Seconds between readings
    #[arg(long, short, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    pub interval: u64,

    /// QoS for both the publish and the subscription (0, 1 or 2)
    #[arg(long, short, default_value = "0", value_parser = parse_qos)]
    pub qos: QoS,

    /// Fixed device ID instead of a random one
    #[arg(long, value_parser = clap::value_parser!(u16).range(0..=MAX_DEVICE_ID as i64))]
    pub device_id: Option<u16>,

    /// Seed for the simulated device, for reproducible runs
    #[arg(long)]
    pub seed: Option<u64>,

    /// Disconnect after this many readings
    #[arg(long, short = 'n')]
    pub count: Option<u64>,
}

fn parse_qos(s: &str) -> Result<QoS, String> {
    match s {
        "0" => Ok(QoS::AtMostOnce),
        "1" => Ok(QoS::AtLeastOnce),
        "2" => Ok(QoS::ExactlyOnce),
        _ => Err(format!("QoS must be 0, 1 or 2, got {s}")),
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(rumqttc::valid_topic(&self.topic), "invalid publish topic {:?}", self.topic);
        let status_topic = self.status_topic();
        ensure!(rumqttc::valid_filter(&status_topic), "invalid status topic {:?}", status_topic);
        Ok(())
    }

    pub fn status_topic(&self) -> String {
        match &self.status_topic {
            Some(topic) => topic.clone(),
            None => format!("{}/status", self.topic),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn client_id(&self, rng: &mut impl Rng) -> String {
        match &self.client_id {
            Some(id) => id.clone(),
            None => format!("dce-sim-{}", rng.gen::<u32>()),
        }
    }

    pub fn mqtt_options(&self, client_id: String) -> MqttOptions {
        let mut mqttoptions = MqttOptions::new(client_id, &self.host, self.port);
        mqttoptions.set_keep_alive(Duration::from_secs(self.keep_alive));
        mqttoptions.set_clean_session(true);
        if let Some(username) = &self.username {
            mqttoptions.set_credentials(username, self.password.as_deref().unwrap_or_default());
        }
        mqttoptions
    }
}
