use std::time::Duration;

use anyhow::Context as _;
use log::{debug, error};
use mac_address::MacAddress;
use rumqttc::{MqttOptions, QoS};
use serde_derive::Serialize;

use crate::config;
use crate::messages::RangingPosition;
use crate::orchestrator::RangingSink;

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct RangingMqttMessage<'a> {
    id: &'a str,
    name: Option<&'a str>,
    #[serde(rename = "mac_address")]
    address: Option<MacAddress>,
    distance: Option<f64>,
    azimuth: Option<f64>,
    elevation: Option<f64>,
    retained: bool,
}

impl<'a> From<&'a RangingPosition> for RangingMqttMessage<'a> {
    fn from(position: &'a RangingPosition) -> Self {
        RangingMqttMessage {
            id: &position.beacon.id,
            name: position.beacon.name.as_deref(),
            address: position.beacon.address,
            distance: position.distance,
            azimuth: position.azimuth,
            elevation: position.elevation,
            retained: false,
        }
    }
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"uwb-monitor".to_string())
            .to_string();

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config.topic_path.clone().unwrap_or("uwb".to_string()),
            },
            eventloop,
        )
    }

    /// Drive the connection. Runs until the task is dropped.
    pub async fn event_loop(mut eventloop: rumqttc::EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                    debug!("Connection acknowledged");
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    // rumqttc reconnects on the next poll
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn topic(&self, position: &RangingPosition) -> String {
        let channel_name = sanitize_name(position.beacon.name.as_deref().unwrap_or(&position.beacon.id));
        format!("{}/{}/{}", self.topic_path, self.publisher_id, channel_name)
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

impl RangingSink for MqttClient {
    fn publish(&self, position: &RangingPosition) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&RangingMqttMessage::from(position))?;
        self.client
            .try_publish(self.topic(position), QoS::AtMostOnce, false, payload)
            .context("queueing ranging update")?;
        Ok(())
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
