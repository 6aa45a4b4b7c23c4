mod sim;

use std::env;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sim::{CommandMsg, DeviceModel};

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env_or("MQTT_HOST", "127.0.0.1");
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let command_topic = env_or("COMMAND_TOPIC", "garden/command");
    let status_topic = env_or("STATUS_TOPIC", "garden/status");
    let sensor_topic = env_or("SENSOR_TOPIC", "garden/sensor");
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);

    let mut options = MqttOptions::new("irrigation-device-sim", broker, port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Ok(user), Ok(pass)) = (env::var("MQTT_USERNAME"), env::var("MQTT_PASSWORD")) {
        options.set_credentials(user, pass);
    }

    let (client, mut eventloop) = AsyncClient::new(options, 20);
    let mut model = DeviceModel::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(sample_every_s));

    info!(
        command = %command_topic,
        status = %status_topic,
        sensor = %sensor_topic,
        "device sim running"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pump_flipped = model.tick();
                let payload = match serde_json::to_vec(&model.sensor(now_unix())) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("sensor encode failed: {e}");
                        continue;
                    }
                };
                if let Err(e) = client
                    .publish(&sensor_topic, QoS::AtLeastOnce, false, payload)
                    .await
                {
                    warn!("sensor publish failed: {e}");
                }
                if pump_flipped {
                    publish_status(&client, &status_topic, &model).await;
                }
            }

            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("connected to broker");
                    if let Err(e) = client.subscribe(&command_topic, QoS::AtLeastOnce).await {
                        warn!("subscribe failed: {e}");
                    }
                    // Announce the full state so a freshly started dashboard
                    // mirrors it immediately.
                    publish_status(&client, &status_topic, &model).await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match serde_json::from_slice::<CommandMsg>(&publish.payload) {
                        Ok(cmd) => {
                            info!(topic = %publish.topic, "command received");
                            if model.apply(&cmd) {
                                publish_status(&client, &status_topic, &model).await;
                            }
                        }
                        Err(e) => warn!("bad command payload: {e}"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }
}

async fn publish_status(client: &AsyncClient, topic: &str, model: &DeviceModel) {
    let payload = match serde_json::to_vec(&model.status()) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("status encode failed: {e}");
            return;
        }
    };
    if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
        warn!("status publish failed: {e}");
    }
}
