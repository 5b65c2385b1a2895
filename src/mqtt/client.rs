use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{error, info, warn};

use crate::config::{Config, DeviceConfig};
use crate::device::Ts0021;
use crate::zcl::{AttributeUpdate, ClusterKey, DeviceSink, Event};

pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Device output waiting to be published.
#[derive(Debug)]
pub enum Outbound {
    Attribute {
        topic_name: String,
        update: AttributeUpdate,
    },
    Event {
        topic_name: String,
        event: Event,
    },
}

/// [`DeviceSink`] that queues output for the MQTT task. Called from the
/// device's dispatch path, so it never waits: a full queue drops the message.
pub struct MqttSink {
    topic_name: String,
    tx: mpsc::Sender<Outbound>,
}

impl MqttSink {
    pub fn new(topic_name: String, tx: mpsc::Sender<Outbound>) -> Self {
        Self { topic_name, tx }
    }

    fn queue(&self, msg: Outbound) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                warn!("Outbound queue full for {}, dropping {:?}", self.topic_name, msg)
            }
            Err(TrySendError::Closed(_)) => warn!("Outbound channel closed"),
        }
    }
}

impl DeviceSink for MqttSink {
    fn attribute_updated(&self, update: AttributeUpdate) {
        self.queue(Outbound::Attribute {
            topic_name: self.topic_name.clone(),
            update,
        });
    }

    fn send_event(&self, event: Event) {
        self.queue(Outbound::Event {
            topic_name: self.topic_name.clone(),
            event,
        });
    }
}

/// Topic, payload and retain flag for one piece of device output.
pub fn render(config: &Config, msg: &Outbound) -> Result<(String, Vec<u8>, bool), String> {
    match msg {
        Outbound::Attribute { topic_name, update } => {
            let topic =
                config.device_state_topic(topic_name, update.cluster.name(), update.attribute);
            // Button attributes mirror momentary presses; replaying them on
            // reconnect would look like a new press.
            let retain = update.cluster != ClusterKey::TuyaManufacturer;
            Ok((topic, update.value.to_string().into_bytes(), retain))
        }
        Outbound::Event { topic_name, event } => {
            let payload = serde_json::to_vec(event)
                .map_err(|e| format!("Failed to encode event {}: {e}", event.action))?;
            Ok((config.device_event_topic(topic_name), payload, false))
        }
    }
}

pub struct MqttClient {
    client: AsyncClient,
    eventloop: EventLoop,
    config: Config,
}

impl MqttClient {
    /// `devices` are the devices the bridge actually runs; only they are
    /// announced and subscribed.
    pub fn new(config: &Config, devices: &[DeviceConfig]) -> Self {
        let config = Config {
            devices: devices.to_vec(),
            ..config.clone()
        };

        let mut mqttopts = MqttOptions::new(
            &config.mqtt.client_id,
            &config.mqtt.broker_host,
            config.mqtt.broker_port,
        );
        mqttopts.set_keep_alive(std::time::Duration::from_secs(30));

        if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
            mqttopts.set_credentials(user, pass);
        }

        let lwt = rumqttc::LastWill::new(
            lwt_topic(&config),
            "offline".as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        );
        mqttopts.set_last_will(lwt);

        let (client, eventloop) = AsyncClient::new(mqttopts, 100);

        Self {
            client,
            eventloop,
            config,
        }
    }

    /// Run the MQTT event loop. On connect, announces each device and its
    /// automation triggers and subscribes to its datapoint topic. Incoming
    /// publishes go out through `frame_tx`; device output from `out_rx` is
    /// published.
    pub async fn run(
        self,
        frame_tx: mpsc::Sender<MqttMessage>,
        mut out_rx: mpsc::Receiver<Outbound>,
    ) {
        let MqttClient {
            client,
            mut eventloop,
            config,
        } = self;

        let triggers = match serde_json::to_vec(Ts0021::AUTOMATION_TRIGGERS) {
            Ok(t) => t,
            Err(e) => {
                error!("Failed to encode automation triggers: {}", e);
                Vec::new()
            }
        };
        let retained = announcements(&config, &triggers);
        let subscribe_topics = datapoint_topics(&config);

        loop {
            tokio::select! {
                event = eventloop.poll() => {
                    match event {
                        Ok(event) => {
                            if let MqttEvent::Incoming(incoming) = &event {
                                match incoming {
                                    Incoming::ConnAck(_) => {
                                        info!("Connected to MQTT broker");
                                        announce(&client, &retained, &subscribe_topics).await;
                                    }
                                    Incoming::Publish(publish) => {
                                        let msg = MqttMessage {
                                            topic: publish.topic.clone(),
                                            payload: publish.payload.to_vec(),
                                        };
                                        if frame_tx.send(msg).await.is_err() {
                                            warn!("Frame channel closed");
                                        }
                                    }
                                    _ => {}
                                }
                            }
                        }
                        Err(e) => {
                            error!("MQTT connection error: {}. Reconnecting...", e);
                            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        }
                    }
                }
                Some(out) = out_rx.recv() => {
                    let (topic, payload, retain) = match render(&config, &out) {
                        Ok(rendered) => rendered,
                        Err(e) => {
                            warn!("{}", e);
                            continue;
                        }
                    };
                    info!("Publishing {}", topic);
                    if let Err(e) = client
                        .publish(&topic, QoS::AtLeastOnce, retain, payload)
                        .await
                    {
                        warn!("Failed to publish {}: {}", topic, e);
                        continue;
                    }
                    // Drive the event loop to immediately flush this publish to the socket
                    match eventloop.poll().await {
                        Ok(MqttEvent::Incoming(Incoming::Publish(publish))) => {
                            let msg = MqttMessage {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                            };
                            let _ = frame_tx.send(msg).await;
                        }
                        Err(e) => {
                            error!("MQTT error after publish flush: {}", e);
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Single-device setups use that device's status topic; otherwise a
/// bridge-wide one.
fn lwt_topic(config: &Config) -> String {
    match config.devices.as_slice() {
        [device] => config.device_status_topic(&device.topic_name),
        _ => format!("{}/bridge_status", config.mqtt.topic_prefix),
    }
}

/// Retained messages published on every connect: online status and the
/// automation trigger table for each device.
fn announcements(config: &Config, triggers: &[u8]) -> Vec<(String, Vec<u8>)> {
    config
        .devices
        .iter()
        .flat_map(|device| {
            [
                (
                    config.device_status_topic(&device.topic_name),
                    b"online".to_vec(),
                ),
                (
                    config.device_triggers_topic(&device.topic_name),
                    triggers.to_vec(),
                ),
            ]
        })
        .collect()
}

fn datapoint_topics(config: &Config) -> Vec<String> {
    config
        .devices
        .iter()
        .map(|d| config.device_datapoint_topic(&d.topic_name))
        .collect()
}

async fn announce(
    client: &AsyncClient,
    retained: &[(String, Vec<u8>)],
    subscribe_topics: &[String],
) {
    for (topic, payload) in retained {
        if let Err(e) = client
            .publish(topic, QoS::AtLeastOnce, true, payload.clone())
            .await
        {
            error!("Failed to publish {}: {}", topic, e);
        }
    }

    for topic in subscribe_topics {
        if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
            error!("Failed to subscribe to {}: {}", topic, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::config::{MqttConfig, TuyaConfig};
    use crate::tuya::cluster::{PressType, press_event};
    use crate::zcl::AttributeValue;

    fn config() -> Config {
        Config {
            mqtt: MqttConfig {
                broker_host: "localhost".into(),
                broker_port: 1883,
                username: None,
                password: None,
                topic_prefix: "tuya".into(),
                client_id: "test".into(),
            },
            tuya: TuyaConfig {
                poll_interval_secs: 30,
            },
            devices: Vec::new(),
        }
    }

    fn device(topic_name: &str) -> DeviceConfig {
        DeviceConfig {
            id: topic_name.into(),
            name: topic_name.into(),
            topic_name: topic_name.into(),
            manufacturer: "_TZ3210_3ulg9kpo".into(),
            model: "TS0021".into(),
            endpoints: Vec::new(),
            lan: None,
            dp_mapping: HashMap::new(),
        }
    }

    fn update(cluster: ClusterKey, attribute: &'static str, value: i64) -> AttributeUpdate {
        AttributeUpdate {
            endpoint_id: 1,
            cluster,
            cluster_id: cluster.cluster_id(),
            attribute_id: 0,
            attribute,
            value: AttributeValue::Int(value),
        }
    }

    #[test]
    fn battery_state_is_retained() {
        let msg = Outbound::Attribute {
            topic_name: "hallway".into(),
            update: update(ClusterKey::Power, "battery_percentage_remaining", 90),
        };
        let (topic, payload, retain) = render(&config(), &msg).unwrap();

        assert_eq!(topic, "tuya/hallway/state/power/battery_percentage_remaining");
        assert_eq!(payload, b"90");
        assert!(retain);
    }

    #[test]
    fn button_state_is_not_retained() {
        let msg = Outbound::Attribute {
            topic_name: "hallway".into(),
            update: update(ClusterKey::TuyaManufacturer, "btn_1_pressed", 1),
        };
        let (topic, _, retain) = render(&config(), &msg).unwrap();

        assert_eq!(topic, "tuya/hallway/state/tuya_manufacturer/btn_1_pressed");
        assert!(!retain);
    }

    #[test]
    fn event_payload_is_json() {
        let event = press_event(2, PressType::Long);
        let msg = Outbound::Event {
            topic_name: "hallway".into(),
            event,
        };
        let (topic, payload, retain) = render(&config(), &msg).unwrap();

        assert_eq!(topic, "tuya/hallway/event");
        assert!(!retain);
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "action": "button_2_long_press",
                "args": {"button": 2, "press_type": "long"},
            })
        );
    }

    #[test]
    fn sink_drops_when_queue_is_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = MqttSink::new("hallway".into(), tx);

        sink.send_event(press_event(1, PressType::Single));
        sink.send_event(press_event(1, PressType::Double));

        match rx.try_recv().unwrap() {
            Outbound::Event { event, .. } => assert_eq!(event.action, "button_1_single_press"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn only_running_devices_are_announced() {
        let mut all = config();
        all.devices = vec![device("hallway"), device("garage")];
        let client = MqttClient::new(&all, &[device("hallway")]);

        let topics: Vec<String> = announcements(&client.config, b"[]")
            .into_iter()
            .map(|(topic, _)| topic)
            .collect();
        assert_eq!(
            topics,
            vec!["tuya/hallway/bridge_status", "tuya/hallway/triggers"]
        );
        assert_eq!(datapoint_topics(&client.config), vec!["tuya/hallway/datapoints"]);
        assert_eq!(lwt_topic(&client.config), "tuya/hallway/bridge_status");
    }

    #[test]
    fn several_devices_share_the_bridge_lwt() {
        let mut config = config();
        config.devices = vec![device("hallway"), device("garage")];

        assert_eq!(lwt_topic(&config), "tuya/bridge_status");
        let retained = announcements(&config, b"[1]");
        assert_eq!(retained.len(), 4);
        assert_eq!(retained[1], ("tuya/hallway/triggers".to_string(), b"[1]".to_vec()));
        assert_eq!(retained[2], ("tuya/garage/bridge_status".to_string(), b"online".to_vec()));
    }

    #[test]
    fn run_future_can_be_spawned() {
        fn assert_send<T: Send>(_: &T) {}

        let client = MqttClient::new(&config(), &[device("hallway")]);
        let (frame_tx, _frame_rx) = mpsc::channel(1);
        let (_out_tx, out_rx) = mpsc::channel(1);
        let run = client.run(frame_tx, out_rx);
        assert_send(&run);
    }
}
