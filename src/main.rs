use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use tuya_quirk_bridge::config::{self, DeviceConfig};
use tuya_quirk_bridge::device::Ts0021;
use tuya_quirk_bridge::mqtt::client::{MqttClient, MqttMessage, MqttSink, Outbound};
use tuya_quirk_bridge::tuya::client::TuyaClient;
use tuya_quirk_bridge::tuya::{self, DatapointReport};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting tuya-quirk-bridge (mqtt={}:{}, devices={})",
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.devices.len(),
    );

    // Channels
    let (frame_tx, mut frame_rx) = mpsc::channel::<MqttMessage>(100);
    let (out_tx, out_rx) = mpsc::channel::<Outbound>(200);

    // Per-device report channels, keyed by topic_name for frame routing
    let mut device_report_txs: HashMap<String, mpsc::Sender<DatapointReport>> = HashMap::new();
    let poll_interval = Duration::from_secs(config.tuya.poll_interval_secs);
    let mut device_handles = Vec::new();

    let accepted = supported_devices(&config.devices);
    for device_config in &accepted {
        let advertised = device_config.advertised();
        let sink = Arc::new(MqttSink::new(device_config.topic_name.clone(), out_tx.clone()));
        let device = match Ts0021::new(&advertised, sink) {
            Ok(d) => d,
            Err(e) => {
                error!("Device profile error: {}", e);
                std::process::exit(1);
            }
        };

        info!(
            "  Device: {} ({}) as {} {}{}",
            device_config.name,
            device_config.id,
            device_config.manufacturer,
            device_config.model,
            device_config
                .lan
                .as_ref()
                .map(|lan| format!(" via LAN {}", lan.ip))
                .unwrap_or_default(),
        );

        let (report_tx, mut report_rx) = mpsc::channel::<DatapointReport>(200);
        device_report_txs.insert(device_config.topic_name.clone(), report_tx.clone());

        // One task owns the device; reports from every source are handled in arrival order.
        device_handles.push(tokio::spawn(async move {
            while let Some(report) = report_rx.recv().await {
                device.on_datapoint_report(&report);
            }
        }));

        if let Some(lan) = &device_config.lan {
            let client = TuyaClient::new(device_config.clone(), lan.clone());
            device_handles.push(tokio::spawn(async move {
                client.run(report_tx, poll_interval).await;
            }));
        }
    }

    if device_report_txs.is_empty() {
        error!("No configured device matches a supported profile");
        std::process::exit(1);
    }

    // Drop the original sender so the channel closes when all devices are gone
    drop(out_tx);

    let mqtt_client = MqttClient::new(&config, &accepted);
    let mqtt_handle = tokio::spawn(async move {
        mqtt_client.run(frame_tx, out_rx).await;
    });

    let topic_prefix = config.mqtt.topic_prefix.clone();

    // Main loop: route raw vendor frames to devices + handle shutdown
    loop {
        tokio::select! {
            Some(msg) = frame_rx.recv() => {
                let Some(topic_name) = parse_datapoint_topic(&msg.topic, &topic_prefix) else {
                    debug!("Ignoring message on {}", msg.topic);
                    continue;
                };
                let Some(report_tx) = device_report_txs.get(topic_name) else {
                    warn!("Unknown device in datapoint topic: {}", topic_name);
                    continue;
                };
                let frame = match decode_frame_payload(&msg.payload) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Bad datapoint frame for {}: {}", topic_name, e);
                        continue;
                    }
                };
                debug!(
                    "Frame tsn={} with {} datapoints for {}",
                    frame.tsn,
                    frame.reports.len(),
                    topic_name
                );
                for report in frame.reports {
                    if report_tx.send(report).await.is_err() {
                        warn!("Report channel closed for device {}", topic_name);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = async {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        error!("Failed to register SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            } => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    // Cleanup
    for handle in device_handles {
        handle.abort();
    }
    mqtt_handle.abort();
    info!("tuya-quirk-bridge stopped");
}

/// Devices whose advertised identity matches the TS0021 signature. The rest
/// are logged and left out of the bridge entirely.
fn supported_devices(devices: &[DeviceConfig]) -> Vec<DeviceConfig> {
    devices
        .iter()
        .filter(|device| {
            let matched = Ts0021::SIGNATURE.matches(&device.advertised());
            if !matched {
                warn!(
                    "Device {} ({} {}) does not match the TS0021 signature, skipping",
                    device.name, device.manufacturer, device.model
                );
            }
            matched
        })
        .cloned()
        .collect()
}

/// Parse a datapoint topic into its topic_name.
/// Expected format: {prefix}/{topic_name}/datapoints
fn parse_datapoint_topic<'a>(topic: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let topic_name = rest.strip_suffix("/datapoints")?;
    if topic_name.is_empty() || topic_name.contains('/') {
        return None;
    }
    Some(topic_name)
}

/// The payload is the vendor cluster command body, hex encoded.
fn decode_frame_payload(payload: &[u8]) -> Result<tuya::DatapointFrame, String> {
    let text = std::str::from_utf8(payload).map_err(|e| format!("payload is not text: {e}"))?;
    let bytes = hex::decode(text.trim()).map_err(|e| format!("payload is not hex: {e}"))?;
    tuya::parse_frame(&bytes).map_err(|e| e.to_string())
}
