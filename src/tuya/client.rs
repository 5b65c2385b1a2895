use std::collections::HashMap;
use std::time::Duration;

use rust_async_tuyapi::mesparse::CommandType;
use rust_async_tuyapi::tuyadevice::TuyaDevice;
use rust_async_tuyapi::{Payload, PayloadStruct};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{DeviceConfig, DpInfo, LanConfig, MappedType};
use crate::error::DecodeError;

use super::{DatapointReport, DpPayload, DpType};

/// Convert one `dps` entry from the LAN protocol into a datapoint report.
/// Enum datapoints arrive as their label; the mapping's range turns the label
/// back into the index the device would send over Zigbee.
pub fn report_from_dps(
    dp_id: &str,
    value: &Value,
    mapping: &HashMap<u8, DpInfo>,
) -> Result<DatapointReport, DecodeError> {
    let dp: u8 = dp_id
        .parse()
        .map_err(|_| DecodeError::InvalidDatapointId(dp_id.to_string()))?;
    let mapped = mapping.get(&dp).map(|info| &info.dp_type);

    let (dp_type, payload) = match value {
        Value::Bool(b) => (DpType::Bool, DpPayload::Bool(*b)),
        Value::Number(n) => {
            let n = n.as_i64().ok_or(DecodeError::UnexpectedPayload {
                dp,
                expected: "integer",
                found: "float",
            })?;
            let dp_type = match mapped {
                Some(MappedType::Enum(_)) => DpType::Enum,
                Some(MappedType::Bitmap) => DpType::Bitmap,
                _ => DpType::Value,
            };
            (dp_type, DpPayload::Int(n))
        }
        Value::String(s) => match mapped {
            Some(MappedType::Enum(range)) => match range.iter().position(|label| label == s) {
                Some(index) => (DpType::Enum, DpPayload::Int(index as i64)),
                None => {
                    warn!("DP {}: '{}' not in declared enum range {:?}", dp, s, range);
                    (DpType::String, DpPayload::Text(s.clone()))
                }
            },
            _ => (DpType::String, DpPayload::Text(s.clone())),
        },
        other => {
            return Err(DecodeError::UnexpectedPayload {
                dp,
                expected: "boolean, integer or string",
                found: match other {
                    Value::Null => "null",
                    Value::Array(_) => "array",
                    _ => "object",
                },
            });
        }
    };

    Ok(DatapointReport::new(dp, dp_type, payload))
}

fn dp_code(mapping: &HashMap<u8, DpInfo>, dp: u8) -> &str {
    mapping.get(&dp).map_or("unmapped", |info| info.code.as_str())
}

/// LAN session with a Tuya device (or the gateway relaying it). Feeds every
/// datapoint it sees into the device's report channel.
pub struct TuyaClient {
    config: DeviceConfig,
    lan: LanConfig,
}

impl TuyaClient {
    pub fn new(config: DeviceConfig, lan: LanConfig) -> Self {
        Self { config, lan }
    }

    /// Main device loop. Connects, polls, reconnects on failure.
    pub async fn run(&self, report_tx: mpsc::Sender<DatapointReport>, poll_interval: Duration) {
        let mut backoff = Duration::from_secs(5);
        let max_backoff = Duration::from_secs(60);

        loop {
            info!(
                "Connecting to device {} ({}) at {}",
                self.config.name, self.config.id, self.lan.ip
            );

            match self.run_session(&report_tx, poll_interval).await {
                Ok(()) => {
                    info!("Device {} session ended cleanly", self.config.name);
                    return;
                }
                Err(e) => {
                    error!(
                        "Device {} session error: {}. Reconnecting in {:?}",
                        self.config.name, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        }
    }

    /// Returns `Ok` only when the report channel has closed.
    async fn run_session(
        &self,
        report_tx: &mpsc::Sender<DatapointReport>,
        poll_interval: Duration,
    ) -> Result<(), String> {
        let mut device = TuyaDevice::new(
            &self.lan.version,
            &self.config.id,
            Some(&self.lan.key),
            self.lan.ip,
        )
        .map_err(|e| format!("Failed to create device: {e:?}"))?;

        let mut receiver = device
            .connect()
            .await
            .map_err(|e| format!("Failed to connect: {e:?}"))?;

        info!("Connected to device {}", self.config.name);

        // Initial DP query
        self.query_all_dps(&mut device).await?;

        let mut heartbeat_interval = tokio::time::interval(Duration::from_secs(10));
        let mut poll_timer = tokio::time::interval(poll_interval);
        // Skip first tick (we already queried)
        poll_timer.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat_interval.tick() => {
                    device.heartbeat().await
                        .map_err(|e| format!("Heartbeat failed: {e:?}"))?;
                }
                _ = poll_timer.tick() => {
                    self.query_all_dps(&mut device).await?;
                }
                msg = receiver.recv() => {
                    match msg {
                        Some(Ok(messages)) => {
                            for m in messages {
                                if m.command == Some(CommandType::HeartBeat) {
                                    continue;
                                }
                                if !self.process_message(&m, report_tx).await {
                                    return Ok(());
                                }
                            }
                        }
                        Some(Err(e)) => {
                            return Err(format!("Device error: {e:?}"));
                        }
                        None => {
                            return Err("Device channel closed".into());
                        }
                    }
                }
            }
        }
    }

    async fn query_all_dps(&self, device: &mut TuyaDevice) -> Result<(), String> {
        let payload = Payload::Struct(PayloadStruct {
            dev_id: self.config.id.clone(),
            gw_id: Some(self.config.id.clone()),
            uid: None,
            t: None,
            dp_id: None,
            dps: Some(json!({})),
        });

        device
            .get(payload)
            .await
            .map_err(|e| format!("DP query failed: {e:?}"))
    }

    /// Returns `false` once the report channel is gone.
    async fn process_message(
        &self,
        msg: &rust_async_tuyapi::mesparse::Message,
        report_tx: &mpsc::Sender<DatapointReport>,
    ) -> bool {
        // rust-async-tuyapi sometimes returns DP query responses as Payload::String
        // containing JSON like {"dps":{"1":0,"10":45}} instead of Payload::Struct.
        let dps_value: Option<Value> = match &msg.payload {
            Payload::Struct(ps) => {
                debug!("PayloadStruct: dev_id={}, dps={:?}", ps.dev_id, ps.dps);
                ps.dps.clone()
            }
            Payload::String(s) => {
                debug!("Payload::String, attempting JSON parse");
                serde_json::from_str::<Value>(s)
                    .ok()
                    .and_then(|v| v.get("dps").cloned())
            }
            Payload::Raw(b) => {
                debug!("Payload::Raw ({} bytes), skipping", b.len());
                None
            }
            _ => None,
        };

        let Some(dps) = dps_value else {
            debug!("No dps in message, skipping");
            return true;
        };
        let Some(dps_map) = dps.as_object() else {
            debug!("dps is not a JSON object: {}", dps);
            return true;
        };

        debug!("Processing {} DPs from {}", dps_map.len(), self.config.name);

        for (dp_id, value) in dps_map {
            let report = match report_from_dps(dp_id, value, &self.config.dp_mapping) {
                Ok(report) => report,
                Err(e) => {
                    warn!("Device {}: skipping DP {}: {}", self.config.name, dp_id, e);
                    continue;
                }
            };
            debug!(
                "Device {}: DP {} ({}) = {:?}",
                self.config.name,
                report.dp,
                dp_code(&self.config.dp_mapping, report.dp),
                report.payload
            );

            if report_tx.send(report).await.is_err() {
                warn!("Report channel closed for {}", self.config.name);
                return false;
            }
        }
        true
    }
}
