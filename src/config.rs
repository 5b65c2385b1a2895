use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::net::IpAddr;

use crate::device::{AdvertisedDevice, SimpleDescriptor};

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub tuya: TuyaConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct TuyaConfig {
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub id: String,
    pub name: String,
    /// Sanitized name for use in MQTT topics (lowercase, spaces to underscores)
    pub topic_name: String,
    pub manufacturer: String,
    pub model: String,
    pub endpoints: Vec<SimpleDescriptor>,
    /// Present when the device is reachable over the Tuya LAN protocol.
    pub lan: Option<LanConfig>,
    pub dp_mapping: HashMap<u8, DpInfo>,
}

#[derive(Debug, Clone)]
pub struct LanConfig {
    pub ip: IpAddr,
    pub key: String,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct DpInfo {
    /// Tuya cloud code for the datapoint, used in logs.
    pub code: String,
    pub dp_type: MappedType,
}

/// How a LAN `dps` value is turned into a datapoint report. Booleans,
/// integers and strings carry their own type in JSON and need no mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum MappedType {
    Plain,
    Enum(Vec<String>),
    Bitmap,
}

impl DeviceConfig {
    /// What the device claims to be, for signature matching.
    pub fn advertised(&self) -> AdvertisedDevice {
        AdvertisedDevice {
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            endpoints: self.endpoints.clone(),
        }
    }
}

// Serde structs for parsing the devices file
#[derive(Deserialize)]
struct RawDevice {
    id: String,
    #[serde(default)]
    name: Option<String>,
    manufacturer: String,
    model: String,
    #[serde(default)]
    endpoints: Vec<SimpleDescriptor>,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    mapping: Option<HashMap<String, RawDpMapping>>,
}

#[derive(Deserialize)]
struct RawDpMapping {
    code: String,
    #[serde(rename = "type")]
    dp_type: String,
    #[serde(default)]
    values: Option<serde_json::Value>,
}

fn env_required(key: &str) -> Result<String, String> {
    env::var(key).map_err(|_| format!("{key} environment variable is required"))
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let devices_file = env_or_default("DEVICES_FILE", "devices.json".to_string());
        let content = std::fs::read_to_string(&devices_file)
            .map_err(|e| format!("Failed to read {devices_file}: {e}"))?;
        let devices =
            parse_devices(&content).map_err(|e| format!("{devices_file}: {e}"))?;

        let config = Self {
            mqtt: MqttConfig {
                broker_host: env_required("MQTT_BROKER_HOST")?,
                broker_port: env_or_default("MQTT_BROKER_PORT", 1883),
                username: env_optional("MQTT_USERNAME"),
                password: env_optional("MQTT_PASSWORD"),
                topic_prefix: env_or_default("MQTT_TOPIC_PREFIX", "tuya".to_string()),
                client_id: env_or_default("MQTT_CLIENT_ID", "tuya-quirk-bridge".to_string()),
            },
            tuya: TuyaConfig {
                poll_interval_secs: env_or_default("TUYA_POLL_INTERVAL_SECS", 30),
            },
            devices,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.mqtt.broker_host.is_empty() {
            return Err("MQTT_BROKER_HOST must not be empty".into());
        }
        if self.devices.is_empty() {
            return Err("No devices found in devices file".into());
        }
        if self.tuya.poll_interval_secs == 0 {
            return Err("TUYA_POLL_INTERVAL_SECS must be > 0".into());
        }
        Ok(())
    }

    pub fn device_status_topic(&self, topic_name: &str) -> String {
        format!("{}/{}/bridge_status", self.mqtt.topic_prefix, topic_name)
    }

    pub fn device_datapoint_topic(&self, topic_name: &str) -> String {
        format!("{}/{}/datapoints", self.mqtt.topic_prefix, topic_name)
    }

    pub fn device_state_topic(&self, topic_name: &str, cluster: &str, attribute: &str) -> String {
        format!(
            "{}/{}/state/{}/{}",
            self.mqtt.topic_prefix, topic_name, cluster, attribute
        )
    }

    pub fn device_event_topic(&self, topic_name: &str) -> String {
        format!("{}/{}/event", self.mqtt.topic_prefix, topic_name)
    }

    pub fn device_triggers_topic(&self, topic_name: &str) -> String {
        format!("{}/{}/triggers", self.mqtt.topic_prefix, topic_name)
    }
}

/// Parse the JSON device list.
pub fn parse_devices(content: &str) -> Result<Vec<DeviceConfig>, String> {
    let raw_devices: Vec<RawDevice> =
        serde_json::from_str(content).map_err(|e| format!("Failed to parse devices: {e}"))?;

    raw_devices
        .into_iter()
        .map(|raw| {
            let lan = match (raw.ip.as_deref(), raw.key) {
                (Some(ip), Some(key)) => Some(LanConfig {
                    ip: ip
                        .parse()
                        .map_err(|e| format!("Device {} invalid IP: {e}", raw.id))?,
                    key,
                    version: raw.version.unwrap_or_else(|| "3.3".to_string()),
                }),
                (None, None) => None,
                _ => {
                    return Err(format!(
                        "Device {} needs both 'ip' and 'key' for LAN access",
                        raw.id
                    ));
                }
            };

            let mut dp_mapping = HashMap::new();
            if let Some(mapping) = raw.mapping {
                for (dp_id, raw_dp) in mapping {
                    let dp: u8 = dp_id
                        .parse()
                        .map_err(|_| format!("Device {} invalid datapoint id {dp_id:?}", raw.id))?;
                    let dp_type = parse_dp_type(&raw_dp);
                    dp_mapping.insert(
                        dp,
                        DpInfo {
                            code: raw_dp.code,
                            dp_type,
                        },
                    );
                }
            }

            let name = raw.name.unwrap_or_else(|| raw.id.clone());
            let topic_name = sanitize_topic_name(&name);

            Ok(DeviceConfig {
                name,
                id: raw.id,
                topic_name,
                manufacturer: raw.manufacturer,
                model: raw.model,
                endpoints: raw.endpoints,
                lan,
                dp_mapping,
            })
        })
        .collect()
}

/// Convert a device name into a safe MQTT topic segment.
/// "Hallway Remote" → "hallway_remote"
fn sanitize_topic_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

fn parse_dp_type(raw: &RawDpMapping) -> MappedType {
    match raw.dp_type.as_str() {
        "Enum" => {
            let range = raw
                .values
                .as_ref()
                .and_then(|v| v.get("range"))
                .and_then(|r| r.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            MappedType::Enum(range)
        }
        "Bitmap" => MappedType::Bitmap,
        _ => MappedType::Plain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICES: &str = r#"[
        {
            "id": "bf0123",
            "name": "Hallway Remote",
            "manufacturer": "_TZ3210_3ulg9kpo",
            "model": "TS0021",
            "endpoints": [
                {"id": 1, "profile_id": 260, "device_type": 1026,
                 "input_clusters": [0, 1, 1280, 61184], "output_clusters": [10, 25]}
            ],
            "ip": "192.168.1.40",
            "key": "0123456789abcdef",
            "mapping": {
                "1": {"code": "switch1_value", "type": "Enum",
                      "values": {"range": ["single_click", "double_click", "long_press"]}},
                "10": {"code": "battery_percentage", "type": "Integer", "values": {}}
            }
        },
        {"id": "a1b2", "manufacturer": "_TZ3210_3ulg9kpo", "model": "TS0021"}
    ]"#;

    #[test]
    fn parses_device_file() {
        let devices = parse_devices(DEVICES).unwrap();
        assert_eq!(devices.len(), 2);

        let hallway = &devices[0];
        assert_eq!(hallway.topic_name, "hallway_remote");
        assert_eq!(hallway.endpoints[0].input_clusters, vec![0, 1, 1280, 61184]);
        let lan = hallway.lan.as_ref().unwrap();
        assert_eq!(lan.version, "3.3");
        assert_eq!(lan.ip.to_string(), "192.168.1.40");
        assert_eq!(
            hallway.dp_mapping[&1].dp_type,
            MappedType::Enum(vec![
                "single_click".into(),
                "double_click".into(),
                "long_press".into()
            ])
        );
        assert_eq!(hallway.dp_mapping[&10].dp_type, MappedType::Plain);
        assert_eq!(hallway.dp_mapping[&10].code, "battery_percentage");

        let bare = &devices[1];
        assert_eq!(bare.name, "a1b2");
        assert!(bare.lan.is_none());
        assert!(bare.endpoints.is_empty());
    }

    #[test]
    fn half_lan_block_is_rejected() {
        let err = parse_devices(
            r#"[{"id": "x", "manufacturer": "m", "model": "TS0021", "ip": "10.0.0.2"}]"#,
        )
        .unwrap_err();
        assert!(err.contains("both 'ip' and 'key'"));
    }

    #[test]
    fn non_numeric_datapoint_id_is_rejected() {
        let err = parse_devices(
            r#"[{"id": "x", "manufacturer": "m", "model": "TS0021",
                 "mapping": {"one": {"code": "c", "type": "Integer"}}}]"#,
        )
        .unwrap_err();
        assert!(err.contains("invalid datapoint id"));
    }

    #[test]
    fn self_describing_types_need_no_mapping() {
        let devices = parse_devices(
            r#"[{"id": "x", "manufacturer": "m", "model": "TS0021",
                 "mapping": {
                     "3": {"code": "flag", "type": "Boolean"},
                     "4": {"code": "label", "type": "String"},
                     "5": {"code": "mask", "type": "Bitmap"},
                     "6": {"code": "odd", "type": "Json"}
                 }}]"#,
        )
        .unwrap();
        let mapping = &devices[0].dp_mapping;

        assert_eq!(mapping[&3].dp_type, MappedType::Plain);
        assert_eq!(mapping[&4].dp_type, MappedType::Plain);
        assert_eq!(mapping[&5].dp_type, MappedType::Bitmap);
        assert_eq!(mapping[&6].dp_type, MappedType::Plain);
    }

    #[test]
    fn topic_names_are_sanitized() {
        assert_eq!(sanitize_topic_name("Kitchen  Remote #2"), "kitchen__remote__2");
        assert_eq!(sanitize_topic_name("_x_"), "x");
    }
}
