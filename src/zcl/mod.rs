pub mod power;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::debug;

use crate::error::CacheError;

/// Home automation profile.
pub const PROFILE_HA: u16 = 0x0104;

/// Cluster ids
pub mod id {
    pub const BASIC: u16 = 0x0000;
    pub const POWER_CONFIG: u16 = 0x0001;
    pub const TIME: u16 = 0x000A;
    pub const OTA: u16 = 0x0019;
    pub const IAS_ZONE: u16 = 0x0500;
    pub const TUYA: u16 = 0xEF00;
}

/// Device type ids (HA profile)
pub mod device_type {
    pub const IAS_ZONE: u16 = 0x0402;
}

/// Basic cluster attributes the bridge fills from the matched device.
pub const BASIC_ATTRIBUTES: &[AttributeDef] = &[
    AttributeDef::new(0x0004, "manufacturer"),
    AttributeDef::new(0x0005, "model"),
];

/// One attribute in a cluster's schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeDef {
    pub id: u16,
    pub name: &'static str,
}

impl AttributeDef {
    pub const fn new(id: u16, name: &'static str) -> Self {
        Self { id, name }
    }
}

/// Clusters on the endpoint that can own attributes, keyed the way handlers
/// refer to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterKey {
    Basic,
    Power,
    TuyaManufacturer,
}

impl ClusterKey {
    pub fn cluster_id(self) -> u16 {
        match self {
            ClusterKey::Basic => id::BASIC,
            ClusterKey::Power => id::POWER_CONFIG,
            ClusterKey::TuyaManufacturer => id::TUYA,
        }
    }

    /// Endpoint attribute name, also used as the MQTT topic segment.
    pub fn name(self) -> &'static str {
        match self {
            ClusterKey::Basic => "basic",
            ClusterKey::Power => "power",
            ClusterKey::TuyaManufacturer => "tuya_manufacturer",
        }
    }

    pub fn schema(self) -> &'static [AttributeDef] {
        match self {
            ClusterKey::Basic => BASIC_ATTRIBUTES,
            ClusterKey::Power => power::ATTRIBUTES,
            ClusterKey::TuyaManufacturer => crate::tuya::cluster::ATTRIBUTES,
        }
    }

    pub fn declares(self, attribute: &str) -> bool {
        self.schema().iter().any(|def| def.name == attribute)
    }
}

/// Last-known value of an attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{b}"),
            AttributeValue::Int(n) => write!(f, "{n}"),
            AttributeValue::Text(s) => f.write_str(s),
            AttributeValue::Bytes(b) => f.write_str(&hex::encode(b)),
        }
    }
}

/// Fired for every cache write, whether or not the value changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeUpdate {
    pub endpoint_id: u8,
    pub cluster: ClusterKey,
    pub cluster_id: u16,
    pub attribute_id: u16,
    pub attribute: &'static str,
    pub value: AttributeValue,
}

/// A discrete user-facing device event, e.g. `button_1_double_press`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub action: String,
    pub args: serde_json::Map<String, serde_json::Value>,
}

/// Where the core hands its output: the host's attribute-updated path and
/// its external event surface.
pub trait DeviceSink: Send + Sync {
    fn attribute_updated(&self, update: AttributeUpdate);

    fn send_event(&self, event: Event);
}

/// Per-cluster store of last-known attribute values. Only names declared in
/// the cluster's schema can be written.
pub struct AttributeCache {
    endpoint_id: u8,
    cluster: ClusterKey,
    values: Mutex<HashMap<&'static str, AttributeValue>>,
    sink: Arc<dyn DeviceSink>,
}

impl AttributeCache {
    pub fn new(endpoint_id: u8, cluster: ClusterKey, sink: Arc<dyn DeviceSink>) -> Self {
        Self {
            endpoint_id,
            cluster,
            values: Mutex::new(HashMap::new()),
            sink,
        }
    }

    /// Seed values that never change and are not announced.
    pub fn with_constants(self, constants: &[(&'static str, AttributeValue)]) -> Self {
        {
            let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
            for (name, value) in constants {
                if self.cluster.declares(name) {
                    values.insert(*name, value.clone());
                }
            }
        }
        self
    }

    pub fn cluster(&self) -> ClusterKey {
        self.cluster
    }

    pub fn get(&self, attribute: &str) -> Option<AttributeValue> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(attribute)
            .cloned()
    }

    /// Write a value and announce it through the sink.
    pub fn update(&self, attribute: &str, value: AttributeValue) -> Result<(), CacheError> {
        let def = self
            .cluster
            .schema()
            .iter()
            .find(|def| def.name == attribute)
            .ok_or_else(|| CacheError::UnknownAttribute {
                cluster: self.cluster.cluster_id(),
                attribute: attribute.to_string(),
            })?;

        debug!("{}.{} = {}", self.cluster.name(), def.name, value);
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(def.name, value.clone());

        self.sink.attribute_updated(AttributeUpdate {
            endpoint_id: self.endpoint_id,
            cluster: self.cluster,
            cluster_id: self.cluster.cluster_id(),
            attribute_id: def.id,
            attribute: def.name,
            value,
        });
        Ok(())
    }
}
