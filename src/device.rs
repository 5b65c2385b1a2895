//! Device composition for the Tuya `TS0021` two-button remote.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProfileError;
use crate::tuya::bus::{BusListener, NotificationBus};
use crate::tuya::cluster::{
    ATTR_BTN_1_PRESSED, ATTR_BTN_2_PRESSED, ClusterResolver, TuyaButtonCluster,
};
use crate::tuya::registry::TS0021;
use crate::tuya::DatapointReport;
use crate::zcl::power::PowerConfigurationCluster;
use crate::zcl::{
    AttributeCache, AttributeUpdate, AttributeValue, ClusterKey, DeviceSink, PROFILE_HA,
    device_type, id,
};

pub const BTN_1: &str = "Button 1";
pub const BTN_2: &str = "Button 2";

pub const SHORT_PRESS: &str = "remote_button_short_press";
pub const DOUBLE_PRESS: &str = "remote_button_double_press";
pub const LONG_PRESS: &str = "remote_button_long_press";

pub const COMMAND_ATTRIBUTE_UPDATED: &str = "attribute_updated";

/// Endpoint description as advertised by a device on join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleDescriptor {
    pub id: u8,
    pub profile_id: u16,
    pub device_type: u16,
    pub input_clusters: Vec<u16>,
    pub output_clusters: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedDevice {
    pub manufacturer: String,
    pub model: String,
    pub endpoints: Vec<SimpleDescriptor>,
}

#[derive(Debug)]
pub struct EndpointSignature {
    pub id: u8,
    pub profile_id: u16,
    pub device_type: u16,
    pub input_clusters: &'static [u16],
    pub output_clusters: &'static [u16],
}

impl EndpointSignature {
    fn matches(&self, descriptor: &SimpleDescriptor) -> bool {
        let set = |ids: &[u16]| ids.iter().copied().collect::<BTreeSet<_>>();
        self.id == descriptor.id
            && self.profile_id == descriptor.profile_id
            && self.device_type == descriptor.device_type
            && set(self.input_clusters) == set(descriptor.input_clusters.as_slice())
            && set(self.output_clusters) == set(descriptor.output_clusters.as_slice())
    }
}

#[derive(Debug)]
pub struct Signature {
    pub models_info: &'static [(&'static str, &'static str)],
    pub endpoints: &'static [EndpointSignature],
}

impl Signature {
    /// Whether `device` is one this profile applies to. Cluster lists are
    /// compared as sets; endpoints must line up one to one.
    pub fn matches(&self, device: &AdvertisedDevice) -> bool {
        let model_listed = self
            .models_info
            .iter()
            .any(|(manufacturer, model)| {
                *manufacturer == device.manufacturer && *model == device.model
            });
        if !model_listed || self.endpoints.len() != device.endpoints.len() {
            return false;
        }
        self.endpoints.iter().all(|expected| {
            device
                .endpoints
                .iter()
                .find(|ep| ep.id == expected.id)
                .is_some_and(|ep| expected.matches(ep))
        })
    }
}

/// One input cluster slot of the replacement endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterSlot {
    /// Kept as the stack provides it.
    Standard(u16),
    /// Replaced with this crate's implementation.
    Custom(ClusterKey),
}

impl ClusterSlot {
    pub fn cluster_id(self) -> u16 {
        match self {
            ClusterSlot::Standard(id) => id,
            ClusterSlot::Custom(key) => key.cluster_id(),
        }
    }
}

#[derive(Debug)]
pub struct EndpointReplacement {
    pub id: u8,
    pub profile_id: u16,
    pub device_type: u16,
    pub input_clusters: &'static [ClusterSlot],
    pub output_clusters: &'static [u16],
}

#[derive(Debug)]
pub struct Replacement {
    pub endpoints: &'static [EndpointReplacement],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TriggerArgs {
    pub attribute_id: &'static str,
    pub value: i64,
}

/// The attribute update a gesture shows up as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TriggerSpec {
    pub command: &'static str,
    pub cluster_id: u16,
    pub endpoint_id: u8,
    pub args: TriggerArgs,
}

impl TriggerSpec {
    pub fn matches(&self, update: &AttributeUpdate) -> bool {
        self.command == COMMAND_ATTRIBUTE_UPDATED
            && self.cluster_id == update.cluster_id
            && self.endpoint_id == update.endpoint_id
            && self.args.attribute_id == update.attribute
            && AttributeValue::Int(self.args.value) == update.value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AutomationTrigger {
    pub gesture: &'static str,
    pub source: &'static str,
    #[serde(flatten)]
    pub spec: TriggerSpec,
}

const fn button_trigger(
    gesture: &'static str,
    source: &'static str,
    attribute_id: &'static str,
    value: i64,
) -> AutomationTrigger {
    AutomationTrigger {
        gesture,
        source,
        spec: TriggerSpec {
            command: COMMAND_ATTRIBUTE_UPDATED,
            cluster_id: id::TUYA,
            endpoint_id: 1,
            args: TriggerArgs {
                attribute_id,
                value,
            },
        },
    }
}

/// Tuya `TS0021` two-button remote.
pub struct Ts0021 {
    endpoint: Endpoint,
}

impl Ts0021 {
    pub const SIGNATURE: Signature = Signature {
        models_info: &[("_TZ3210_3ulg9kpo", "TS0021")],
        endpoints: &[EndpointSignature {
            id: 1,
            profile_id: PROFILE_HA,
            device_type: device_type::IAS_ZONE,
            input_clusters: &[id::BASIC, id::POWER_CONFIG, id::IAS_ZONE, id::TUYA],
            output_clusters: &[id::TIME, id::OTA],
        }],
    };

    pub const REPLACEMENT: Replacement = Replacement {
        endpoints: &[EndpointReplacement {
            id: 1,
            profile_id: PROFILE_HA,
            device_type: device_type::IAS_ZONE,
            input_clusters: &[
                ClusterSlot::Standard(id::BASIC),
                ClusterSlot::Custom(ClusterKey::Power),
                ClusterSlot::Custom(ClusterKey::TuyaManufacturer),
            ],
            output_clusters: &[id::TIME, id::OTA],
        }],
    };

    pub const AUTOMATION_TRIGGERS: &'static [AutomationTrigger] = &[
        button_trigger(SHORT_PRESS, BTN_1, ATTR_BTN_1_PRESSED, 0),
        button_trigger(DOUBLE_PRESS, BTN_1, ATTR_BTN_1_PRESSED, 1),
        button_trigger(LONG_PRESS, BTN_1, ATTR_BTN_1_PRESSED, 2),
        button_trigger(SHORT_PRESS, BTN_2, ATTR_BTN_2_PRESSED, 0),
        button_trigger(DOUBLE_PRESS, BTN_2, ATTR_BTN_2_PRESSED, 1),
        button_trigger(LONG_PRESS, BTN_2, ATTR_BTN_2_PRESSED, 2),
    ];

    /// Build the device's endpoint. The notification bus is created first and
    /// handed to the clusters that use it.
    pub fn new(device: &AdvertisedDevice, sink: Arc<dyn DeviceSink>) -> Result<Self, ProfileError> {
        TS0021.validate()?;

        let layout = &Self::REPLACEMENT.endpoints[0];
        let bus = Arc::new(NotificationBus::new());

        let basic = AttributeCache::new(layout.id, ClusterKey::Basic, sink.clone())
            .with_constants(&[
                ("manufacturer", AttributeValue::Text(device.manufacturer.clone())),
                ("model", AttributeValue::Text(device.model.clone())),
            ]);

        let power = Arc::new(PowerConfigurationCluster::new(layout.id, sink.clone()));
        let listener: Arc<dyn BusListener> = power.clone();
        bus.subscribe(&listener);

        let tuya = TuyaButtonCluster::new(layout.id, &TS0021, bus, sink);

        debug!(
            "Built {} {} endpoint {} with inputs {:04x?}",
            device.manufacturer,
            device.model,
            layout.id,
            layout.input_clusters.iter().map(|slot| slot.cluster_id()).collect::<Vec<_>>(),
        );

        Ok(Self {
            endpoint: Endpoint {
                id: layout.id,
                basic,
                power,
                tuya,
            },
        })
    }

    pub fn automation_trigger(gesture: &str, source: &str) -> Option<&'static TriggerSpec> {
        Self::AUTOMATION_TRIGGERS
            .iter()
            .find(|t| t.gesture == gesture && t.source == source)
            .map(|t| &t.spec)
    }

    /// Entry point for vendor datapoint reports received on the endpoint.
    pub fn on_datapoint_report(&self, report: &DatapointReport) {
        self.endpoint.tuya.handle(report, &self.endpoint);
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// The single endpoint of the device, holding its clusters.
pub struct Endpoint {
    id: u8,
    basic: AttributeCache,
    power: Arc<PowerConfigurationCluster>,
    tuya: TuyaButtonCluster,
}

impl Endpoint {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn input_clusters(&self) -> Vec<u16> {
        vec![
            self.basic.cluster().cluster_id(),
            self.power.cache().cluster().cluster_id(),
            self.tuya.cache().cluster().cluster_id(),
        ]
    }

    pub fn attribute(&self, cluster: ClusterKey, attribute: &str) -> Option<AttributeValue> {
        self.attribute_cache(cluster)?.get(attribute)
    }
}

impl ClusterResolver for Endpoint {
    fn attribute_cache(&self, cluster: ClusterKey) -> Option<&AttributeCache> {
        match cluster {
            ClusterKey::Basic => Some(&self.basic),
            ClusterKey::Power => Some(self.power.cache()),
            ClusterKey::TuyaManufacturer => Some(self.tuya.cache()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuya::{DpPayload, DpType};
    use crate::zcl::testing::RecordingSink;

    fn advertised() -> AdvertisedDevice {
        AdvertisedDevice {
            manufacturer: "_TZ3210_3ulg9kpo".into(),
            model: "TS0021".into(),
            endpoints: vec![SimpleDescriptor {
                id: 1,
                profile_id: 260,
                device_type: 1026,
                input_clusters: vec![1, 1280, 61184, 0],
                output_clusters: vec![25, 10],
            }],
        }
    }

    #[test]
    fn signature_matches_advertised_descriptor() {
        assert!(Ts0021::SIGNATURE.matches(&advertised()));
    }

    #[test]
    fn signature_rejects_other_model() {
        let mut device = advertised();
        device.model = "TS0041".into();
        assert!(!Ts0021::SIGNATURE.matches(&device));
    }

    #[test]
    fn signature_rejects_missing_cluster() {
        let mut device = advertised();
        device.endpoints[0].input_clusters.retain(|c| *c != 0xEF00);
        assert!(!Ts0021::SIGNATURE.matches(&device));
    }

    #[test]
    fn signature_rejects_extra_endpoint() {
        let mut device = advertised();
        let mut second = device.endpoints[0].clone();
        second.id = 2;
        device.endpoints.push(second);
        assert!(!Ts0021::SIGNATURE.matches(&device));
    }

    #[test]
    fn endpoint_follows_replacement() {
        let device = Ts0021::new(&advertised(), Arc::new(RecordingSink::default())).unwrap();
        let expected: Vec<u16> = Ts0021::REPLACEMENT.endpoints[0]
            .input_clusters
            .iter()
            .map(|slot| slot.cluster_id())
            .collect();

        assert_eq!(device.endpoint().input_clusters(), expected);
        assert_eq!(device.endpoint().id(), 1);
        assert_eq!(
            device.endpoint().attribute(ClusterKey::Basic, "model"),
            Some(AttributeValue::Text("TS0021".into()))
        );
    }

    #[test]
    fn trigger_table_covers_every_gesture() {
        for source in [BTN_1, BTN_2] {
            for gesture in [SHORT_PRESS, DOUBLE_PRESS, LONG_PRESS] {
                assert!(Ts0021::automation_trigger(gesture, source).is_some());
            }
        }
        assert_eq!(Ts0021::AUTOMATION_TRIGGERS.len(), 6);
        assert!(Ts0021::automation_trigger("remote_button_triple_press", BTN_1).is_none());
    }

    #[test]
    fn long_press_produces_the_declared_trigger() {
        let sink = Arc::new(RecordingSink::default());
        let device = Ts0021::new(&advertised(), sink.clone()).unwrap();

        device.on_datapoint_report(&DatapointReport::new(2, DpType::Enum, DpPayload::Int(2)));

        let spec = Ts0021::automation_trigger(LONG_PRESS, BTN_2).unwrap();
        let updates = sink.updates();
        assert_eq!(updates.len(), 1);
        assert!(spec.matches(&updates[0]));
        assert!(!Ts0021::automation_trigger(LONG_PRESS, BTN_1).unwrap().matches(&updates[0]));
    }

    #[test]
    fn triggers_serialize_flat() {
        let value = serde_json::to_value(Ts0021::AUTOMATION_TRIGGERS[1]).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "gesture": "remote_button_double_press",
                "source": "Button 1",
                "command": "attribute_updated",
                "cluster_id": 0xEF00,
                "endpoint_id": 1,
                "args": {"attribute_id": "btn_1_pressed", "value": 1},
            })
        );
    }
}
