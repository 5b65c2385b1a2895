//! Vendor (0xEF00) cluster for Tuya button remotes.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::DecodeError;
use crate::zcl::{AttributeCache, AttributeDef, AttributeValue, ClusterKey, DeviceSink, Event};

use super::bus::{BusMessage, NotificationBus};
use super::registry::{AttributeLocator, Handler, Profile, RegistryEntry};
use super::DatapointReport;

pub const ATTR_BTN_1_PRESSED: &str = "btn_1_pressed";
pub const ATTR_BTN_2_PRESSED: &str = "btn_2_pressed";

pub const ATTRIBUTES: &[AttributeDef] = &[
    AttributeDef::new(0xEF01, ATTR_BTN_1_PRESSED),
    AttributeDef::new(0xEF02, ATTR_BTN_2_PRESSED),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressType {
    Single,
    Double,
    Long,
    Unknown,
}

impl PressType {
    pub fn from_value(value: i64) -> Self {
        match value {
            0 => PressType::Single,
            1 => PressType::Double,
            2 => PressType::Long,
            _ => PressType::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PressType::Single => "single",
            PressType::Double => "double",
            PressType::Long => "long",
            PressType::Unknown => "unknown",
        }
    }
}

/// `button_{dp}_{press}_press` with `{button, press_type}` args.
pub fn press_event(button: u8, press: PressType) -> Event {
    let mut args = serde_json::Map::new();
    args.insert("button".into(), json!(button));
    args.insert("press_type".into(), json!(press.as_str()));
    Event {
        action: format!("button_{}_{}_press", button, press.as_str()),
        args,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheWrite {
    pub locator: AttributeLocator,
    pub value: AttributeValue,
}

/// What a handler wants done with a report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub write: Option<CacheWrite>,
    pub event: Option<Event>,
    pub notify: Option<BusMessage>,
}

impl Handler {
    /// Interpret `report`. Pure: nothing is written until the outcome is applied.
    pub fn apply(
        self,
        report: &DatapointReport,
        entry: Option<&RegistryEntry>,
    ) -> Result<Outcome, DecodeError> {
        match self {
            Handler::AttributeMirror => {
                let press = PressType::from_value(report.numeric()?);
                let write = match entry {
                    Some(entry) => Some(CacheWrite {
                        locator: entry.locator,
                        value: entry.value_for(report)?,
                    }),
                    None => {
                        warn!("Datapoint {} has no registry entry, not stored", report.dp);
                        None
                    }
                };
                Ok(Outcome {
                    write,
                    event: Some(press_event(report.dp, press)),
                    notify: None,
                })
            }
            Handler::BatteryPercentForward => Ok(Outcome {
                notify: Some(BusMessage::BatteryPercentageReported(report.numeric()?)),
                ..Outcome::default()
            }),
        }
    }
}

/// Finds sibling clusters on the same endpoint by key.
pub trait ClusterResolver {
    fn attribute_cache(&self, cluster: ClusterKey) -> Option<&AttributeCache>;
}

/// Turns a datapoint report into an outcome, or `None` when the datapoint is
/// not handled.
pub trait Decoder {
    fn decode(&self, report: &DatapointReport) -> Result<Option<Outcome>, DecodeError>;
}

/// Sends device events to the host.
pub trait Emitter {
    fn emit(&self, event: Event);
}

pub struct TuyaButtonCluster {
    profile: &'static Profile,
    cache: AttributeCache,
    bus: Arc<NotificationBus>,
    sink: Arc<dyn DeviceSink>,
}

impl TuyaButtonCluster {
    pub fn new(
        endpoint_id: u8,
        profile: &'static Profile,
        bus: Arc<NotificationBus>,
        sink: Arc<dyn DeviceSink>,
    ) -> Self {
        Self {
            profile,
            cache: AttributeCache::new(endpoint_id, ClusterKey::TuyaManufacturer, sink.clone()),
            bus,
            sink,
        }
    }

    pub fn cache(&self) -> &AttributeCache {
        &self.cache
    }

    /// Dispatch one report. Never fails: unhandled datapoints are ignored and
    /// malformed ones are logged and dropped without side effects.
    pub fn handle(&self, report: &DatapointReport, endpoint: &dyn ClusterResolver) {
        let outcome = match self.decode(report) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                debug!("Unhandled datapoint {} ({:?})", report.dp, report.dp_type);
                return;
            }
            Err(e) => {
                warn!("Dropping datapoint {}: {}", report.dp, e);
                return;
            }
        };

        if let Some(write) = outcome.write {
            let target = write.locator.cluster;
            let cache = if target == self.cache.cluster() {
                Some(&self.cache)
            } else {
                endpoint.attribute_cache(target)
            };
            let Some(cache) = cache else {
                warn!("Datapoint {}: no {} cluster on endpoint", report.dp, target.name());
                return;
            };
            if let Err(e) = cache.update(write.locator.attribute, write.value) {
                warn!("Datapoint {}: {}", report.dp, e);
                return;
            }
        }

        if let Some(event) = outcome.event {
            self.emit(event);
        }

        if let Some(message) = outcome.notify {
            self.bus.publish(message);
        }
    }
}

impl Decoder for TuyaButtonCluster {
    fn decode(&self, report: &DatapointReport) -> Result<Option<Outcome>, DecodeError> {
        let Some(handler) = self.profile.handler(report.dp) else {
            return Ok(None);
        };
        handler
            .apply(report, self.profile.entry(report.dp))
            .map(Some)
    }
}

impl Emitter for TuyaButtonCluster {
    fn emit(&self, event: Event) {
        info!("Event {}", event.action);
        self.sink.send_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuya::registry::TS0021;
    use crate::tuya::{DpPayload, DpType};
    use crate::zcl::testing::RecordingSink;

    struct NoSiblings;

    impl ClusterResolver for NoSiblings {
        fn attribute_cache(&self, _cluster: ClusterKey) -> Option<&AttributeCache> {
            None
        }
    }

    fn cluster() -> (TuyaButtonCluster, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let bus = Arc::new(NotificationBus::new());
        let cluster = TuyaButtonCluster::new(1, &TS0021, bus, sink.clone());
        (cluster, sink)
    }

    fn enum_report(dp: u8, value: i64) -> DatapointReport {
        DatapointReport::new(dp, DpType::Enum, DpPayload::Int(value))
    }

    #[test]
    fn press_labels() {
        assert_eq!(PressType::from_value(0), PressType::Single);
        assert_eq!(PressType::from_value(1), PressType::Double);
        assert_eq!(PressType::from_value(2), PressType::Long);
        assert_eq!(PressType::from_value(3), PressType::Unknown);
        assert_eq!(PressType::from_value(-1), PressType::Unknown);
    }

    #[test]
    fn mirror_writes_and_emits() {
        let (cluster, sink) = cluster();
        cluster.handle(&enum_report(1, 1), &NoSiblings);

        assert_eq!(cluster.cache().get(ATTR_BTN_1_PRESSED), Some(AttributeValue::Int(1)));
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "button_1_double_press");
        assert_eq!(events[0].args["button"], json!(1));
        assert_eq!(events[0].args["press_type"], json!("double"));
    }

    #[test]
    fn unknown_press_still_emits() {
        let (cluster, sink) = cluster();
        cluster.handle(&enum_report(2, 99), &NoSiblings);

        assert_eq!(cluster.cache().get(ATTR_BTN_2_PRESSED), Some(AttributeValue::Int(99)));
        assert_eq!(sink.events()[0].action, "button_2_unknown_press");
    }

    #[test]
    fn non_numeric_press_is_dropped() {
        let (cluster, sink) = cluster();
        let report = DatapointReport::new(1, DpType::String, DpPayload::Text("single".into()));
        cluster.handle(&report, &NoSiblings);

        assert!(cluster.cache().get(ATTR_BTN_1_PRESSED).is_none());
        assert!(sink.events().is_empty());
        assert!(sink.updates().is_empty());
    }

    #[test]
    fn unhandled_datapoint_decodes_to_none() {
        let (cluster, _) = cluster();
        assert_eq!(cluster.decode(&enum_report(7, 1)), Ok(None));
    }

    #[test]
    fn battery_outcome_only_notifies() {
        let report = DatapointReport::new(10, DpType::Value, DpPayload::Int(45));
        let outcome = Handler::BatteryPercentForward.apply(&report, None).unwrap();

        assert_eq!(
            outcome,
            Outcome {
                write: None,
                event: None,
                notify: Some(BusMessage::BatteryPercentageReported(45)),
            }
        );
    }

    #[test]
    fn mirror_without_entry_still_emits() {
        let outcome = Handler::AttributeMirror.apply(&enum_report(5, 0), None).unwrap();

        assert!(outcome.write.is_none());
        assert_eq!(outcome.event.unwrap().action, "button_5_single_press");
    }

    #[test]
    fn write_to_missing_sibling_is_dropped() {
        static ELSEWHERE: Profile = Profile {
            datapoints: &[(3, RegistryEntry::new(ClusterKey::Basic, "model"))],
            handlers: &[(3, Handler::AttributeMirror)],
        };
        let sink = Arc::new(RecordingSink::default());
        let bus = Arc::new(NotificationBus::new());
        let cluster = TuyaButtonCluster::new(1, &ELSEWHERE, bus, sink.clone());

        cluster.handle(&enum_report(3, 0), &NoSiblings);

        assert!(sink.events().is_empty());
        assert!(sink.updates().is_empty());
    }
}
