use crate::error::{DecodeError, ProfileError};
use crate::zcl::{AttributeValue, ClusterKey};

use super::cluster::{ATTR_BTN_1_PRESSED, ATTR_BTN_2_PRESSED};
use super::DatapointReport;

/// Names the attribute a datapoint is mirrored into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeLocator {
    pub cluster: ClusterKey,
    pub attribute: &'static str,
}

pub type Transform = fn(&DatapointReport) -> Result<AttributeValue, DecodeError>;

#[derive(Debug, Clone, Copy)]
pub struct RegistryEntry {
    pub locator: AttributeLocator,
    pub transform: Option<Transform>,
}

impl RegistryEntry {
    pub const fn new(cluster: ClusterKey, attribute: &'static str) -> Self {
        Self {
            locator: AttributeLocator { cluster, attribute },
            transform: None,
        }
    }

    pub const fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// The value to store for `report`.
    pub fn value_for(&self, report: &DatapointReport) -> Result<AttributeValue, DecodeError> {
        match self.transform {
            Some(transform) => transform(report),
            None => Ok(AttributeValue::from(&report.payload)),
        }
    }
}

/// Closed set of datapoint handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// Store the payload in the registry's attribute and emit a press event.
    AttributeMirror,
    /// Forward the payload to the battery percentage owner over the bus.
    BatteryPercentForward,
}

pub struct Profile {
    pub datapoints: &'static [(u8, RegistryEntry)],
    pub handlers: &'static [(u8, Handler)],
}

impl Profile {
    pub fn entry(&self, dp: u8) -> Option<&RegistryEntry> {
        self.datapoints
            .iter()
            .find(|(id, _)| *id == dp)
            .map(|(_, entry)| entry)
    }

    pub fn handler(&self, dp: u8) -> Option<Handler> {
        self.handlers
            .iter()
            .find(|(id, _)| *id == dp)
            .map(|(_, handler)| *handler)
    }

    /// Check that every mirroring handler has somewhere to write, and that
    /// every registry entry names an attribute its cluster declares.
    pub fn validate(&self) -> Result<(), ProfileError> {
        for (dp, handler) in self.handlers {
            if *handler == Handler::AttributeMirror && self.entry(*dp).is_none() {
                return Err(ProfileError::MissingRegistryEntry(*dp));
            }
        }
        for (dp, entry) in self.datapoints {
            let AttributeLocator { cluster, attribute } = entry.locator;
            if !cluster.declares(attribute) {
                return Err(ProfileError::UnknownAttribute {
                    dp: *dp,
                    cluster: cluster.name(),
                    attribute,
                });
            }
        }
        Ok(())
    }
}

/// Two-button remote `TS0021`.
pub static TS0021: Profile = Profile {
    datapoints: &[
        (
            1,
            RegistryEntry::new(ClusterKey::TuyaManufacturer, ATTR_BTN_1_PRESSED),
        ),
        (
            2,
            RegistryEntry::new(ClusterKey::TuyaManufacturer, ATTR_BTN_2_PRESSED),
        ),
    ],
    handlers: &[
        (1, Handler::AttributeMirror),
        (2, Handler::AttributeMirror),
        (10, Handler::BatteryPercentForward),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuya::{DpPayload, DpType};

    #[test]
    fn ts0021_tables_are_consistent() {
        assert_eq!(TS0021.validate(), Ok(()));
    }

    #[test]
    fn locators_resolve_to_declared_attributes() {
        for (_, entry) in TS0021.datapoints {
            let locator = entry.locator;
            assert!(
                locator.cluster.schema().iter().any(|def| def.name == locator.attribute),
                "{:?} not declared",
                locator
            );
        }
    }

    #[test]
    fn lookups() {
        assert_eq!(TS0021.handler(1), Some(Handler::AttributeMirror));
        assert_eq!(TS0021.handler(10), Some(Handler::BatteryPercentForward));
        assert_eq!(TS0021.handler(7), None);
        assert!(TS0021.entry(10).is_none());
        assert_eq!(TS0021.entry(2).unwrap().locator.attribute, "btn_2_pressed");
    }

    #[test]
    fn mirror_without_entry_fails_validation() {
        static BROKEN: Profile = Profile {
            datapoints: &[],
            handlers: &[(3, Handler::AttributeMirror)],
        };
        assert_eq!(BROKEN.validate(), Err(ProfileError::MissingRegistryEntry(3)));
    }

    #[test]
    fn undeclared_attribute_fails_validation() {
        static BROKEN: Profile = Profile {
            datapoints: &[(4, RegistryEntry::new(ClusterKey::Power, "btn_1_pressed"))],
            handlers: &[],
        };
        assert!(matches!(
            BROKEN.validate(),
            Err(ProfileError::UnknownAttribute { dp: 4, cluster: "power", .. })
        ));
    }

    #[test]
    fn transform_replaces_raw_payload() {
        fn halve(report: &DatapointReport) -> Result<AttributeValue, DecodeError> {
            Ok(AttributeValue::Int(report.numeric()? / 2))
        }
        let entry = RegistryEntry::new(ClusterKey::TuyaManufacturer, ATTR_BTN_1_PRESSED)
            .with_transform(halve);
        let report = DatapointReport::new(1, DpType::Value, DpPayload::Int(8));

        assert_eq!(entry.value_for(&report), Ok(AttributeValue::Int(4)));
    }
}
