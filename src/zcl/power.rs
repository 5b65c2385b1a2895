use std::sync::Arc;

use tracing::debug;

use crate::error::SubscriberError;
use crate::tuya::bus::BusListener;

use super::{AttributeCache, AttributeDef, AttributeValue, ClusterKey, DeviceSink};

pub const ATTR_BATTERY_VOLTAGE: &str = "battery_voltage";
pub const ATTR_BATTERY_PERCENTAGE_REMAINING: &str = "battery_percentage_remaining";
pub const ATTR_BATTERY_SIZE: &str = "battery_size";
pub const ATTR_BATTERY_QUANTITY: &str = "battery_quantity";
pub const ATTR_BATTERY_RATED_VOLTAGE: &str = "battery_rated_voltage";

pub const ATTRIBUTES: &[AttributeDef] = &[
    AttributeDef::new(0x0020, ATTR_BATTERY_VOLTAGE),
    AttributeDef::new(0x0021, ATTR_BATTERY_PERCENTAGE_REMAINING),
    AttributeDef::new(0x0031, ATTR_BATTERY_SIZE),
    AttributeDef::new(0x0033, ATTR_BATTERY_QUANTITY),
    AttributeDef::new(0x0034, ATTR_BATTERY_RATED_VOLTAGE),
];

/// Battery size enumeration value for AAA cells.
pub const BATTERY_SIZE_AAA: i64 = 4;

/// Power configuration cluster for a device running on two AAA cells. The
/// battery percentage is not reported here directly; it arrives over the
/// device's notification bus from the vendor cluster.
pub struct PowerConfigurationCluster {
    cache: AttributeCache,
}

impl PowerConfigurationCluster {
    pub fn new(endpoint_id: u8, sink: Arc<dyn DeviceSink>) -> Self {
        let cache = AttributeCache::new(endpoint_id, ClusterKey::Power, sink).with_constants(&[
            (ATTR_BATTERY_SIZE, AttributeValue::Int(BATTERY_SIZE_AAA)),
            (ATTR_BATTERY_QUANTITY, AttributeValue::Int(2)),
            // 100 mV units
            (ATTR_BATTERY_RATED_VOLTAGE, AttributeValue::Int(15)),
        ]);
        Self { cache }
    }

    pub fn cache(&self) -> &AttributeCache {
        &self.cache
    }
}

impl BusListener for PowerConfigurationCluster {
    fn battery_percentage_reported(&self, value: i64) -> Result<(), SubscriberError> {
        // The device counts in whole percent; the attribute is in half percent.
        let remaining = value
            .checked_mul(2)
            .ok_or_else(|| SubscriberError::Rejected(format!("battery value {value} overflows")))?;
        debug!("Battery reported {}%, remaining = {}", value, remaining);
        self.cache
            .update(ATTR_BATTERY_PERCENTAGE_REMAINING, AttributeValue::Int(remaining))?;
        Ok(())
    }
}
