//! Per-device notification bus between sibling clusters.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::{debug, warn};

use crate::error::SubscriberError;

/// Messages carried by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMessage {
    /// Battery level as reported by the device, in whole percent.
    BatteryPercentageReported(i64),
}

impl BusMessage {
    pub fn name(&self) -> &'static str {
        match self {
            BusMessage::BatteryPercentageReported(_) => "battery_percentage_reported",
        }
    }
}

/// Implemented by clusters that subscribe to the bus. Each message has its own
/// callback; the default ignores it.
pub trait BusListener: Send + Sync {
    fn battery_percentage_reported(&self, _value: i64) -> Result<(), SubscriberError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct NotificationBus {
    listeners: Mutex<Vec<Weak<dyn BusListener>>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: &Arc<dyn BusListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(listener));
    }

    /// Deliver `message` to every live subscriber. Returns how many
    /// subscribers handled it without error.
    pub fn publish(&self, message: BusMessage) -> usize {
        let listeners: Vec<Arc<dyn BusListener>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        debug!("Publishing {} to {} listeners", message.name(), listeners.len());

        let mut delivered = 0;
        for listener in listeners {
            let result = match message {
                BusMessage::BatteryPercentageReported(value) => {
                    listener.battery_percentage_reported(value)
                }
            };
            match result {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Listener failed on {}: {}", message.name(), e),
            }
        }
        delivered
    }
}
