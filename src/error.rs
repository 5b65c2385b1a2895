use thiserror::Error;

/// A vendor payload that does not have the shape a handler or the frame
/// decoder expects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("unknown datapoint type code {0:#04x}")]
    UnknownType(u8),

    #[error("datapoint {dp}: invalid {kind} length {len}")]
    InvalidLength { dp: u8, kind: &'static str, len: usize },

    #[error("datapoint {0}: string payload is not valid UTF-8")]
    InvalidUtf8(u8),

    #[error("invalid datapoint id {0:?}")]
    InvalidDatapointId(String),

    #[error("datapoint {dp}: expected {expected} payload, got {found}")]
    UnexpectedPayload {
        dp: u8,
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cluster {cluster:#06x} has no attribute named {attribute:?}")]
    UnknownAttribute { cluster: u16, attribute: String },
}

/// Failure raised by a notification bus subscriber. Stays with the subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriberError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("{0}")]
    Rejected(String),
}

/// Inconsistency between the datapoint registry, the handler table and the
/// cluster schemas.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    #[error("datapoint {0} mirrors an attribute but has no registry entry")]
    MissingRegistryEntry(u8),

    #[error("datapoint {dp} targets {attribute:?}, which cluster {cluster} does not declare")]
    UnknownAttribute {
        dp: u8,
        cluster: &'static str,
        attribute: &'static str,
    },
}
