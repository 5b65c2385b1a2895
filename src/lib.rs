//! Bridge for Tuya Zigbee devices that report their state as vendor
//! datapoints on cluster `0xEF00`.

pub mod config;
pub mod device;
pub mod error;
pub mod mqtt;
pub mod tuya;
pub mod zcl;
