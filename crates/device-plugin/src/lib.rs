//! GPU device inventory for the device plugin: configuration, platform
//! detection and the resource managers that expose and health check devices.

pub mod config;
pub mod platform;
pub mod rm;
