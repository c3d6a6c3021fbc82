//! Hardware coordination layer for a Raspberry Pi plant wall: sensors,
//! watering, LED lighting, and a small status display, each usable in
//! mock mode without any hardware attached.

pub mod config;
pub mod device;
pub mod display;
pub mod error;
pub mod lighting;
pub mod manager;
pub mod sensors;
pub mod watering;

pub use config::Config;
pub use display::{DisplaySystem, SystemAlert};
pub use error::{Error, Result};
pub use lighting::{LightingMode, LightingSystem};
pub use manager::{HardwareManager, HealthReport, SystemStatus};
pub use sensors::{SensorManager, SensorReading, SensorSnapshot};
pub use watering::{WateringSchedule, WateringSystem};
