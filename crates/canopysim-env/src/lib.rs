//! # canopysim-env
//!
//! Behavioral entities of the forest network: the climate process that
//! drives the weather, the temperature sensors, the battery-powered
//! sensor devices, and the gateway that adjudicates their uplinks.
//!
//! Entities only interact through events. Each one owns its state, reacts
//! to the events addressed to it, and posts follow-up events through the
//! shared context.

pub mod climate;
pub mod device;
pub mod gateway;
pub mod sensor;

pub use climate::{
    environment_attenuation_db, Climate, ClimateConfig, ForestParams, SeasonProfile,
    WEATHER_UPDATE_INTERVAL_S,
};
pub use device::{Device, DeviceConfig, DeviceState};
pub use gateway::{Gateway, GatewayConfig, ReceivedPacket, AVAILABILITY_CHECK_INTERVAL_S};
pub use sensor::{SensorConfig, TemperatureSensor};
