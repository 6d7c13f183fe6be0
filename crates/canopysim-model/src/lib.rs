//! # canopysim-model
//!
//! Scenario definitions and simulation assembly. A [`Scenario`] describes
//! one deployment: the season, the forest stand, the radio environment,
//! and the devices with their distances and settings. Scenarios load from
//! YAML or come from [`Scenario::amazon_default`], and
//! [`build_simulation`] turns a validated scenario into a registry of
//! entities plus the initial event schedule.

use canopysim_common::{
    ConfigUpdate, EntityId, EntityRegistry, Event, EventId, LoraConfig, Season,
};
use canopysim_env::{
    Climate, ClimateConfig, Device, DeviceConfig, ForestParams, Gateway, GatewayConfig,
    SeasonProfile, SensorConfig,
};
use canopysim_lora::DEFAULT_FREQUENCY_MHZ;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Errors from scenario loading and simulation assembly.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid scenario: {0}")]
    Invalid(String),
}

// ============================================================================
// Scenario Definition
// ============================================================================

/// One deployment to simulate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_season")]
    pub season: Season,
    /// Carrier frequency in MHz.
    #[serde(default = "default_frequency_mhz")]
    pub frequency_mhz: f64,
    /// Path loss exponent of the environment.
    #[serde(default = "default_path_loss_exponent")]
    pub path_loss_exponent: f64,
    #[serde(default)]
    pub forest: ForestSpec,
    pub devices: Vec<DeviceSpec>,
}

/// The forest stand around the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForestSpec {
    /// Fraction of ground covered by canopy, in [0, 1].
    #[serde(default = "default_vegetation_density")]
    pub vegetation_density: f64,
    /// Mean canopy height in meters.
    #[serde(default = "default_tree_height_m")]
    pub avg_tree_height_m: f64,
    /// Fraction of each radio path that runs under vegetation, in [0, 1].
    #[serde(default = "default_canopy_depth_factor")]
    pub canopy_depth_factor: f64,
}

impl Default for ForestSpec {
    fn default() -> Self {
        ForestSpec {
            vegetation_density: default_vegetation_density(),
            avg_tree_height_m: default_tree_height_m(),
            canopy_depth_factor: default_canopy_depth_factor(),
        }
    }
}

impl From<ForestSpec> for ForestParams {
    fn from(spec: ForestSpec) -> Self {
        ForestParams {
            vegetation_density: spec.vegetation_density,
            avg_tree_height_m: spec.avg_tree_height_m,
            canopy_depth_factor: spec.canopy_depth_factor,
        }
    }
}

/// One sensor device in a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceSpec {
    pub name: String,
    /// Line-of-sight distance to the gateway in meters.
    pub distance_m: f64,
    /// Temperature the device's sensor starts from, in degrees Celsius.
    #[serde(default = "default_initial_temperature_c")]
    pub initial_temperature_c: f64,
    /// Seconds between transmit cycles.
    #[serde(default = "default_tx_interval_s")]
    pub tx_interval_s: f64,
    /// Radio settings; omitted fields fall back to SF7/125 kHz/CR4-5/14 dBm.
    #[serde(default)]
    pub lora: ConfigUpdate,
    /// Starting battery charge in percent.
    #[serde(default = "default_battery_pct")]
    pub initial_battery_pct: f64,
}

fn default_name() -> String {
    "Amazon dense forest".to_string()
}

fn default_season() -> Season {
    Season::Rainy
}

fn default_frequency_mhz() -> f64 {
    DEFAULT_FREQUENCY_MHZ
}

fn default_path_loss_exponent() -> f64 {
    2.7
}

fn default_vegetation_density() -> f64 {
    0.8
}

fn default_tree_height_m() -> f64 {
    25.0
}

fn default_canopy_depth_factor() -> f64 {
    0.9
}

fn default_initial_temperature_c() -> f64 {
    28.0
}

fn default_tx_interval_s() -> f64 {
    300.0
}

fn default_battery_pct() -> f64 {
    100.0
}

impl Scenario {
    /// The reference deployment: four ESP32 nodes at 100 m steps from the
    /// gateway under dense rainy-season canopy.
    pub fn amazon_default() -> Self {
        let temperatures = [27.5, 28.2, 27.8, 28.5];
        let devices = temperatures
            .iter()
            .enumerate()
            .map(|(i, &t)| DeviceSpec {
                name: format!("ESP32-{}", i + 1),
                distance_m: (i + 1) as f64 * 100.0,
                initial_temperature_c: t,
                tx_interval_s: default_tx_interval_s(),
                lora: ConfigUpdate::default(),
                initial_battery_pct: default_battery_pct(),
            })
            .collect();
        Scenario {
            name: default_name(),
            season: Season::Rainy,
            frequency_mhz: default_frequency_mhz(),
            path_loss_exponent: default_path_loss_exponent(),
            forest: ForestSpec::default(),
            devices,
        }
    }

    /// Check every field against its domain.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.devices.is_empty() {
            return Err(ModelError::Invalid("scenario has no devices".to_string()));
        }
        if !self.frequency_mhz.is_finite() || self.frequency_mhz <= 0.0 {
            return Err(ModelError::Invalid(format!(
                "frequency must be positive, got {} MHz",
                self.frequency_mhz
            )));
        }
        if !(1.0..=6.0).contains(&self.path_loss_exponent) {
            return Err(ModelError::Invalid(format!(
                "path loss exponent must be in [1.0, 6.0], got {}",
                self.path_loss_exponent
            )));
        }
        if !(0.0..=1.0).contains(&self.forest.vegetation_density) {
            return Err(ModelError::Invalid(format!(
                "vegetation density must be in [0, 1], got {}",
                self.forest.vegetation_density
            )));
        }
        if !self.forest.avg_tree_height_m.is_finite() || self.forest.avg_tree_height_m <= 0.0 {
            return Err(ModelError::Invalid(format!(
                "tree height must be positive, got {} m",
                self.forest.avg_tree_height_m
            )));
        }
        if !(0.0..=1.0).contains(&self.forest.canopy_depth_factor) {
            return Err(ModelError::Invalid(format!(
                "canopy depth factor must be in [0, 1], got {}",
                self.forest.canopy_depth_factor
            )));
        }

        let mut names = HashSet::new();
        for spec in &self.devices {
            if spec.name.is_empty() {
                return Err(ModelError::Invalid("device with empty name".to_string()));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(ModelError::Invalid(format!(
                    "duplicate device name '{}'",
                    spec.name
                )));
            }
            if !spec.distance_m.is_finite() || spec.distance_m <= 0.0 {
                return Err(ModelError::Invalid(format!(
                    "device '{}': distance must be positive, got {} m",
                    spec.name, spec.distance_m
                )));
            }
            if !spec.tx_interval_s.is_finite() || spec.tx_interval_s <= 0.0 {
                return Err(ModelError::Invalid(format!(
                    "device '{}': transmit interval must be positive, got {} s",
                    spec.name, spec.tx_interval_s
                )));
            }
            if !(0.0..=100.0).contains(&spec.initial_battery_pct) {
                return Err(ModelError::Invalid(format!(
                    "device '{}': battery must be in [0, 100], got {}%",
                    spec.name, spec.initial_battery_pct
                )));
            }
            if !spec.initial_temperature_c.is_finite() {
                return Err(ModelError::Invalid(format!(
                    "device '{}': initial temperature must be finite",
                    spec.name
                )));
            }
            LoraConfig::default()
                .with_update(&spec.lora)
                .map_err(|e| ModelError::Invalid(format!("device '{}': {}", spec.name, e)))?;
        }
        Ok(())
    }
}

/// Load a scenario from a YAML file and validate it.
pub fn load_scenario<P: AsRef<Path>>(path: P) -> Result<Scenario, ModelError> {
    let text = std::fs::read_to_string(path)?;
    load_scenario_from_str(&text)
}

/// Parse a scenario from YAML text and validate it.
pub fn load_scenario_from_str(text: &str) -> Result<Scenario, ModelError> {
    let scenario: Scenario = serde_yaml::from_str(text)?;
    scenario.validate()?;
    Ok(scenario)
}

// ============================================================================
// Simulation Assembly
// ============================================================================

/// Static facts about one built device, for display and lookups.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub entity_id: EntityId,
    /// Logical 1-based id matching scenario order.
    pub device_id: u64,
    pub name: String,
    pub distance_m: f64,
}

/// A fully assembled simulation, ready for an event loop.
pub struct BuiltSimulation {
    pub entities: EntityRegistry,
    pub initial_events: Vec<Event>,
    pub device_infos: Vec<DeviceInfo>,
    pub gateway_id: EntityId,
}

/// Assemble entities and the initial schedule from a scenario.
///
/// Entity ids are assigned in a fixed order: climate, gateway, then the
/// devices in scenario order. The same scenario always produces the same
/// ids and the same initial events.
pub fn build_simulation(scenario: &Scenario) -> Result<BuiltSimulation, ModelError> {
    scenario.validate()?;

    let mut registry = EntityRegistry::new();
    let mut initial_events = Vec::new();
    let mut next_entity_id: u64 = 0;
    let mut event_id_counter: u64 = 0;

    let initial_weather = SeasonProfile::initial_weather(scenario.season);
    let forest: ForestParams = scenario.forest.clone().into();

    let climate_id = EntityId::new(next_entity_id);
    next_entity_id += 1;
    let gateway_id = EntityId::new(next_entity_id);
    next_entity_id += 1;

    let mut device_infos = Vec::new();
    for (index, spec) in scenario.devices.iter().enumerate() {
        let entity_id = EntityId::new(next_entity_id);
        next_entity_id += 1;
        device_infos.push(DeviceInfo {
            entity_id,
            device_id: index as u64 + 1,
            name: spec.name.clone(),
            distance_m: spec.distance_m,
        });
    }

    let mut subscribers = vec![gateway_id];
    subscribers.extend(device_infos.iter().map(|info| info.entity_id));

    let climate = Climate::new(
        climate_id,
        ClimateConfig {
            season: scenario.season,
            forest,
            subscribers,
        },
    );
    initial_events.push(climate.startup_event(EventId(event_id_counter)));
    event_id_counter += 1;
    registry.register(Box::new(climate));

    let gateway = Gateway::new(
        gateway_id,
        GatewayConfig {
            name: "GW-1".to_string(),
        },
        initial_weather,
    );
    initial_events.push(gateway.startup_event(EventId(event_id_counter)));
    event_id_counter += 1;
    registry.register(Box::new(gateway));

    for (spec, info) in scenario.devices.iter().zip(&device_infos) {
        let lora = LoraConfig::default()
            .with_update(&spec.lora)
            .map_err(|e| ModelError::Invalid(format!("device '{}': {}", spec.name, e)))?;
        let device = Device::new(
            info.entity_id,
            DeviceConfig {
                device_id: info.device_id,
                name: spec.name.clone(),
                distance_m: spec.distance_m,
                tx_interval_s: spec.tx_interval_s,
                lora,
                frequency_mhz: scenario.frequency_mhz,
                path_loss_exponent: scenario.path_loss_exponent,
                initial_battery_pct: spec.initial_battery_pct,
                forest,
                sensor: SensorConfig {
                    initial_temperature_c: spec.initial_temperature_c,
                    ..SensorConfig::default()
                },
                gateway: gateway_id,
            },
            initial_weather,
        );
        initial_events.push(device.startup_event(EventId(event_id_counter)));
        event_id_counter += 1;
        registry.register(Box::new(device));
    }

    Ok(BuiltSimulation {
        entities: registry,
        initial_events,
        device_infos,
        gateway_id,
    })
}
