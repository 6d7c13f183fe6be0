//! Sensor-node device: the periodic sense/transmit/sleep cycle.

use crate::climate::{environment_attenuation_db, ForestParams};
use crate::sensor::{SensorConfig, TemperatureSensor};
use canopysim_common::{
    BatteryDepletedEvent, ConfigUpdate, DeliveryOutcome, Entity, EntityId, Event, EventId,
    EventPayload, LoraConfig, SimContext, SimError, SimTime, TelemetryEvent, UplinkEvent, Weather,
};
use canopysim_lora::{noise_floor_dbm, path_loss_db, sample_gaussian, sf_gain_db, PAYLOAD_BYTES};
use rand::Rng;
use tracing::{debug, info, warn};

// Timer IDs
const TIMER_TX_CYCLE: u64 = 0;

/// Log-normal shadowing standard deviation in dB.
const SHADOWING_STD_DB: f64 = 3.0;

/// Idle draw between transmissions in mW.
const SLEEP_POWER_MW: f64 = 0.1;

/// Battery level below which the device logs a one-shot warning.
const LOW_BATTERY_PCT: f64 = 20.0;

/// Configuration for one sensor device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Logical device id, stable across the run and 1-based in scenarios.
    pub device_id: u64,
    /// Human-readable name, e.g. "ESP32-1".
    pub name: String,
    /// Line-of-sight distance to the gateway in meters.
    pub distance_m: f64,
    /// Seconds between transmit cycles.
    pub tx_interval_s: f64,
    /// Initial radio settings.
    pub lora: LoraConfig,
    /// Carrier frequency in MHz.
    pub frequency_mhz: f64,
    /// Path loss exponent of the environment.
    pub path_loss_exponent: f64,
    /// Starting battery charge in percent.
    pub initial_battery_pct: f64,
    /// Forest geometry shared by every radio path.
    pub forest: ForestParams,
    /// Sensor behind this device.
    pub sensor: SensorConfig,
    /// Gateway that receives this device's uplinks.
    pub gateway: EntityId,
}

/// Lifecycle state of a device between events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Waiting for the next transmit cycle.
    Sleeping,
    /// Battery at zero. Terminal: no further cycles are scheduled.
    Depleted,
}

/// One simulated sensor node.
///
/// Each transmit cycle is atomic: the device senses, computes the link
/// budget under the weather it last received, spends energy, and posts the
/// uplink toward the gateway with the cycle's latency as event delay.
/// Queued reconfigurations apply at the start of the next cycle, never
/// mid-cycle.
pub struct Device {
    entity_id: EntityId,
    config: DeviceConfig,
    sensor: TemperatureSensor,
    weather: Weather,
    state: DeviceState,
    /// Swapped in at the start of the next cycle.
    pending_config: Option<LoraConfig>,
    sequence: u64,
    packets_sent: u64,
    packets_received: u64,
    battery_pct: f64,
    energy_mwh: f64,
    low_battery_warned: bool,
}

impl Device {
    pub fn new(entity_id: EntityId, config: DeviceConfig, initial_weather: Weather) -> Self {
        let sensor = TemperatureSensor::new(config.sensor.clone());
        let battery_pct = config.initial_battery_pct.clamp(0.0, 100.0);
        let state = if battery_pct > 0.0 {
            DeviceState::Sleeping
        } else {
            warn!("Device[{}]: starting with a depleted battery", config.name);
            DeviceState::Depleted
        };
        Device {
            entity_id,
            config,
            sensor,
            weather: initial_weather,
            state,
            pending_config: None,
            sequence: 0,
            packets_sent: 0,
            packets_received: 0,
            battery_pct,
            energy_mwh: 0.0,
            low_battery_warned: false,
        }
    }

    pub fn device_id(&self) -> u64 {
        self.config.device_id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    pub fn battery_pct(&self) -> f64 {
        self.battery_pct
    }

    pub fn energy_consumed_mwh(&self) -> f64 {
        self.energy_mwh
    }

    pub fn lora_config(&self) -> LoraConfig {
        self.config.lora
    }

    /// Kickoff event for the initial schedule: the first cycle runs at the
    /// end of the first transmit interval, not at t=0.
    pub fn startup_event(&self, id: EventId) -> Event {
        Event {
            id,
            time: SimTime::from_secs(self.config.tx_interval_s),
            source: self.entity_id,
            targets: vec![self.entity_id],
            payload: EventPayload::Timer {
                timer_id: TIMER_TX_CYCLE,
            },
        }
    }

    /// Fraction of attempts the gateway acknowledged; 0 before the first
    /// attempt.
    pub fn packet_delivery_ratio(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_received as f64 / self.packets_sent as f64
        }
    }

    pub fn packet_loss_ratio(&self) -> f64 {
        1.0 - self.packet_delivery_ratio()
    }

    /// Stage a reconfiguration for the next cycle.
    fn queue_config_update(&mut self, update: &ConfigUpdate) {
        let base = self.pending_config.unwrap_or(self.config.lora);
        match base.with_update(update) {
            Ok(next) => {
                debug!("Device[{}]: config change queued", self.config.name);
                self.pending_config = Some(next);
            }
            Err(e) => {
                warn!("Device[{}]: rejected config update: {}", self.config.name, e);
            }
        }
    }

    /// One full sense/transmit cycle.
    fn run_cycle(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        if let Some(next) = self.pending_config.take() {
            info!(
                "Device[{}]: config now SF{} BW{} CR4/{} TP{}",
                self.config.name,
                next.spreading_factor,
                next.bandwidth_khz,
                next.coding_rate,
                next.tx_power_dbm
            );
            self.config.lora = next;
        }

        if self.state == DeviceState::Depleted {
            return Ok(());
        }

        let now = ctx.time();
        let reading = self.sensor.read(now, &self.weather, ctx.rng());
        let usable = reading.is_finite();

        // Link budget under the current weather.
        let path_loss = path_loss_db(
            self.config.distance_m,
            self.config.frequency_mhz,
            self.config.path_loss_exponent,
            1.0,
        )
        .map_err(|e| SimError::HandlerError {
            entity: self.entity_id,
            message: e.to_string(),
        })?;
        let environment = environment_attenuation_db(
            &self.weather,
            &self.config.forest,
            self.config.distance_m,
            self.config.frequency_mhz,
        );
        let shadowing = sample_gaussian(ctx.rng(), 0.0, SHADOWING_STD_DB);
        let rssi = self.config.lora.tx_power_dbm as f64 - path_loss - environment
            + sf_gain_db(self.config.lora.spreading_factor)
            + shadowing;

        let rain = if self.weather.is_raining {
            self.weather.rain_intensity_mm_h
        } else {
            0.0
        };
        let snr = rssi
            - noise_floor_dbm(
                self.config.lora.bandwidth_hz(),
                rain,
                self.weather.humidity_pct,
            );

        let airtime = self.config.lora.airtime_s(PAYLOAD_BYTES);
        // Queuing and processing jitter on top of the time on air.
        let latency = airtime + ctx.rng().gen_range(0.0..0.5);

        let energy = self.cycle_energy_mwh(airtime, ctx);
        self.energy_mwh += energy;
        self.drain_battery(energy);

        self.sequence += 1;
        self.packets_sent += 1;

        // History row for this cycle, usable reading or not.
        ctx.post_immediate(
            vec![],
            EventPayload::Telemetry(TelemetryEvent {
                device_id: self.config.device_id,
                sequence: self.sequence,
                temperature_c: usable.then_some(reading),
                humidity_pct: self.weather.humidity_pct,
                rain_intensity_mm_h: rain,
                rssi_dbm: rssi,
                snr_db: snr,
                airtime_s: airtime,
                latency_s: latency,
                energy_mwh: self.energy_mwh,
                battery_pct: self.battery_pct,
            }),
        );

        if usable {
            ctx.post_event(
                SimTime::from_secs(latency),
                vec![self.config.gateway],
                EventPayload::Uplink(UplinkEvent {
                    device_id: self.config.device_id,
                    sequence: self.sequence,
                    temperature_c: reading,
                    rssi_dbm: rssi,
                    snr_db: snr,
                    airtime_s: airtime,
                    latency_s: latency,
                    battery_pct: self.battery_pct,
                    config: self.config.lora,
                }),
            );
            debug!(
                "Device[{}]: #{} {:.1} C rssi {:.1} dBm snr {:.1} dB airtime {:.1} ms",
                self.config.name,
                self.sequence,
                reading,
                rssi,
                snr,
                airtime * 1000.0
            );
        } else {
            warn!(
                "Device[{}]: unusable sensor reading, cycle {} not transmitted",
                self.config.name, self.sequence
            );
        }

        let labels = [("device", self.config.name.clone())];
        metrics::counter!("canopysim_device_tx_attempts", &labels).increment(1);
        metrics::gauge!("canopysim_device_battery_pct", &labels).set(self.battery_pct);
        metrics::histogram!("canopysim_device_latency_seconds", &labels).record(latency);

        if self.battery_pct <= 0.0 {
            self.state = DeviceState::Depleted;
            warn!(
                "Device[{}]: battery depleted after {} cycles",
                self.config.name, self.sequence
            );
            ctx.post_immediate(
                vec![],
                EventPayload::BatteryDepleted(BatteryDepletedEvent {
                    device_id: self.config.device_id,
                }),
            );
        } else {
            if self.battery_pct < LOW_BATTERY_PCT && !self.low_battery_warned {
                warn!(
                    "Device[{}]: battery low ({:.1}%)",
                    self.config.name, self.battery_pct
                );
                self.low_battery_warned = true;
            }
            ctx.post_event(
                SimTime::from_secs(self.config.tx_interval_s),
                vec![self.entity_id],
                EventPayload::Timer {
                    timer_id: TIMER_TX_CYCLE,
                },
            );
        }
        Ok(())
    }

    /// Energy for one cycle in mWh: TX draw for the airtime plus the sleep
    /// floor for the rest of the interval, derated for heat.
    fn cycle_energy_mwh(&self, airtime_s: f64, ctx: &mut SimContext) -> f64 {
        let tx_power_mw = 120.0 + 5.0 * self.config.lora.tx_power_dbm as f64;
        let heat_factor = 1.0 + (self.weather.temperature_c - 30.0).max(0.0) * 0.03;
        let sleep_s = (self.config.tx_interval_s - airtime_s).max(0.0);
        let mut energy = (tx_power_mw * airtime_s * heat_factor + SLEEP_POWER_MW * sleep_s) / 3600.0;

        // Saturated air occasionally upsets the regulator.
        if self.weather.humidity_pct > 90.0 && ctx.rng().gen::<f64>() < 0.05 {
            energy *= ctx.rng().gen_range(1.5..2.5);
        }
        energy
    }

    fn drain_battery(&mut self, energy_mwh: f64) {
        let mut drain = 0.01 * energy_mwh * 30.0;
        if self.weather.temperature_c > 32.0 {
            drain *= 1.0 + (self.weather.temperature_c - 32.0) * 0.1;
        }
        self.battery_pct = (self.battery_pct - drain).max(0.0);
    }
}

impl Entity for Device {
    fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Timer { timer_id } => {
                if *timer_id == TIMER_TX_CYCLE {
                    self.run_cycle(ctx)?;
                }
            }
            EventPayload::WeatherUpdate(update) => {
                self.weather = update.weather;
            }
            EventPayload::ConfigChange(change) => {
                self.queue_config_update(&change.update);
            }
            EventPayload::DeliveryReport(report) => match report.outcome {
                DeliveryOutcome::Delivered => {
                    self.packets_received += 1;
                    debug!(
                        "Device[{}]: uplink {} delivered",
                        self.config.name, report.sequence
                    );
                }
                DeliveryOutcome::Lost(cause) => {
                    debug!(
                        "Device[{}]: uplink {} lost ({:?})",
                        self.config.name, report.sequence, cause
                    );
                }
            },
            _ => {}
        }
        Ok(())
    }
}
