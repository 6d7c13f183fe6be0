//! Temperature sensor model: noise, drift, thermal inertia, and an
//! intermittent humidity-driven malfunction sub-state.

use canopysim_common::{SimTime, Weather};
use rand::Rng;
use tracing::{debug, warn};

/// Seconds between malfunction checks.
const MALFUNCTION_CHECK_INTERVAL_S: f64 = 60.0;

/// Configuration for one temperature sensor.
#[derive(Debug, Clone)]
pub struct SensorConfig {
    /// Reading the sensor starts from, in degrees Celsius.
    pub initial_temperature_c: f64,
    /// Half-width of the uniform measurement noise, in degrees Celsius.
    pub noise_c: f64,
    /// Maximum random walk step per reading when the sensor is not coupled
    /// to the climate, in degrees Celsius.
    pub drift_c: f64,
    /// Whether readings pull toward the ambient temperature.
    pub climate_coupled: bool,
}

impl Default for SensorConfig {
    fn default() -> Self {
        SensorConfig {
            initial_temperature_c: 28.0,
            noise_c: 0.5,
            drift_c: 0.02,
            climate_coupled: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SensorState {
    Ok,
    Malfunctioning { until: SimTime },
}

/// One temperature sensor.
///
/// `read` is the only mutating operation; each call advances the internal
/// temperature, applies measurement noise, and rounds to one decimal.
/// While the malfunction sub-state is active, readings are NaN or wildly
/// implausible and the caller decides whether to transmit them.
pub struct TemperatureSensor {
    config: SensorConfig,
    temperature_c: f64,
    state: SensorState,
    last_malfunction_check: SimTime,
}

impl TemperatureSensor {
    pub fn new(config: SensorConfig) -> Self {
        let temperature_c = config.initial_temperature_c;
        TemperatureSensor {
            config,
            temperature_c,
            state: SensorState::Ok,
            last_malfunction_check: SimTime::ZERO,
        }
    }

    /// Take one reading at `now` under `weather`.
    pub fn read<R: Rng>(&mut self, now: SimTime, weather: &Weather, rng: &mut R) -> f64 {
        self.check_malfunction(now, weather, rng);

        if let SensorState::Malfunctioning { until } = self.state {
            if now < until {
                return if rng.gen::<f64>() < 0.3 {
                    f64::NAN
                } else {
                    rng.gen_range(10.0..50.0)
                };
            }
            self.state = SensorState::Ok;
            debug!("sensor recovered from malfunction");
        }

        if self.config.climate_coupled {
            // Thermal inertia toward the ambient temperature.
            self.temperature_c = self.temperature_c * 0.9 + weather.temperature_c * 0.1;
        } else if self.config.drift_c > 0.0 {
            self.temperature_c += rng.gen_range(-self.config.drift_c..self.config.drift_c);
        }

        let noise = if self.config.noise_c > 0.0 {
            // Rain roughly doubles the measurement noise.
            let scale = if weather.is_raining { 2.0 } else { 1.0 };
            rng.gen_range(-self.config.noise_c..self.config.noise_c) * scale
        } else {
            0.0
        };
        ((self.temperature_c + noise) * 10.0).round() / 10.0
    }

    /// True while the malfunction sub-state is active.
    pub fn is_malfunctioning(&self) -> bool {
        matches!(self.state, SensorState::Malfunctioning { .. })
    }

    fn check_malfunction<R: Rng>(&mut self, now: SimTime, weather: &Weather, rng: &mut R) {
        if self.is_malfunctioning() {
            return;
        }
        // At most one check per interval.
        if now > SimTime::ZERO
            && (now - self.last_malfunction_check).as_secs_f64() < MALFUNCTION_CHECK_INTERVAL_S
        {
            return;
        }
        self.last_malfunction_check = now;

        if weather.humidity_pct <= 85.0 {
            return;
        }
        let probability = ((weather.humidity_pct - 85.0) / 30.0).powi(3);
        if rng.gen::<f64>() < probability {
            let duration_min = rng.gen_range(5..=30);
            let until = now + SimTime::from_secs(duration_min as f64 * 60.0);
            self.state = SensorState::Malfunctioning { until };
            warn!(
                "sensor malfunction for {} min at {:.0}% humidity",
                duration_min, weather.humidity_pct
            );
        }
    }
}
