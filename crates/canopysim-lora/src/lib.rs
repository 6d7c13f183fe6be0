//! # canopysim-lora
//!
//! LoRa PHY math for the forest sensor-network simulator.
//!
//! Everything here is pure: modulation parameters with their derived airtime
//! and data rate, the propagation models (log-distance path loss, canopy
//! attenuation, weather attenuation), and the link-budget helpers (noise
//! floor, per-SF demodulation thresholds, tiered loss probability). Nothing
//! in this crate draws randomness on its own; the Gaussian sampler takes the
//! caller's RNG so results stay reproducible under a fixed seed.

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Carrier frequency of the simulated network in MHz (EU868 band).
pub const DEFAULT_FREQUENCY_MHZ: f64 = 868.0;

/// Thermal noise power spectral density in dBm/Hz.
pub const THERMAL_NOISE_DBM_PER_HZ: f64 = -174.0;

/// Receiver noise figure in dB.
pub const NOISE_FIGURE_DB: f64 = 6.0;

/// Preamble length of an uplink frame in symbols.
pub const PREAMBLE_SYMBOLS: f64 = 8.0;

/// Fixed uplink payload size in bytes (one sensor reading frame).
pub const PAYLOAD_BYTES: u32 = 10;

/// Minimum SNR in dB required for demodulation, indexed by SF 7 through 12.
pub const SNR_THRESHOLDS_DB: [f64; 6] = [-7.5, -10.0, -12.5, -15.0, -17.5, -20.0];

// ============================================================================
// Error Types
// ============================================================================

/// Domain violations in LoRa radio parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Spreading factor outside 7..=12.
    #[error("spreading factor {0} out of range (7-12)")]
    SpreadingFactor(u8),

    /// Bandwidth not one of the supported channel widths.
    #[error("bandwidth {0} kHz not supported (125, 250 or 500)")]
    Bandwidth(u32),

    /// Coding rate denominator outside 5..=8.
    #[error("coding rate 4/{0} out of range (4/5-4/8)")]
    CodingRate(u8),

    /// Transmit power outside 2..=14 dBm.
    #[error("tx power {0} dBm out of range (2-14)")]
    TxPower(i8),

    /// Link distance must be positive and finite.
    #[error("distance {0} m must be positive")]
    Distance(f64),
}

// ============================================================================
// LoRa Configuration
// ============================================================================

/// Immutable LoRa modulation and power settings for one device radio.
///
/// Constructed only through [`LoraConfig::new`], which rejects out-of-range
/// parameters. Devices replace their config wholesale and never mutate it,
/// so derived values (airtime, thresholds) always reflect the assigned
/// config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Spreading factor (7-12).
    pub spreading_factor: u8,
    /// Channel bandwidth in kHz (125, 250 or 500).
    pub bandwidth_khz: u32,
    /// Coding rate denominator (5-8, meaning 4/5 to 4/8).
    pub coding_rate: u8,
    /// Transmit power in dBm (2-14).
    pub tx_power_dbm: i8,
}

impl Default for LoraConfig {
    fn default() -> Self {
        LoraConfig {
            spreading_factor: 7,
            bandwidth_khz: 125,
            coding_rate: 5,
            tx_power_dbm: 14,
        }
    }
}

impl LoraConfig {
    /// Create a validated configuration.
    pub fn new(
        spreading_factor: u8,
        bandwidth_khz: u32,
        coding_rate: u8,
        tx_power_dbm: i8,
    ) -> Result<Self, ConfigError> {
        let config = LoraConfig {
            spreading_factor,
            bandwidth_khz,
            coding_rate,
            tx_power_dbm,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every field against its LoRa domain.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(7..=12).contains(&self.spreading_factor) {
            return Err(ConfigError::SpreadingFactor(self.spreading_factor));
        }
        if !matches!(self.bandwidth_khz, 125 | 250 | 500) {
            return Err(ConfigError::Bandwidth(self.bandwidth_khz));
        }
        if !(5..=8).contains(&self.coding_rate) {
            return Err(ConfigError::CodingRate(self.coding_rate));
        }
        if !(2..=14).contains(&self.tx_power_dbm) {
            return Err(ConfigError::TxPower(self.tx_power_dbm));
        }
        Ok(())
    }

    /// Apply a partial update, returning a fresh validated config.
    pub fn with_update(&self, update: &ConfigUpdate) -> Result<Self, ConfigError> {
        LoraConfig::new(
            update.spreading_factor.unwrap_or(self.spreading_factor),
            update.bandwidth_khz.unwrap_or(self.bandwidth_khz),
            update.coding_rate.unwrap_or(self.coding_rate),
            update.tx_power_dbm.unwrap_or(self.tx_power_dbm),
        )
    }

    /// Channel bandwidth in Hz.
    pub fn bandwidth_hz(&self) -> f64 {
        (self.bandwidth_khz as f64) * 1000.0
    }

    /// Minimum SNR in dB this spreading factor can demodulate.
    pub fn snr_threshold_db(&self) -> f64 {
        match self.spreading_factor {
            7..=12 => SNR_THRESHOLDS_DB[(self.spreading_factor - 7) as usize],
            _ => SNR_THRESHOLDS_DB[0],
        }
    }

    /// Time on air in seconds for a payload of `payload_bytes`.
    ///
    /// Standard LoRa symbol-time formula with an 8-symbol preamble and no
    /// low-data-rate optimization.
    pub fn airtime_s(&self, payload_bytes: u32) -> f64 {
        let sf = self.spreading_factor as f64;
        let cr = self.coding_rate as f64;
        let bw = self.bandwidth_hz();
        let pl = payload_bytes as f64;

        let symbol_time = 2f64.powf(sf) / bw;
        let preamble_time = (PREAMBLE_SYMBOLS + 4.25) * symbol_time;
        let payload_symbols =
            8.0 + (((8.0 * pl - 4.0 * sf + 28.0) / (4.0 * sf)).ceil() * cr).max(0.0);

        preamble_time + payload_symbols * symbol_time
    }

    /// Effective data rate in bits per second.
    pub fn data_rate_bps(&self) -> f64 {
        let sf = self.spreading_factor as f64;
        sf * self.bandwidth_hz() / 2f64.powf(sf)
    }
}

/// A partial configuration change; `None` fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub spreading_factor: Option<u8>,
    pub bandwidth_khz: Option<u32>,
    pub coding_rate: Option<u8>,
    pub tx_power_dbm: Option<i8>,
}

impl ConfigUpdate {
    /// Check the supplied fields against their domains. Unsupplied fields
    /// cannot fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        LoraConfig::default().with_update(self).map(|_| ())
    }

    /// True when no field is supplied.
    pub fn is_empty(&self) -> bool {
        self.spreading_factor.is_none()
            && self.bandwidth_khz.is_none()
            && self.coding_rate.is_none()
            && self.tx_power_dbm.is_none()
    }
}

// ============================================================================
// Propagation Models
// ============================================================================

/// Log-distance path loss in dB.
///
/// Free-space loss at the reference distance is the base term, extended by
/// the log-distance power law with the given exponent. Distances inside the
/// reference distance clamp to the reference distance; non-positive
/// distances are rejected.
pub fn path_loss_db(
    distance_m: f64,
    freq_mhz: f64,
    path_loss_exponent: f64,
    reference_distance_m: f64,
) -> Result<f64, ConfigError> {
    if distance_m <= 0.0 || !distance_m.is_finite() {
        return Err(ConfigError::Distance(distance_m));
    }
    let distance_m = distance_m.max(reference_distance_m);

    // Free-space loss at d0, distance in km and frequency in MHz.
    let reference_km = reference_distance_m / 1000.0;
    let fspl_ref = 20.0 * reference_km.log10() + 20.0 * freq_mhz.log10() + 32.45;

    Ok(fspl_ref + 10.0 * path_loss_exponent * (distance_m / reference_distance_m).log10())
}

/// Canopy attenuation in dB for the part of the path crossing vegetation.
///
/// Weissberger's modified exponential decay on the vegetation depth, scaled
/// by tree density and canopy height. `depth_factor` in [0,1] is the
/// fraction of the path inside vegetation; the result is 0 when either the
/// density or the depth is 0.
pub fn vegetation_attenuation_db(
    distance_m: f64,
    freq_mhz: f64,
    tree_density: f64,
    avg_tree_height_m: f64,
    depth_factor: f64,
) -> f64 {
    let depth_m = distance_m.max(0.0) * depth_factor.clamp(0.0, 1.0);
    if depth_m <= 0.0 || tree_density <= 0.0 {
        return 0.0;
    }
    // Weissberger is only calibrated up to 400 m of vegetation.
    let depth_m = depth_m.min(400.0);

    let freq_ghz = freq_mhz / 1000.0;
    let base = if depth_m > 14.0 {
        1.33 * freq_ghz.powf(0.284) * depth_m.powf(0.588)
    } else {
        0.45 * freq_ghz.powf(0.284) * depth_m
    };

    // Height normalized to a 20 m reference stand.
    let canopy_scale = tree_density.clamp(0.0, 1.0) * (avg_tree_height_m / 20.0).min(2.0);
    base * canopy_scale
}

/// Weather-dependent excess loss in dB under the current conditions.
///
/// Rain attenuation grows with intensity, humidity adds loss above 50%, and
/// the standing canopy contributes a fixed share per unit density.
pub fn weather_attenuation_db(
    rain_intensity_mm_h: f64,
    humidity_pct: f64,
    vegetation_density: f64,
) -> f64 {
    let rain_loss = rain_intensity_mm_h.max(0.0) * 0.2;
    let humidity_loss = (humidity_pct - 50.0).max(0.0) * 0.05;
    let canopy_loss = vegetation_density.clamp(0.0, 1.0) * 5.0;
    rain_loss + humidity_loss + canopy_loss
}

// ============================================================================
// Link Budget
// ============================================================================

/// Receiver noise floor in dBm for the given bandwidth and conditions.
///
/// Thermal noise over the channel bandwidth plus the receiver noise figure,
/// raised by wideband interference from heavy rain and saturated air.
pub fn noise_floor_dbm(bandwidth_hz: f64, rain_intensity_mm_h: f64, humidity_pct: f64) -> f64 {
    let thermal = THERMAL_NOISE_DBM_PER_HZ + 10.0 * bandwidth_hz.log10() + NOISE_FIGURE_DB;
    let rain_interference = rain_intensity_mm_h.max(0.0) * 0.1;
    let humidity_interference = (humidity_pct - 85.0).max(0.0) * 0.05;
    thermal + rain_interference + humidity_interference
}

/// Receive sensitivity gain in dB of slower chirps, relative to SF7.
pub fn sf_gain_db(spreading_factor: u8) -> f64 {
    (spreading_factor.saturating_sub(7)) as f64 * 2.5
}

/// Probability that an uplink is lost on the channel, from its SNR margin
/// over the demodulation threshold.
///
/// Even comfortable links keep a small multipath floor under the canopy;
/// links below threshold still get through occasionally.
pub fn loss_probability(snr_db: f64, threshold_db: f64) -> f64 {
    let margin = snr_db - threshold_db;
    if margin >= 5.0 {
        0.01
    } else if margin >= 2.0 {
        0.05
    } else if margin >= 0.0 {
        0.15
    } else if margin >= -2.0 {
        0.4
    } else {
        0.8
    }
}

// ============================================================================
// Random Sampling
// ============================================================================

/// Sample from a Gaussian distribution via the Box-Muller transform.
pub fn sample_gaussian<R: Rng>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    let u1: f64 = rng.gen();
    let u2: f64 = rng.gen();

    // Avoid ln(0)
    let u1 = if u1 == 0.0 { f64::MIN_POSITIVE } else { u1 };

    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    mean + z * std_dev
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_config_validation() {
        assert!(LoraConfig::new(7, 125, 5, 14).is_ok());
        assert!(LoraConfig::new(12, 500, 8, 2).is_ok());
        assert_eq!(
            LoraConfig::new(6, 125, 5, 14),
            Err(ConfigError::SpreadingFactor(6))
        );
        assert_eq!(
            LoraConfig::new(13, 125, 5, 14),
            Err(ConfigError::SpreadingFactor(13))
        );
        assert_eq!(LoraConfig::new(7, 200, 5, 14), Err(ConfigError::Bandwidth(200)));
        assert_eq!(LoraConfig::new(7, 125, 4, 14), Err(ConfigError::CodingRate(4)));
        assert_eq!(LoraConfig::new(7, 125, 9, 14), Err(ConfigError::CodingRate(9)));
        assert_eq!(LoraConfig::new(7, 125, 5, 15), Err(ConfigError::TxPower(15)));
        assert_eq!(LoraConfig::new(7, 125, 5, 1), Err(ConfigError::TxPower(1)));
    }

    #[test]
    fn test_config_update_replaces_only_given_fields() {
        let base = LoraConfig::default();
        let update = ConfigUpdate {
            spreading_factor: Some(10),
            ..Default::default()
        };
        let updated = base.with_update(&update).unwrap();
        assert_eq!(updated.spreading_factor, 10);
        assert_eq!(updated.bandwidth_khz, base.bandwidth_khz);
        assert_eq!(updated.coding_rate, base.coding_rate);
        assert_eq!(updated.tx_power_dbm, base.tx_power_dbm);

        let bad = ConfigUpdate {
            tx_power_dbm: Some(20),
            ..Default::default()
        };
        assert_eq!(base.with_update(&bad), Err(ConfigError::TxPower(20)));
        assert_eq!(bad.validate(), Err(ConfigError::TxPower(20)));
        assert!(update.validate().is_ok());
        assert!(ConfigUpdate::default().is_empty());
        assert!(!update.is_empty());
    }

    #[test]
    fn test_airtime_in_plausible_range() {
        // SF7/125 kHz with a 10 byte payload comes out around 36 ms.
        let config = LoraConfig::default();
        let airtime = config.airtime_s(PAYLOAD_BYTES);
        assert!(
            airtime > 0.030 && airtime < 0.060,
            "airtime {} s out of range",
            airtime
        );
    }

    #[test]
    fn test_airtime_monotonic_in_sf_and_bw() {
        for sf in 7..12u8 {
            let faster = LoraConfig::new(sf, 125, 5, 14).unwrap();
            let slower = LoraConfig::new(sf + 1, 125, 5, 14).unwrap();
            assert!(slower.airtime_s(PAYLOAD_BYTES) > faster.airtime_s(PAYLOAD_BYTES));
        }
        let narrow = LoraConfig::new(9, 125, 5, 14).unwrap();
        let medium = LoraConfig::new(9, 250, 5, 14).unwrap();
        let wide = LoraConfig::new(9, 500, 5, 14).unwrap();
        assert!(narrow.airtime_s(PAYLOAD_BYTES) > medium.airtime_s(PAYLOAD_BYTES));
        assert!(medium.airtime_s(PAYLOAD_BYTES) > wide.airtime_s(PAYLOAD_BYTES));
    }

    #[test]
    fn test_snr_thresholds_descend_with_sf() {
        for sf in 7..12u8 {
            let lower = LoraConfig::new(sf, 125, 5, 14).unwrap();
            let higher = LoraConfig::new(sf + 1, 125, 5, 14).unwrap();
            assert!(higher.snr_threshold_db() < lower.snr_threshold_db());
        }
        assert_eq!(LoraConfig::default().snr_threshold_db(), -7.5);
    }

    #[test]
    fn test_data_rate_decreases_with_sf() {
        let sf7 = LoraConfig::new(7, 125, 5, 14).unwrap();
        let sf12 = LoraConfig::new(12, 125, 5, 14).unwrap();
        assert!(sf7.data_rate_bps() > sf12.data_rate_bps());
        assert!((sf7.data_rate_bps() - 6835.94).abs() < 0.01);
    }

    #[test]
    fn test_path_loss_monotonic_in_distance() {
        let mut previous = 0.0;
        for distance in [1.0, 10.0, 50.0, 100.0, 200.0, 400.0, 1000.0] {
            let loss = path_loss_db(distance, DEFAULT_FREQUENCY_MHZ, 2.7, 1.0).unwrap();
            assert!(loss >= previous, "path loss decreased at {} m", distance);
            previous = loss;
        }
    }

    #[test]
    fn test_path_loss_rejects_non_positive_distance() {
        assert!(path_loss_db(0.0, 868.0, 2.7, 1.0).is_err());
        assert!(path_loss_db(-5.0, 868.0, 2.7, 1.0).is_err());
        // Inside the reference distance clamps instead of failing.
        let at_ref = path_loss_db(1.0, 868.0, 2.7, 1.0).unwrap();
        let inside = path_loss_db(0.5, 868.0, 2.7, 1.0).unwrap();
        assert_eq!(inside, at_ref);
    }

    #[test]
    fn test_vegetation_attenuation_zero_cases() {
        assert_eq!(vegetation_attenuation_db(200.0, 868.0, 0.0, 25.0, 0.9), 0.0);
        assert_eq!(vegetation_attenuation_db(200.0, 868.0, 0.8, 25.0, 0.0), 0.0);
        assert!(vegetation_attenuation_db(200.0, 868.0, 0.8, 25.0, 0.9) > 0.0);
    }

    #[test]
    fn test_vegetation_attenuation_grows_with_density_and_depth() {
        let sparse = vegetation_attenuation_db(200.0, 868.0, 0.3, 25.0, 0.9);
        let dense = vegetation_attenuation_db(200.0, 868.0, 0.9, 25.0, 0.9);
        assert!(dense > sparse);

        let shallow = vegetation_attenuation_db(100.0, 868.0, 0.8, 25.0, 0.9);
        let deep = vegetation_attenuation_db(300.0, 868.0, 0.8, 25.0, 0.9);
        assert!(deep > shallow);
    }

    #[test]
    fn test_weather_attenuation_terms() {
        // Dry air at 50% humidity leaves only the standing canopy term.
        assert_eq!(weather_attenuation_db(0.0, 50.0, 0.8), 4.0);
        let calm = weather_attenuation_db(0.0, 60.0, 0.8);
        let storm = weather_attenuation_db(20.0, 95.0, 0.8);
        assert!(storm > calm);
    }

    #[test]
    fn test_noise_floor_tracks_bandwidth_and_rain() {
        let narrow = noise_floor_dbm(125_000.0, 0.0, 60.0);
        let wide = noise_floor_dbm(500_000.0, 0.0, 60.0);
        assert!(wide > narrow);
        // -174 + 10*log10(125000) + 6 is about -117 dBm.
        assert!((narrow - (-117.03)).abs() < 0.1);

        let raining = noise_floor_dbm(125_000.0, 30.0, 60.0);
        assert!(raining > narrow);
    }

    #[test]
    fn test_loss_probability_tiers() {
        let threshold = -7.5;
        assert_eq!(loss_probability(0.0, threshold), 0.01);
        assert_eq!(loss_probability(-4.0, threshold), 0.05);
        assert_eq!(loss_probability(-7.0, threshold), 0.15);
        assert_eq!(loss_probability(-9.0, threshold), 0.4);
        assert_eq!(loss_probability(-15.0, threshold), 0.8);
    }

    #[test]
    fn test_sf_gain_relative_to_sf7() {
        assert_eq!(sf_gain_db(7), 0.0);
        assert_eq!(sf_gain_db(12), 12.5);
    }

    #[test]
    fn test_gaussian_sampling() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let samples: Vec<f64> = (0..1000)
            .map(|_| sample_gaussian(&mut rng, 0.0, 3.0))
            .collect();
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!(mean.abs() < 0.5, "sample mean {} too far from 0", mean);

        // Same seed, same sequence.
        let mut a = ChaCha8Rng::seed_from_u64(7);
        let mut b = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..32 {
            assert_eq!(
                sample_gaussian(&mut a, 1.0, 2.0),
                sample_gaussian(&mut b, 1.0, 2.0)
            );
        }
    }
}
