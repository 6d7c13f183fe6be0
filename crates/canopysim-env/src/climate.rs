//! Climate process: the seasonal stochastic weather generator.

use canopysim_common::{
    Entity, EntityId, Event, EventId, EventPayload, Season, SimContext, SimError, SimTime,
    Weather, WeatherUpdateEvent,
};
use canopysim_lora::{vegetation_attenuation_db, weather_attenuation_db};
use rand::Rng;
use tracing::{debug, info};

/// Seconds between weather generator reactivations.
pub const WEATHER_UPDATE_INTERVAL_S: f64 = 600.0;

// Timer IDs
const TIMER_WEATHER_UPDATE: u64 = 0;
const TIMER_RAIN_END: u64 = 1;

// ============================================================================
// Season Profiles
// ============================================================================

/// Stochastic parameters of one season.
#[derive(Debug, Clone, Copy)]
pub struct SeasonProfile {
    /// Mean air temperature in degrees Celsius.
    pub base_temperature_c: f64,
    /// Diurnal temperature swing amplitude in degrees Celsius.
    pub temperature_variation_c: f64,
    /// Mean relative humidity in percent.
    pub base_humidity_pct: f64,
    /// Diurnal humidity swing amplitude in percent.
    pub humidity_variation_pct: f64,
    /// Rain onset probability per generator cycle before the humidity
    /// adjustment.
    pub rain_probability: f64,
    /// Upper bound of drawn rain intensity in mm/h.
    pub max_rain_intensity_mm_h: f64,
}

impl SeasonProfile {
    /// The parameter set for a season.
    pub fn for_season(season: Season) -> Self {
        match season {
            Season::Rainy => SeasonProfile {
                base_temperature_c: 28.0,
                temperature_variation_c: 3.5,
                base_humidity_pct: 90.0,
                humidity_variation_pct: 8.0,
                rain_probability: 0.65,
                max_rain_intensity_mm_h: 35.0,
            },
            Season::Dry => SeasonProfile {
                base_temperature_c: 32.0,
                temperature_variation_c: 6.5,
                base_humidity_pct: 70.0,
                humidity_variation_pct: 15.0,
                rain_probability: 0.15,
                max_rain_intensity_mm_h: 15.0,
            },
        }
    }

    /// Calm starting weather for the season, in effect until the generator
    /// publishes its first drawn record.
    pub fn initial_weather(season: Season) -> Weather {
        let profile = SeasonProfile::for_season(season);
        Weather {
            season,
            temperature_c: profile.base_temperature_c,
            humidity_pct: profile.base_humidity_pct,
            is_raining: false,
            rain_intensity_mm_h: 0.0,
        }
    }
}

// ============================================================================
// Forest Geometry
// ============================================================================

/// Static geometry of the forest stand every radio path crosses.
#[derive(Debug, Clone, Copy)]
pub struct ForestParams {
    /// Fraction of ground covered by canopy, in [0, 1].
    pub vegetation_density: f64,
    /// Mean canopy height in meters.
    pub avg_tree_height_m: f64,
    /// Fraction of each radio path that runs under vegetation, in [0, 1].
    pub canopy_depth_factor: f64,
}

impl Default for ForestParams {
    fn default() -> Self {
        ForestParams {
            vegetation_density: 0.8,
            avg_tree_height_m: 25.0,
            canopy_depth_factor: 0.9,
        }
    }
}

/// Total dB loss attributable to the forest and the given weather on a
/// path of `distance_m`.
pub fn environment_attenuation_db(
    weather: &Weather,
    forest: &ForestParams,
    distance_m: f64,
    freq_mhz: f64,
) -> f64 {
    let rain = if weather.is_raining {
        weather.rain_intensity_mm_h
    } else {
        0.0
    };
    vegetation_attenuation_db(
        distance_m,
        freq_mhz,
        forest.vegetation_density,
        forest.avg_tree_height_m,
        forest.canopy_depth_factor,
    ) + weather_attenuation_db(rain, weather.humidity_pct, forest.vegetation_density)
}

// ============================================================================
// Climate Entity
// ============================================================================

/// Configuration for the climate entity.
#[derive(Debug, Clone)]
pub struct ClimateConfig {
    /// Seasonal regime of the run.
    pub season: Season,
    /// Forest geometry for attenuation queries.
    pub forest: ForestParams,
    /// Entities that receive every published weather record.
    pub subscribers: Vec<EntityId>,
}

/// The climate process.
///
/// Reactivates every [`WEATHER_UPDATE_INTERVAL_S`] simulated seconds, draws
/// a fresh weather record from the season profile, and broadcasts it whole.
/// Rain runs on its own scheduled end timer so a shower outlives the
/// generator cycle that started it.
pub struct Climate {
    entity_id: EntityId,
    config: ClimateConfig,
    profile: SeasonProfile,
    weather: Weather,
}

impl Climate {
    pub fn new(entity_id: EntityId, config: ClimateConfig) -> Self {
        let profile = SeasonProfile::for_season(config.season);
        let weather = SeasonProfile::initial_weather(config.season);
        Climate {
            entity_id,
            config,
            profile,
            weather,
        }
    }

    /// Read-only copy of the current weather record.
    pub fn current_conditions(&self) -> Weather {
        self.weather
    }

    /// Kickoff event for the initial schedule: the generator's first cycle
    /// runs at t=0.
    pub fn startup_event(&self, id: EventId) -> Event {
        Event {
            id,
            time: SimTime::ZERO,
            source: self.entity_id,
            targets: vec![self.entity_id],
            payload: EventPayload::Timer {
                timer_id: TIMER_WEATHER_UPDATE,
            },
        }
    }

    /// Total weather and canopy loss in dB for a path of `distance_m` under
    /// the current conditions.
    pub fn attenuation_db(&self, distance_m: f64, freq_mhz: f64) -> f64 {
        environment_attenuation_db(&self.weather, &self.config.forest, distance_m, freq_mhz)
    }

    /// Draw a fresh weather record and broadcast it.
    fn regenerate(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        // Diurnal swing from simulated time of day, peaking mid-afternoon.
        let hour = (ctx.time().as_secs_f64() / 3600.0) % 24.0;
        let diurnal = ((hour - 6.0) * std::f64::consts::PI / 12.0).sin();

        let temperature = self.profile.base_temperature_c
            + diurnal * self.profile.temperature_variation_c
            + ctx.rng().gen_range(-0.5..0.5);
        let humidity = (self.profile.base_humidity_pct
            - diurnal * self.profile.humidity_variation_pct
            + ctx.rng().gen_range(-3.0..3.0))
        .clamp(40.0, 100.0);

        if !temperature.is_finite() || !humidity.is_finite() {
            return Err(SimError::HandlerError {
                entity: self.entity_id,
                message: format!(
                    "weather generator produced non-finite values: {temperature} C, {humidity}%"
                ),
            });
        }

        self.weather.temperature_c = temperature;
        self.weather.humidity_pct = humidity;

        // Rain in progress persists until its scheduled end.
        if !self.weather.is_raining {
            let onset = (self.profile.rain_probability * (humidity - 60.0) / 40.0).clamp(0.0, 1.0);
            if ctx.rng().gen_bool(onset) {
                let intensity = ctx.rng().gen_range(2.0..self.profile.max_rain_intensity_mm_h);
                let duration_min = ctx.rng().gen_range(10..=180);
                self.weather.is_raining = true;
                self.weather.rain_intensity_mm_h = intensity;
                ctx.post_event(
                    SimTime::from_secs(duration_min as f64 * 60.0),
                    vec![self.entity_id],
                    EventPayload::Timer {
                        timer_id: TIMER_RAIN_END,
                    },
                );
                info!(
                    "Climate: rain started, {:.1} mm/h for {} min",
                    intensity, duration_min
                );
            }
        }

        self.publish(ctx);
        Ok(())
    }

    /// Broadcast the current record whole.
    fn publish(&self, ctx: &mut SimContext) {
        debug!(
            "Climate: {:.1} C, {:.0}% humidity, rain {:.1} mm/h",
            self.weather.temperature_c, self.weather.humidity_pct, self.weather.rain_intensity_mm_h
        );
        ctx.post_immediate(
            self.config.subscribers.clone(),
            EventPayload::WeatherUpdate(WeatherUpdateEvent {
                weather: self.weather,
            }),
        );
    }
}

impl Entity for Climate {
    fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        if let EventPayload::Timer { timer_id } = &event.payload {
            match *timer_id {
                TIMER_WEATHER_UPDATE => {
                    self.regenerate(ctx)?;
                    ctx.post_event(
                        SimTime::from_secs(WEATHER_UPDATE_INTERVAL_S),
                        vec![self.entity_id],
                        EventPayload::Timer {
                            timer_id: TIMER_WEATHER_UPDATE,
                        },
                    );
                }
                TIMER_RAIN_END => {
                    self.weather.is_raining = false;
                    self.weather.rain_intensity_mm_h = 0.0;
                    info!("Climate: rain stopped");
                    self.publish(ctx);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn update_timer(target: EntityId) -> Event {
        Event {
            id: EventId(0),
            time: SimTime::ZERO,
            source: target,
            targets: vec![target],
            payload: EventPayload::Timer {
                timer_id: TIMER_WEATHER_UPDATE,
            },
        }
    }

    #[test]
    fn test_season_profiles() {
        let rainy = SeasonProfile::for_season(Season::Rainy);
        let dry = SeasonProfile::for_season(Season::Dry);
        assert!(rainy.base_humidity_pct > dry.base_humidity_pct);
        assert!(rainy.rain_probability > dry.rain_probability);
        assert!(dry.base_temperature_c > rainy.base_temperature_c);
    }

    #[test]
    fn test_initial_weather_is_calm() {
        let weather = SeasonProfile::initial_weather(Season::Dry);
        assert!(!weather.is_raining);
        assert_eq!(weather.rain_intensity_mm_h, 0.0);
        assert_eq!(weather.temperature_c, 32.0);
    }

    #[test]
    fn test_regenerate_publishes_whole_record() {
        let id = EntityId::new(0);
        let subscriber = EntityId::new(1);
        let mut climate = Climate::new(
            id,
            ClimateConfig {
                season: Season::Rainy,
                forest: ForestParams::default(),
                subscribers: vec![subscriber],
            },
        );
        let mut ctx = SimContext::new(42);
        ctx.set_source(id);

        climate.handle_event(&update_timer(id), &mut ctx).unwrap();

        let pending = ctx.take_pending_events();
        let updates: Vec<_> = pending
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::WeatherUpdate(u) => Some(u),
                _ => None,
            })
            .collect();
        assert_eq!(updates.len(), 1);
        let weather = updates[0].weather;
        assert!((40.0..=100.0).contains(&weather.humidity_pct));
        assert!(weather.temperature_c.is_finite());
        assert!(weather.is_raining == (weather.rain_intensity_mm_h > 0.0));

        // The generator reschedules itself.
        assert!(pending.iter().any(|e| matches!(
            e.payload,
            EventPayload::Timer {
                timer_id: TIMER_WEATHER_UPDATE
            }
        )));
    }

    #[test]
    fn test_rain_starts_and_stops() {
        let id = EntityId::new(0);
        let mut climate = Climate::new(
            id,
            ClimateConfig {
                season: Season::Rainy,
                forest: ForestParams::default(),
                subscribers: vec![],
            },
        );
        let mut ctx = SimContext::new(7);
        ctx.set_source(id);

        // The rainy season starts a shower within a bounded number of
        // cycles for any seed.
        let mut rain_end = None;
        for cycle in 0..200u64 {
            ctx.set_time(SimTime::from_secs(cycle as f64 * WEATHER_UPDATE_INTERVAL_S));
            climate.handle_event(&update_timer(id), &mut ctx).unwrap();
            let pending = ctx.take_pending_events();
            if let Some(end) = pending.iter().find(|e| {
                matches!(
                    e.payload,
                    EventPayload::Timer {
                        timer_id: TIMER_RAIN_END
                    }
                )
            }) {
                rain_end = Some(end.clone());
                break;
            }
        }
        let rain_end = rain_end.expect("no rain in 200 rainy-season cycles");
        assert!(climate.current_conditions().is_raining);
        assert!(climate.current_conditions().rain_intensity_mm_h >= 2.0);

        // Rain adds loss over the same conditions without it.
        let mut dry_now = climate.current_conditions();
        dry_now.is_raining = false;
        dry_now.rain_intensity_mm_h = 0.0;
        let calm = environment_attenuation_db(&dry_now, &ForestParams::default(), 200.0, 868.0);
        assert!(climate.attenuation_db(200.0, 868.0) > calm);

        ctx.set_time(rain_end.time);
        climate.handle_event(&rain_end, &mut ctx).unwrap();
        assert!(!climate.current_conditions().is_raining);
        assert_eq!(climate.current_conditions().rain_intensity_mm_h, 0.0);
    }
}
