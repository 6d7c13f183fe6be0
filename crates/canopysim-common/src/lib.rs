//! # canopysim-common
//!
//! Core types for the CanopySim discrete-event simulation.
//!
//! This crate provides the simulation kernel shared by every other crate:
//! simulated time, entity and event identities, the event payload
//! vocabulary, the dispatch context with its seeded RNG, and the entity
//! registry. The weather record that the climate entity publishes and all
//! radio entities consume also lives here.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub use canopysim_lora::{ConfigError, ConfigUpdate, LoraConfig};

// ============================================================================
// Simulation Time
// ============================================================================

/// Simulation time in microseconds since simulation start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time (simulation start).
    pub const ZERO: SimTime = SimTime(0);

    /// Create from microseconds.
    pub fn from_micros(micros: u64) -> Self {
        SimTime(micros)
    }

    /// Create from milliseconds.
    pub fn from_millis(millis: u64) -> Self {
        SimTime(millis * 1_000)
    }

    /// Create from seconds.
    pub fn from_secs(secs: f64) -> Self {
        SimTime((secs * 1_000_000.0) as u64)
    }

    /// Get time in microseconds.
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Get time in milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0 / 1_000
    }

    /// Get time in seconds as floating point.
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Add a duration, returning None on overflow.
    pub fn checked_add(&self, other: SimTime) -> Option<SimTime> {
        self.0.checked_add(other.0).map(SimTime)
    }

    /// Subtract a duration, returning None on underflow.
    pub fn checked_sub(&self, other: SimTime) -> Option<SimTime> {
        self.0.checked_sub(other.0).map(SimTime)
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, other: SimTime) -> SimTime {
        SimTime(self.0 + other.0)
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, other: SimTime) -> SimTime {
        SimTime(self.0.saturating_sub(other.0))
    }
}

// ============================================================================
// Identities
// ============================================================================

/// Unique identifier for an entity in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

impl EntityId {
    pub fn new(id: u64) -> Self {
        EntityId(id)
    }
}

/// Unique identifier for a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

// ============================================================================
// Weather State
// ============================================================================

/// Seasonal regime driving the stochastic weather generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Season {
    Rainy,
    Dry,
}

/// One atomically published weather record.
///
/// Only the climate entity produces these; every other entity receives
/// whole copies through weather-update events, so a reader can never
/// observe a half-updated mix of fields from two generator cycles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weather {
    pub season: Season,
    /// Air temperature in degrees Celsius.
    pub temperature_c: f64,
    /// Relative humidity in percent.
    pub humidity_pct: f64,
    pub is_raining: bool,
    /// Rainfall intensity in mm/h; 0 while not raining.
    pub rain_intensity_mm_h: f64,
}

// ============================================================================
// Event Payloads
// ============================================================================

/// New weather record broadcast by the climate entity.
#[derive(Debug, Clone)]
pub struct WeatherUpdateEvent {
    pub weather: Weather,
}

/// Per-cycle history row a device publishes for itself, whether or not the
/// cycle produced an uplink. `temperature_c` is None when the sensor
/// returned an unusable reading.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub device_id: u64,
    pub sequence: u64,
    pub temperature_c: Option<f64>,
    pub humidity_pct: f64,
    pub rain_intensity_mm_h: f64,
    pub rssi_dbm: f64,
    pub snr_db: f64,
    pub airtime_s: f64,
    pub latency_s: f64,
    /// Cumulative energy drawn by the device so far, in mWh.
    pub energy_mwh: f64,
    pub battery_pct: f64,
}

/// One uplink frame in flight from a device to the gateway.
#[derive(Debug, Clone)]
pub struct UplinkEvent {
    pub device_id: u64,
    pub sequence: u64,
    pub temperature_c: f64,
    pub rssi_dbm: f64,
    pub snr_db: f64,
    pub airtime_s: f64,
    pub latency_s: f64,
    pub battery_pct: f64,
    pub config: LoraConfig,
}

/// Why the gateway did not accept an uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossCause {
    GatewayUnavailable,
    WeakSignal,
    HeavyRain,
    HighHumidity,
    Multipath,
}

/// Outcome of one uplink at the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Lost(LossCause),
}

/// The gateway's verdict on an uplink, reported back to the device and
/// observed by the event loop for statistics. Carries the original frame
/// plus the weather the gateway saw at receive time.
#[derive(Debug, Clone)]
pub struct DeliveryReportEvent {
    pub device_id: u64,
    pub sequence: u64,
    pub outcome: DeliveryOutcome,
    pub frame: UplinkEvent,
    pub humidity_pct: f64,
    pub is_raining: bool,
    pub rain_intensity_mm_h: f64,
}

/// Partial radio reconfiguration for one device, applied at the start of
/// its next transmit cycle.
#[derive(Debug, Clone)]
pub struct ConfigChangeEvent {
    pub update: ConfigUpdate,
}

/// Gateway availability transition, emitted whenever the flag flips.
#[derive(Debug, Clone)]
pub struct GatewayStatusEvent {
    pub available: bool,
}

/// Terminal battery exhaustion marker for one device.
#[derive(Debug, Clone)]
pub struct BatteryDepletedEvent {
    pub device_id: u64,
}

/// Payload of a simulation event.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// Climate broadcast of a fresh weather record.
    WeatherUpdate(WeatherUpdateEvent),
    /// Device history row for one transmit cycle.
    Telemetry(TelemetryEvent),
    /// Uplink frame travelling to the gateway.
    Uplink(UplinkEvent),
    /// Gateway verdict on an uplink.
    DeliveryReport(DeliveryReportEvent),
    /// Pending radio reconfiguration for a device.
    ConfigChange(ConfigChangeEvent),
    /// Gateway availability flip.
    GatewayStatus(GatewayStatusEvent),
    /// Device battery reached zero.
    BatteryDepleted(BatteryDepletedEvent),
    /// Entity-local timer.
    Timer { timer_id: u64 },
    /// End-of-simulation sentinel.
    SimulationEnd,
}

// ============================================================================
// Events
// ============================================================================

/// A scheduled simulation event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique event ID.
    pub id: EventId,
    /// Simulation time when this event fires.
    pub time: SimTime,
    /// Entity that posted the event.
    pub source: EntityId,
    /// Entities that receive the event.
    pub targets: Vec<EntityId>,
    /// Event payload.
    pub payload: EventPayload,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl Ord for Event {
    // Reversed so BinaryHeap pops the earliest event; ties broken by the
    // lower event id to keep runs reproducible.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// Simulation Context
// ============================================================================

/// Mutable context handed to entities while they handle an event.
///
/// Owns the single deterministic RNG for the whole run and collects the
/// events an entity posts, to be drained into the queue by the event loop
/// after the handler returns.
pub struct SimContext {
    time: SimTime,
    rng: ChaCha8Rng,
    pending_events: Vec<Event>,
    next_event_id: u64,
    source_entity: EntityId,
}

impl SimContext {
    /// Create a new context with a deterministic RNG seed.
    pub fn new(seed: u64) -> Self {
        SimContext {
            time: SimTime::ZERO,
            rng: ChaCha8Rng::seed_from_u64(seed),
            pending_events: Vec::new(),
            next_event_id: 0,
            source_entity: EntityId::new(0),
        }
    }

    /// Current simulation time.
    pub fn time(&self) -> SimTime {
        self.time
    }

    /// The simulation RNG. All stochastic draws must come from here.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Advance the clock. Called by the event loop, never by entities.
    pub fn set_time(&mut self, time: SimTime) {
        self.time = time;
    }

    /// Set the entity currently being dispatched to.
    pub fn set_source(&mut self, source: EntityId) {
        self.source_entity = source;
    }

    /// Post an event to fire after `delay`.
    pub fn post_event(
        &mut self,
        delay: SimTime,
        targets: Vec<EntityId>,
        payload: EventPayload,
    ) -> EventId {
        let id = EventId(self.next_event_id);
        self.next_event_id += 1;
        self.pending_events.push(Event {
            id,
            time: self.time + delay,
            source: self.source_entity,
            targets,
            payload,
        });
        id
    }

    /// Post an event to fire at the current simulation time.
    pub fn post_immediate(&mut self, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        self.post_event(SimTime::ZERO, targets, payload)
    }

    /// Drain the events posted since the last call.
    pub fn take_pending_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }

    /// The id the next posted event will get.
    pub fn next_event_id(&self) -> u64 {
        self.next_event_id
    }

    /// Advance the id counter so ids stay unique after an externally built
    /// initial schedule. Never moves backwards.
    pub fn reserve_event_ids(&mut self, count: u64) {
        self.next_event_id = self.next_event_id.max(count);
    }
}

// ============================================================================
// Entity Trait and Registry
// ============================================================================

/// A simulated process: climate, gateway, or one sensor device.
pub trait Entity: Send {
    /// Unique identifier of this entity.
    fn entity_id(&self) -> EntityId;

    /// Handle an event addressed to this entity.
    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError>;
}

/// Owns every entity in a built simulation, keyed by id.
#[derive(Default)]
pub struct EntityRegistry {
    entities: HashMap<EntityId, Box<dyn Entity>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        EntityRegistry {
            entities: HashMap::new(),
        }
    }

    /// Register an entity under its own id.
    pub fn register(&mut self, entity: Box<dyn Entity>) {
        self.entities.insert(entity.entity_id(), entity);
    }

    pub fn get(&self, id: EntityId) -> Option<&dyn Entity> {
        self.entities.get(&id).map(|e| e.as_ref())
    }

    /// Dispatch an event to each of its targets in order.
    pub fn dispatch_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        for target in &event.targets {
            if let Some(entity) = self.entities.get_mut(target) {
                ctx.set_source(*target);
                entity.handle_event(event, ctx)?;
            } else {
                return Err(SimError::EntityNotFound(*target));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors produced by the simulation kernel and entity handlers.
#[derive(Debug, Error)]
pub enum SimError {
    /// An event targeted an entity that is not registered.
    #[error("entity not found: {0:?}")]
    EntityNotFound(EntityId),

    /// An entity handler hit an internal invariant violation.
    #[error("handler error in {entity:?}: {message}")]
    HandlerError { entity: EntityId, message: String },
}

// ============================================================================
// Tests
// ============================================================================
