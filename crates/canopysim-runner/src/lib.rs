//! # canopysim-runner
//!
//! The discrete-event loop and the simulation facade around it. The loop
//! pops events from a time-ordered queue, dispatches them to entities,
//! and feeds everything it sees into a statistics collector that lives
//! behind one coarse mutex, so other threads can read consistent
//! statistics and histories while the run is in flight. The lock is only
//! ever held to append or copy, never across an event dispatch.
//!
//! [`Simulation`] is the entry point: build one from a scenario, run it
//! inline or in a background thread, then read statistics and history or
//! export them as CSV through [`export`].

pub mod export;

use canopysim_common::{
    ConfigChangeEvent, DeliveryOutcome, EntityId, Event, EventId, EventPayload, LossCause,
    SimContext,
};
use canopysim_env::SeasonProfile;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BinaryHeap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info};

pub use canopysim_common::{
    ConfigError, ConfigUpdate, LoraConfig, Season, SimError, SimTime, Weather,
};
pub use canopysim_model::{
    build_simulation, load_scenario, load_scenario_from_str, BuiltSimulation, DeviceInfo,
    ModelError, Scenario,
};

/// Errors from running a simulation.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("simulation error: {0}")]
    Simulation(#[from] SimError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("unknown device id {0}")]
    UnknownDevice(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("simulation thread panicked")]
    ThreadPanicked,
}

/// Render a duration as "1h02m03s".
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    format!(
        "{}h{:02}m{:02}s",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

// ============================================================================
// Statistics
// ============================================================================

/// Per-cause tallies of lost uplinks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LossCounts {
    pub gateway_unavailable: u64,
    pub weak_signal: u64,
    pub heavy_rain: u64,
    pub high_humidity: u64,
    pub multipath: u64,
}

impl LossCounts {
    fn record(&mut self, cause: LossCause) {
        match cause {
            LossCause::GatewayUnavailable => self.gateway_unavailable += 1,
            LossCause::WeakSignal => self.weak_signal += 1,
            LossCause::HeavyRain => self.heavy_rain += 1,
            LossCause::HighHumidity => self.high_humidity += 1,
            LossCause::Multipath => self.multipath += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.gateway_unavailable
            + self.weak_signal
            + self.heavy_rain
            + self.high_humidity
            + self.multipath
    }
}

/// Statistics for one device at a point in simulated time.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStats {
    pub device_id: u64,
    pub name: String,
    pub distance_m: f64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    /// Fraction of attempts the gateway accepted.
    pub pdr: f64,
    pub plr: f64,
    pub avg_latency_ms: f64,
    /// Mean absolute difference between consecutive cycle latencies.
    pub jitter_ms: f64,
    pub avg_rssi_dbm: f64,
    pub avg_snr_db: f64,
    pub avg_airtime_ms: f64,
    pub energy_consumed_mwh: f64,
    pub battery_pct: f64,
    pub battery_depleted: bool,
    pub losses: LossCounts,
}

/// Network-wide statistics, the unit every snapshot read returns.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub scenario: String,
    pub season: Season,
    pub simulation_time_s: f64,
    pub wall_time_ms: u64,
    pub events_processed: u64,
    pub total_sent: u64,
    pub total_received: u64,
    pub overall_pdr: f64,
    pub gateway_available: bool,
    pub gateway_uptime_pct: f64,
    /// Weather at the time of the snapshot.
    pub weather: Weather,
    pub devices: Vec<DeviceStats>,
}

/// One per-cycle history sample, kept for every device cycle.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySample {
    pub time_s: f64,
    pub device_id: u64,
    /// None when the sensor returned an unusable reading.
    pub temperature_c: Option<f64>,
    pub humidity_pct: f64,
    pub rain_intensity_mm_h: f64,
    pub rssi_dbm: f64,
    pub snr_db: f64,
    pub latency_ms: f64,
    pub energy_mwh: f64,
    pub battery_pct: f64,
}

/// One packet the gateway accepted, with the conditions it arrived under.
#[derive(Debug, Clone, Serialize)]
pub struct ReceivedRecord {
    pub time_s: f64,
    pub device_id: u64,
    pub temperature_c: f64,
    pub rssi_dbm: f64,
    pub snr_db: f64,
    pub latency_ms: f64,
    pub spreading_factor: u8,
    pub bandwidth_khz: u32,
    pub coding_rate: u8,
    pub data_rate_bps: f64,
    pub humidity_pct: f64,
    pub is_raining: bool,
    pub rain_intensity_mm_h: f64,
}

/// One temperature reading in a per-device dump.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TemperaturePoint {
    pub time_s: f64,
    pub temperature_c: Option<f64>,
}

/// One link-quality row in a per-device dump.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricPoint {
    pub time_s: f64,
    pub rssi_dbm: f64,
    pub snr_db: f64,
    pub latency_ms: f64,
    /// Cumulative energy drawn up to this cycle, in mWh.
    pub energy_mwh: f64,
}

struct DeviceAccumulator {
    info: DeviceInfo,
    sent: u64,
    received: u64,
    lost: u64,
    losses: LossCounts,
    rssi_sum: f64,
    snr_sum: f64,
    latency_sum_ms: f64,
    airtime_sum_ms: f64,
    last_latency_ms: Option<f64>,
    jitter_abs_sum_ms: f64,
    jitter_samples: u64,
    energy_mwh: f64,
    battery_pct: f64,
    depleted: bool,
}

/// Builds statistics and history from the event stream as the loop
/// processes it. Every event passes through [`StatsCollector::observe`]
/// exactly once, in dispatch order.
struct StatsCollector {
    scenario_name: String,
    season: Season,
    weather: Weather,
    devices: Vec<DeviceAccumulator>,
    telemetry: Vec<TelemetrySample>,
    received: Vec<ReceivedRecord>,
    gateway_available: bool,
    gateway_last_transition: SimTime,
    gateway_up_accum: SimTime,
}

impl StatsCollector {
    fn new(scenario: &Scenario, device_infos: &[DeviceInfo]) -> Self {
        let devices = device_infos
            .iter()
            .zip(&scenario.devices)
            .map(|(info, spec)| DeviceAccumulator {
                info: info.clone(),
                sent: 0,
                received: 0,
                lost: 0,
                losses: LossCounts::default(),
                rssi_sum: 0.0,
                snr_sum: 0.0,
                latency_sum_ms: 0.0,
                airtime_sum_ms: 0.0,
                last_latency_ms: None,
                jitter_abs_sum_ms: 0.0,
                jitter_samples: 0,
                energy_mwh: 0.0,
                battery_pct: spec.initial_battery_pct,
                // A zero-charge device never runs a cycle, so no depletion
                // event will ever arrive for it.
                depleted: spec.initial_battery_pct <= 0.0,
            })
            .collect();
        StatsCollector {
            scenario_name: scenario.name.clone(),
            season: scenario.season,
            weather: SeasonProfile::initial_weather(scenario.season),
            devices,
            telemetry: Vec::new(),
            received: Vec::new(),
            gateway_available: true,
            gateway_last_transition: SimTime::ZERO,
            gateway_up_accum: SimTime::ZERO,
        }
    }

    fn device_mut(&mut self, device_id: u64) -> Option<&mut DeviceAccumulator> {
        let index = device_id.checked_sub(1)? as usize;
        self.devices.get_mut(index)
    }

    fn observe(&mut self, event: &Event) {
        let time = event.time;
        match &event.payload {
            EventPayload::Telemetry(t) => {
                let latency_ms = t.latency_s * 1000.0;
                self.telemetry.push(TelemetrySample {
                    time_s: time.as_secs_f64(),
                    device_id: t.device_id,
                    temperature_c: t.temperature_c,
                    humidity_pct: t.humidity_pct,
                    rain_intensity_mm_h: t.rain_intensity_mm_h,
                    rssi_dbm: t.rssi_dbm,
                    snr_db: t.snr_db,
                    latency_ms,
                    energy_mwh: t.energy_mwh,
                    battery_pct: t.battery_pct,
                });
                let airtime_ms = t.airtime_s * 1000.0;
                if let Some(acc) = self.device_mut(t.device_id) {
                    acc.sent += 1;
                    acc.rssi_sum += t.rssi_dbm;
                    acc.snr_sum += t.snr_db;
                    acc.latency_sum_ms += latency_ms;
                    acc.airtime_sum_ms += airtime_ms;
                    if let Some(last) = acc.last_latency_ms {
                        acc.jitter_abs_sum_ms += (latency_ms - last).abs();
                        acc.jitter_samples += 1;
                    }
                    acc.last_latency_ms = Some(latency_ms);
                    acc.energy_mwh = t.energy_mwh;
                    acc.battery_pct = t.battery_pct;
                }
            }
            EventPayload::DeliveryReport(report) => {
                if let Some(acc) = self.device_mut(report.device_id) {
                    match report.outcome {
                        DeliveryOutcome::Delivered => acc.received += 1,
                        DeliveryOutcome::Lost(cause) => {
                            acc.lost += 1;
                            acc.losses.record(cause);
                        }
                    }
                }
                if report.outcome == DeliveryOutcome::Delivered {
                    self.received.push(ReceivedRecord {
                        time_s: time.as_secs_f64(),
                        device_id: report.device_id,
                        temperature_c: report.frame.temperature_c,
                        rssi_dbm: report.frame.rssi_dbm,
                        snr_db: report.frame.snr_db,
                        latency_ms: report.frame.latency_s * 1000.0,
                        spreading_factor: report.frame.config.spreading_factor,
                        bandwidth_khz: report.frame.config.bandwidth_khz,
                        coding_rate: report.frame.config.coding_rate,
                        data_rate_bps: report.frame.config.data_rate_bps(),
                        humidity_pct: report.humidity_pct,
                        is_raining: report.is_raining,
                        rain_intensity_mm_h: report.rain_intensity_mm_h,
                    });
                }
            }
            EventPayload::WeatherUpdate(update) => {
                self.weather = update.weather;
            }
            EventPayload::GatewayStatus(status) => {
                if self.gateway_available != status.available {
                    if self.gateway_available {
                        self.gateway_up_accum =
                            self.gateway_up_accum + (time - self.gateway_last_transition);
                    }
                    self.gateway_last_transition = time;
                    self.gateway_available = status.available;
                }
            }
            EventPayload::BatteryDepleted(depleted) => {
                if let Some(acc) = self.device_mut(depleted.device_id) {
                    acc.depleted = true;
                }
            }
            _ => {}
        }
    }

    fn gateway_uptime_pct(&self, now: SimTime) -> f64 {
        if now == SimTime::ZERO {
            return 100.0;
        }
        let mut up = self.gateway_up_accum;
        if self.gateway_available {
            up = up + (now - self.gateway_last_transition);
        }
        up.as_secs_f64() / now.as_secs_f64() * 100.0
    }

    fn network_stats(&self, now: SimTime, events_processed: u64, wall_time_ms: u64) -> NetworkStats {
        let devices: Vec<DeviceStats> = self
            .devices
            .iter()
            .map(|acc| {
                let sent = acc.sent;
                let avg = |sum: f64| if sent == 0 { 0.0 } else { sum / sent as f64 };
                let pdr = if sent == 0 {
                    0.0
                } else {
                    acc.received as f64 / sent as f64
                };
                DeviceStats {
                    device_id: acc.info.device_id,
                    name: acc.info.name.clone(),
                    distance_m: acc.info.distance_m,
                    packets_sent: sent,
                    packets_received: acc.received,
                    packets_lost: acc.lost,
                    pdr,
                    plr: 1.0 - pdr,
                    avg_latency_ms: avg(acc.latency_sum_ms),
                    jitter_ms: if acc.jitter_samples == 0 {
                        0.0
                    } else {
                        acc.jitter_abs_sum_ms / acc.jitter_samples as f64
                    },
                    avg_rssi_dbm: avg(acc.rssi_sum),
                    avg_snr_db: avg(acc.snr_sum),
                    avg_airtime_ms: avg(acc.airtime_sum_ms),
                    energy_consumed_mwh: acc.energy_mwh,
                    battery_pct: acc.battery_pct,
                    battery_depleted: acc.depleted,
                    losses: acc.losses,
                }
            })
            .collect();

        let total_sent: u64 = devices.iter().map(|d| d.packets_sent).sum();
        let total_received: u64 = devices.iter().map(|d| d.packets_received).sum();
        NetworkStats {
            scenario: self.scenario_name.clone(),
            season: self.season,
            simulation_time_s: now.as_secs_f64(),
            wall_time_ms,
            events_processed,
            total_sent,
            total_received,
            overall_pdr: if total_sent == 0 {
                0.0
            } else {
                total_received as f64 / total_sent as f64
            },
            gateway_available: self.gateway_available,
            gateway_uptime_pct: self.gateway_uptime_pct(now),
            weather: self.weather,
            devices,
        }
    }
}

// ============================================================================
// Shared State & Read API
// ============================================================================

/// Everything readers may touch while the loop runs. One coarse lock; the
/// loop takes it to append one event's worth of observations, readers take
/// it to copy out. Neither side holds it across a dispatch or any I/O.
struct Shared {
    collector: StatsCollector,
    sim_time: SimTime,
    events_processed: u64,
    wall_time_ms: u64,
    finished: bool,
}

enum ControlCommand {
    ConfigChange { entity: EntityId, update: ConfigUpdate },
}

fn stats_from(shared: &Mutex<Shared>) -> NetworkStats {
    let shared = shared.lock();
    shared
        .collector
        .network_stats(shared.sim_time, shared.events_processed, shared.wall_time_ms)
}

fn temperature_data_from(
    shared: &Mutex<Shared>,
    devices: &[DeviceInfo],
) -> BTreeMap<u64, Vec<TemperaturePoint>> {
    let mut map: BTreeMap<u64, Vec<TemperaturePoint>> = devices
        .iter()
        .map(|info| (info.device_id, Vec::new()))
        .collect();
    let shared = shared.lock();
    for sample in &shared.collector.telemetry {
        map.entry(sample.device_id).or_default().push(TemperaturePoint {
            time_s: sample.time_s,
            temperature_c: sample.temperature_c,
        });
    }
    map
}

fn metric_data_from(
    shared: &Mutex<Shared>,
    devices: &[DeviceInfo],
) -> BTreeMap<u64, Vec<MetricPoint>> {
    let mut map: BTreeMap<u64, Vec<MetricPoint>> = devices
        .iter()
        .map(|info| (info.device_id, Vec::new()))
        .collect();
    let shared = shared.lock();
    for sample in &shared.collector.telemetry {
        map.entry(sample.device_id).or_default().push(MetricPoint {
            time_s: sample.time_s,
            rssi_dbm: sample.rssi_dbm,
            snr_db: sample.snr_db,
            latency_ms: sample.latency_ms,
            energy_mwh: sample.energy_mwh,
        });
    }
    map
}

fn export_from(shared: &Mutex<Shared>, dir: &Path) -> Result<(), RunnerError> {
    let (stats, history, received) = {
        let shared = shared.lock();
        (
            shared.collector.network_stats(
                shared.sim_time,
                shared.events_processed,
                shared.wall_time_ms,
            ),
            shared.collector.telemetry.clone(),
            shared.collector.received.clone(),
        )
    };
    export::export_all(dir, &stats, &history, &received)?;
    Ok(())
}

fn queue_config_change(
    control: &Mutex<Vec<ControlCommand>>,
    devices: &[DeviceInfo],
    device_id: u64,
    update: ConfigUpdate,
) -> Result<(), RunnerError> {
    update.validate()?;
    let info = devices
        .iter()
        .find(|d| d.device_id == device_id)
        .ok_or(RunnerError::UnknownDevice(device_id))?;
    info!("queueing config change for {}: {:?}", info.name, update);
    control.lock().push(ControlCommand::ConfigChange {
        entity: info.entity_id,
        update,
    });
    Ok(())
}

// ============================================================================
// Event Loop
// ============================================================================

/// Progress snapshot handed to the `run_with_progress` callback.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    pub sim_time_s: f64,
    pub target_time_s: f64,
    pub wall_elapsed: Duration,
    pub events_processed: u64,
    /// Simulated seconds per wall second.
    pub time_multiplier: f64,
    pub progress_percent: f64,
    pub estimated_remaining: Option<Duration>,
}

/// The discrete-event loop.
///
/// Pops events in (time, id) order, dispatches them, pushes whatever the
/// handlers posted back into the queue, and stops at the end-of-run
/// sentinel or an external stop flag. A handler error leaves that
/// component silent for the rest of the run; the loop logs it and keeps
/// going.
pub struct EventLoop {
    event_queue: BinaryHeap<Event>,
    simulation: BuiltSimulation,
    context: SimContext,
    shared: Arc<Mutex<Shared>>,
    control: Arc<Mutex<Vec<ControlCommand>>>,
    events_processed: u64,
}

impl EventLoop {
    pub fn new(simulation: BuiltSimulation, scenario: &Scenario, seed: u64) -> Self {
        let mut event_queue = BinaryHeap::new();
        for event in simulation.initial_events.iter().cloned() {
            event_queue.push(event);
        }
        let mut context = SimContext::new(seed);
        context.reserve_event_ids(simulation.initial_events.len() as u64);

        let shared = Arc::new(Mutex::new(Shared {
            collector: StatsCollector::new(scenario, &simulation.device_infos),
            sim_time: SimTime::ZERO,
            events_processed: 0,
            wall_time_ms: 0,
            finished: false,
        }));

        EventLoop {
            event_queue,
            simulation,
            context,
            shared,
            control: Arc::new(Mutex::new(Vec::new())),
            events_processed: 0,
        }
    }

    /// Run until `duration_s` of simulated time has elapsed.
    pub fn run(&mut self, duration_s: f64) -> Result<NetworkStats, RunnerError> {
        self.run_with_progress(duration_s, None, |_, _| {})
    }

    /// Run with an optional stop flag and a progress callback.
    ///
    /// The callback fires at most every few wall seconds plus once at the
    /// end with `is_final` set. Setting the stop flag ends the run after
    /// the event in flight; handlers are atomic, so no partial cycle ever
    /// lands in the history.
    pub fn run_with_progress<F>(
        &mut self,
        duration_s: f64,
        stop_flag: Option<Arc<AtomicBool>>,
        mut on_progress: F,
    ) -> Result<NetworkStats, RunnerError>
    where
        F: FnMut(&ProgressInfo, bool),
    {
        let end_time = SimTime::from_secs(duration_s);
        self.event_queue.push(Event {
            id: EventId(u64::MAX),
            time: end_time,
            source: EntityId::new(0),
            targets: vec![],
            payload: EventPayload::SimulationEnd,
        });

        info!(
            "running '{}' for {} with {} entities",
            self.shared.lock().collector.scenario_name,
            format_duration(Duration::from_secs_f64(duration_s.max(0.0))),
            self.simulation.entities.len()
        );

        let started = Instant::now();
        let mut last_progress = Instant::now();

        while let Some(event) = self.event_queue.pop() {
            if let Some(flag) = &stop_flag {
                if flag.load(Ordering::Relaxed) {
                    info!(
                        "stop requested at t={:.1}s after {} events",
                        self.context.time().as_secs_f64(),
                        self.events_processed
                    );
                    break;
                }
            }
            if matches!(event.payload, EventPayload::SimulationEnd) {
                self.context.set_time(event.time);
                break;
            }

            self.context.set_time(event.time);
            self.apply_control_commands();

            if let Err(e) = self
                .simulation
                .entities
                .dispatch_event(&event, &mut self.context)
            {
                error!("handler failed, leaving component silent: {}", e);
            }
            for pending in self.context.take_pending_events() {
                self.event_queue.push(pending);
            }

            self.events_processed += 1;
            metrics::counter!("canopysim_events_processed").increment(1);
            {
                let mut shared = self.shared.lock();
                shared.collector.observe(&event);
                shared.sim_time = self.context.time();
                shared.events_processed = self.events_processed;
                shared.wall_time_ms = started.elapsed().as_millis() as u64;
            }

            if last_progress.elapsed() >= Duration::from_secs(5)
                || self.events_processed % 100_000 == 0
            {
                on_progress(&self.progress_info(duration_s, started), false);
                last_progress = Instant::now();
            }
        }

        {
            let mut shared = self.shared.lock();
            shared.sim_time = self.context.time();
            shared.events_processed = self.events_processed;
            shared.wall_time_ms = started.elapsed().as_millis() as u64;
            shared.finished = true;
        }
        on_progress(&self.progress_info(duration_s, started), true);

        let stats = self.network_stats();
        info!(
            "simulated {} in {}: {} events, {}/{} packets delivered",
            format_duration(Duration::from_secs_f64(stats.simulation_time_s)),
            format_duration(started.elapsed()),
            stats.events_processed,
            stats.total_received,
            stats.total_sent
        );
        Ok(stats)
    }

    /// Statistics as of the current simulation time.
    pub fn network_stats(&self) -> NetworkStats {
        stats_from(&self.shared)
    }

    /// Copy of every per-cycle history sample so far, in dispatch order.
    pub fn telemetry_history(&self) -> Vec<TelemetrySample> {
        self.shared.lock().collector.telemetry.clone()
    }

    /// Copy of every packet the gateway accepted so far, in arrival order.
    pub fn received_packets(&self) -> Vec<ReceivedRecord> {
        self.shared.lock().collector.received.clone()
    }

    pub fn device_infos(&self) -> &[DeviceInfo] {
        &self.simulation.device_infos
    }

    fn apply_control_commands(&mut self) {
        let commands: Vec<ControlCommand> = {
            let mut queue = self.control.lock();
            if queue.is_empty() {
                return;
            }
            queue.drain(..).collect()
        };
        for command in commands {
            match command {
                ControlCommand::ConfigChange { entity, update } => {
                    debug!("dispatching queued config change to {:?}", entity);
                    self.context.set_source(entity);
                    self.context.post_immediate(
                        vec![entity],
                        EventPayload::ConfigChange(ConfigChangeEvent { update }),
                    );
                }
            }
        }
        for event in self.context.take_pending_events() {
            self.event_queue.push(event);
        }
    }

    fn progress_info(&self, target_time_s: f64, started: Instant) -> ProgressInfo {
        let sim_time_s = self.context.time().as_secs_f64();
        let wall_elapsed = started.elapsed();
        let wall_s = wall_elapsed.as_secs_f64();
        let time_multiplier = if wall_s > 0.0 { sim_time_s / wall_s } else { 0.0 };
        let progress_percent = if target_time_s > 0.0 {
            (sim_time_s / target_time_s * 100.0).min(100.0)
        } else {
            100.0
        };
        let remaining_s = if time_multiplier > 0.0 {
            ((target_time_s - sim_time_s).max(0.0)) / time_multiplier
        } else {
            f64::INFINITY
        };
        let estimated_remaining = if sim_time_s > 0.0 && remaining_s.is_finite() && remaining_s < 1e9
        {
            Some(Duration::from_secs_f64(remaining_s))
        } else {
            None
        };
        ProgressInfo {
            sim_time_s,
            target_time_s,
            wall_elapsed,
            events_processed: self.events_processed,
            time_multiplier,
            progress_percent,
            estimated_remaining,
        }
    }
}

// ============================================================================
// Simulation Facade
// ============================================================================

/// One simulation: scenario, entities, event loop, and collected results.
pub struct Simulation {
    event_loop: EventLoop,
}

impl Simulation {
    /// Build a simulation from a scenario with a fixed RNG seed. The same
    /// scenario and seed always produce the same run.
    pub fn new(scenario: Scenario, seed: u64) -> Result<Self, RunnerError> {
        let built = build_simulation(&scenario)?;
        Ok(Simulation {
            event_loop: EventLoop::new(built, &scenario, seed),
        })
    }

    /// Run inline until `duration_s` of simulated time has elapsed.
    pub fn run(&mut self, duration_s: f64) -> Result<NetworkStats, RunnerError> {
        self.event_loop.run(duration_s)
    }

    pub fn run_with_progress<F>(
        &mut self,
        duration_s: f64,
        stop_flag: Option<Arc<AtomicBool>>,
        on_progress: F,
    ) -> Result<NetworkStats, RunnerError>
    where
        F: FnMut(&ProgressInfo, bool),
    {
        self.event_loop
            .run_with_progress(duration_s, stop_flag, on_progress)
    }

    /// Run in a background thread. The returned handle reads consistent
    /// snapshots, queues reconfigurations, and can stop the run early;
    /// joining it gives the simulation back with its full history.
    pub fn run_in_thread(self, duration_s: f64) -> SimulationHandle {
        let shared = self.event_loop.shared.clone();
        let control = self.event_loop.control.clone();
        let devices = self.event_loop.simulation.device_infos.clone();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_flag = stop_flag.clone();

        let join_handle = thread::spawn(move || {
            let mut simulation = self;
            simulation
                .event_loop
                .run_with_progress(duration_s, Some(thread_flag), |_, _| {})?;
            Ok(simulation)
        });

        SimulationHandle {
            shared,
            control,
            devices,
            stop_flag,
            join_handle,
        }
    }

    pub fn network_stats(&self) -> NetworkStats {
        self.event_loop.network_stats()
    }

    /// Copy of the full per-cycle history, all devices interleaved in
    /// dispatch order.
    pub fn telemetry_history(&self) -> Vec<TelemetrySample> {
        self.event_loop.telemetry_history()
    }

    /// Copy of the gateway's accepted-packet log.
    pub fn received_packets(&self) -> Vec<ReceivedRecord> {
        self.event_loop.received_packets()
    }

    /// Temperature history per device id, every device present.
    pub fn all_temperature_data(&self) -> BTreeMap<u64, Vec<TemperaturePoint>> {
        temperature_data_from(&self.event_loop.shared, self.device_infos())
    }

    /// Link-quality history per device id, every device present.
    pub fn all_metric_data(&self) -> BTreeMap<u64, Vec<MetricPoint>> {
        metric_data_from(&self.event_loop.shared, self.device_infos())
    }

    pub fn device_infos(&self) -> &[DeviceInfo] {
        self.event_loop.device_infos()
    }

    /// Write the four CSV result files into `dir`, one consistent cut of
    /// statistics and history.
    pub fn export_csv(&self, dir: &Path) -> Result<(), RunnerError> {
        export_from(&self.event_loop.shared, dir)
    }

    /// Validate and queue a partial reconfiguration for one device,
    /// applied at the start of that device's next transmit cycle.
    pub fn change_device_config(
        &self,
        device_id: u64,
        update: ConfigUpdate,
    ) -> Result<(), RunnerError> {
        queue_config_change(
            &self.event_loop.control,
            self.device_infos(),
            device_id,
            update,
        )
    }
}

/// Handle to a simulation running in a background thread. All read
/// methods copy under the shared lock and never block the loop for
/// longer than one append.
pub struct SimulationHandle {
    shared: Arc<Mutex<Shared>>,
    control: Arc<Mutex<Vec<ControlCommand>>>,
    devices: Vec<DeviceInfo>,
    stop_flag: Arc<AtomicBool>,
    join_handle: thread::JoinHandle<Result<Simulation, RunnerError>>,
}

impl SimulationHandle {
    /// The state of the network as of the last dispatched event. Always
    /// internally consistent: the loop appends whole events, never
    /// partial ones.
    pub fn network_stats(&self) -> NetworkStats {
        stats_from(&self.shared)
    }

    pub fn telemetry_history(&self) -> Vec<TelemetrySample> {
        self.shared.lock().collector.telemetry.clone()
    }

    pub fn received_packets(&self) -> Vec<ReceivedRecord> {
        self.shared.lock().collector.received.clone()
    }

    pub fn all_temperature_data(&self) -> BTreeMap<u64, Vec<TemperaturePoint>> {
        temperature_data_from(&self.shared, &self.devices)
    }

    pub fn all_metric_data(&self) -> BTreeMap<u64, Vec<MetricPoint>> {
        metric_data_from(&self.shared, &self.devices)
    }

    /// Export the run so far; usable mid-run or after completion.
    pub fn export_csv(&self, dir: &Path) -> Result<(), RunnerError> {
        export_from(&self.shared, dir)
    }

    pub fn is_finished(&self) -> bool {
        self.shared.lock().finished || self.join_handle.is_finished()
    }

    /// Ask the run to stop after the event in flight.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }

    /// Validate and queue a partial reconfiguration for one device.
    pub fn change_device_config(
        &self,
        device_id: u64,
        update: ConfigUpdate,
    ) -> Result<(), RunnerError> {
        queue_config_change(&self.control, &self.devices, device_id, update)
    }

    /// Wait for the run to end and get the simulation back, with final
    /// statistics and the complete history.
    pub fn join(self) -> Result<Simulation, RunnerError> {
        self.join_handle
            .join()
            .map_err(|_| RunnerError::ThreadPanicked)?
    }
}
