//! End-to-end runs of the full simulation stack, from scenario files
//! through the event loop to statistics, CSV export and the CLI binary.

use canopysim_runner::{
    load_scenario, load_scenario_from_str, ConfigUpdate, RunnerError, Scenario, Season, Simulation,
};
use std::collections::HashMap;
use std::fs;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

const FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/dense_forest.yaml");

#[test]
fn test_same_seed_reproduces_run() {
    let mut scenario = Scenario::amazon_default();
    scenario.devices.truncate(2);

    let mut first = Simulation::new(scenario.clone(), 42).unwrap();
    let stats_a = first.run(7200.0).unwrap();
    let mut second = Simulation::new(scenario, 42).unwrap();
    let stats_b = second.run(7200.0).unwrap();

    assert_eq!(stats_a.total_sent, stats_b.total_sent);
    assert_eq!(stats_a.total_received, stats_b.total_received);
    assert_eq!(stats_a.events_processed, stats_b.events_processed);
    assert_eq!(
        serde_json::to_value(&stats_a.devices).unwrap(),
        serde_json::to_value(&stats_b.devices).unwrap(),
        "identical seeds must produce identical per-device statistics"
    );
    assert_eq!(
        serde_json::to_value(first.telemetry_history()).unwrap(),
        serde_json::to_value(second.telemetry_history()).unwrap(),
        "identical seeds must produce identical histories"
    );
}

#[test]
fn test_different_seeds_diverge() {
    let mut scenario = Scenario::amazon_default();
    scenario.devices.truncate(2);

    let mut first = Simulation::new(scenario.clone(), 1).unwrap();
    first.run(7200.0).unwrap();
    let mut second = Simulation::new(scenario, 2).unwrap();
    second.run(7200.0).unwrap();

    assert_ne!(
        serde_json::to_value(first.telemetry_history()).unwrap(),
        serde_json::to_value(second.telemetry_history()).unwrap(),
        "different seeds should not produce identical histories"
    );
}

#[test]
fn test_transmit_schedule_is_exact() {
    let mut scenario = Scenario::amazon_default();
    scenario.devices.truncate(1);
    scenario.season = Season::Dry;

    let mut simulation = Simulation::new(scenario, 11).unwrap();
    let stats = simulation.run(3600.0).unwrap();

    // One cycle every 300s, the last one exactly at the end of the run.
    let device = &stats.devices[0];
    assert_eq!(device.packets_sent, 12);
    assert!(device.packets_received + device.packets_lost <= device.packets_sent);
    assert_eq!(device.losses.total(), device.packets_lost);
    assert!((0.0..=1.0).contains(&device.pdr));
    assert_eq!(simulation.telemetry_history().len(), 12);

    let times: Vec<f64> = simulation
        .telemetry_history()
        .iter()
        .map(|s| s.time_s)
        .collect();
    assert_eq!(times[0], 300.0);
    assert_eq!(times[11], 3600.0);
}

#[test]
fn test_rainy_run_accounting_is_consistent() {
    let mut simulation = Simulation::new(Scenario::amazon_default(), 1234).unwrap();
    let stats = simulation.run(21600.0).unwrap();

    assert_eq!(stats.simulation_time_s, 21600.0);
    assert_eq!(stats.devices.len(), 4);
    assert_eq!(stats.season, Season::Rainy);

    let mut total_sent = 0;
    let mut total_received = 0;
    for (i, device) in stats.devices.iter().enumerate() {
        assert_eq!(device.device_id, i as u64 + 1);
        assert_eq!(device.name, format!("ESP32-{}", i + 1));
        assert!(device.packets_received <= device.packets_sent);
        assert!(device.packets_received + device.packets_lost <= device.packets_sent);
        assert_eq!(device.losses.total(), device.packets_lost);
        assert!(device.energy_consumed_mwh > 0.0);
        assert!(device.battery_pct < 100.0);
        total_sent += device.packets_sent;
        total_received += device.packets_received;
    }
    assert_eq!(stats.total_sent, total_sent);
    assert_eq!(stats.total_received, total_received);
    assert!((0.0..=1.0).contains(&stats.overall_pdr));
    assert!((0.0..=100.0).contains(&stats.gateway_uptime_pct));

    // SF7 airtime is ~62ms and queue delay is below half a second.
    let near = &stats.devices[0];
    assert!(
        near.avg_latency_ms > 50.0 && near.avg_latency_ms < 600.0,
        "implausible average latency {}",
        near.avg_latency_ms
    );

    let history = simulation.telemetry_history();
    assert_eq!(history.len() as u64, total_sent);
    assert_eq!(simulation.received_packets().len() as u64, total_received);

    // Batteries only drain.
    let mut last_battery: HashMap<u64, f64> = HashMap::new();
    for sample in &history {
        if let Some(previous) = last_battery.get(&sample.device_id) {
            assert!(
                sample.battery_pct <= *previous,
                "battery of device {} went up at t={}",
                sample.device_id,
                sample.time_s
            );
        }
        assert!(sample.battery_pct >= 0.0);
        last_battery.insert(sample.device_id, sample.battery_pct);
    }
}

#[test]
fn test_depleted_battery_stops_transmissions() {
    let mut scenario = Scenario::amazon_default();
    scenario.devices.truncate(1);
    scenario.devices[0].initial_battery_pct = 0.002;

    let mut simulation = Simulation::new(scenario, 3).unwrap();
    let stats = simulation.run(7200.0).unwrap();

    let device = &stats.devices[0];
    assert!(device.battery_depleted, "tiny battery must deplete");
    assert_eq!(device.battery_pct, 0.0);
    assert!(device.packets_sent >= 1);
    assert!(
        device.packets_sent < 24,
        "device kept transmitting after depletion: {} packets",
        device.packets_sent
    );
    assert_eq!(
        simulation.telemetry_history().len() as u64,
        device.packets_sent
    );
}

#[test]
fn test_zero_initial_battery_never_transmits() {
    let mut scenario = Scenario::amazon_default();
    scenario.devices.truncate(1);
    scenario.devices[0].initial_battery_pct = 0.0;

    let mut simulation = Simulation::new(scenario, 3).unwrap();
    let stats = simulation.run(900.0).unwrap();

    let device = &stats.devices[0];
    assert_eq!(
        device.packets_sent, 0,
        "device with a dead battery transmitted {} packet(s)",
        device.packets_sent
    );
    assert_eq!(device.packets_received, 0);
    assert!(device.battery_depleted);
    assert_eq!(device.battery_pct, 0.0);
    assert_eq!(device.energy_consumed_mwh, 0.0);
    assert_eq!(stats.total_sent, 0);
    assert!(simulation.telemetry_history().is_empty());
    assert!(simulation.received_packets().is_empty());
}

#[test]
fn test_config_change_applies_to_following_cycles() {
    let simulation = Simulation::new(Scenario::amazon_default(), 21).unwrap();
    simulation
        .change_device_config(
            1,
            ConfigUpdate {
                spreading_factor: Some(12),
                ..ConfigUpdate::default()
            },
        )
        .unwrap();

    let mut simulation = simulation;
    let stats = simulation.run(3600.0).unwrap();

    // SF12 airtime is over a second per packet.
    assert!(
        stats.devices[0].avg_airtime_ms > 1000.0,
        "spreading factor change not applied, airtime {}ms",
        stats.devices[0].avg_airtime_ms
    );
    assert!(stats.devices[1].avg_airtime_ms < 100.0);
    for record in simulation.received_packets() {
        if record.device_id == 1 {
            assert_eq!(record.spreading_factor, 12);
        }
    }
}

#[test]
fn test_background_run_snapshots_and_stop() {
    let simulation = Simulation::new(Scenario::amazon_default(), 77).unwrap();
    let handle = simulation.run_in_thread(30.0 * 86400.0);

    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        let stats = handle.network_stats();
        assert!(stats.total_received <= stats.total_sent);
        for device in &stats.devices {
            assert!(device.packets_received + device.packets_lost <= device.packets_sent);
        }
        // History polls must work concurrently with the run.
        let temperatures = handle.all_temperature_data();
        assert_eq!(temperatures.len(), 4);
        for points in handle.all_metric_data().values() {
            assert!(points.iter().all(|p| p.latency_ms >= 0.0));
        }
        if stats.events_processed > 0 || handle.is_finished() {
            break;
        }
        assert!(Instant::now() < deadline, "simulation made no progress");
        thread::sleep(Duration::from_millis(1));
    }

    let update = ConfigUpdate {
        spreading_factor: Some(10),
        ..ConfigUpdate::default()
    };
    assert!(matches!(
        handle.change_device_config(99, update),
        Err(RunnerError::UnknownDevice(99))
    ));
    handle.change_device_config(2, update).unwrap();

    handle.stop();
    let simulation = handle.join().expect("simulation thread failed");
    let stats = simulation.network_stats();
    assert!(stats.simulation_time_s <= 30.0 * 86400.0);
    assert_eq!(
        simulation.telemetry_history().len() as u64,
        stats.total_sent
    );
}

#[test]
fn test_scenario_file_defaults_and_overrides() {
    let scenario = load_scenario(FIXTURE).unwrap();
    assert_eq!(scenario.name, "Dense forest test plot");
    assert_eq!(scenario.devices.len(), 3);
    assert_eq!(scenario.frequency_mhz, 868.0);
    assert_eq!(scenario.devices[0].lora.spreading_factor, None);
    assert_eq!(scenario.devices[1].lora.spreading_factor, Some(9));
    assert_eq!(scenario.devices[1].tx_interval_s, 600.0);
    assert_eq!(scenario.devices[2].initial_battery_pct, 80.0);

    let mut simulation = Simulation::new(scenario, 5).unwrap();
    let stats = simulation.run(1200.0).unwrap();
    // node-a and node-c transmit every 300s, node-b every 600s.
    assert_eq!(stats.devices[0].packets_sent, 4);
    assert_eq!(stats.devices[1].packets_sent, 2);
    assert_eq!(stats.devices[2].packets_sent, 4);
}

#[test]
fn test_csv_export_matches_read_apis() {
    let mut simulation = Simulation::new(Scenario::amazon_default(), 8).unwrap();
    let stats = simulation.run(7200.0).unwrap();

    let dir = tempfile::tempdir().unwrap();
    simulation.export_csv(dir.path()).unwrap();

    let network = fs::read_to_string(dir.path().join("network_stats.csv")).unwrap();
    assert_eq!(network.lines().count(), stats.devices.len() + 1);
    assert!(network.starts_with("device,distance_m,packets_sent"));

    let environmental = fs::read_to_string(dir.path().join("environmental_data.csv")).unwrap();
    assert_eq!(
        environmental.lines().count(),
        simulation.telemetry_history().len() + 1
    );

    let metrics = fs::read_to_string(dir.path().join("metrics_data.csv")).unwrap();
    assert_eq!(
        metrics.lines().count(),
        simulation.telemetry_history().len() + 1
    );

    let received = fs::read_to_string(dir.path().join("received_packets.csv")).unwrap();
    assert_eq!(
        received.lines().count(),
        simulation.received_packets().len() + 1
    );
}

#[test]
fn test_cli_prints_scenario_yaml() {
    let output = Command::new(env!("CARGO_BIN_EXE_canopysim"))
        .arg("scenario")
        .output()
        .expect("failed to launch binary");
    assert!(output.status.success());

    let yaml = String::from_utf8(output.stdout).unwrap();
    let scenario = load_scenario_from_str(&yaml).expect("printed scenario must load back");
    assert_eq!(scenario.name, "Amazon dense forest");
    assert_eq!(scenario.devices.len(), 4);
}

#[test]
fn test_cli_run_emits_json_and_csv() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_canopysim"))
        .arg("run")
        .arg(FIXTURE)
        .arg("--duration")
        .arg("1200")
        .arg("--seed")
        .arg("7")
        .arg("--export-dir")
        .arg(dir.path())
        .output()
        .expect("failed to launch binary");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stats: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(stats["scenario"], "Dense forest test plot");
    assert_eq!(stats["season"], "rainy");
    assert_eq!(stats["total_sent"], 10);
    assert_eq!(stats["devices"].as_array().unwrap().len(), 3);

    for name in [
        "network_stats.csv",
        "environmental_data.csv",
        "metrics_data.csv",
        "received_packets.csv",
    ] {
        assert!(dir.path().join(name).exists(), "{} missing", name);
    }
}
