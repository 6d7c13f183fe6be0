//! Command line front end for the forest LoRaWAN simulator.
//!
//! `canopysim run` simulates a scenario and prints network statistics as
//! JSON on stdout; progress and the summary table go to stderr so the
//! JSON stays pipeable. `canopysim scenario` prints the built-in Amazon
//! scenario as YAML, as a starting point for custom scenario files.

use canopysim_runner::{
    format_duration, load_scenario, ModelError, NetworkStats, RunnerError, Scenario, Season,
    Simulation,
};
use clap::{Args, Parser, Subcommand};
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "canopysim",
    about = "LoRaWAN sensor network simulator for dense rainforest",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a simulation and print JSON statistics to stdout.
    Run(RunArgs),
    /// Print the built-in Amazon scenario as YAML.
    Scenario,
}

#[derive(Args)]
struct RunArgs {
    /// Scenario YAML file. Uses the built-in Amazon scenario when omitted.
    scenario: Option<PathBuf>,

    /// Simulated duration, e.g. "90m", "6h", "1h30m" or plain seconds.
    #[arg(short, long, value_parser = parse_duration, default_value = "1h")]
    duration: f64,

    /// RNG seed. Random when omitted; reuse a printed seed to repeat a run.
    #[arg(short, long)]
    seed: Option<u64>,

    /// Override the scenario's season (rainy or dry).
    #[arg(long, value_parser = parse_season)]
    season: Option<Season>,

    /// Write CSV result files into this directory.
    #[arg(long)]
    export_dir: Option<PathBuf>,
}

fn parse_duration(s: &str) -> Result<f64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(seconds) = s.parse::<f64>() {
        return if seconds.is_finite() && seconds >= 0.0 {
            Ok(seconds)
        } else {
            Err(format!("duration '{}' must be a non-negative number", s))
        };
    }

    let mut total = 0.0;
    let mut number = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
        } else {
            let value: f64 = number
                .parse()
                .map_err(|_| format!("invalid duration '{}'", s))?;
            number.clear();
            total += match c {
                's' => value,
                'm' => value * 60.0,
                'h' => value * 3600.0,
                'd' => value * 86400.0,
                _ => return Err(format!("unknown duration unit '{}'", c)),
            };
        }
    }
    // A trailing bare number counts as seconds, so "1h30" is 3630.
    if !number.is_empty() {
        total += number
            .parse::<f64>()
            .map_err(|_| format!("invalid duration '{}'", s))?;
    }
    Ok(total)
}

fn parse_season(s: &str) -> Result<Season, String> {
    match s.to_ascii_lowercase().as_str() {
        "rainy" | "wet" => Ok(Season::Rainy),
        "dry" => Ok(Season::Dry),
        other => Err(format!("unknown season '{}' (expected rainy or dry)", other)),
    }
}

fn main() -> Result<(), RunnerError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    match Cli::parse().command {
        Command::Run(args) => run(args),
        Command::Scenario => {
            let yaml =
                serde_yaml::to_string(&Scenario::amazon_default()).map_err(ModelError::from)?;
            print!("{}", yaml);
            Ok(())
        }
    }
}

fn run(args: RunArgs) -> Result<(), RunnerError> {
    let mut scenario = match &args.scenario {
        Some(path) => load_scenario(path)?,
        None => Scenario::amazon_default(),
    };
    if let Some(season) = args.season {
        scenario.season = season;
    }
    let seed = args.seed.unwrap_or_else(|| rand::thread_rng().gen());

    eprintln!(
        "scenario '{}': {:?} season, {} devices, seed {}",
        scenario.name,
        scenario.season,
        scenario.devices.len(),
        seed
    );

    let mut simulation = Simulation::new(scenario, seed)?;
    let stats = simulation.run_with_progress(args.duration, None, |progress, is_final| {
        if !is_final {
            eprintln!(
                "  t={:>8.0}s  {:5.1}%  {} events  {:.0}x real time",
                progress.sim_time_s,
                progress.progress_percent,
                progress.events_processed,
                progress.time_multiplier
            );
        }
    })?;

    print_summary(&stats);

    if let Some(dir) = &args.export_dir {
        simulation.export_csv(dir)?;
        eprintln!("CSV files written to {}", dir.display());
    }

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn print_summary(stats: &NetworkStats) {
    eprintln!();
    eprintln!("┌──────────────┬───────┬───────┬────────┬──────────┬────────────┬──────────┐");
    eprintln!("│ device       │  sent │  recv │    PDR │ RSSI dBm │ latency ms │  battery │");
    eprintln!("├──────────────┼───────┼───────┼────────┼──────────┼────────────┼──────────┤");
    for device in &stats.devices {
        eprintln!(
            "│ {:<12} │ {:>5} │ {:>5} │ {:>5.1}% │ {:>8.1} │ {:>10.1} │ {:>7.2}% │",
            device.name,
            device.packets_sent,
            device.packets_received,
            device.pdr * 100.0,
            device.avg_rssi_dbm,
            device.avg_latency_ms,
            device.battery_pct
        );
    }
    eprintln!("└──────────────┴───────┴───────┴────────┴──────────┴────────────┴──────────┘");

    let rain = if stats.weather.is_raining {
        format!(", raining {:.1} mm/h", stats.weather.rain_intensity_mm_h)
    } else {
        String::new()
    };
    eprintln!(
        "delivered {}/{} packets ({:.1}% PDR), gateway uptime {:.1}%",
        stats.total_received,
        stats.total_sent,
        stats.overall_pdr * 100.0,
        stats.gateway_uptime_pct
    );
    eprintln!(
        "final weather: {:.1}C, {:.0}% RH{}",
        stats.weather.temperature_c, stats.weather.humidity_pct, rain
    );
    eprintln!(
        "simulated {} in {:?} ({} events)",
        format_duration(Duration::from_secs_f64(stats.simulation_time_s)),
        Duration::from_millis(stats.wall_time_ms),
        stats.events_processed
    );
    eprintln!();
}
