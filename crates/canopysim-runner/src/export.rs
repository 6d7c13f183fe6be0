//! CSV export of simulation results.
//!
//! Four files, one per read API: per-device network statistics, the
//! temperature/humidity/rain history, the signal-quality history, and
//! the packets the gateway accepted. Rows keep dispatch order, so the
//! history files are already sorted by timestamp.

use crate::{NetworkStats, ReceivedRecord, TelemetrySample};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing::info;

fn escape_csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn fmt_temperature(value: Option<f64>) -> String {
    match value {
        Some(t) => format!("{:.1}", t),
        None => "NaN".to_string(),
    }
}

/// Per-device statistics, one row per device.
pub fn export_network_stats<W: Write>(writer: &mut W, stats: &NetworkStats) -> io::Result<()> {
    writeln!(writer, "device,distance_m,packets_sent,packets_received,packets_lost,pdr,plr,avg_latency_ms,jitter_ms,avg_rssi_dbm,avg_snr_db,avg_airtime_ms,energy_mwh,battery_pct,battery_depleted")?;
    for device in &stats.devices {
        writeln!(
            writer,
            "{},{:.1},{},{},{},{:.4},{:.4},{:.2},{:.2},{:.2},{:.2},{:.2},{:.6},{:.2},{}",
            escape_csv_field(&device.name),
            device.distance_m,
            device.packets_sent,
            device.packets_received,
            device.packets_lost,
            device.pdr,
            device.plr,
            device.avg_latency_ms,
            device.jitter_ms,
            device.avg_rssi_dbm,
            device.avg_snr_db,
            device.avg_airtime_ms,
            device.energy_consumed_mwh,
            device.battery_pct,
            device.battery_depleted,
        )?;
    }
    Ok(())
}

/// Temperature and weather per cycle. Broken sensor readings come out
/// as `NaN` so downstream tooling can filter them.
pub fn export_environmental_data<W: Write>(
    writer: &mut W,
    stats: &NetworkStats,
    history: &[TelemetrySample],
) -> io::Result<()> {
    let names = device_names(stats);
    writeln!(
        writer,
        "timestamp,device,temperature_c,humidity_pct,rain_intensity_mm_h"
    )?;
    for sample in history {
        writeln!(
            writer,
            "{:.1},{},{},{:.1},{:.1}",
            sample.time_s,
            escape_csv_field(names.get(&sample.device_id).copied().unwrap_or("?")),
            fmt_temperature(sample.temperature_c),
            sample.humidity_pct,
            sample.rain_intensity_mm_h,
        )?;
    }
    Ok(())
}

/// Signal quality and energy per cycle.
pub fn export_metrics_data<W: Write>(
    writer: &mut W,
    stats: &NetworkStats,
    history: &[TelemetrySample],
) -> io::Result<()> {
    let names = device_names(stats);
    writeln!(
        writer,
        "timestamp,device,rssi_dbm,snr_db,latency_ms,energy_mwh,battery_pct"
    )?;
    for sample in history {
        writeln!(
            writer,
            "{:.1},{},{:.2},{:.2},{:.2},{:.6},{:.2}",
            sample.time_s,
            escape_csv_field(names.get(&sample.device_id).copied().unwrap_or("?")),
            sample.rssi_dbm,
            sample.snr_db,
            sample.latency_ms,
            sample.energy_mwh,
            sample.battery_pct,
        )?;
    }
    Ok(())
}

/// Every accepted packet with its radio settings and the weather it
/// arrived under.
pub fn export_received_packets<W: Write>(
    writer: &mut W,
    stats: &NetworkStats,
    received: &[ReceivedRecord],
) -> io::Result<()> {
    let names = device_names(stats);
    writeln!(writer, "timestamp,device_id,device,temperature_c,rssi_dbm,snr_db,latency_ms,spreading_factor,bandwidth_khz,coding_rate,data_rate_bps,humidity_pct,is_raining,rain_intensity_mm_h")?;
    for record in received {
        writeln!(
            writer,
            "{:.1},{},{},{:.1},{:.2},{:.2},{:.2},{},{},4/{},{:.0},{:.1},{},{:.1}",
            record.time_s,
            record.device_id,
            escape_csv_field(names.get(&record.device_id).copied().unwrap_or("?")),
            record.temperature_c,
            record.rssi_dbm,
            record.snr_db,
            record.latency_ms,
            record.spreading_factor,
            record.bandwidth_khz,
            record.coding_rate,
            record.data_rate_bps,
            record.humidity_pct,
            record.is_raining,
            record.rain_intensity_mm_h,
        )?;
    }
    Ok(())
}

/// Write all four CSV files into `dir`, creating it if needed.
pub fn export_all(
    dir: &Path,
    stats: &NetworkStats,
    history: &[TelemetrySample],
    received: &[ReceivedRecord],
) -> io::Result<()> {
    fs::create_dir_all(dir)?;

    let mut out = BufWriter::new(File::create(dir.join("network_stats.csv"))?);
    export_network_stats(&mut out, stats)?;
    out.flush()?;

    let mut out = BufWriter::new(File::create(dir.join("environmental_data.csv"))?);
    export_environmental_data(&mut out, stats, history)?;
    out.flush()?;

    let mut out = BufWriter::new(File::create(dir.join("metrics_data.csv"))?);
    export_metrics_data(&mut out, stats, history)?;
    out.flush()?;

    let mut out = BufWriter::new(File::create(dir.join("received_packets.csv"))?);
    export_received_packets(&mut out, stats, received)?;
    out.flush()?;

    info!("exported CSV results to {}", dir.display());
    Ok(())
}

fn device_names(stats: &NetworkStats) -> BTreeMap<u64, &str> {
    stats
        .devices
        .iter()
        .map(|d| (d.device_id, d.name.as_str()))
        .collect()
}
