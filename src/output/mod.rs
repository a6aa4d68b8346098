use chrono::Utc;
use log::info;
use std::fs::File;
use std::path::Path;

use crate::error::VentResult;
use crate::simulation::{SessionEvent, SessionResult, SessionSummary};
use crate::snapshot::{MonitoredSnapshot, Reading};

pub fn save_results<P: AsRef<Path>>(result: &SessionResult, duration_s: f64, output_dir: P) -> VentResult<()> {
    let output_path = output_dir.as_ref();

    save_monitored_data(result, &output_path.join("monitored.csv"))?;
    save_waveform_data(result, &output_path.join("waveform.csv"))?;
    save_alarm_log(result, &output_path.join("alarms.csv"))?;
    save_events(result, &output_path.join("events.json"))?;

    let summary = SessionSummary::from_result(result, duration_s);
    save_session_summary(&summary, &output_path.join("session_summary.json"))?;

    info!("All results saved to {:?}", output_path);
    Ok(())
}

/// Unavailable readings are written as empty cells.
fn format_reading(reading: Reading) -> String {
    reading.value().map(|v| v.to_string()).unwrap_or_default()
}

fn save_monitored_data<P: AsRef<Path>>(result: &SessionResult, path: P) -> VentResult<()> {
    let mut writer = csv::Writer::from_path(path)?;

    let mut header = vec!["TIME_MS".to_string()];
    header.extend(
        MonitoredSnapshot::default()
            .fields()
            .into_iter()
            .map(|(label, _)| label.to_string()),
    );
    header.push("ACTIVE_ALARMS".to_string());
    header.push("SNOOZE_REMAINING_S".to_string());
    writer.write_record(&header)?;

    for tick in &result.ticks {
        let mut record = vec![tick.time_ms.to_string()];
        record.extend(tick.snapshot.fields().into_iter().map(|(_, r)| format_reading(r)));
        record.push(
            tick.active_alarms
                .iter()
                .map(|k| k.label())
                .collect::<Vec<_>>()
                .join(";"),
        );
        record.push(tick.snooze_remaining_s.map(|s| s.to_string()).unwrap_or_default());
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

fn save_waveform_data<P: AsRef<Path>>(result: &SessionResult, path: P) -> VentResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["TIME_MS", "PIXEL", "PRESSURE", "FLOW", "VOLUME"])?;

    for sample in &result.waveform {
        writer.write_record(&[
            format!("{:.1}", sample.time_ms),
            sample.pixel.to_string(),
            format!("{:.2}", sample.pressure),
            format!("{:.2}", sample.flow),
            format!("{:.1}", sample.volume),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

fn save_alarm_log<P: AsRef<Path>>(result: &SessionResult, path: P) -> VentResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["TIME_MS", "EVENT", "DETAIL"])?;

    for timed in &result.events {
        let (event, detail) = match &timed.event {
            SessionEvent::AlarmFired { key } => ("alarm_fired", key.label().to_string()),
            SessionEvent::Snooze { change } => ("snooze", format!("{:?}", change)),
            _ => continue,
        };
        writer.write_record(&[timed.time_ms.to_string(), event.to_string(), detail])?;
    }

    writer.flush()?;
    Ok(())
}

fn save_events<P: AsRef<Path>>(result: &SessionResult, path: P) -> VentResult<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, &result.events)?;
    Ok(())
}

fn save_session_summary<P: AsRef<Path>>(summary: &SessionSummary, path: P) -> VentResult<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, summary)?;
    Ok(())
}

fn optional(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{:.1} {}", v, unit),
        None => "--".to_string(),
    }
}

/// Generate a human-readable session report
pub fn generate_report<P: AsRef<Path>>(result: &SessionResult, duration_s: f64, output_dir: P) -> VentResult<()> {
    let report_path = output_dir.as_ref().join("session_report.md");
    let summary = SessionSummary::from_result(result, duration_s);

    let mut maneuvers = String::new();
    for maneuver in result.maneuver_results() {
        maneuvers.push_str(&format!("### {:?}\n", maneuver.kind));
        for entry in &maneuver.entries {
            maneuvers.push_str(&format!("- {}: {:.1} {}\n", entry.label, entry.value, entry.unit));
        }
        maneuvers.push('\n');
    }
    if maneuvers.is_empty() {
        maneuvers.push_str("No hold maneuvers were performed.\n");
    }

    let report_content = format!(
        r#"# Ventilation Session Report

Generated {}

## Session Overview
- **Duration**: {:.0} s
- **Monitor ticks**: {}
- **Waveform samples**: {}
- **Events**: {}
- **Alarms fired**: {}

## Monitored Values
- Max peak pressure: {}
- Mean minute volume: {}
- Mean EtCO2: {}
- Final soda lime remaining: {}

## Maneuvers
{}
## Files Generated
- `monitored.csv`: Monitored values at every 2 s tick
- `waveform.csv`: Pressure, flow and volume at every display pixel
- `alarms.csv`: Alarm and snooze history
- `events.json`: Full session event stream
- `session_summary.json`: Aggregated session statistics
"#,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        summary.duration_s,
        summary.tick_count,
        summary.waveform_samples,
        summary.event_count,
        summary.alarms_fired,
        optional(summary.max_peak_pressure, "cmH2O"),
        optional(summary.mean_minute_volume, "L/min"),
        optional(summary.mean_etco2, "mmHg"),
        optional(summary.final_soda_lime_remaining, "%"),
        maneuvers,
    );

    std::fs::write(report_path, report_content)?;
    Ok(())
}
