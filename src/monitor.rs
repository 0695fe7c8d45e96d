use anyhow::{Context, Result};
use jbdbms_lib::ble::BleTransport;
use jbdbms_lib::protocol::ChargeState;
use jbdbms_lib::sequencer::Reading;
use jbdbms_lib::session::{Session, Transport};
use log::{error, info};
use serde_json::json;
use std::fmt::Write;
use std::ops::ControlFlow;

use crate::commandline::OutputFormat;
use crate::config::Config;

/// Human readable charge state; idle has no meaningful time remaining.
fn state_text(reading: &Reading) -> String {
    let info = &reading.battery_info;
    match (info.state(), info.hhmm_remaining.as_deref()) {
        (ChargeState::Charging, Some(hhmm)) => format!("Charged in {hhmm}"),
        (ChargeState::Discharging, Some(hhmm)) => format!("Discharging in {hhmm}"),
        _ => "Idle".to_string(),
    }
}

pub fn format_text(reading: &Reading, watt_hours: f64) -> Result<String> {
    let info = &reading.battery_info;
    let mut out = String::new();
    writeln!(
        out,
        "--- {} at {} ---",
        info.name,
        chrono::Local::now().to_rfc3339()
    )?;
    writeln!(
        out,
        "SOC: {}% ({})",
        info.remaining_percent_soc,
        state_text(reading)
    )?;
    writeln!(
        out,
        "Capacity: {:.2} / {:.2} Ah",
        info.remaining_capacity_ah, info.nominal_capacity_ah
    )?;
    writeln!(out, "Voltage: {:.2} V", info.total_volts)?;
    writeln!(out, "Current: {:.2} A", info.current)?;
    writeln!(out, "Power: {:.2} W", info.power_watts())?;
    writeln!(out, "Watt-hours: {watt_hours:.2} Wh")?;
    writeln!(out, "Cycle count: {}", info.total_cycles)?;
    writeln!(
        out,
        "Mosfet: charge={} discharge={}",
        info.mosfet_charge, info.mosfet_discharge
    )?;
    for (n, volts) in reading.cell_voltages.iter().enumerate() {
        let balancing = if info.balance_status.get(n).copied().unwrap_or(false) {
            " (balancing)"
        } else {
            ""
        };
        writeln!(out, "Cell {}: {volts:.3} V{balancing}", n + 1)?;
    }
    for (n, celsius) in info.temperatures.iter().enumerate() {
        writeln!(out, "Sensor {}: {celsius:.1} C", n + 1)?;
    }
    Ok(out)
}

pub fn format_json(reading: &Reading, watt_hours: f64) -> Result<String> {
    let payload = json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "battery_info": reading.battery_info,
        "cell_voltages": reading.cell_voltages,
        "watt_hours": watt_hours,
    });
    serde_json::to_string(&payload).with_context(|| "Failed to serialize reading to JSON")
}

fn print_reading(reading: &Reading, watt_hours: f64, format: OutputFormat) {
    match format {
        OutputFormat::Text => match format_text(reading, watt_hours) {
            Ok(text) => print!("{text}"),
            Err(e) => error!("Failed to format reading: {e:#}"),
        },
        OutputFormat::Json => match format_json(reading, watt_hours) {
            Ok(line) => println!("{line}"),
            Err(e) => error!("{e:#}"),
        },
    }
}

/// Connects and prints readings until the link closes, or after the first one with `once`.
pub async fn run(config: Config, format: OutputFormat, once: bool) -> Result<()> {
    info!("Starting monitor: format={format:?}, once={once}, config={config:?}");
    let transport = BleTransport::connect(config.device_name.as_deref(), config.scan_timeout)
        .await
        .with_context(|| "Cannot connect to BMS")?;

    let mut session = Session::new(transport.device_name(), &config.session);
    let result = {
        let notifications = transport
            .notifications()
            .await
            .with_context(|| "Cannot start notifications")?;
        session
            .run(&transport, notifications, |reading, watt_hours| {
                print_reading(reading, watt_hours, format);
                if once {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .await
            .with_context(|| "Polling stopped")
    };

    if let Err(e) = transport.disconnect().await {
        error!("Failed to disconnect: {e}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use jbdbms_lib::protocol::{BatteryInfo, CellVoltages};

    fn reading(current: f32) -> Reading {
        Reading {
            battery_info: BatteryInfo {
                name: "xiaoxiang BMS".into(),
                total_volts: 13.2,
                current,
                remaining_capacity_ah: 50.0,
                nominal_capacity_ah: 100.0,
                total_cycles: 12,
                remaining_percent_soc: 50,
                mosfet_charge: true,
                mosfet_discharge: true,
                cell_count: 4,
                balance_status: vec![false, true, false, false],
                temperatures: vec![21.5],
                charging: current > 0.0,
                discharging: current < 0.0,
                seconds_remaining: jbdbms_lib::protocol::seconds_remaining(current, 50.0, 100.0),
                hhmm_remaining: jbdbms_lib::protocol::seconds_remaining(current, 50.0, 100.0)
                    .map(jbdbms_lib::protocol::format_hhmm),
            },
            cell_voltages: CellVoltages(vec![3.3, 3.301, 3.299, 3.3]),
        }
    }

    #[test]
    fn idle_is_not_formatted_as_duration() {
        assert_eq!(state_text(&reading(0.0)), "Idle");
        assert_eq!(state_text(&reading(-10.0)), "Discharging in 5h 0m");
        assert_eq!(state_text(&reading(25.0)), "Charged in 2h 0m");
    }

    #[test]
    fn text_lists_cells_and_sensors() {
        let text = format_text(&reading(-10.0), 1.5).unwrap();
        assert!(text.contains("Cell 2: 3.301 V (balancing)"));
        assert!(text.contains("Cell 4: 3.300 V\n"));
        assert!(text.contains("Sensor 1: 21.5 C"));
        assert!(text.contains("Watt-hours: 1.50 Wh"));
        assert!(text.contains("Power: -132.00 W"));
    }

    #[test]
    fn json_carries_reading_and_energy() {
        let line = format_json(&reading(0.0), 2.25).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["battery_info"]["name"], "xiaoxiang BMS");
        assert_eq!(value["battery_info"]["hhmm_remaining"], serde_json::Value::Null);
        assert_eq!(value["cell_voltages"].as_array().unwrap().len(), 4);
        assert_eq!(value["watt_hours"], 2.25);
    }
}
