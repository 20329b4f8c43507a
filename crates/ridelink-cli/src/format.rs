//! Output formatting for readings, statuses and decoded payloads.

use anyhow::Result;
use ridelink_core::SensorEvent;
use ridelink_types::{ConnectionStatus, Reading, SensorKind, TreadmillMeasurement};
use time::OffsetDateTime;

/// Wall-clock time of day (UTC) for a millisecond timestamp.
pub fn format_time(timestamp_ms: u64) -> String {
    let nanos = i128::from(timestamp_ms) * 1_000_000;
    match OffsetDateTime::from_unix_timestamp_nanos(nanos) {
        Ok(t) => format!(
            "{:02}:{:02}:{:02}.{:03}",
            t.hour(),
            t.minute(),
            t.second(),
            t.millisecond()
        ),
        Err(_) => timestamp_ms.to_string(),
    }
}

fn format_optional(value: Option<f64>, precision: usize, unit: &str) -> String {
    match value {
        Some(v) => format!("{:.*} {}", precision, v, unit),
        None => "-".to_string(),
    }
}

fn format_treadmill(measurement: &TreadmillMeasurement) -> String {
    format!(
        "{}  {}",
        format_optional(measurement.speed, 2, "km/h"),
        format_optional(measurement.incline, 1, "%")
    )
}

/// One human-readable line for a reading.
pub fn format_reading_line(kind: SensorKind, reading: &Reading) -> String {
    let value = match reading {
        Reading::Measurement(m) => format!("{:.0} {}", m.value, kind.unit()),
        Reading::Treadmill(t) => format_treadmill(t),
    };
    format!("{}  {}", format_time(reading.timestamp()), value)
}

/// One human-readable line for a status change.
pub fn format_status_line(status: ConnectionStatus) -> String {
    match status {
        ConnectionStatus::Connected => "-- connected".to_string(),
        ConnectionStatus::Disconnected => "-- link lost".to_string(),
        ConnectionStatus::Reconnecting => "-- reconnecting...".to_string(),
        ConnectionStatus::Failed => "-- reconnection failed".to_string(),
    }
}

/// Serialize an event as a single JSON line.
pub fn format_event_json(event: &SensorEvent) -> Result<String> {
    Ok(serde_json::to_string(event)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ridelink_core::DeviceHandle;
    use ridelink_types::Measurement;

    #[test]
    fn test_format_time() {
        // 2023-11-14T22:13:20.123Z
        assert_eq!(format_time(1_700_000_000_123), "22:13:20.123");
    }

    #[test]
    fn test_format_measurement_line() {
        let reading: Reading = Measurement::new(1_700_000_000_000, 245.0).into();
        assert_eq!(
            format_reading_line(SensorKind::Power, &reading),
            "22:13:20.000  245 W"
        );
    }

    #[test]
    fn test_format_treadmill_line() {
        let reading: Reading = TreadmillMeasurement {
            timestamp: 1_700_000_000_000,
            speed: Some(10.5),
            incline: None,
        }
        .into();
        assert_eq!(
            format_reading_line(SensorKind::Treadmill, &reading),
            "22:13:20.000  10.50 km/h  -"
        );
    }

    #[test]
    fn test_format_status_lines_distinct() {
        let lines: Vec<_> = [
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected,
            ConnectionStatus::Reconnecting,
            ConnectionStatus::Failed,
        ]
        .into_iter()
        .map(format_status_line)
        .collect();
        for (i, line) in lines.iter().enumerate() {
            assert!(!lines[i + 1..].contains(line));
        }
    }

    #[test]
    fn test_format_event_json() {
        let event = SensorEvent::Status {
            device: DeviceHandle::new("dev"),
            kind: SensorKind::Cadence,
            status: ConnectionStatus::Failed,
        };
        let line = format_event_json(&event).unwrap();
        assert!(!line.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["status"], "failed");
    }
}
