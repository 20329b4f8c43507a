//! Decode command implementation.
//!
//! Runs captured notification payloads through the same decoders a live
//! connection uses. Cadence payloads share one crank state, in order.

use anyhow::{Context, Result, bail};
use ridelink_types::decode::{
    decode_csc_crank_data_with, decode_cycling_power_with, decode_heart_rate_with,
};
use ridelink_types::{CrankState, SanityBounds, SensorKind, TreadmillData, decode_treadmill_ftms};
use serde::Serialize;

/// The decoder's view of one payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decoded {
    HeartRate {
        bpm: Option<u16>,
    },
    Power {
        watts: Option<i16>,
    },
    Cadence {
        crank_revs: Option<u16>,
        crank_time: Option<u16>,
        rpm: Option<u16>,
    },
    Treadmill(TreadmillData),
}

/// Parse a hex payload, tolerating `0x`, whitespace and `:`/`-` separators.
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let digits: String = trimmed
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();
    if digits.is_empty() {
        bail!("Empty payload");
    }
    hex::decode(&digits).with_context(|| format!("Invalid hex payload: {}", input))
}

/// Decode `payloads` in arrival order.
pub fn decode_payloads(
    kind: SensorKind,
    payloads: &[Vec<u8>],
    bounds: &SanityBounds,
) -> Vec<Decoded> {
    let mut crank = CrankState::new();
    payloads
        .iter()
        .map(|data| match kind {
            SensorKind::HeartRate => Decoded::HeartRate {
                bpm: decode_heart_rate_with(data, bounds),
            },
            SensorKind::Power => Decoded::Power {
                watts: decode_cycling_power_with(data, bounds),
            },
            SensorKind::Cadence => match decode_csc_crank_data_with(data, &crank, bounds) {
                Some(sample) => {
                    crank.update(&sample);
                    Decoded::Cadence {
                        crank_revs: Some(sample.crank_revs),
                        crank_time: Some(sample.crank_time),
                        rpm: sample.rpm,
                    }
                }
                None => Decoded::Cadence {
                    crank_revs: None,
                    crank_time: None,
                    rpm: None,
                },
            },
            SensorKind::Treadmill => Decoded::Treadmill(decode_treadmill_ftms(data)),
        })
        .collect()
}

fn show<T: std::fmt::Display>(value: Option<T>, unit: &str) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{}{}", v, unit))
}

/// Human-readable summary of one decoded payload.
pub fn format_decoded(decoded: &Decoded) -> String {
    match decoded {
        Decoded::HeartRate { bpm } => show(*bpm, " bpm"),
        Decoded::Power { watts } => show(*watts, " W"),
        Decoded::Cadence {
            crank_revs: None, ..
        } => "no crank data".to_string(),
        Decoded::Cadence {
            crank_revs,
            crank_time,
            rpm,
        } => format!(
            "revs {}  time {}  {}",
            show(*crank_revs, ""),
            show(*crank_time, "/1024 s"),
            show(*rpm, " rpm")
        ),
        Decoded::Treadmill(data) => {
            let mut parts = vec![
                format!("speed {}", show(data.speed.map(|v| format!("{:.2}", v)), " km/h")),
                format!("incline {}", show(data.incline.map(|v| format!("{:.1}", v)), "%")),
            ];
            if let Some(distance) = data.total_distance {
                parts.push(format!("distance {} m", distance));
            }
            if let Some(bpm) = data.heart_rate {
                parts.push(format!("hr {} bpm", bpm));
            }
            if let Some(elapsed) = data.elapsed_time {
                parts.push(format!("elapsed {} s", elapsed));
            }
            parts.join("  ")
        }
    }
}

pub fn cmd_decode(
    kind: SensorKind,
    payloads: &[String],
    json: bool,
    bounds: &SanityBounds,
) -> Result<()> {
    let frames = payloads
        .iter()
        .map(|p| parse_hex(p))
        .collect::<Result<Vec<_>>>()?;

    for (payload, decoded) in payloads.iter().zip(decode_payloads(kind, &frames, bounds)) {
        if json {
            println!("{}", serde_json::to_string(&decoded)?);
        } else {
            println!("{}  {}", payload, format_decoded(&decoded));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_forms() {
        assert_eq!(parse_hex("0000c800").unwrap(), vec![0x00, 0x00, 0xc8, 0x00]);
        assert_eq!(parse_hex("0x00 96").unwrap(), vec![0x00, 0x96]);
        assert_eq!(parse_hex("02:64:00:00:04").unwrap(), vec![0x02, 0x64, 0x00, 0x00, 0x04]);
    }

    #[test]
    fn test_parse_hex_rejects_garbage() {
        assert!(parse_hex("").is_err());
        assert!(parse_hex("0x").is_err());
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_decode_heart_rate_and_power() {
        let bounds = SanityBounds::default();
        let hr = decode_payloads(SensorKind::HeartRate, &[vec![0x00, 150], vec![]], &bounds);
        assert_eq!(hr, vec![Decoded::HeartRate { bpm: Some(150) }, Decoded::HeartRate { bpm: None }]);

        let power = decode_payloads(SensorKind::Power, &[vec![0x00, 0x00, 0xc8, 0x00]], &bounds);
        assert_eq!(format_decoded(&power[0]), "200 W");
    }

    #[test]
    fn test_cadence_uses_rolling_state() {
        // Two revolutions one second apart: 120 rpm.
        let frames = [
            vec![0x02, 100, 0, 0x00, 0x04],
            vec![0x02, 102, 0, 0x00, 0x08],
        ];
        let decoded = decode_payloads(SensorKind::Cadence, &frames, &SanityBounds::default());
        assert_eq!(
            decoded[0],
            Decoded::Cadence {
                crank_revs: Some(100),
                crank_time: Some(0x0400),
                rpm: None
            }
        );
        assert_eq!(
            decoded[1],
            Decoded::Cadence {
                crank_revs: Some(102),
                crank_time: Some(0x0800),
                rpm: Some(120)
            }
        );
    }

    #[test]
    fn test_cadence_without_crank_flag() {
        let decoded = decode_payloads(SensorKind::Cadence, &[vec![0x01]], &SanityBounds::default());
        assert_eq!(format_decoded(&decoded[0]), "no crank data");
    }

    #[test]
    fn test_treadmill_summary_and_json() {
        // Speed 10.50 km/h, inclination 2.0 %, ramp 1.1 deg
        let frame = vec![0x08, 0x00, 0x1a, 0x04, 0x14, 0x00, 0x0b, 0x00];
        let decoded = decode_payloads(SensorKind::Treadmill, &[frame], &SanityBounds::default());
        assert_eq!(format_decoded(&decoded[0]), "speed 10.50 km/h  incline 2.0%");

        let value: serde_json::Value =
            serde_json::to_value(&decoded[0]).unwrap();
        assert_eq!(value["kind"], "treadmill");
        assert_eq!(value["speed"], 10.5);
    }
}
