//! Sensor text protocol.
//!
//! Each notification carries exactly one frame of the form `<tag>:<value>`:
//!
//! | Tag | Meaning     | Value                      |
//! |-----|-------------|----------------------------|
//! | `T` | Temperature | decimal degrees Celsius    |
//! | `H` | Humidity    | decimal percent            |
//! | `B` | Battery     | integer percent            |
//!
//! Older firmware sent `Temp: 25.5°C` and `Humidity: 65.2%`; those forms
//! are still accepted. Anything else decodes to
//! [`TelemetryFrame::Unrecognized`].

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::trace;

/// One decoded sensor sample.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryFrame {
    /// Temperature in degrees Celsius.
    Temperature(f32),
    /// Relative humidity in percent.
    Humidity(f32),
    /// Battery charge in percent.
    Battery(u8),
    /// A payload that is not a valid frame, kept verbatim.
    Unrecognized(Bytes),
}

impl TelemetryFrame {
    /// Check if this frame carries a sensor value.
    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }
}

impl std::fmt::Display for TelemetryFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Temperature(c) => write!(f, "T:{:.1}°C", c),
            Self::Humidity(h) => write!(f, "H:{:.1}%", h),
            Self::Battery(b) => write!(f, "B:{}%", b),
            Self::Unrecognized(raw) => write!(f, "unrecognized ({} bytes)", raw.len()),
        }
    }
}

/// Decode one notification payload. Never fails.
pub fn decode(payload: &[u8]) -> TelemetryFrame {
    let frame = decode_text(payload)
        .unwrap_or_else(|| TelemetryFrame::Unrecognized(Bytes::copy_from_slice(payload)));

    trace!("Decoded {:?} as {}", String::from_utf8_lossy(payload), frame);

    frame
}

fn decode_text(payload: &[u8]) -> Option<TelemetryFrame> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    let (tag, value) = text.split_once(':')?;
    let value = value.trim();

    match tag {
        "T" => parse_decimal(value).map(TelemetryFrame::Temperature),
        "H" => parse_decimal(value).map(TelemetryFrame::Humidity),
        "B" => value.parse::<u8>().ok().map(TelemetryFrame::Battery),
        "Temp" => parse_decimal(strip_unit(value, &["°C", "C"])).map(TelemetryFrame::Temperature),
        "Humidity" => parse_decimal(strip_unit(value, &["%"])).map(TelemetryFrame::Humidity),
        _ => None,
    }
}

/// Period decimal separator, no grouping, finite values only.
fn parse_decimal(value: &str) -> Option<f32> {
    let accepted = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+'));
    if !accepted {
        return None;
    }

    value.parse::<f32>().ok().filter(|v| v.is_finite())
}

fn strip_unit<'a>(value: &'a str, units: &[&str]) -> &'a str {
    units
        .iter()
        .find_map(|unit| value.strip_suffix(unit))
        .unwrap_or(value)
        .trim_end()
}

/// Split `payload` into consecutive slices of at most `max_len` bytes.
///
/// A `max_len` of zero is treated as one. Empty input yields no chunks.
pub fn chunk(payload: &[u8], max_len: usize) -> Vec<Bytes> {
    let max_len = max_len.max(1);
    let payload = Bytes::copy_from_slice(payload);

    (0..payload.len())
        .step_by(max_len)
        .map(|start| payload.slice(start..(start + max_len).min(payload.len())))
        .collect()
}

/// Most recent value of each telemetry kind.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TelemetrySnapshot {
    /// Last temperature in degrees Celsius.
    pub temperature: Option<f32>,
    /// Last humidity in percent.
    pub humidity: Option<f32>,
    /// Last battery charge in percent.
    pub battery: Option<u8>,
    /// When any field last changed.
    pub updated_at: Option<DateTime<Utc>>,
}

impl TelemetrySnapshot {
    /// Fold a frame into the snapshot. Unrecognized frames are ignored.
    pub fn apply(&mut self, frame: &TelemetryFrame, at: DateTime<Utc>) {
        match frame {
            TelemetryFrame::Temperature(c) => self.temperature = Some(*c),
            TelemetryFrame::Humidity(h) => self.humidity = Some(*h),
            TelemetryFrame::Battery(b) => self.battery = Some(*b),
            TelemetryFrame::Unrecognized(_) => return,
        }
        self.updated_at = Some(at);
    }
}
