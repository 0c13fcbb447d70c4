//! Telemetry frame codec.
//!
//! Packs a comma-delimited decimal measurement line into a fixed-length
//! bit-packed frame for the downlink, and rebuilds the measurement vector on
//! the ground. The codec is lossy by construction: values are scaled,
//! truncated to a digit budget, rounded and wrapped into their bit widths.

pub mod bits;
pub mod schema;

pub use schema::{FieldDescriptor, PackingMode, Schema, SchemaError};

use bits::{BitReader, BitWriter};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("measurement line has {actual} fields, schema expects {expected}")]
    FieldCountMismatch { expected: usize, actual: usize },
    #[error("timestamp '{0}' is not shaped HH:MM:SS.ffffff")]
    InvalidTimestamp(String),
    #[error("frame is {actual} bytes, schema needs {expected}")]
    FrameLength { expected: usize, actual: usize },
}

/// A field whose text could not be encoded; its sentinel was sent instead.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldEncodeFailure {
    pub field: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFrame {
    pub bytes: Vec<u8>,
    pub substituted: Vec<FieldEncodeFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuiltField {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuiltFrame {
    /// `YYYYMMDD_HH:MM:SS`, dated on the day of decoding.
    pub timestamp: String,
    pub seconds_since_midnight: f64,
    /// Transmitted value fields in schema order, timestamp excluded.
    pub fields: Vec<RebuiltField>,
}

impl RebuiltFrame {
    /// Render as a measurement line: timestamp followed by the values.
    pub fn to_line(&self) -> String {
        let mut line = self.timestamp.clone();
        for field in &self.fields {
            line.push(',');
            line.push_str(&field.value.to_string());
        }
        line
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.fields.iter().find(|field| field.name == name).map(|field| field.value)
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryCodec {
    schema: Schema,
    mode: PackingMode,
}

impl TelemetryCodec {
    pub fn new(schema: Schema) -> Self {
        Self::with_mode(schema, PackingMode::Bitwise)
    }

    pub fn with_mode(schema: Schema, mode: PackingMode) -> Self {
        Self { schema, mode }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn mode(&self) -> PackingMode {
        self.mode
    }

    pub fn frame_len(&self) -> usize {
        self.schema.frame_len(self.mode)
    }

    /// Encode a measurement line, logging any field that fell back to its
    /// sentinel.
    pub fn encode(&self, line: &str) -> Result<Vec<u8>, CodecError> {
        let frame = self.encode_frame(line)?;
        for failure in &frame.substituted {
            warn!("Field {} had unparseable value [{}], sent sentinel", failure.field, failure.text);
        }
        Ok(frame.bytes)
    }

    pub fn encode_frame(&self, line: &str) -> Result<EncodedFrame, CodecError> {
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() != self.schema.len() {
            return Err(CodecError::FieldCountMismatch {
                expected: self.schema.len(),
                actual: parts.len(),
            });
        }

        let mut writer = BitWriter::with_capacity_bits(self.schema.frame_bits(self.mode));
        let mut substituted = Vec::new();

        let timestamp = self.schema.timestamp();
        let seconds = seconds_since_midnight(parts[0])?;
        writer.push(
            bits::wrap_to_width(seconds as f64, timestamp.wire_bits(self.mode)),
            timestamp.wire_bits(self.mode),
        );

        for (field, text) in self.schema.fields().iter().zip(&parts).skip(1) {
            if field.multiplier == 0.0 || !field.is_transmitted() {
                continue;
            }
            let width = field.wire_bits(self.mode);
            let raw = match scale_value(field, text) {
                Some(rounded) => bits::wrap_to_width(rounded, width),
                None => {
                    substituted.push(FieldEncodeFailure {
                        field: field.name.clone(),
                        text: (*text).to_string(),
                    });
                    field.sentinel()
                }
            };
            writer.push(raw, width);
        }

        Ok(EncodedFrame {
            bytes: writer.into_bytes(),
            substituted,
        })
    }

    /// Rebuild a frame, dating the timestamp with today's UTC date.
    pub fn decode(&self, bytes: &[u8]) -> Result<RebuiltFrame, CodecError> {
        self.decode_on(bytes, Utc::now().date_naive())
    }

    /// Rebuild a frame. The capture date is not transmitted, so `date` is
    /// prefixed to the reconstructed clock time. Bytes past the fixed frame
    /// length are ignored.
    pub fn decode_on(&self, bytes: &[u8], date: NaiveDate) -> Result<RebuiltFrame, CodecError> {
        let expected = self.frame_len();
        if bytes.len() < expected {
            return Err(CodecError::FrameLength {
                expected,
                actual: bytes.len(),
            });
        }

        let mut reader = BitReader::new(bytes);
        let mut values = Vec::with_capacity(self.schema.len());
        for field in self.schema.transmitted() {
            let width = field.wire_bits(self.mode);
            let raw = reader.read(width).ok_or(CodecError::FrameLength {
                expected,
                actual: bytes.len(),
            })?;
            values.push((field, rebuild_value(field, raw, width)));
        }

        let mut values = values.into_iter();
        let seconds = values.next().map_or(0.0, |(_, value)| value);
        Ok(RebuiltFrame {
            timestamp: format_clock(seconds, date),
            seconds_since_midnight: seconds,
            fields: values
                .map(|(field, value)| RebuiltField {
                    name: field.name.clone(),
                    value,
                })
                .collect(),
        })
    }
}

// Largest whole number of seconds an f64 holds exactly (2^53).
const MAX_WHOLE_SECONDS: f64 = 9_007_199_254_740_992.0;

/// Seconds since local midnight from a `..._HH:MM:SS.ffffff` stamp,
/// rounding the fractional seconds half to even.
pub fn seconds_since_midnight(stamp: &str) -> Result<u64, CodecError> {
    let invalid = || CodecError::InvalidTimestamp(stamp.to_string());
    let clock = stamp.rsplit('_').next().unwrap_or(stamp);

    let mut parts = clock.split(':');
    let (Some(hours), Some(minutes), Some(seconds), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };

    let hours: u64 = hours.trim().parse().map_err(|_| invalid())?;
    let minutes: u64 = minutes.trim().parse().map_err(|_| invalid())?;
    let seconds = seconds.trim().parse::<f64>().map_err(|_| invalid())?.round_ties_even();
    if !(0.0..=MAX_WHOLE_SECONDS).contains(&seconds) {
        return Err(invalid());
    }

    hours
        .checked_mul(3600)
        .and_then(|total| total.checked_add(minutes.checked_mul(60)?))
        .and_then(|total| total.checked_add(seconds as u64))
        .ok_or_else(invalid)
}

/// `YYYYMMDD_HH:MM:SS` for a seconds-since-midnight value on `date`.
pub fn format_clock(seconds: f64, date: NaiveDate) -> String {
    let total = seconds.round_ties_even() as i64;
    format!(
        "{}_{:02}:{:02}:{:02}",
        date.format("%Y%m%d"),
        total.div_euclid(3600),
        total.div_euclid(60).rem_euclid(60),
        total.rem_euclid(60)
    )
}

// Scale, truncate to the digit budget, and round. `None` means the text is
// not a finite number.
fn scale_value(field: &FieldDescriptor, text: &str) -> Option<f64> {
    let value: f64 = text.trim().parse().ok()?;
    let mut scaled = value * field.multiplier.abs();
    let modulus = field.modulus();
    if modulus > 1.0 {
        scaled = scaled.rem_euclid(modulus);
    }
    scaled.is_finite().then(|| scaled.round_ties_even())
}

fn rebuild_value(field: &FieldDescriptor, raw: u64, width: u8) -> f64 {
    let value = if field.is_signed() && width > 0 && width < 64 && raw > (1u64 << (width - 1)) {
        raw as f64 - 2f64.powi(i32::from(width))
    } else if field.is_signed() && width == 64 && raw > (1u64 << 63) {
        (raw as i64) as f64
    } else {
        raw as f64
    };
    value / field.divisor() + field.offset
}
