use super::bits::{self, MAX_FIELD_BITS};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    /// Scale applied before rounding. A negative multiplier marks the field
    /// as signed on decode; its magnitude is the scale.
    pub multiplier: f64,
    /// Decimal-truncation exponent: values are reduced modulo `10^digits`
    /// when that modulus exceeds 1.
    #[serde(default)]
    pub digits: i32,
    /// Width on the wire. Zero means schema-present but never transmitted.
    pub bits: u8,
    /// Added back after division on decode.
    #[serde(default)]
    pub offset: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackingMode {
    /// Fields are packed back to back at their declared widths.
    #[default]
    Bitwise,
    /// Each field's width is rounded up to whole bytes.
    ByteAligned,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("schema has no fields")]
    Empty,
    #[error("timestamp field '{0}' needs a non-zero bit width and a multiplier of 0 or 1")]
    TimestampField(String),
    #[error("field '{field}' declares {bits} bits, limit is 64")]
    BitWidth { field: String, bits: u8 },
    #[error("field '{field}' is transmitted but has a zero multiplier")]
    ZeroMultiplier { field: String },
    #[error("field '{field}' has a non-finite multiplier or offset")]
    NonFiniteValue { field: String },
    #[error("duplicate field name '{0}'")]
    DuplicateName(String),
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, multiplier: f64, digits: i32, bits: u8, offset: f64) -> Self {
        Self {
            name: name.into(),
            multiplier,
            digits,
            bits,
            offset,
        }
    }

    pub fn is_transmitted(&self) -> bool {
        self.bits != 0
    }

    pub fn is_signed(&self) -> bool {
        self.multiplier < 0.0
    }

    pub fn modulus(&self) -> f64 {
        10f64.powi(self.digits)
    }

    /// Divisor applied on decode; never below 1.
    pub fn divisor(&self) -> f64 {
        self.multiplier.abs().max(1.0)
    }

    /// Substituted when a measurement cannot be parsed.
    pub fn sentinel(&self) -> u64 {
        bits::mask(self.bits)
    }

    pub fn wire_bits(&self, mode: PackingMode) -> u8 {
        match mode {
            PackingMode::Bitwise => self.bits,
            PackingMode::ByteAligned => self.bits.div_ceil(8) * 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    fields: Vec<FieldDescriptor>,
}

impl Schema {
    /// Validate a descriptor table. Malformed descriptors are rejected here
    /// rather than defaulted.
    pub fn new(fields: Vec<FieldDescriptor>) -> Result<Self, SchemaError> {
        let Some(timestamp) = fields.first() else {
            return Err(SchemaError::Empty);
        };
        if timestamp.bits == 0 || !(timestamp.multiplier == 0.0 || timestamp.multiplier == 1.0) {
            return Err(SchemaError::TimestampField(timestamp.name.clone()));
        }

        let mut names = HashSet::with_capacity(fields.len());
        for (index, field) in fields.iter().enumerate() {
            if !names.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateName(field.name.clone()));
            }
            if field.bits > MAX_FIELD_BITS {
                return Err(SchemaError::BitWidth {
                    field: field.name.clone(),
                    bits: field.bits,
                });
            }
            if !field.multiplier.is_finite() || !field.offset.is_finite() {
                return Err(SchemaError::NonFiniteValue {
                    field: field.name.clone(),
                });
            }
            // A transmitted value field must produce a value, otherwise every
            // following field would slide out of alignment.
            if index > 0 && field.is_transmitted() && field.multiplier == 0.0 {
                return Err(SchemaError::ZeroMultiplier {
                    field: field.name.clone(),
                });
            }
        }

        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn timestamp(&self) -> &FieldDescriptor {
        &self.fields[0]
    }

    /// Fields that occupy space in the frame, in wire order.
    pub fn transmitted(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|field| field.is_transmitted())
    }

    pub fn frame_bits(&self, mode: PackingMode) -> usize {
        self.transmitted()
            .map(|field| usize::from(field.wire_bits(mode)))
            .sum()
    }

    /// Fixed frame length in bytes, final byte zero-padded.
    pub fn frame_len(&self, mode: PackingMode) -> usize {
        self.frame_bits(mode).div_ceil(8)
    }
}
