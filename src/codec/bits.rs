/// Largest width a single field may occupy on the wire.
pub const MAX_FIELD_BITS: u8 = 64;

/// All-ones value for a field of `width` bits.
pub fn mask(width: u8) -> u64 {
    if width >= MAX_FIELD_BITS {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Reduce an already-rounded integral value into `width` bits.
///
/// Negative values land on their two's-complement image and values at or
/// above `2^width` wrap. Outside the `i64` range `fmod` is used, which is
/// exact for power-of-two divisors.
pub fn wrap_to_width(rounded: f64, width: u8) -> u64 {
    if width == 0 {
        return 0;
    }
    if rounded.abs() < I64_RANGE {
        return (rounded as i64) as u64 & mask(width);
    }
    let modulus = 2f64.powi(i32::from(width));
    rounded.rem_euclid(modulus) as u64
}

const I64_RANGE: f64 = 9_223_372_036_854_775_808.0; // 2^63

#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    bytes: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_bits(bits: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(bits.div_ceil(8)),
            bit_len: 0,
        }
    }

    /// Append the low `width` bits of `value`, most significant bit first.
    pub fn push(&mut self, value: u64, width: u8) {
        debug_assert!(width <= MAX_FIELD_BITS, "field width {width} exceeds {MAX_FIELD_BITS}");

        for shift in (0..u32::from(width)).rev() {
            let byte_index = self.bit_len / 8;
            if byte_index == self.bytes.len() {
                self.bytes.push(0);
            }
            if (value >> shift) & 1 == 1 {
                self.bytes[byte_index] |= 0x80u8 >> (self.bit_len % 8);
            }
            self.bit_len += 1;
        }
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// Finish the stream. Unused trailing bits of the last byte are zero.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    pub fn remaining_bits(&self) -> usize {
        (self.bytes.len() * 8).saturating_sub(self.position)
    }

    /// Read the next `width` bits as an unsigned integer, or `None` when the
    /// stream is exhausted.
    pub fn read(&mut self, width: u8) -> Option<u64> {
        let width_bits = usize::from(width);
        if width > MAX_FIELD_BITS || width_bits > self.remaining_bits() {
            return None;
        }

        let mut value = 0u64;
        for _ in 0..width_bits {
            let byte = self.bytes[self.position / 8];
            let bit = (byte >> (7 - self.position % 8)) & 1;
            value = (value << 1) | u64::from(bit);
            self.position += 1;
        }
        Some(value)
    }
}
