//! Per-field bytestream codecs: bit-packed integers, raw floats, and
//! length-prefixed strings. Each encoder/decoder pair is resumable across
//! packet boundaries — a decoder only ever consumes whole bytes and
//! buffers whatever bits/bytes of a record it couldn't complete yet.

use crate::error::E57Error;
use crate::node::Precision;

/// `bits_needed(a, b)`: 0 if `a == b`, else `ceil(log2(b - a + 1))`,
/// clamped to 64.
pub fn bits_needed(a: i64, b: i64) -> u32 {
    if a == b {
        return 0;
    }
    let span = (b as i128 - a as i128) as u128;
    let count = span + 1;
    if count - 1 == 0 {
        return 1;
    }
    (128 - (count - 1).leading_zeros()).min(64)
}

/// Big-endian, high-bit-continuation variable-length integer (MIDI-VLQ
/// style): 7 payload bits per byte, most-significant group first, every
/// byte but the last has its high bit set.
pub mod varint {
    pub fn encode(mut value: u64) -> Vec<u8> {
        let mut groups = vec![(value & 0x7F) as u8];
        value >>= 7;
        while value > 0 {
            groups.push((value & 0x7F) as u8);
            value >>= 7;
        }
        groups.reverse();
        let last = groups.len() - 1;
        for b in &mut groups[..last] {
            *b |= 0x80;
        }
        groups
    }

    /// Returns `(value, bytes_consumed)` if `data` holds a complete varint.
    pub fn decode(data: &[u8]) -> Option<(u64, usize)> {
        let mut value: u64 = 0;
        for (i, &b) in data.iter().enumerate() {
            value = (value << 7) | (b & 0x7F) as u64;
            if b & 0x80 == 0 {
                return Some((value, i + 1));
            }
        }
        None
    }
}

/// Bit-packed integer encoder. Records are stored as `value - min` in
/// `bits_needed(min, max)` bits, least-significant-bit first within a
/// byte.
pub struct IntegerEncoder {
    bits: u32,
    min: i64,
    acc: u128,
    acc_bits: u32,
    bytes: Vec<u8>,
}

impl IntegerEncoder {
    pub fn new(bits: u32, min: i64) -> Self {
        IntegerEncoder {
            bits,
            min,
            acc: 0,
            acc_bits: 0,
            bytes: Vec::new(),
        }
    }

    pub fn push(&mut self, value: i64) {
        if self.bits == 0 {
            return;
        }
        // Widen to i128 before subtracting: at 64 bits (`new_integer(_, i64::MIN, i64::MAX)`)
        // `value - self.min` can overflow i64 even though the result always
        // fits in u64.
        let raw = ((value as i128) - (self.min as i128)) as u128;
        self.acc |= raw << self.acc_bits;
        self.acc_bits += self.bits;
        while self.acc_bits >= 8 {
            self.bytes.push((self.acc & 0xFF) as u8);
            self.acc >>= 8;
            self.acc_bits -= 8;
        }
    }

    /// Complete bytes emitted so far; any partial trailing bits stay
    /// buffered until enough accumulate or `flush()` is called.
    pub fn take_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }

    /// Bytes currently staged, without draining them.
    pub fn staged_len(&self) -> usize {
        self.bytes.len()
    }

    /// Pad the trailing partial byte with zeros. Only valid at section end.
    pub fn flush(&mut self) -> Vec<u8> {
        if self.acc_bits > 0 {
            self.bytes.push((self.acc & 0xFF) as u8);
            self.acc = 0;
            self.acc_bits = 0;
        }
        self.take_bytes()
    }
}

/// Decoder side of [`IntegerEncoder`]. `feed` is resumable: it consumes
/// whole bytes only and carries leftover bits across calls.
pub struct IntegerDecoder {
    bits: u32,
    min: i64,
    acc: u128,
    acc_bits: u32,
}

impl IntegerDecoder {
    pub fn new(bits: u32, min: i64) -> Self {
        IntegerDecoder {
            bits,
            min,
            acc: 0,
            acc_bits: 0,
        }
    }

    /// Decode up to `want` records from `data`. Returns the values produced
    /// and the number of bytes of `data` consumed.
    pub fn feed(&mut self, data: &[u8], want: usize) -> (Vec<i64>, usize) {
        if self.bits == 0 {
            return (vec![self.min; want], 0);
        }
        let mask: u128 = if self.bits >= 128 { u128::MAX } else { (1u128 << self.bits) - 1 };
        let mut byte_idx = 0;
        let mut out = Vec::with_capacity(want);
        while out.len() < want {
            while self.acc_bits < self.bits && byte_idx < data.len() {
                self.acc |= (data[byte_idx] as u128) << self.acc_bits;
                self.acc_bits += 8;
                byte_idx += 1;
            }
            if self.acc_bits < self.bits {
                break;
            }
            let raw = (self.acc & mask) as u64;
            out.push((raw as i128 + self.min as i128) as i64);
            self.acc >>= self.bits;
            self.acc_bits -= self.bits;
        }
        (out, byte_idx)
    }
}

/// Raw little-endian float passthrough, 4 bytes (single) or 8 (double).
pub struct FloatEncoder {
    precision: Precision,
    bytes: Vec<u8>,
}

impl FloatEncoder {
    pub fn new(precision: Precision) -> Self {
        FloatEncoder { precision, bytes: Vec::new() }
    }

    pub fn push(&mut self, value: f64) {
        match self.precision {
            Precision::Single => self.bytes.extend_from_slice(&(value as f32).to_le_bytes()),
            Precision::Double => self.bytes.extend_from_slice(&value.to_le_bytes()),
        }
    }

    pub fn take_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }

    pub fn staged_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn flush(&mut self) -> Vec<u8> {
        self.take_bytes()
    }
}

pub struct FloatDecoder {
    precision: Precision,
    width: usize,
    leftover: Vec<u8>,
}

impl FloatDecoder {
    pub fn new(precision: Precision) -> Self {
        let width = match precision {
            Precision::Single => 4,
            Precision::Double => 8,
        };
        FloatDecoder { precision, width, leftover: Vec::new() }
    }

    pub fn feed(&mut self, data: &[u8], want: usize) -> (Vec<f64>, usize) {
        let mut out = Vec::with_capacity(want);
        let mut idx = 0;
        let mut buf = std::mem::take(&mut self.leftover);
        while out.len() < want {
            while buf.len() < self.width && idx < data.len() {
                buf.push(data[idx]);
                idx += 1;
            }
            if buf.len() < self.width {
                break;
            }
            let value = match self.precision {
                Precision::Single => f32::from_le_bytes(buf[..4].try_into().unwrap()) as f64,
                Precision::Double => f64::from_le_bytes(buf[..8].try_into().unwrap()),
            };
            out.push(value);
            buf.clear();
        }
        self.leftover = buf;
        (out, idx)
    }
}

/// Length-prefixed UTF-8, prefix encoded with [`varint`].
pub struct StringEncoder {
    bytes: Vec<u8>,
}

impl StringEncoder {
    pub fn new() -> Self {
        StringEncoder { bytes: Vec::new() }
    }

    pub fn push(&mut self, value: &str) {
        self.bytes.extend_from_slice(&varint::encode(value.len() as u64));
        self.bytes.extend_from_slice(value.as_bytes());
    }

    pub fn take_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }

    pub fn staged_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn flush(&mut self) -> Vec<u8> {
        self.take_bytes()
    }
}

impl Default for StringEncoder {
    fn default() -> Self {
        Self::new()
    }
}

enum StringDecodeState {
    Length(Vec<u8>),
    Value { len: usize, buf: Vec<u8> },
}

pub struct StringDecoder {
    state: StringDecodeState,
}

impl StringDecoder {
    pub fn new() -> Self {
        StringDecoder { state: StringDecodeState::Length(Vec::new()) }
    }

    pub fn feed(&mut self, data: &[u8], want: usize) -> Result<(Vec<String>, usize), E57Error> {
        let mut out = Vec::with_capacity(want);
        let mut idx = 0;
        while out.len() < want && idx < data.len() {
            match &mut self.state {
                StringDecodeState::Length(buf) => {
                    let byte = data[idx];
                    buf.push(byte);
                    idx += 1;
                    if byte & 0x80 == 0 {
                        let (len, _) = varint::decode(buf).expect("terminated varint is complete");
                        self.state = StringDecodeState::Value { len: len as usize, buf: Vec::new() };
                    }
                },
                StringDecodeState::Value { len, buf } => {
                    let need = *len - buf.len();
                    let take = need.min(data.len() - idx);
                    buf.extend_from_slice(&data[idx..idx + take]);
                    idx += take;
                    if buf.len() == *len {
                        let bytes = std::mem::take(buf);
                        let s = String::from_utf8(bytes)?;
                        out.push(s);
                        self.state = StringDecodeState::Length(Vec::new());
                    }
                },
            }
        }
        Ok((out, idx))
    }
}

impl Default for StringDecoder {
    fn default() -> Self {
        Self::new()
    }
}
