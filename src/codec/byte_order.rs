//! Register value packing and unpacking.
//!
//! All byte-layout decisions live here, driven by the decode table.
//! Buffers are always `register_count * 2` bytes; anything else is a
//! codec error.

use crate::codec::table::{self, CodecEntry, Endian, WordSwap};
use crate::core::error::{Result, SimError};

/// A value crossing the register boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CodecValue {
    /// Integer layouts (16/32/64-bit, signed or unsigned).
    Integer(i64),
    /// IEEE-754 layouts (f32 over 2 registers, f64 over 4).
    Float(f64),
}

impl CodecValue {
    /// View the value as f64.
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Integer(v) => *v as f64,
            Self::Float(v) => *v,
        }
    }

    /// View the value as i64, rounding floats.
    pub fn as_i64(&self) -> i64 {
        match self {
            Self::Integer(v) => *v,
            Self::Float(v) => v.round() as i64,
        }
    }
}

impl From<i64> for CodecValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for CodecValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// Pack a value into its wire representation.
///
/// Integer values are accepted for integer entries and floats for float
/// entries; the other combination is converted (floats are rounded).
pub fn pack(decode_code: u8, value: CodecValue) -> Result<Vec<u8>> {
    let entry = table::entry(decode_code);
    let mut buf = if entry.float {
        pack_float(&entry, value.as_f64())?
    } else {
        pack_int(&entry, value.as_i64())
    };
    if entry.word_swap == WordSwap::Pairwise {
        swap_words(&mut buf);
    }
    Ok(buf)
}

/// Unpack a wire buffer into a value.
///
/// Fails with a codec error when the buffer length does not match the
/// entry's register count.
pub fn unpack(decode_code: u8, bytes: &[u8]) -> Result<CodecValue> {
    let entry = table::entry(decode_code);
    if bytes.len() != entry.byte_len() {
        return Err(SimError::codec(format!(
            "decode 0x{decode_code:02X} expects {} bytes, got {}",
            entry.byte_len(),
            bytes.len()
        )));
    }

    let mut buf = bytes.to_vec();
    // Pairwise swap is an involution, so undoing it is the same operation.
    if entry.word_swap == WordSwap::Pairwise {
        swap_words(&mut buf);
    }

    if entry.float {
        unpack_float(&entry, &buf)
    } else {
        Ok(CodecValue::Integer(unpack_int(&entry, &buf)))
    }
}

fn pack_int(entry: &CodecEntry, value: i64) -> Vec<u8> {
    match (entry.register_count, entry.endian) {
        (1, Endian::Big) => (value as u16).to_be_bytes().to_vec(),
        (1, Endian::Little) => (value as u16).to_le_bytes().to_vec(),
        (2, Endian::Big) => (value as u32).to_be_bytes().to_vec(),
        (2, Endian::Little) => (value as u32).to_le_bytes().to_vec(),
        (4, Endian::Big) => (value as u64).to_be_bytes().to_vec(),
        (4, Endian::Little) => (value as u64).to_le_bytes().to_vec(),
        _ => (value as u16).to_be_bytes().to_vec(),
    }
}

fn pack_float(entry: &CodecEntry, value: f64) -> Result<Vec<u8>> {
    match (entry.register_count, entry.endian) {
        (2, Endian::Big) => Ok((value as f32).to_be_bytes().to_vec()),
        (2, Endian::Little) => Ok((value as f32).to_le_bytes().to_vec()),
        (4, Endian::Big) => Ok(value.to_be_bytes().to_vec()),
        (4, Endian::Little) => Ok(value.to_le_bytes().to_vec()),
        _ => Err(SimError::codec("float layout requires 2 or 4 registers")),
    }
}

fn unpack_int(entry: &CodecEntry, buf: &[u8]) -> i64 {
    match (entry.register_count, entry.endian, entry.signed) {
        (1, Endian::Big, false) => u16::from_be_bytes([buf[0], buf[1]]) as i64,
        (1, Endian::Big, true) => i16::from_be_bytes([buf[0], buf[1]]) as i64,
        (1, Endian::Little, false) => u16::from_le_bytes([buf[0], buf[1]]) as i64,
        (1, Endian::Little, true) => i16::from_le_bytes([buf[0], buf[1]]) as i64,
        (2, Endian::Big, false) => {
            u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as i64
        }
        (2, Endian::Big, true) => {
            i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as i64
        }
        (2, Endian::Little, false) => {
            u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as i64
        }
        (2, Endian::Little, true) => {
            i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as i64
        }
        (4, Endian::Big, _) => i64::from_be_bytes(buf[..8].try_into().unwrap_or([0; 8])),
        (4, Endian::Little, _) => i64::from_le_bytes(buf[..8].try_into().unwrap_or([0; 8])),
        _ => 0,
    }
}

fn unpack_float(entry: &CodecEntry, buf: &[u8]) -> Result<CodecValue> {
    let v = match (entry.register_count, entry.endian) {
        (2, Endian::Big) => f32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64,
        (2, Endian::Little) => f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64,
        (4, Endian::Big) => f64::from_be_bytes(buf[..8].try_into().unwrap_or([0; 8])),
        (4, Endian::Little) => f64::from_le_bytes(buf[..8].try_into().unwrap_or([0; 8])),
        _ => return Err(SimError::codec("float layout requires 2 or 4 registers")),
    };
    Ok(CodecValue::Float(v))
}

/// Exchange 16-bit words in 2-word units, in place.
///
/// A 2-byte buffer is untouched; 4 bytes become w1·w0; 8 bytes become
/// w1·w0·w3·w2.
fn swap_words(buf: &mut [u8]) {
    let words = buf.len() / 2;
    let mut i = 0;
    while i + 1 < words {
        for b in 0..2 {
            buf.swap(i * 2 + b, (i + 1) * 2 + b);
        }
        i += 2;
    }
}

/// Convert a slice of 16-bit registers (as carried on the Modbus wire,
/// high byte first) into the flat byte buffer the codec operates on.
pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(registers.len() * 2);
    for r in registers {
        out.extend_from_slice(&r.to_be_bytes());
    }
    out
}

/// Split a flat byte buffer back into 16-bit registers, high byte first.
pub fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_int(code: u8, value: i64) {
        let packed = pack(code, CodecValue::Integer(value)).unwrap();
        assert_eq!(packed.len(), table::entry(code).byte_len());
        let back = unpack(code, &packed).unwrap();
        assert_eq!(back, CodecValue::Integer(value), "code 0x{code:02X}");
    }

    #[test]
    fn test_roundtrip_16_bit() {
        roundtrip_int(0x20, 0);
        roundtrip_int(0x20, 65535);
        roundtrip_int(0x21, -32768);
        roundtrip_int(0x21, 32767);
        roundtrip_int(0xB1, -1234);
    }

    #[test]
    fn test_roundtrip_32_bit() {
        for code in [0x40, 0x43, 0xD0, 0xD4] {
            roundtrip_int(code, 0);
            roundtrip_int(code, u32::MAX as i64);
        }
        for code in [0x41, 0x44, 0xD1, 0xD5] {
            roundtrip_int(code, i32::MIN as i64);
            roundtrip_int(code, i32::MAX as i64);
        }
    }

    #[test]
    fn test_roundtrip_64_bit() {
        roundtrip_int(0x61, i64::MIN);
        roundtrip_int(0x61, i64::MAX);
        roundtrip_int(0x64, -987654321012345);
        roundtrip_int(0xE1, 123456789012345);
    }

    #[test]
    fn test_roundtrip_float() {
        for code in [0x42, 0x45, 0xD2, 0xD3] {
            let packed = pack(code, CodecValue::Float(230.5)).unwrap();
            let back = unpack(code, &packed).unwrap();
            assert_eq!(back, CodecValue::Float(230.5));
        }
        let packed = pack(0x62, CodecValue::Float(-0.125)).unwrap();
        assert_eq!(unpack(0x62, &packed).unwrap(), CodecValue::Float(-0.125));
    }

    #[test]
    fn test_big_endian_layout() {
        let packed = pack(0x41, CodecValue::Integer(0x01020304)).unwrap();
        assert_eq!(packed, vec![0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_little_endian_layout() {
        let packed = pack(0xD0, CodecValue::Integer(0x01020304)).unwrap();
        assert_eq!(packed, vec![0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_word_swap_two_words() {
        // 0x43 is u32 big-endian with pairwise swap: bytes become w1·w0.
        let packed = pack(0x43, CodecValue::Integer(0x01020304)).unwrap();
        assert_eq!(packed, vec![0x03, 0x04, 0x01, 0x02]);
    }

    #[test]
    fn test_word_swap_four_words() {
        let packed = pack(0x64, CodecValue::Integer(0x0102030405060708)).unwrap();
        assert_eq!(packed, vec![0x03, 0x04, 0x01, 0x02, 0x07, 0x08, 0x05, 0x06]);
    }

    #[test]
    fn test_word_swap_single_word_is_noop() {
        let packed = pack(0xB0, CodecValue::Integer(0x0102)).unwrap();
        assert_eq!(packed, vec![0x01, 0x02]);
    }

    #[test]
    fn test_unpack_length_mismatch() {
        let err = unpack(0x41, &[0x00, 0x01]).unwrap_err();
        assert!(matches!(err, SimError::Codec(_)));
    }

    #[test]
    fn test_register_conversion() {
        let bytes = registers_to_bytes(&[0x0102, 0x0304]);
        assert_eq!(bytes, vec![0x01, 0x02, 0x03, 0x04]);
        assert_eq!(bytes_to_registers(&bytes), vec![0x0102, 0x0304]);
    }
}
