//! The Modbus server's local data model: per-slave banks of coils,
//! discrete inputs, holding registers and input registers.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;

use crate::codec::{self, CodecValue};
use crate::core::point::Point;
use crate::protocols::adapter::{bit_of, with_bit};
use crate::protocols::modbus::frame::{exception, function, MAX_READ_REGISTERS};

/// The four Modbus address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    Coils,
    DiscreteInputs,
    Holding,
    Input,
}

impl Space {
    /// Address space selected by a function code.
    pub fn of_function(function_code: u8) -> Option<Self> {
        match function_code {
            function::READ_COILS | function::WRITE_SINGLE_COIL | function::WRITE_MULTIPLE_COILS => {
                Some(Self::Coils)
            }
            function::READ_DISCRETE_INPUTS => Some(Self::DiscreteInputs),
            function::READ_HOLDING_REGISTERS
            | function::WRITE_SINGLE_REGISTER
            | function::WRITE_MULTIPLE_REGISTERS => Some(Self::Holding),
            function::READ_INPUT_REGISTERS => Some(Self::Input),
            _ => None,
        }
    }

    /// Whether this space stores single bits.
    #[inline]
    pub fn is_bit(&self) -> bool {
        matches!(self, Self::Coils | Self::DiscreteInputs)
    }
}

/// Register banks shared between the adapter surface and the connection
/// tasks serving the wire.
#[derive(Default)]
pub struct RegisterBank {
    coils: DashMap<(u8, u16), bool>,
    discrete_inputs: DashMap<(u8, u16), bool>,
    holding: DashMap<(u8, u16), u16>,
    input: DashMap<(u8, u16), u16>,
    slaves: RwLock<HashSet<u8>>,
}

impl RegisterBank {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a slave id so the server answers for it.
    pub fn add_slave(&self, slave_id: u8) {
        self.slaves.write().unwrap().insert(slave_id);
    }

    /// Whether the server answers for this slave.
    pub fn has_slave(&self, slave_id: u8) -> bool {
        self.slaves.read().unwrap().contains(&slave_id)
    }

    /// Make the span of a point addressable, zero-filled.
    pub fn register_point(&self, point: &Point) {
        self.add_slave(point.slave_id());
        let Some(space) = Space::of_function(point.function_code()) else {
            return;
        };
        let start = point.address() as u16;
        if space.is_bit() {
            self.bit_map(space).entry((point.slave_id(), start)).or_insert(false);
        } else {
            for offset in 0..point.register_count() {
                self.word_map(space)
                    .entry((point.slave_id(), start.wrapping_add(offset)))
                    .or_insert(0);
            }
        }
    }

    fn bit_map(&self, space: Space) -> &DashMap<(u8, u16), bool> {
        match space {
            Space::Coils => &self.coils,
            Space::DiscreteInputs => &self.discrete_inputs,
            _ => &self.coils,
        }
    }

    fn word_map(&self, space: Space) -> &DashMap<(u8, u16), u16> {
        match space {
            Space::Holding => &self.holding,
            Space::Input => &self.input,
            _ => &self.holding,
        }
    }

    /// Read a run of the bank as 0/1 or register words.
    pub fn read_words(&self, space: Space, slave_id: u8, start: u16, count: u16) -> Vec<u16> {
        (0..count)
            .map(|i| {
                let key = (slave_id, start.wrapping_add(i));
                if space.is_bit() {
                    self.bit_map(space).get(&key).map(|v| *v as u16).unwrap_or(0)
                } else {
                    self.word_map(space).get(&key).map(|v| *v).unwrap_or(0)
                }
            })
            .collect()
    }

    pub fn write_bit(&self, space: Space, slave_id: u8, address: u16, on: bool) {
        self.bit_map(space).insert((slave_id, address), on);
    }

    pub fn write_word(&self, space: Space, slave_id: u8, address: u16, value: u16) {
        self.word_map(space).insert((slave_id, address), value);
    }

    /// Read one point's raw register image out of the banks.
    pub fn read_point(&self, point: &Point) -> Option<i64> {
        let space = Space::of_function(point.function_code())?;
        let slave_id = point.slave_id();
        let address = point.address() as u16;

        if space.is_bit() {
            let words = self.read_words(space, slave_id, address, 1);
            return Some(words[0] as i64);
        }

        if point.kind().is_binary() {
            let word = self.read_words(space, slave_id, address, 1)[0];
            return Some(match point.bit() {
                Some(bit) => bit_of(word, bit),
                None => (word != 0) as i64,
            });
        }

        let words = self.read_words(space, slave_id, address, point.register_count());
        let bytes = codec::registers_to_bytes(&words);
        codec::unpack(point.decode_code(), &bytes).ok().map(|v| v.as_i64())
    }

    /// Write one point's raw register image into the banks.
    pub fn write_point(&self, point: &Point, raw: i64) -> bool {
        let Some(space) = Space::of_function(point.function_code()) else {
            return false;
        };
        let slave_id = point.slave_id();
        let address = point.address() as u16;

        if space.is_bit() {
            self.write_bit(space, slave_id, address, raw != 0);
            return true;
        }

        if point.kind().is_binary() {
            if let Some(bit) = point.bit() {
                let word = self.read_words(space, slave_id, address, 1)[0];
                self.write_word(space, slave_id, address, with_bit(word, bit, raw != 0));
            } else {
                self.write_word(space, slave_id, address, (raw != 0) as u16);
            }
            return true;
        }

        let value = if codec::is_float(point.decode_code()) {
            CodecValue::Float(raw as f64)
        } else {
            CodecValue::Integer(raw)
        };
        let Ok(bytes) = codec::pack(point.decode_code(), value) else {
            return false;
        };
        for (i, word) in codec::bytes_to_registers(&bytes).into_iter().enumerate() {
            self.write_word(space, slave_id, address.wrapping_add(i as u16), word);
        }
        true
    }

    /// Serve one request PDU against the banks.
    ///
    /// `None` means no response goes out (unknown slave); an exception
    /// PDU is produced for malformed requests.
    pub fn process_request(&self, slave_id: u8, pdu: &[u8]) -> Option<Vec<u8>> {
        use crate::protocols::modbus::frame::build_exception;

        if !self.has_slave(slave_id) {
            return None;
        }
        if pdu.is_empty() {
            return None;
        }
        let fc = pdu[0];

        let response = match fc {
            function::READ_COILS
            | function::READ_DISCRETE_INPUTS
            | function::READ_HOLDING_REGISTERS
            | function::READ_INPUT_REGISTERS => self.serve_read(slave_id, fc, pdu),
            function::WRITE_SINGLE_COIL => self.serve_write_single_coil(slave_id, pdu),
            function::WRITE_SINGLE_REGISTER => self.serve_write_single_register(slave_id, pdu),
            function::WRITE_MULTIPLE_COILS => self.serve_write_multiple_coils(slave_id, pdu),
            function::WRITE_MULTIPLE_REGISTERS => {
                self.serve_write_multiple_registers(slave_id, pdu)
            }
            _ => Err(exception::ILLEGAL_FUNCTION),
        };

        Some(response.unwrap_or_else(|code| build_exception(fc, code)))
    }

    fn serve_read(&self, slave_id: u8, fc: u8, pdu: &[u8]) -> std::result::Result<Vec<u8>, u8> {
        if pdu.len() != 5 {
            return Err(exception::ILLEGAL_DATA_VALUE);
        }
        let start = u16::from_be_bytes([pdu[1], pdu[2]]);
        let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
        let space = Space::of_function(fc).ok_or(exception::ILLEGAL_FUNCTION)?;

        if space.is_bit() {
            if quantity == 0 || quantity > 2000 {
                return Err(exception::ILLEGAL_DATA_VALUE);
            }
            let bits = self.read_words(space, slave_id, start, quantity);
            let byte_count = quantity.div_ceil(8) as usize;
            let mut response = vec![fc, byte_count as u8];
            response.resize(2 + byte_count, 0);
            for (i, bit) in bits.iter().enumerate() {
                if *bit != 0 {
                    response[2 + i / 8] |= 1 << (i % 8);
                }
            }
            Ok(response)
        } else {
            if quantity == 0 || quantity > MAX_READ_REGISTERS {
                return Err(exception::ILLEGAL_DATA_VALUE);
            }
            let words = self.read_words(space, slave_id, start, quantity);
            let mut response = vec![fc, (quantity * 2) as u8];
            for word in words {
                response.extend_from_slice(&word.to_be_bytes());
            }
            Ok(response)
        }
    }

    fn serve_write_single_coil(
        &self,
        slave_id: u8,
        pdu: &[u8],
    ) -> std::result::Result<Vec<u8>, u8> {
        if pdu.len() != 5 {
            return Err(exception::ILLEGAL_DATA_VALUE);
        }
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let value = u16::from_be_bytes([pdu[3], pdu[4]]);
        if value != 0x0000 && value != 0xFF00 {
            return Err(exception::ILLEGAL_DATA_VALUE);
        }
        self.write_bit(Space::Coils, slave_id, address, value == 0xFF00);
        Ok(pdu.to_vec())
    }

    fn serve_write_single_register(
        &self,
        slave_id: u8,
        pdu: &[u8],
    ) -> std::result::Result<Vec<u8>, u8> {
        if pdu.len() != 5 {
            return Err(exception::ILLEGAL_DATA_VALUE);
        }
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let value = u16::from_be_bytes([pdu[3], pdu[4]]);
        self.write_word(Space::Holding, slave_id, address, value);
        Ok(pdu.to_vec())
    }

    fn serve_write_multiple_coils(
        &self,
        slave_id: u8,
        pdu: &[u8],
    ) -> std::result::Result<Vec<u8>, u8> {
        if pdu.len() < 6 {
            return Err(exception::ILLEGAL_DATA_VALUE);
        }
        let start = u16::from_be_bytes([pdu[1], pdu[2]]);
        let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
        let byte_count = pdu[5] as usize;
        if quantity == 0 || quantity > 1968 || pdu.len() != 6 + byte_count {
            return Err(exception::ILLEGAL_DATA_VALUE);
        }
        for i in 0..quantity as usize {
            let on = (pdu[6 + i / 8] >> (i % 8)) & 1 != 0;
            self.write_bit(Space::Coils, slave_id, start.wrapping_add(i as u16), on);
        }
        Ok(pdu[..5].to_vec())
    }

    fn serve_write_multiple_registers(
        &self,
        slave_id: u8,
        pdu: &[u8],
    ) -> std::result::Result<Vec<u8>, u8> {
        if pdu.len() < 6 {
            return Err(exception::ILLEGAL_DATA_VALUE);
        }
        let start = u16::from_be_bytes([pdu[1], pdu[2]]);
        let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
        let byte_count = pdu[5] as usize;
        if quantity == 0 || quantity > 123 || byte_count != quantity as usize * 2 {
            return Err(exception::ILLEGAL_DATA_VALUE);
        }
        if pdu.len() != 6 + byte_count {
            return Err(exception::ILLEGAL_DATA_VALUE);
        }
        for i in 0..quantity as usize {
            let word = u16::from_be_bytes([pdu[6 + i * 2], pdu[7 + i * 2]]);
            self.write_word(Space::Holding, slave_id, start.wrapping_add(i as u16), word);
        }
        Ok(pdu[..5].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::point::PointKind;

    fn analog_point(code: &str, address: u32, decode_code: u8) -> Arc<Point> {
        Point::builder(PointKind::Analog, code, 1, address, 3)
            .decode_code(decode_code)
            .scaling(1.0, 0.0)
            .build()
    }

    #[test]
    fn test_point_roundtrip_through_bank() {
        let bank = RegisterBank::new();
        let p = analog_point("a", 0x0000, 0x41);
        bank.register_point(&p);
        assert!(bank.write_point(&p, -123456));
        assert_eq!(bank.read_point(&p), Some(-123456));
    }

    #[test]
    fn test_bit_point_read_modify_write() {
        let bank = RegisterBank::new();
        let p = Point::builder(PointKind::Signal, "b", 1, 0x0005, 3)
            .decode_code(0x20)
            .bit(3)
            .build();
        bank.register_point(&p);
        bank.write_word(Space::Holding, 1, 5, 0b0100_0001);
        assert!(bank.write_point(&p, 1));
        assert_eq!(bank.read_words(Space::Holding, 1, 5, 1)[0], 0b0100_1001);
        assert_eq!(bank.read_point(&p), Some(1));
    }

    #[test]
    fn test_serve_read_holding() {
        let bank = RegisterBank::new();
        bank.add_slave(1);
        bank.write_word(Space::Holding, 1, 0, 0x1234);
        bank.write_word(Space::Holding, 1, 1, 0x5678);
        let response = bank
            .process_request(1, &[0x03, 0x00, 0x00, 0x00, 0x02])
            .unwrap();
        assert_eq!(response, vec![0x03, 0x04, 0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_serve_unknown_slave_is_silent() {
        let bank = RegisterBank::new();
        bank.add_slave(1);
        assert!(bank.process_request(9, &[0x03, 0x00, 0x00, 0x00, 0x01]).is_none());
    }

    #[test]
    fn test_serve_illegal_function() {
        let bank = RegisterBank::new();
        bank.add_slave(1);
        let response = bank.process_request(1, &[0x2B, 0x00]).unwrap();
        assert_eq!(response, vec![0xAB, exception::ILLEGAL_FUNCTION]);
    }

    #[test]
    fn test_serve_oversized_read_rejected() {
        let bank = RegisterBank::new();
        bank.add_slave(1);
        let response = bank.process_request(1, &[0x03, 0x00, 0x00, 0x00, 0x7E]).unwrap();
        assert_eq!(response, vec![0x83, exception::ILLEGAL_DATA_VALUE]);
    }

    #[test]
    fn test_serve_write_single_register() {
        let bank = RegisterBank::new();
        bank.add_slave(1);
        let request = [0x06, 0x00, 0x10, 0xAB, 0xCD];
        let response = bank.process_request(1, &request).unwrap();
        assert_eq!(response, request.to_vec());
        assert_eq!(bank.read_words(Space::Holding, 1, 0x10, 1)[0], 0xABCD);
    }

    #[test]
    fn test_serve_coil_bitmap() {
        let bank = RegisterBank::new();
        bank.add_slave(1);
        bank.write_bit(Space::Coils, 1, 0, true);
        bank.write_bit(Space::Coils, 1, 2, true);
        let response = bank.process_request(1, &[0x01, 0x00, 0x00, 0x00, 0x03]).unwrap();
        assert_eq!(response, vec![0x01, 0x01, 0b0000_0101]);
    }
}
