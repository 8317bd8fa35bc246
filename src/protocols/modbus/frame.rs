//! Modbus framing: MBAP (TCP) and CRC-16 (RTU) envelopes plus PDU
//! builders and parsers shared by the server and client halves.

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};

use crate::core::error::{Result, SimError};

/// Maximum PDU size per the Modbus specification.
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum number of registers in one read request.
pub const MAX_READ_REGISTERS: u16 = 125;

pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Modbus function codes used by the simulator.
pub mod function {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
}

/// Modbus exception codes.
pub mod exception {
    pub const ILLEGAL_FUNCTION: u8 = 0x01;
    pub const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
    pub const ILLEGAL_DATA_VALUE: u8 = 0x03;
    pub const SLAVE_DEVICE_FAILURE: u8 = 0x04;
}

/// MBAP header of a Modbus TCP frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Remaining byte count: unit id + PDU.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Parse the fixed 7-byte header.
    pub fn decode(buf: &[u8; 7]) -> Result<Self> {
        let header = Self {
            transaction_id: u16::from_be_bytes([buf[0], buf[1]]),
            protocol_id: u16::from_be_bytes([buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]),
            unit_id: buf[6],
        };
        if header.protocol_id != 0 {
            return Err(SimError::transient(format!(
                "bad MBAP protocol id: {}",
                header.protocol_id
            )));
        }
        if header.length == 0 || header.length as usize > MAX_PDU_SIZE + 1 {
            return Err(SimError::transient(format!(
                "bad MBAP length: {}",
                header.length
            )));
        }
        Ok(header)
    }
}

/// Wrap a PDU in an MBAP envelope.
pub fn encode_mbap_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(7 + pdu.len());
    buf.put_u16(transaction_id);
    buf.put_u16(0); // protocol id
    buf.put_u16(pdu.len() as u16 + 1);
    buf.put_u8(unit_id);
    buf.put_slice(pdu);
    buf.to_vec()
}

/// Wrap a PDU in an RTU envelope (slave + PDU + CRC-16 little-endian).
pub fn encode_rtu_frame(slave_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(3 + pdu.len());
    buf.put_u8(slave_id);
    buf.put_slice(pdu);
    let crc = CRC16.checksum(&buf);
    buf.put_u16_le(crc);
    buf.to_vec()
}

/// Validate an RTU frame and split it into slave id and PDU.
pub fn decode_rtu_frame(frame: &[u8]) -> Result<(u8, &[u8])> {
    if frame.len() < 4 {
        return Err(SimError::transient("RTU frame too short"));
    }
    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let wire_crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let calc_crc = CRC16.checksum(body);
    if wire_crc != calc_crc {
        return Err(SimError::transient(format!(
            "RTU CRC mismatch: wire {wire_crc:04X}, calculated {calc_crc:04X}"
        )));
    }
    Ok((body[0], &body[1..]))
}

/// Build the PDU of a read request (FC 1/2/3/4).
pub fn build_read_request(function_code: u8, start: u16, quantity: u16) -> Vec<u8> {
    vec![
        function_code,
        (start >> 8) as u8,
        (start & 0xFF) as u8,
        (quantity >> 8) as u8,
        (quantity & 0xFF) as u8,
    ]
}

/// Build the PDU of a write-single-coil request (FC 5).
pub fn build_write_single_coil(address: u16, on: bool) -> Vec<u8> {
    let value: u16 = if on { 0xFF00 } else { 0x0000 };
    vec![
        function::WRITE_SINGLE_COIL,
        (address >> 8) as u8,
        (address & 0xFF) as u8,
        (value >> 8) as u8,
        (value & 0xFF) as u8,
    ]
}

/// Build the PDU of a write-single-register request (FC 6).
pub fn build_write_single_register(address: u16, value: u16) -> Vec<u8> {
    vec![
        function::WRITE_SINGLE_REGISTER,
        (address >> 8) as u8,
        (address & 0xFF) as u8,
        (value >> 8) as u8,
        (value & 0xFF) as u8,
    ]
}

/// Build the PDU of a write-multiple-registers request (FC 16).
pub fn build_write_multiple_registers(address: u16, values: &[u16]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(6 + values.len() * 2);
    pdu.push(function::WRITE_MULTIPLE_REGISTERS);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push((values.len() * 2) as u8);
    for v in values {
        pdu.extend_from_slice(&v.to_be_bytes());
    }
    pdu
}

/// Build an exception PDU.
pub fn build_exception(function_code: u8, exception_code: u8) -> Vec<u8> {
    vec![function_code | 0x80, exception_code]
}

/// Parse a read response PDU into register words.
///
/// Bit responses (FC 1/2) are expanded to one 0/1 word per point of the
/// requested quantity.
pub fn parse_read_response(function_code: u8, quantity: u16, pdu: &[u8]) -> Result<Vec<u16>> {
    if pdu.is_empty() {
        return Err(SimError::transient("empty response PDU"));
    }
    if pdu[0] == (function_code | 0x80) {
        let exc = pdu.get(1).copied().unwrap_or(0);
        return Err(SimError::transient(format!(
            "exception response: function 0x{function_code:02X}, code {exc}"
        )));
    }
    if pdu[0] != function_code {
        return Err(SimError::transient(format!(
            "function mismatch: sent 0x{:02X}, got 0x{:02X}",
            function_code, pdu[0]
        )));
    }
    if pdu.len() < 2 {
        return Err(SimError::transient("truncated response PDU"));
    }
    let byte_count = pdu[1] as usize;
    let data = &pdu[2..];
    if data.len() < byte_count {
        return Err(SimError::transient("short response data"));
    }

    match function_code {
        function::READ_COILS | function::READ_DISCRETE_INPUTS => {
            let mut words = Vec::with_capacity(quantity as usize);
            for i in 0..quantity as usize {
                let byte = data.get(i / 8).copied().unwrap_or(0);
                words.push(((byte >> (i % 8)) & 1) as u16);
            }
            Ok(words)
        }
        function::READ_HOLDING_REGISTERS | function::READ_INPUT_REGISTERS => Ok(data
            [..byte_count]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect()),
        other => Err(SimError::transient(format!(
            "unexpected read function 0x{other:02X}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mbap_roundtrip() {
        let frame = encode_mbap_frame(0x1234, 9, &[0x03, 0x00, 0x00, 0x00, 0x06]);
        assert_eq!(frame.len(), 12);
        let header = MbapHeader::decode(frame[..7].try_into().unwrap()).unwrap();
        assert_eq!(header.transaction_id, 0x1234);
        assert_eq!(header.unit_id, 9);
        assert_eq!(header.length, 6);
    }

    #[test]
    fn test_mbap_rejects_bad_protocol() {
        let buf = [0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x01];
        assert!(MbapHeader::decode(&buf).is_err());
    }

    #[test]
    fn test_rtu_roundtrip() {
        let frame = encode_rtu_frame(1, &[0x03, 0x00, 0x00, 0x00, 0x02]);
        let (slave, pdu) = decode_rtu_frame(&frame).unwrap();
        assert_eq!(slave, 1);
        assert_eq!(pdu, &[0x03, 0x00, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn test_rtu_crc_detects_corruption() {
        let mut frame = encode_rtu_frame(1, &[0x03, 0x00, 0x00, 0x00, 0x02]);
        frame[2] ^= 0xFF;
        assert!(decode_rtu_frame(&frame).is_err());
    }

    #[test]
    fn test_read_request_layout() {
        // The canonical batch read: slave-agnostic PDU `03 00 00 00 06`.
        let pdu = build_read_request(function::READ_HOLDING_REGISTERS, 0, 6);
        assert_eq!(pdu, vec![0x03, 0x00, 0x00, 0x00, 0x06]);
    }

    #[test]
    fn test_parse_register_response() {
        let pdu = [0x03, 0x04, 0x00, 0x01, 0x00, 0x02];
        let words = parse_read_response(0x03, 2, &pdu).unwrap();
        assert_eq!(words, vec![1, 2]);
    }

    #[test]
    fn test_parse_coil_response() {
        // 3 coils: bits 0 and 2 set.
        let pdu = [0x01, 0x01, 0b0000_0101];
        let words = parse_read_response(0x01, 3, &pdu).unwrap();
        assert_eq!(words, vec![1, 0, 1]);
    }

    #[test]
    fn test_parse_exception_response() {
        let pdu = [0x83, 0x02];
        let err = parse_read_response(0x03, 1, &pdu).unwrap_err();
        assert!(matches!(err, SimError::TransientIo(_)));
    }

    #[test]
    fn test_write_multiple_registers_layout() {
        let pdu = build_write_multiple_registers(0x0010, &[0xAABB, 0xCCDD]);
        assert_eq!(
            pdu,
            vec![0x10, 0x00, 0x10, 0x00, 0x02, 0x04, 0xAA, 0xBB, 0xCC, 0xDD]
        );
    }
}
