//! IEC 60870-5-104 APDU build and parse.
//!
//! The simulator speaks a deliberately small dialect: single-object
//! ASDUs, the U-frame handshakes, S-frame acknowledgements, general
//! interrogation and clock sync. Everything starts with 0x68 followed by
//! a length byte covering the four control octets and the ASDU.

use crate::core::error::{Result, SimError};

/// ASDU type identifiers used by the simulator.
pub mod type_id {
    /// Single-point information (遥信)
    pub const M_SP_NA_1: u8 = 1;
    /// Double-point information
    pub const M_DP_NA_1: u8 = 3;
    /// Measured value, normalized (遥测)
    pub const M_ME_NA_1: u8 = 9;
    /// Measured value, short float (遥测)
    pub const M_ME_NC_1: u8 = 13;
    /// Single command (遥控)
    pub const C_SC_NA_1: u8 = 45;
    /// Double command
    pub const C_DC_NA_1: u8 = 46;
    /// Set-point command, short float (遥调)
    pub const C_SE_NC_1: u8 = 50;
    /// General interrogation
    pub const C_IC_NA_1: u8 = 100;
    /// Clock synchronization
    pub const C_CS_NA_1: u8 = 103;

    /// Whether frames of this type flow in the monitoring direction.
    pub fn is_monitoring(id: u8) -> bool {
        matches!(id, M_SP_NA_1 | M_DP_NA_1 | M_ME_NA_1 | M_ME_NC_1)
    }
}

/// Cause-of-transmission values.
pub mod cot {
    pub const PERIODIC: u8 = 1;
    pub const SPONTANEOUS: u8 = 3;
    pub const REQUEST: u8 = 5;
    pub const ACTIVATION: u8 = 6;
    pub const ACTIVATION_CON: u8 = 7;
    pub const ACTIVATION_TERM: u8 = 10;
    pub const INTERROGATED: u8 = 20;
}

/// U-frame functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UFrame {
    StartDtAct,
    StartDtCon,
    StopDtAct,
    StopDtCon,
    TestFrAct,
    TestFrCon,
}

impl UFrame {
    fn control_byte(&self) -> u8 {
        match self {
            Self::StartDtAct => 0x07,
            Self::StartDtCon => 0x0B,
            Self::StopDtAct => 0x13,
            Self::StopDtCon => 0x23,
            Self::TestFrAct => 0x43,
            Self::TestFrCon => 0x83,
        }
    }

    fn from_control_byte(b: u8) -> Option<Self> {
        match b {
            0x07 => Some(Self::StartDtAct),
            0x0B => Some(Self::StartDtCon),
            0x13 => Some(Self::StopDtAct),
            0x23 => Some(Self::StopDtCon),
            0x43 => Some(Self::TestFrAct),
            0x83 => Some(Self::TestFrCon),
            _ => None,
        }
    }
}

/// A single-object ASDU.
#[derive(Debug, Clone, PartialEq)]
pub struct Asdu {
    pub type_id: u8,
    pub cot: u8,
    pub common_address: u16,
    /// Information object address.
    pub ioa: u32,
    /// Object value: 0/1 for points and commands, engineering value for
    /// measured values and set-points.
    pub value: f64,
}

/// One APDU.
#[derive(Debug, Clone, PartialEq)]
pub enum Apdu {
    I {
        send_seq: u16,
        recv_seq: u16,
        asdu: Asdu,
    },
    S {
        recv_seq: u16,
    },
    U(UFrame),
}

impl Apdu {
    /// Encode into wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(4 + 16);
        match self {
            Self::U(u) => {
                body.extend_from_slice(&[u.control_byte(), 0x00, 0x00, 0x00]);
            }
            Self::S { recv_seq } => {
                body.extend_from_slice(&[0x01, 0x00]);
                body.extend_from_slice(&(recv_seq << 1).to_le_bytes());
            }
            Self::I {
                send_seq,
                recv_seq,
                asdu,
            } => {
                body.extend_from_slice(&(send_seq << 1).to_le_bytes());
                body.extend_from_slice(&(recv_seq << 1).to_le_bytes());
                encode_asdu(asdu, &mut body);
            }
        }
        let mut frame = Vec::with_capacity(2 + body.len());
        frame.push(0x68);
        frame.push(body.len() as u8);
        frame.extend_from_slice(&body);
        frame
    }

    /// Decode one APDU from `bytes` (exactly one frame).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 6 || bytes[0] != 0x68 {
            return Err(SimError::transient("malformed APDU"));
        }
        let length = bytes[1] as usize;
        if bytes.len() != length + 2 || length < 4 {
            return Err(SimError::transient("APDU length mismatch"));
        }
        let ctrl = &bytes[2..6];

        if ctrl[0] & 0x03 == 0x03 {
            let u = UFrame::from_control_byte(ctrl[0])
                .ok_or_else(|| SimError::transient("unknown U-frame"))?;
            return Ok(Self::U(u));
        }
        if ctrl[0] & 0x01 == 0x01 {
            let recv_seq = u16::from_le_bytes([ctrl[2], ctrl[3]]) >> 1;
            return Ok(Self::S { recv_seq });
        }

        let send_seq = u16::from_le_bytes([ctrl[0], ctrl[1]]) >> 1;
        let recv_seq = u16::from_le_bytes([ctrl[2], ctrl[3]]) >> 1;
        let asdu = decode_asdu(&bytes[6..])?;
        Ok(Self::I {
            send_seq,
            recv_seq,
            asdu,
        })
    }
}

fn encode_asdu(asdu: &Asdu, out: &mut Vec<u8>) {
    out.push(asdu.type_id);
    out.push(0x01); // VSQ: one object
    out.push(asdu.cot & 0x3F);
    out.push(0x00); // originator address
    out.extend_from_slice(&asdu.common_address.to_le_bytes());
    out.extend_from_slice(&asdu.ioa.to_le_bytes()[..3]);

    match asdu.type_id {
        type_id::M_SP_NA_1 | type_id::M_DP_NA_1 => {
            out.push((asdu.value != 0.0) as u8);
        }
        type_id::M_ME_NA_1 => {
            out.extend_from_slice(&(asdu.value as i16).to_le_bytes());
            out.push(0x00); // QDS: good
        }
        type_id::M_ME_NC_1 => {
            out.extend_from_slice(&(asdu.value as f32).to_le_bytes());
            out.push(0x00); // QDS: good
        }
        type_id::C_SC_NA_1 | type_id::C_DC_NA_1 => {
            out.push((asdu.value != 0.0) as u8); // SCO/DCO
        }
        type_id::C_SE_NC_1 => {
            out.extend_from_slice(&(asdu.value as f32).to_le_bytes());
            out.push(0x00); // QOS
        }
        type_id::C_IC_NA_1 => {
            out.push(0x14); // QOI: station interrogation
        }
        type_id::C_CS_NA_1 => {
            out.extend_from_slice(&[0u8; 7]); // CP56Time2a placeholder
        }
        _ => {}
    }
}

fn decode_asdu(bytes: &[u8]) -> Result<Asdu> {
    if bytes.len() < 9 {
        return Err(SimError::transient("short ASDU"));
    }
    let type_id = bytes[0];
    let cot = bytes[2] & 0x3F;
    let common_address = u16::from_le_bytes([bytes[4], bytes[5]]);
    let ioa = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], 0]);
    let payload = &bytes[9..];

    let value = match type_id {
        type_id::M_SP_NA_1 | type_id::M_DP_NA_1 | type_id::C_SC_NA_1 | type_id::C_DC_NA_1 => {
            (payload.first().copied().unwrap_or(0) & 0x01) as f64
        }
        type_id::M_ME_NA_1 => {
            if payload.len() < 2 {
                return Err(SimError::transient("short normalized value"));
            }
            i16::from_le_bytes([payload[0], payload[1]]) as f64
        }
        type_id::M_ME_NC_1 | type_id::C_SE_NC_1 => {
            if payload.len() < 4 {
                return Err(SimError::transient("short float value"));
            }
            f32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as f64
        }
        _ => 0.0,
    };

    Ok(Asdu {
        type_id,
        cot,
        common_address,
        ioa,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u_frame_roundtrip() {
        for u in [
            UFrame::StartDtAct,
            UFrame::StartDtCon,
            UFrame::StopDtAct,
            UFrame::StopDtCon,
            UFrame::TestFrAct,
            UFrame::TestFrCon,
        ] {
            let frame = Apdu::U(u).encode();
            assert_eq!(frame.len(), 6);
            assert_eq!(Apdu::decode(&frame).unwrap(), Apdu::U(u));
        }
    }

    #[test]
    fn test_s_frame_roundtrip() {
        let frame = Apdu::S { recv_seq: 1234 }.encode();
        assert_eq!(Apdu::decode(&frame).unwrap(), Apdu::S { recv_seq: 1234 });
    }

    #[test]
    fn test_short_float_roundtrip() {
        let apdu = Apdu::I {
            send_seq: 5,
            recv_seq: 7,
            asdu: Asdu {
                type_id: type_id::M_ME_NC_1,
                cot: cot::SPONTANEOUS,
                common_address: 1,
                ioa: 16385,
                value: 230.0,
            },
        };
        let frame = apdu.encode();
        assert_eq!(frame[0], 0x68);
        assert_eq!(Apdu::decode(&frame).unwrap(), apdu);
    }

    #[test]
    fn test_single_point_roundtrip() {
        let apdu = Apdu::I {
            send_seq: 0,
            recv_seq: 0,
            asdu: Asdu {
                type_id: type_id::M_SP_NA_1,
                cot: cot::INTERROGATED,
                common_address: 1,
                ioa: 3,
                value: 1.0,
            },
        };
        assert_eq!(Apdu::decode(&apdu.encode()).unwrap(), apdu);
    }

    #[test]
    fn test_interrogation_command() {
        let apdu = Apdu::I {
            send_seq: 0,
            recv_seq: 0,
            asdu: Asdu {
                type_id: type_id::C_IC_NA_1,
                cot: cot::ACTIVATION,
                common_address: 1,
                ioa: 0,
                value: 0.0,
            },
        };
        let frame = apdu.encode();
        // QOI byte is present after the IOA.
        assert_eq!(*frame.last().unwrap(), 0x14);
        assert_eq!(Apdu::decode(&frame).unwrap(), apdu);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Apdu::decode(&[0x67, 0x04, 0, 0, 0, 0]).is_err());
        assert!(Apdu::decode(&[0x68, 0x10, 0, 0]).is_err());
    }
}
