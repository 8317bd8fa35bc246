//! Human-readable frame summaries for captured messages.
//!
//! Descriptions are best-effort: a frame that does not parse yields an
//! empty string rather than an error, since the ring must accept whatever
//! actually crossed the wire.

use crate::capture::ring::Direction;

/// Wire framing of the adapter that owns the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFlavor {
    ModbusTcp,
    ModbusRtu,
    Iec104,
    Dlt645,
}

/// Summarize a frame.
pub fn describe(flavor: FrameFlavor, direction: Direction, bytes: &[u8]) -> String {
    match flavor {
        FrameFlavor::ModbusTcp => describe_modbus_tcp(bytes),
        FrameFlavor::ModbusRtu => describe_modbus_rtu(bytes),
        FrameFlavor::Iec104 => describe_iec104(bytes),
        FrameFlavor::Dlt645 => describe_dlt645(direction, bytes),
    }
}

fn function_name(code: u8) -> &'static str {
    match code {
        0x01 => "读线圈",
        0x02 => "读离散输入",
        0x03 => "读保持寄存器",
        0x04 => "读输入寄存器",
        0x05 => "写单线圈",
        0x06 => "写单寄存器",
        0x0F => "写多线圈",
        0x10 => "写多寄存器",
        _ => "未知功能",
    }
}

fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "非法功能",
        0x02 => "非法数据地址",
        0x03 => "非法数据值",
        0x04 => "从机故障",
        _ => "异常",
    }
}

fn describe_modbus_tcp(bytes: &[u8]) -> String {
    if bytes.len() < 8 {
        return String::new();
    }
    let unit = bytes[6];
    describe_modbus_pdu(unit, &bytes[7..])
}

fn describe_modbus_rtu(bytes: &[u8]) -> String {
    // slave + pdu + 2-byte CRC
    if bytes.len() < 4 {
        return String::new();
    }
    describe_modbus_pdu(bytes[0], &bytes[1..bytes.len() - 2])
}

fn describe_modbus_pdu(unit: u8, pdu: &[u8]) -> String {
    if pdu.is_empty() {
        return String::new();
    }
    let fc = pdu[0];
    if fc & 0x80 != 0 {
        let exc = pdu.get(1).copied().unwrap_or(0);
        return format!(
            "从机{} {} 异常响应({})",
            unit,
            function_name(fc & 0x7F),
            exception_name(exc)
        );
    }
    let name = function_name(fc);
    match fc {
        0x01..=0x04 => {
            if pdu.len() == 5 {
                let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
                let qty = u16::from_be_bytes([pdu[3], pdu[4]]);
                format!("从机{unit} {name} 请求 起始:0x{addr:04X} 数量:{qty}")
            } else if pdu.len() >= 2 {
                format!("从机{unit} {name} 响应 {}字节", pdu[1])
            } else {
                format!("从机{unit} {name}")
            }
        }
        0x05 | 0x06 => {
            if pdu.len() >= 5 {
                let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
                let value = u16::from_be_bytes([pdu[3], pdu[4]]);
                format!("从机{unit} {name} 地址:0x{addr:04X} 值:0x{value:04X}")
            } else {
                format!("从机{unit} {name}")
            }
        }
        0x0F | 0x10 => {
            if pdu.len() >= 5 {
                let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
                let qty = u16::from_be_bytes([pdu[3], pdu[4]]);
                format!("从机{unit} {name} 起始:0x{addr:04X} 数量:{qty}")
            } else {
                format!("从机{unit} {name}")
            }
        }
        _ => format!("从机{unit} {name}"),
    }
}

fn iec104_type_name(type_id: u8) -> &'static str {
    match type_id {
        1 => "单点遥信",
        3 => "双点遥信",
        9 => "归一化遥测",
        11 => "标度化遥测",
        13 => "短浮点遥测",
        30 => "单点遥信(CP56)",
        36 => "短浮点遥测(CP56)",
        45 => "单点遥控",
        46 => "双点遥控",
        48 => "设定值(归一化)",
        50 => "设定值(短浮点)",
        100 => "总召唤",
        103 => "时钟同步",
        _ => "未知类型",
    }
}

fn iec104_cot_name(cot: u8) -> &'static str {
    match cot {
        1 => "周期传送",
        2 => "背景扫描",
        3 => "突发",
        4 => "初始化",
        5 => "请求",
        6 => "激活",
        7 => "激活确认",
        8 => "停止激活",
        9 => "停止激活确认",
        10 => "激活终止",
        20 => "响应总召唤",
        _ => "未知原因",
    }
}

fn describe_iec104(bytes: &[u8]) -> String {
    if bytes.len() < 6 || bytes[0] != 0x68 {
        return String::new();
    }
    let ctrl = &bytes[2..6];

    if ctrl[0] & 0x03 == 0x03 {
        // U-frame
        let name = match ctrl[0] {
            0x07 => "STARTDT_ACT",
            0x0B => "STARTDT_CON",
            0x13 => "STOPDT_ACT",
            0x23 => "STOPDT_CON",
            0x43 => "TESTFR_ACT",
            0x83 => "TESTFR_CON",
            _ => "未知U帧",
        };
        return format!("U帧 {name}");
    }

    if ctrl[0] & 0x01 == 0x01 {
        // S-frame
        let recv_seq = (u16::from_le_bytes([ctrl[2], ctrl[3]])) >> 1;
        return format!("S帧 确认接收序号:{recv_seq}");
    }

    // I-frame: TypeID + VSQ + COT(2) + CommonAddress(2) + IOA(3) + value
    if bytes.len() < 14 {
        return String::new();
    }
    let type_id = bytes[6];
    let cot = bytes[8] & 0x3F;
    let ioa = u32::from_le_bytes([bytes[12], bytes[13], *bytes.get(14).unwrap_or(&0), 0]);
    format!(
        "{} IOA:{} ({})",
        iec104_type_name(type_id),
        ioa,
        iec104_cot_name(cot)
    )
}

fn describe_dlt645(direction: Direction, bytes: &[u8]) -> String {
    if bytes.len() < 12 || bytes[0] != 0x68 || bytes[7] != 0x68 {
        return String::new();
    }
    let ctrl = bytes[8];
    let len = bytes[9] as usize;
    let data = &bytes[10..bytes.len().saturating_sub(2).min(10 + len)];

    let di = if data.len() >= 4 {
        let raw: Vec<u8> = data[..4].iter().map(|b| b.wrapping_sub(0x33)).collect();
        Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    } else {
        None
    };

    let action = match ctrl {
        0x11 => "读数据",
        0x91 => "读数据应答",
        0xD1 => "读数据异常",
        0x14 => "写数据",
        0x94 => "写数据应答",
        0xD4 => "写数据异常",
        _ => return format!("控制码:0x{ctrl:02X} ({})", direction.as_str()),
    };

    match di {
        Some(di) => format!("{action} DI:0x{di:08X}"),
        None => action.to_string(),
    }
}
