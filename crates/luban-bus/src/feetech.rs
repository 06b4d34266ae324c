//! Feetech 串行总线后端
//!
//! 半双工指令/状态包协议（与 Dynamixel 1.0 同构）：
//!
//! ```text
//! 指令包: FF FF | ID | LEN | INSTR | PARAM.. | CHK
//! 状态包: FF FF | ID | LEN | ERR   | DATA..  | CHK
//! ```
//!
//! `LEN` = 参数字节数 + 2，`CHK` = `~(ID + LEN + .. ) & 0xFF`。
//! STS 系列 16 位寄存器为小端（低字节在前）。
//!
//! 状态包的 ERR 字节携带舵机侧硬件标志，其中 bit0（欠压）被分类为
//! 瞬态 [`BusError::Voltage`]；其余标志位不阻断本次读数，只记录日志。

use crate::{BusError, Register, ServoId, Transport};
use serialport::{ClearBuffer, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, warn};

const HEADER: [u8; 2] = [0xFF, 0xFF];
const INSTR_READ: u8 = 0x02;
const INSTR_WRITE: u8 = 0x03;

/// 舵机侧欠压标志（状态包 ERR bit0）
const ERR_VOLTAGE: u8 = 0x01;

/// 单次状态包等待时间
///
/// 1 Mbps 下一个完整状态包 < 1ms；20ms 余量覆盖舵机的应答延迟。
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(20);

/// Feetech 串行总线
///
/// 一个实例独占一个串口。并发所有权由上层 `PortRegistry` 仲裁，
/// 本层不做任何锁。
pub struct FeetechBus {
    port: Option<Box<dyn SerialPort>>,
    port_name: String,
}

impl FeetechBus {
    /// 打开串口
    ///
    /// # 错误
    ///
    /// 设备不存在或权限不足时返回错误。这是唯一向调用方抛出硬错误的
    /// 连接路径；打开之后的单次读写失败都以 `BusError` 返回给弹性层分类。
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, BusError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(RESPONSE_TIMEOUT)
            .open()
            .map_err(|e| {
                BusError::Io(std::io::Error::other(format!(
                    "failed to open {port_name}: {e}"
                )))
            })?;

        debug!(port = port_name, baud = baud_rate, "serial port opened");

        Ok(Self {
            port: Some(port),
            port_name: port_name.to_string(),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// 组指令包
    fn build_frame(id: ServoId, instr: u8, params: &[u8]) -> Vec<u8> {
        let len = (params.len() + 2) as u8;
        let mut frame = Vec::with_capacity(params.len() + 6);
        frame.extend_from_slice(&HEADER);
        frame.push(id);
        frame.push(len);
        frame.push(instr);
        frame.extend_from_slice(params);
        frame.push(checksum(&frame[2..]));
        frame
    }

    /// 发送指令包并读取状态包，返回状态包的数据段
    fn transact(&mut self, id: ServoId, instr: u8, params: &[u8]) -> Result<Vec<u8>, BusError> {
        let port = self.port.as_mut().ok_or(BusError::NotConnected)?;

        // 半双工总线：丢弃上一次事务可能残留的字节
        let _ = port.clear(ClearBuffer::Input);

        let frame = Self::build_frame(id, instr, params);
        port.write_all(&frame).map_err(|e| classify_io(id, e))?;
        port.flush().map_err(|e| classify_io(id, e))?;

        // 状态包头：FF FF ID LEN
        let mut head = [0u8; 4];
        read_exact(port, id, &mut head)?;

        if head[0..2] != HEADER {
            return Err(BusError::CorruptPacket {
                id,
                reason: format!("bad header {:02X} {:02X}", head[0], head[1]),
            });
        }
        if head[2] != id {
            return Err(BusError::Protocol(format!(
                "response from servo {} while addressing {}",
                head[2], id
            )));
        }

        let len = head[3] as usize;
        if !(2..=16).contains(&len) {
            return Err(BusError::CorruptPacket {
                id,
                reason: format!("implausible length {len}"),
            });
        }

        // ERR + DATA.. + CHK
        let mut tail = vec![0u8; len];
        read_exact(port, id, &mut tail)?;

        let mut sum_input = Vec::with_capacity(len + 2);
        sum_input.extend_from_slice(&head[2..]);
        sum_input.extend_from_slice(&tail[..len - 1]);
        let expected = checksum(&sum_input);
        let actual = tail[len - 1];
        if expected != actual {
            return Err(BusError::CorruptPacket {
                id,
                reason: format!("checksum mismatch: expected {expected:02X}, got {actual:02X}"),
            });
        }

        let err_bits = tail[0];
        if err_bits & ERR_VOLTAGE != 0 {
            return Err(BusError::Voltage { id, bits: err_bits });
        }
        if err_bits != 0 {
            // 过热/过载等舵机侧标志；数据本身有效，交由遥测观察
            warn!(servo = id, bits = err_bits, "servo hardware status flags set");
        }

        Ok(tail[1..len - 1].to_vec())
    }
}

impl Transport for FeetechBus {
    fn read(&mut self, reg: Register, id: ServoId) -> Result<i32, BusError> {
        let params = [reg.address(), reg.width() as u8];
        let data = self.transact(id, INSTR_READ, &params)?;

        if data.len() != reg.width() {
            return Err(BusError::CorruptPacket {
                id,
                reason: format!(
                    "{} returned {} bytes, expected {}",
                    reg.name(),
                    data.len(),
                    reg.width()
                ),
            });
        }

        let raw = match reg.width() {
            1 => data[0] as u16,
            _ => u16::from_le_bytes([data[0], data[1]]),
        };
        Ok(decode_value(reg, raw))
    }

    fn write(&mut self, reg: Register, id: ServoId, value: i32) -> Result<(), BusError> {
        let raw = encode_value(reg, value);
        let mut params = vec![reg.address()];
        match reg.width() {
            1 => params.push(raw as u8),
            _ => params.extend_from_slice(&raw.to_le_bytes()),
        }
        self.transact(id, INSTR_WRITE, &params)?;
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "serial port released");
        }
    }
}

/// Feetech 校验和：`~sum & 0xFF`
fn checksum(bytes: &[u8]) -> u8 {
    let sum: u32 = bytes.iter().map(|&b| b as u32).sum();
    !(sum as u8)
}

/// 解码寄存器原始值（符号-幅值 → 有符号整数）
fn decode_value(reg: Register, raw: u16) -> i32 {
    if reg.sign_magnitude() {
        let magnitude = (raw & 0x7FFF) as i32;
        if raw & 0x8000 != 0 { -magnitude } else { magnitude }
    } else {
        raw as i32
    }
}

/// 编码寄存器写入值
fn encode_value(reg: Register, value: i32) -> u16 {
    if reg.sign_magnitude() {
        let magnitude = value.unsigned_abs().min(0x7FFF) as u16;
        if value < 0 { magnitude | 0x8000 } else { magnitude }
    } else {
        value.clamp(0, u16::MAX as i32) as u16
    }
}

fn classify_io(id: ServoId, e: std::io::Error) -> BusError {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::UnexpectedEof => {
            BusError::Timeout { id }
        },
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::ResourceBusy => {
            BusError::PortBusy(e.to_string())
        },
        _ => BusError::Io(e),
    }
}

fn read_exact(
    port: &mut Box<dyn SerialPort>,
    id: ServoId,
    buf: &mut [u8],
) -> Result<(), BusError> {
    Read::read_exact(port, buf).map_err(|e| classify_io(id, e))
}
