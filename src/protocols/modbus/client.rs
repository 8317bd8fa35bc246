//! Modbus client adapter (TCP, and RTU over a serial line).
//!
//! One request is in flight at a time; the transport is a mutex so the
//! poll loop, the simulator and the operator API serialize naturally at
//! the frame boundary. Link state is self-healing: an I/O failure drops
//! the connection and the next request reconnects.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::capture::{FrameFlavor, MessageCapture};
use crate::codec::{self, CodecValue};
use crate::config::CAPTURE_CAPACITY;
use crate::core::error::{Result, SimError};
use crate::core::point::Point;
use crate::protocols::adapter::{with_bit, ProtocolAdapter, ProtocolKind};
use crate::protocols::modbus::frame::{
    self, build_read_request, build_write_single_coil, build_write_single_register,
    build_write_multiple_registers, encode_mbap_frame, function, parse_read_response,
    MbapHeader, MAX_READ_REGISTERS,
};

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Modbus client endpoint.
pub struct ModbusClientAdapter {
    kind: ProtocolKind,
    peer_addr: String,
    #[cfg(feature = "serial")]
    serial: Option<crate::config::SerialParams>,
    io_timeout: Duration,
    conn: Mutex<Option<Box<dyn Transport>>>,
    transaction_id: AtomicU16,
    capture: Arc<MessageCapture>,
    running: AtomicBool,
}

impl ModbusClientAdapter {
    /// TCP client targeting `peer_addr` (`ip:port`).
    pub fn tcp(peer_addr: impl Into<String>, io_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            kind: ProtocolKind::ModbusTcpClient,
            peer_addr: peer_addr.into(),
            #[cfg(feature = "serial")]
            serial: None,
            io_timeout,
            conn: Mutex::new(None),
            transaction_id: AtomicU16::new(0),
            capture: Arc::new(MessageCapture::new(CAPTURE_CAPACITY, FrameFlavor::ModbusTcp)),
            running: AtomicBool::new(false),
        })
    }

    /// RTU client speaking over a serial line.
    #[cfg(feature = "serial")]
    pub fn rtu(serial: crate::config::SerialParams, io_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            kind: ProtocolKind::ModbusRtuClient,
            peer_addr: String::new(),
            serial: Some(serial),
            io_timeout,
            conn: Mutex::new(None),
            transaction_id: AtomicU16::new(0),
            capture: Arc::new(MessageCapture::new(CAPTURE_CAPACITY, FrameFlavor::ModbusRtu)),
            running: AtomicBool::new(false),
        })
    }

    async fn open_transport(&self) -> Result<Box<dyn Transport>> {
        match self.kind {
            ProtocolKind::ModbusTcpClient => {
                let stream = timeout(self.io_timeout, TcpStream::connect(&self.peer_addr))
                    .await
                    .map_err(|_| SimError::link(format!("connect {} timed out", self.peer_addr)))?
                    .map_err(|e| SimError::link(format!("connect {}: {e}", self.peer_addr)))?;
                stream.set_nodelay(true).ok();
                Ok(Box::new(stream))
            }
            #[cfg(feature = "serial")]
            ProtocolKind::ModbusRtuClient => {
                let params = self
                    .serial
                    .clone()
                    .ok_or_else(|| SimError::config("RTU client requires serial parameters"))?;
                Ok(Box::new(params.open()?))
            }
            other => Err(SimError::config(format!("not a client kind: {other}"))),
        }
    }

    /// Issue one request PDU and await the matching response PDU.
    async fn request(&self, slave_id: u8, pdu: &[u8]) -> Result<Vec<u8>> {
        if !self.is_running() {
            return Err(SimError::state("client stopped"));
        }

        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_transport().await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(SimError::NotConnected);
        };

        let result = match self.kind {
            ProtocolKind::ModbusTcpClient => self.exchange_mbap(stream, slave_id, pdu).await,
            _ => self.exchange_rtu(stream, slave_id, pdu).await,
        };
        if result.is_err() {
            // Poison the link; the next request reconnects.
            *guard = None;
        }
        result
    }

    async fn exchange_mbap(
        &self,
        stream: &mut Box<dyn Transport>,
        slave_id: u8,
        pdu: &[u8],
    ) -> Result<Vec<u8>> {
        let tid = self.transaction_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let request = encode_mbap_frame(tid, slave_id, pdu);
        timeout(self.io_timeout, stream.write_all(&request))
            .await
            .map_err(|_| SimError::WriteTimeout)??;
        self.capture.record_tx(&request);

        let mut header_buf = [0u8; 7];
        timeout(self.io_timeout, stream.read_exact(&mut header_buf))
            .await
            .map_err(|_| SimError::ReadTimeout)??;
        let header = MbapHeader::decode(&header_buf)?;
        let mut response_pdu = vec![0u8; header.length as usize - 1];
        timeout(self.io_timeout, stream.read_exact(&mut response_pdu))
            .await
            .map_err(|_| SimError::ReadTimeout)??;

        let mut frame = header_buf.to_vec();
        frame.extend_from_slice(&response_pdu);
        self.capture.record_rx(&frame);

        if header.transaction_id != tid {
            return Err(SimError::transient(format!(
                "transaction id mismatch: sent {tid}, got {}",
                header.transaction_id
            )));
        }
        Ok(response_pdu)
    }

    async fn exchange_rtu(
        &self,
        stream: &mut Box<dyn Transport>,
        slave_id: u8,
        pdu: &[u8],
    ) -> Result<Vec<u8>> {
        let request = frame::encode_rtu_frame(slave_id, pdu);
        timeout(self.io_timeout, stream.write_all(&request))
            .await
            .map_err(|_| SimError::WriteTimeout)??;
        self.capture.record_tx(&request);

        // slave + function code
        let mut head = [0u8; 2];
        timeout(self.io_timeout, stream.read_exact(&mut head))
            .await
            .map_err(|_| SimError::ReadTimeout)??;

        let fc = head[1];
        let rest_len = if fc & 0x80 != 0 {
            3 // exception code + CRC
        } else {
            match fc {
                function::READ_COILS
                | function::READ_DISCRETE_INPUTS
                | function::READ_HOLDING_REGISTERS
                | function::READ_INPUT_REGISTERS => {
                    let mut count = [0u8; 1];
                    timeout(self.io_timeout, stream.read_exact(&mut count))
                        .await
                        .map_err(|_| SimError::ReadTimeout)??;
                    let mut tail = vec![0u8; count[0] as usize + 2];
                    timeout(self.io_timeout, stream.read_exact(&mut tail))
                        .await
                        .map_err(|_| SimError::ReadTimeout)??;
                    let mut response = head.to_vec();
                    response.push(count[0]);
                    response.extend_from_slice(&tail);
                    return self.finish_rtu(slave_id, response);
                }
                _ => 6, // address + value/quantity + CRC
            }
        };
        let mut tail = vec![0u8; rest_len];
        timeout(self.io_timeout, stream.read_exact(&mut tail))
            .await
            .map_err(|_| SimError::ReadTimeout)??;
        let mut response = head.to_vec();
        response.extend_from_slice(&tail);
        self.finish_rtu(slave_id, response)
    }

    fn finish_rtu(&self, slave_id: u8, response: Vec<u8>) -> Result<Vec<u8>> {
        self.capture.record_rx(&response);
        let (rx_slave, rx_pdu) = frame::decode_rtu_frame(&response)?;
        if rx_slave != slave_id {
            return Err(SimError::transient(format!(
                "slave mismatch: sent {slave_id}, got {rx_slave}"
            )));
        }
        Ok(rx_pdu.to_vec())
    }
}

#[async_trait]
impl ProtocolAdapter for ModbusClientAdapter {
    fn kind(&self) -> ProtocolKind {
        self.kind
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<()> {
        let transport = self.open_transport().await?;
        *self.conn.lock().await = Some(transport);
        self.running.store(true, Ordering::SeqCst);
        info!(peer = %self.peer_addr, kind = %self.kind, "modbus client connected");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        *self.conn.lock().await = None;
        Ok(())
    }

    fn add_points(&self, _points: &[Arc<Point>]) {
        // Clients address the remote datastore; nothing to register.
    }

    async fn read_value(&self, point: &Point) -> Result<Option<i64>> {
        let fc = point.function_code();
        let address = point.address() as u16;
        match fc {
            function::READ_COILS | function::READ_DISCRETE_INPUTS => {
                let pdu = build_read_request(fc, address, 1);
                let response = self.request(point.slave_id(), &pdu).await?;
                let words = parse_read_response(fc, 1, &response)?;
                Ok(Some(words[0] as i64))
            }
            function::READ_HOLDING_REGISTERS | function::READ_INPUT_REGISTERS => {
                let count = point.register_count();
                let pdu = build_read_request(fc, address, count);
                let response = self.request(point.slave_id(), &pdu).await?;
                let words = parse_read_response(fc, count, &response)?;
                if let Some(bit) = point.bit() {
                    return Ok(Some(crate::protocols::adapter::bit_of(words[0], bit)));
                }
                let bytes = codec::registers_to_bytes(&words);
                let value = codec::unpack(point.decode_code(), &bytes)?;
                Ok(Some(value.as_i64()))
            }
            _ => Ok(None),
        }
    }

    async fn write_value(&self, point: &Point, raw: i64) -> Result<bool> {
        let slave_id = point.slave_id();
        let address = point.address() as u16;
        match point.function_code() {
            function::READ_COILS
            | function::WRITE_SINGLE_COIL
            | function::WRITE_MULTIPLE_COILS => {
                let pdu = build_write_single_coil(address, raw != 0);
                self.request(slave_id, &pdu).await?;
                Ok(true)
            }
            function::READ_HOLDING_REGISTERS
            | function::WRITE_SINGLE_REGISTER
            | function::WRITE_MULTIPLE_REGISTERS => {
                if let Some(bit) = point.bit() {
                    // Read-modify-write of one bit inside the register.
                    let read = build_read_request(function::READ_HOLDING_REGISTERS, address, 1);
                    let response = self.request(slave_id, &read).await?;
                    let word =
                        parse_read_response(function::READ_HOLDING_REGISTERS, 1, &response)?[0];
                    let pdu =
                        build_write_single_register(address, with_bit(word, bit, raw != 0));
                    self.request(slave_id, &pdu).await?;
                    return Ok(true);
                }

                let value = if codec::is_float(point.decode_code()) {
                    CodecValue::Float(raw as f64)
                } else {
                    CodecValue::Integer(raw)
                };
                let bytes = codec::pack(point.decode_code(), value)?;
                let words = codec::bytes_to_registers(&bytes);
                let pdu = if words.len() == 1 {
                    build_write_single_register(address, words[0])
                } else {
                    build_write_multiple_registers(address, &words)
                };
                self.request(slave_id, &pdu).await?;
                Ok(true)
            }
            other => {
                debug!(function_code = other, "write not supported");
                Ok(false)
            }
        }
    }

    async fn read_batch(
        &self,
        slave_id: u8,
        function_code: u8,
        start_address: u32,
        count: u16,
    ) -> Result<Option<Vec<u16>>> {
        if !(function::READ_COILS..=function::READ_INPUT_REGISTERS).contains(&function_code) {
            return Ok(None);
        }
        if count == 0 || count > MAX_READ_REGISTERS {
            return Err(SimError::transient(format!("bad batch size: {count}")));
        }
        let pdu = build_read_request(function_code, start_address as u16, count);
        let response = self.request(slave_id, &pdu).await?;
        Ok(Some(parse_read_response(function_code, count, &response)?))
    }

    fn capture(&self) -> Arc<MessageCapture> {
        self.capture.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::point::PointKind;
    use crate::protocols::modbus::server::ModbusServerAdapter;
    use tokio::net::TcpListener;

    async fn server_on_ephemeral_port() -> (Arc<ModbusServerAdapter>, String) {
        // Pick a free port first, then start the adapter against it.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap().to_string();
        drop(probe);
        let server = ModbusServerAdapter::tcp(addr.clone());
        server.start().await.unwrap();
        (server, addr)
    }

    #[tokio::test]
    async fn test_client_reads_server_register() {
        let (server, addr) = server_on_ephemeral_port().await;
        let point = Point::builder(PointKind::Analog, "p1", 1, 0x0000, 3)
            .decode_code(0x41)
            .scaling(1.0, 0.0)
            .build();
        server.add_points(&[point.clone()]);
        server.write_value(&point, 99_999).await.unwrap();

        let client = ModbusClientAdapter::tcp(addr, Duration::from_secs(3));
        client.start().await.unwrap();

        let value = client.read_value(&point).await.unwrap();
        assert_eq!(value, Some(99_999));

        client.stop().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_client_batch_read() {
        let (server, addr) = server_on_ephemeral_port().await;
        let bank = server.bank();
        bank.add_slave(1);
        for (i, v) in [1u16, 2, 3, 4, 5, 6].iter().enumerate() {
            bank.write_word(
                crate::protocols::modbus::bank::Space::Holding,
                1,
                i as u16,
                *v,
            );
        }

        let client = ModbusClientAdapter::tcp(addr, Duration::from_secs(3));
        client.start().await.unwrap();

        let words = client.read_batch(1, 3, 0, 6).await.unwrap().unwrap();
        assert_eq!(words, vec![1, 2, 3, 4, 5, 6]);

        // Exactly one TX/RX pair crossed the wire.
        let stats = client.capture().stats();
        assert_eq!(stats.tx_count, 1);
        assert_eq!(stats.rx_count, 1);

        client.stop().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_client_write_roundtrip() {
        let (server, addr) = server_on_ephemeral_port().await;
        let point = Point::builder(PointKind::Setpoint, "sp", 1, 0x0010, 3)
            .decode_code(0x21)
            .scaling(1.0, 0.0)
            .build();
        server.add_points(&[point.clone()]);

        let client = ModbusClientAdapter::tcp(addr, Duration::from_secs(3));
        client.start().await.unwrap();
        assert!(client.write_value(&point, -5).await.unwrap());
        assert_eq!(server.read_value(&point).await.unwrap(), Some(-5));

        client.stop().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_client_fails_fast() {
        let client = ModbusClientAdapter::tcp("127.0.0.1:1", Duration::from_millis(100));
        let point = Point::builder(PointKind::Analog, "p", 1, 0, 3).build();
        let err = client.read_value(&point).await.unwrap_err();
        assert!(matches!(err, SimError::State(_)));
    }
}
