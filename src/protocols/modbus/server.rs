//! Modbus server adapter (TCP, and RTU over a serial line).
//!
//! Serves the local register banks to any number of masters. The banks
//! double as the adapter's datastore: `read_value`/`write_value` operate
//! on them directly, so operator edits and wire traffic observe the same
//! cells.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::capture::{FrameFlavor, MessageCapture};
use crate::config::CAPTURE_CAPACITY;
use crate::core::error::{Result, SimError};
use crate::core::point::Point;
use crate::protocols::adapter::{ProtocolAdapter, ProtocolKind};
use crate::protocols::modbus::bank::RegisterBank;
use crate::protocols::modbus::frame::{encode_mbap_frame, MbapHeader};

/// Modbus server endpoint.
pub struct ModbusServerAdapter {
    kind: ProtocolKind,
    bind_addr: String,
    #[cfg(feature = "serial")]
    serial: Option<crate::config::SerialParams>,
    bank: Arc<RegisterBank>,
    capture: Arc<MessageCapture>,
    running: AtomicBool,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ModbusServerAdapter {
    /// TCP server listening on `bind_addr` (`ip:port`).
    pub fn tcp(bind_addr: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            kind: ProtocolKind::ModbusTcpServer,
            bind_addr: bind_addr.into(),
            #[cfg(feature = "serial")]
            serial: None,
            bank: RegisterBank::new(),
            capture: Arc::new(MessageCapture::new(CAPTURE_CAPACITY, FrameFlavor::ModbusTcp)),
            running: AtomicBool::new(false),
            stop_tx: Mutex::new(None),
            accept_task: Mutex::new(None),
        })
    }

    /// RTU server answering on a serial line.
    #[cfg(feature = "serial")]
    pub fn rtu(serial: crate::config::SerialParams) -> Arc<Self> {
        Arc::new(Self {
            kind: ProtocolKind::ModbusRtuServer,
            bind_addr: String::new(),
            serial: Some(serial),
            bank: RegisterBank::new(),
            capture: Arc::new(MessageCapture::new(CAPTURE_CAPACITY, FrameFlavor::ModbusRtu)),
            running: AtomicBool::new(false),
            stop_tx: Mutex::new(None),
            accept_task: Mutex::new(None),
        })
    }

    /// Direct access to the register banks (shared with connection tasks).
    pub fn bank(&self) -> Arc<RegisterBank> {
        self.bank.clone()
    }

    async fn start_tcp(&self, stop_rx: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| SimError::link(format!("bind {}: {e}", self.bind_addr)))?;
        info!(addr = %self.bind_addr, "modbus server listening");

        let bank = self.bank.clone();
        let capture = self.capture.clone();
        let mut accept_stop = stop_rx.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_stop.changed() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { break };
                        debug!(%peer, "modbus client connected");
                        let bank = bank.clone();
                        let capture = capture.clone();
                        let conn_stop = accept_stop.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_mbap(stream, bank, capture, conn_stop).await {
                                debug!(%peer, error = %e, "modbus connection closed");
                            }
                        });
                    }
                }
            }
        });
        *self.accept_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    #[cfg(feature = "serial")]
    async fn start_rtu(&self, stop_rx: watch::Receiver<bool>) -> Result<()> {
        let params = self
            .serial
            .clone()
            .ok_or_else(|| SimError::config("RTU server requires serial parameters"))?;
        let stream = params.open()?;
        info!(port = %params.port, "modbus RTU server attached");

        let bank = self.bank.clone();
        let capture = self.capture.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_rtu(stream, bank, capture, stop_rx).await {
                tracing::warn!(error = %e, "modbus RTU loop ended");
            }
        });
        Ok(())
    }
}

#[async_trait]
impl ProtocolAdapter for ModbusServerAdapter {
    fn kind(&self) -> ProtocolKind {
        self.kind
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);

        match self.kind {
            ProtocolKind::ModbusTcpServer => self.start_tcp(stop_rx).await?,
            #[cfg(feature = "serial")]
            ProtocolKind::ModbusRtuServer => self.start_rtu(stop_rx).await?,
            #[cfg(not(feature = "serial"))]
            ProtocolKind::ModbusRtuServer => {
                return Err(SimError::config(
                    "modbus RTU requires the `serial` feature",
                ))
            }
            other => return Err(SimError::state(format!("not a server kind: {other}"))),
        }

        *self.stop_tx.lock().unwrap() = Some(stop_tx);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.lock().unwrap().take() {
            let _ = stop_tx.send(true);
        }
        // Wait for the accept loop so the port is actually released.
        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn add_points(&self, points: &[Arc<Point>]) {
        for point in points {
            self.bank.register_point(point);
        }
    }

    async fn read_value(&self, point: &Point) -> Result<Option<i64>> {
        Ok(self.bank.read_point(point))
    }

    async fn write_value(&self, point: &Point, raw: i64) -> Result<bool> {
        Ok(self.bank.write_point(point, raw))
    }

    fn capture(&self) -> Arc<MessageCapture> {
        self.capture.clone()
    }
}

/// Serve MBAP frames on one TCP connection until EOF or stop.
async fn serve_mbap<S>(
    mut stream: S,
    bank: Arc<RegisterBank>,
    capture: Arc<MessageCapture>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let mut header_buf = [0u8; 7];
        tokio::select! {
            _ = stop_rx.changed() => return Ok(()),
            read = stream.read_exact(&mut header_buf) => {
                if read.is_err() {
                    return Ok(()); // peer went away
                }
            }
        }

        let header = MbapHeader::decode(&header_buf)?;
        let mut pdu = vec![0u8; header.length as usize - 1];
        stream.read_exact(&mut pdu).await?;

        let mut request_frame = header_buf.to_vec();
        request_frame.extend_from_slice(&pdu);
        capture.record_rx(&request_frame);

        if let Some(response_pdu) = bank.process_request(header.unit_id, &pdu) {
            let frame = encode_mbap_frame(header.transaction_id, header.unit_id, &response_pdu);
            capture.record_tx(&frame);
            stream.write_all(&frame).await?;
        }
    }
}

/// Serve CRC-framed requests on a serial line until stop.
#[cfg(feature = "serial")]
async fn serve_rtu<S>(
    mut stream: S,
    bank: Arc<RegisterBank>,
    capture: Arc<MessageCapture>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    use crate::protocols::modbus::frame::{decode_rtu_frame, encode_rtu_frame};

    loop {
        let mut frame = vec![0u8; 256];
        let n = tokio::select! {
            _ = stop_rx.changed() => return Ok(()),
            read = stream.read(&mut frame) => read?,
        };
        if n == 0 {
            return Ok(());
        }
        frame.truncate(n);
        capture.record_rx(&frame);

        let Ok((slave_id, pdu)) = decode_rtu_frame(&frame) else {
            continue; // CRC failure: stay silent, the master retries
        };
        if let Some(response_pdu) = bank.process_request(slave_id, pdu) {
            let response = encode_rtu_frame(slave_id, &response_pdu);
            capture.record_tx(&response);
            stream.write_all(&response).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::point::PointKind;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_tcp_server_serves_registered_point() {
        let adapter = ModbusServerAdapter::tcp("127.0.0.1:0");
        // Bind to an ephemeral port via a manual listener to learn the address.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let bank = adapter.bank();
        let capture = adapter.capture();
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = serve_mbap(stream, bank, capture, stop_rx).await;
        });

        let point = Point::builder(PointKind::Analog, "p", 1, 0x0000, 3)
            .decode_code(0x21)
            .scaling(1.0, 0.0)
            .build();
        adapter.add_points(&[point.clone()]);
        adapter.write_value(&point, 0x1234).await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = encode_mbap_frame(1, 1, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        client.write_all(&request).await.unwrap();

        let mut response = vec![0u8; 11];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response[7..], &[0x03, 0x02, 0x12, 0x34]);
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let adapter = ModbusServerAdapter::tcp("127.0.0.1:0");
        assert!(!adapter.is_running());
        adapter.start().await.unwrap();
        assert!(adapter.is_running());
        adapter.stop().await.unwrap();
        assert!(!adapter.is_running());
    }
}
