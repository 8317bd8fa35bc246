//! IEC 60870-5-104 client adapter.
//!
//! Values arrive asynchronously on the socket and land in a mirror map
//! owned by the adapter; the runtime pulls them into the point model via
//! `sync_mirror` just before presenting data, instead of pushing on
//! every callback. Analog mirror values carry the engineering value and
//! are back-transformed into the register image using the point scaling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::capture::{FrameFlavor, MessageCapture};
use crate::config::CAPTURE_CAPACITY;
use crate::core::error::{Result, SimError};
use crate::core::point::{Point, PointKind};
use crate::core::validity::Validity;
use crate::protocols::adapter::{ProtocolAdapter, ProtocolKind};
use crate::protocols::iec104::frame::{cot, type_id, Apdu, Asdu, UFrame};

type WriterSlot = Arc<Mutex<Option<OwnedWriteHalf>>>;

/// IEC-104 client endpoint.
pub struct Iec104ClientAdapter {
    peer_addr: String,
    common_address: u16,
    connect_timeout: Duration,
    /// Last reported wire value per information object address.
    mirror: Arc<DashMap<u32, f64>>,
    writer: WriterSlot,
    send_seq: StdMutex<u16>,
    recv_seq: Arc<StdMutex<u16>>,
    capture: Arc<MessageCapture>,
    running: AtomicBool,
}

impl Iec104ClientAdapter {
    pub fn new(
        peer_addr: impl Into<String>,
        common_address: u16,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer_addr: peer_addr.into(),
            common_address,
            connect_timeout,
            mirror: Arc::new(DashMap::new()),
            writer: Arc::new(Mutex::new(None)),
            send_seq: StdMutex::new(0),
            recv_seq: Arc::new(StdMutex::new(0)),
            capture: Arc::new(MessageCapture::new(CAPTURE_CAPACITY, FrameFlavor::Iec104)),
            running: AtomicBool::new(false),
        })
    }

    fn next_send_seq(&self) -> u16 {
        let mut seq = self.send_seq.lock().unwrap();
        let current = *seq;
        *seq = (*seq + 1) & 0x7FFF;
        current
    }

    async fn send(&self, apdu: &Apdu) -> Result<()> {
        send_via(&self.writer, &self.capture, apdu).await
    }

    async fn send_i(&self, asdu: Asdu) -> Result<()> {
        let apdu = Apdu::I {
            send_seq: self.next_send_seq(),
            recv_seq: *self.recv_seq.lock().unwrap(),
            asdu,
        };
        self.send(&apdu).await
    }

    /// Back-transform a mirror value into the point's register image.
    fn raw_of(point: &Point, wire: f64) -> Option<i64> {
        if point.kind().is_scaled() {
            let scaling = point.scaling();
            if scaling.mul_coe == 0.0 {
                return None;
            }
            Some(((wire - scaling.add_coe) / scaling.mul_coe).round() as i64)
        } else {
            Some((wire != 0.0) as i64)
        }
    }
}

#[async_trait]
impl ProtocolAdapter for Iec104ClientAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Iec104Client
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<()> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.peer_addr))
            .await
            .map_err(|_| SimError::link(format!("connect {} timed out", self.peer_addr)))?
            .map_err(|e| SimError::link(format!("connect {}: {e}", self.peer_addr)))?;
        stream.set_nodelay(true).ok();
        let (mut reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);

        // Reader task: mirror updates, TESTFR keep-alive, S-frame acks.
        // Writes initiated here go through the shared writer slot so they
        // serialize with command writes from the adapter surface.
        let mirror = self.mirror.clone();
        let capture = self.capture.clone();
        let recv_seq = self.recv_seq.clone();
        let writer_slot = self.writer.clone();
        tokio::spawn(async move {
            loop {
                let apdu = match read_apdu(&mut reader, &capture).await {
                    Ok(apdu) => apdu,
                    Err(_) => break,
                };
                let reply = match apdu {
                    Apdu::I { asdu, .. } => {
                        let ack = {
                            let mut seq = recv_seq.lock().unwrap();
                            *seq = (*seq + 1) & 0x7FFF;
                            Apdu::S { recv_seq: *seq }
                        };
                        if type_id::is_monitoring(asdu.type_id) {
                            mirror.insert(asdu.ioa, asdu.value);
                        }
                        Some(ack)
                    }
                    Apdu::U(UFrame::TestFrAct) => Some(Apdu::U(UFrame::TestFrCon)),
                    _ => None,
                };
                if let Some(reply) = reply {
                    if send_via(&writer_slot, &capture, &reply).await.is_err() {
                        break;
                    }
                }
            }
        });

        self.running.store(true, Ordering::SeqCst);

        // Open the data transfer window and interrogate the station once.
        self.send(&Apdu::U(UFrame::StartDtAct)).await?;
        self.send_i(Asdu {
            type_id: type_id::C_IC_NA_1,
            cot: cot::ACTIVATION,
            common_address: self.common_address,
            ioa: 0,
            value: 0.0,
        })
        .await?;
        info!(peer = %self.peer_addr, "iec104 client started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        *self.writer.lock().await = None;
        Ok(())
    }

    fn add_points(&self, points: &[Arc<Point>]) {
        // Pre-seed the mirror so unreported points read as zero.
        for point in points {
            self.mirror.entry(point.address()).or_insert(0.0);
        }
    }

    async fn read_value(&self, point: &Point) -> Result<Option<i64>> {
        let Some(wire) = self.mirror.get(&point.address()).map(|v| *v) else {
            return Ok(None);
        };
        Ok(Self::raw_of(point, wire))
    }

    async fn write_value(&self, point: &Point, raw: i64) -> Result<bool> {
        if !self.is_running() {
            return Err(SimError::state("client stopped"));
        }
        match point.kind() {
            PointKind::Command => {
                self.send_i(Asdu {
                    type_id: type_id::C_SC_NA_1,
                    cot: cot::ACTIVATION,
                    common_address: self.common_address,
                    ioa: point.address(),
                    value: (raw != 0) as i64 as f64,
                })
                .await?;
                self.mirror.insert(point.address(), (raw != 0) as i64 as f64);
                Ok(true)
            }
            PointKind::Setpoint => {
                let scaling = point.scaling();
                let wire = raw as f64 * scaling.mul_coe + scaling.add_coe;
                self.send_i(Asdu {
                    type_id: type_id::C_SE_NC_1,
                    cot: cot::ACTIVATION,
                    common_address: self.common_address,
                    ioa: point.address(),
                    value: wire,
                })
                .await?;
                // Commands are best-effort; mirror the sent value.
                self.mirror.insert(point.address(), wire);
                Ok(true)
            }
            _ => {
                debug!(code = point.code(), "monitoring point is read-only");
                Ok(false)
            }
        }
    }

    fn capture(&self) -> Arc<MessageCapture> {
        self.capture.clone()
    }

    async fn sync_mirror(&self, points: &[Arc<Point>]) -> Result<()> {
        for point in points {
            let Some(wire) = self.mirror.get(&point.address()).map(|v| *v) else {
                continue;
            };
            if let Some(raw) = Self::raw_of(point, wire) {
                point.set_raw(raw);
                point.set_validity(Validity::Fresh);
            }
        }
        Ok(())
    }
}

async fn send_via(writer: &WriterSlot, capture: &MessageCapture, apdu: &Apdu) -> Result<()> {
    let mut guard = writer.lock().await;
    let stream = guard.as_mut().ok_or(SimError::NotConnected)?;
    let frame = apdu.encode();
    capture.record_tx(&frame);
    stream.write_all(&frame).await?;
    Ok(())
}

/// Read exactly one APDU.
async fn read_apdu<R>(reader: &mut R, capture: &MessageCapture) -> Result<Apdu>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;
    if head[0] != 0x68 {
        return Err(SimError::transient("lost APDU framing"));
    }
    let mut body = vec![0u8; head[1] as usize];
    reader.read_exact(&mut body).await?;
    let mut frame = head.to_vec();
    frame.extend_from_slice(&body);
    capture.record_rx(&frame);
    Apdu::decode(&frame)
}
