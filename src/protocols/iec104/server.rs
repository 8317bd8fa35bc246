//! IEC 60870-5-104 server adapter.
//!
//! Owns the station's information objects and pushes spontaneous
//! (COT=3) frames to every peer that has completed STARTDT. General
//! interrogation replays the whole monitoring table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::capture::{FrameFlavor, MessageCapture};
use crate::config::CAPTURE_CAPACITY;
use crate::core::error::{Result, SimError};
use crate::core::point::{Point, PointKind};
use crate::protocols::adapter::{ProtocolAdapter, ProtocolKind};
use crate::protocols::iec104::frame::{cot, type_id, Apdu, Asdu, UFrame};

/// One information object of the station.
#[derive(Debug, Clone, Copy)]
struct IoPoint {
    type_id: u8,
    value: f64,
}

type IoStore = Arc<DashMap<u32, IoPoint>>;

/// ASDU type of a point variant on the server side.
pub fn server_type_of(kind: PointKind) -> u8 {
    match kind {
        PointKind::Analog => type_id::M_ME_NC_1,
        PointKind::Signal => type_id::M_SP_NA_1,
        PointKind::Command => type_id::C_SC_NA_1,
        PointKind::Setpoint => type_id::C_SE_NC_1,
    }
}

/// IEC-104 server endpoint.
pub struct Iec104ServerAdapter {
    bind_addr: String,
    common_address: u16,
    store: IoStore,
    events: broadcast::Sender<(u32, u8, f64)>,
    capture: Arc<MessageCapture>,
    running: AtomicBool,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Iec104ServerAdapter {
    pub fn new(bind_addr: impl Into<String>, common_address: u16) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            bind_addr: bind_addr.into(),
            common_address,
            store: Arc::new(DashMap::new()),
            events,
            capture: Arc::new(MessageCapture::new(CAPTURE_CAPACITY, FrameFlavor::Iec104)),
            running: AtomicBool::new(false),
            stop_tx: Mutex::new(None),
            accept_task: Mutex::new(None),
        })
    }

    /// Wire value of a point: engineering value for scaled kinds, 0/1
    /// otherwise.
    fn wire_value(point: &Point, raw: i64) -> f64 {
        if point.kind().is_scaled() {
            let scaling = point.scaling();
            raw as f64 * scaling.mul_coe + scaling.add_coe
        } else {
            (raw != 0) as i64 as f64
        }
    }

    /// Back-transform a wire value into the point's register image.
    fn raw_value(point: &Point, wire: f64) -> Option<i64> {
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
impl ProtocolAdapter for Iec104ServerAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Iec104Server
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| SimError::link(format!("bind {}: {e}", self.bind_addr)))?;
        info!(addr = %self.bind_addr, "iec104 server listening");

        let (stop_tx, stop_rx) = watch::channel(false);
        let store = self.store.clone();
        let capture = self.capture.clone();
        let events = self.events.clone();
        let common_address = self.common_address;
        let mut accept_stop = stop_rx;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_stop.changed() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { break };
                        debug!(%peer, "iec104 peer connected");
                        let store = store.clone();
                        let capture = capture.clone();
                        let events = events.subscribe();
                        let conn_stop = accept_stop.clone();
                        tokio::spawn(async move {
                            let _ = serve_connection(
                                stream,
                                store,
                                capture,
                                events,
                                common_address,
                                conn_stop,
                            )
                            .await;
                            debug!(%peer, "iec104 peer disconnected");
                        });
                    }
                }
            }
        });

        *self.accept_task.lock().unwrap() = Some(handle);
        *self.stop_tx.lock().unwrap() = Some(stop_tx);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.lock().unwrap().take() {
            let _ = stop_tx.send(true);
        }
        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn add_points(&self, points: &[Arc<Point>]) {
        for point in points {
            self.store.insert(
                point.address(),
                IoPoint {
                    type_id: server_type_of(point.kind()),
                    value: 0.0,
                },
            );
        }
    }

    async fn read_value(&self, point: &Point) -> Result<Option<i64>> {
        let Some(io) = self.store.get(&point.address()) else {
            return Ok(None);
        };
        Ok(Self::raw_value(point, io.value))
    }

    async fn write_value(&self, point: &Point, raw: i64) -> Result<bool> {
        let ioa = point.address();
        let wire = Self::wire_value(point, raw);
        let Some(mut io) = self.store.get_mut(&ioa) else {
            return Ok(false);
        };
        io.value = wire;
        let io_type = io.type_id;
        drop(io);

        // The station pushes monitoring objects to every started peer.
        if type_id::is_monitoring(io_type) {
            let _ = self.events.send((ioa, io_type, wire));
        }
        Ok(true)
    }

    fn capture(&self) -> Arc<MessageCapture> {
        self.capture.clone()
    }
}

/// Per-connection APCI state.
struct Apci {
    send_seq: u16,
    recv_seq: u16,
    started: bool,
}

impl Apci {
    fn next_i(&mut self, asdu: Asdu) -> Apdu {
        let apdu = Apdu::I {
            send_seq: self.send_seq,
            recv_seq: self.recv_seq,
            asdu,
        };
        self.send_seq = (self.send_seq + 1) & 0x7FFF;
        apdu
    }
}

async fn send_apdu<W>(writer: &mut W, capture: &MessageCapture, apdu: &Apdu) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let frame = apdu.encode();
    capture.record_tx(&frame);
    writer.write_all(&frame).await?;
    Ok(())
}

/// Read exactly one APDU from the stream.
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

async fn serve_connection(
    stream: TcpStream,
    store: IoStore,
    capture: Arc<MessageCapture>,
    mut events: broadcast::Receiver<(u32, u8, f64)>,
    common_address: u16,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut apci = Apci {
        send_seq: 0,
        recv_seq: 0,
        started: false,
    };

    // Partial reads must survive other select branches firing, so frames
    // are assembled on a dedicated task.
    let (frame_tx, mut frame_rx) = tokio::sync::mpsc::channel::<Apdu>(32);
    let reader_capture = capture.clone();
    tokio::spawn(async move {
        loop {
            match read_apdu(&mut reader, &reader_capture).await {
                Ok(apdu) => {
                    if frame_tx.send(apdu).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    loop {
        tokio::select! {
            _ = stop.changed() => return Ok(()),

            event = events.recv() => {
                let Ok((ioa, io_type, value)) = event else { continue };
                if !apci.started {
                    continue;
                }
                let apdu = apci.next_i(Asdu {
                    type_id: io_type,
                    cot: cot::SPONTANEOUS,
                    common_address,
                    ioa,
                    value,
                });
                send_apdu(&mut writer, &capture, &apdu).await?;
            }

            incoming = frame_rx.recv() => {
                let Some(apdu) = incoming else { return Ok(()) };
                match apdu {
                    Apdu::U(UFrame::StartDtAct) => {
                        apci.started = true;
                        send_apdu(&mut writer, &capture, &Apdu::U(UFrame::StartDtCon)).await?;
                    }
                    Apdu::U(UFrame::StopDtAct) => {
                        apci.started = false;
                        send_apdu(&mut writer, &capture, &Apdu::U(UFrame::StopDtCon)).await?;
                    }
                    Apdu::U(UFrame::TestFrAct) => {
                        send_apdu(&mut writer, &capture, &Apdu::U(UFrame::TestFrCon)).await?;
                    }
                    Apdu::U(_) => {}
                    Apdu::S { .. } => {}
                    Apdu::I { asdu, .. } => {
                        apci.recv_seq = (apci.recv_seq + 1) & 0x7FFF;
                        handle_asdu(&mut writer, &store, &capture, &mut apci, common_address, asdu)
                            .await?;
                    }
                }
            }
        }
    }
}

async fn handle_asdu<W>(
    stream: &mut W,
    store: &IoStore,
    capture: &MessageCapture,
    apci: &mut Apci,
    common_address: u16,
    asdu: Asdu,
) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    match asdu.type_id {
        type_id::C_IC_NA_1 if asdu.cot == cot::ACTIVATION => {
            // Activation confirm, the monitoring table, activation terminate.
            let confirm = apci.next_i(Asdu {
                cot: cot::ACTIVATION_CON,
                ..asdu.clone()
            });
            send_apdu(stream, capture, &confirm).await?;

            let mut objects: Vec<(u32, IoPoint)> = store
                .iter()
                .filter(|e| type_id::is_monitoring(e.value().type_id))
                .map(|e| (*e.key(), *e.value()))
                .collect();
            objects.sort_by_key(|(ioa, _)| *ioa);
            for (ioa, io) in objects {
                let apdu = apci.next_i(Asdu {
                    type_id: io.type_id,
                    cot: cot::INTERROGATED,
                    common_address,
                    ioa,
                    value: io.value,
                });
                send_apdu(stream, capture, &apdu).await?;
            }

            let terminate = apci.next_i(Asdu {
                cot: cot::ACTIVATION_TERM,
                ..asdu
            });
            send_apdu(stream, capture, &terminate).await?;
        }

        type_id::C_SC_NA_1 | type_id::C_DC_NA_1 | type_id::C_SE_NC_1
            if asdu.cot == cot::ACTIVATION =>
        {
            if let Some(mut io) = store.get_mut(&asdu.ioa) {
                io.value = asdu.value;
            }
            let confirm = apci.next_i(Asdu {
                cot: cot::ACTIVATION_CON,
                ..asdu
            });
            send_apdu(stream, capture, &confirm).await?;
        }

        type_id::C_CS_NA_1 if asdu.cot == cot::ACTIVATION => {
            let confirm = apci.next_i(Asdu {
                cot: cot::ACTIVATION_CON,
                ..asdu
            });
            send_apdu(stream, capture, &confirm).await?;
        }

        _ => {
            // Unknown control traffic is acknowledged at the APCI level only.
            let ack = Apdu::S {
                recv_seq: apci.recv_seq,
            };
            send_apdu(stream, capture, &ack).await?;
        }
    }
    Ok(())
}
