//! DL/T 645-2007 meter server adapter.
//!
//! Serves the meter's data-identifier store over TCP. Connections idle
//! for longer than the configured window are closed, matching field
//! meters that drop silent masters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::capture::{FrameFlavor, MessageCapture};
use crate::config::CAPTURE_CAPACITY;
use crate::core::error::{Result, SimError};
use crate::core::point::Point;
use crate::protocols::adapter::{ProtocolAdapter, ProtocolKind};
use crate::protocols::dlt645::frame::{
    bcd_to_value, control, di_family, value_to_bcd, Dlt645Frame,
};

type ItemStore = Arc<DashMap<u32, f64>>;

/// DL/T 645 server endpoint.
pub struct Dlt645ServerAdapter {
    bind_addr: String,
    meter_address: [u8; 6],
    idle_timeout: Duration,
    items: ItemStore,
    capture: Arc<MessageCapture>,
    running: AtomicBool,
    stop_tx: StdMutex<Option<watch::Sender<bool>>>,
    accept_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Dlt645ServerAdapter {
    pub fn new(
        bind_addr: impl Into<String>,
        meter_address: [u8; 6],
        idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            bind_addr: bind_addr.into(),
            meter_address,
            idle_timeout,
            items: Arc::new(DashMap::new()),
            capture: Arc::new(MessageCapture::new(CAPTURE_CAPACITY, FrameFlavor::Dlt645)),
            running: AtomicBool::new(false),
            stop_tx: StdMutex::new(None),
            accept_task: StdMutex::new(None),
        })
    }

    /// Wire value of a point: engineering value for scaled kinds.
    fn wire_value(point: &Point, raw: i64) -> f64 {
        if point.kind().is_scaled() {
            let scaling = point.scaling();
            raw as f64 * scaling.mul_coe + scaling.add_coe
        } else {
            (raw != 0) as i64 as f64
        }
    }

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
impl ProtocolAdapter for Dlt645ServerAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Dlt645Server
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| SimError::link(format!("bind {}: {e}", self.bind_addr)))?;
        info!(addr = %self.bind_addr, meter = %crate::protocols::dlt645::frame::meter_address_to_str(&self.meter_address), "dlt645 server listening");

        let (stop_tx, stop_rx) = watch::channel(false);
        let items = self.items.clone();
        let capture = self.capture.clone();
        let meter_address = self.meter_address;
        let idle_timeout = self.idle_timeout;
        let mut accept_stop = stop_rx;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_stop.changed() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { break };
                        debug!(%peer, "dlt645 master connected");
                        let items = items.clone();
                        let capture = capture.clone();
                        let conn_stop = accept_stop.clone();
                        tokio::spawn(async move {
                            let _ = serve_connection(
                                stream,
                                items,
                                capture,
                                meter_address,
                                idle_timeout,
                                conn_stop,
                            )
                            .await;
                            debug!(%peer, "dlt645 master disconnected");
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
            self.items.entry(point.address()).or_insert(0.0);
        }
    }

    async fn read_value(&self, point: &Point) -> Result<Option<i64>> {
        let Some(wire) = self.items.get(&point.address()).map(|v| *v) else {
            return Ok(None);
        };
        Ok(Self::raw_value(point, wire))
    }

    async fn write_value(&self, point: &Point, raw: i64) -> Result<bool> {
        let wire = Self::wire_value(point, raw);
        self.items.insert(point.address(), wire);
        Ok(true)
    }

    fn capture(&self) -> Arc<MessageCapture> {
        self.capture.clone()
    }
}

/// Read one frame off the stream: header through end byte.
async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    // Skip wake-up bytes, then fix on the first start byte.
    let mut first = [0u8; 1];
    loop {
        stream.read_exact(&mut first).await?;
        if first[0] == crate::protocols::dlt645::frame::FRAME_START {
            break;
        }
        if first[0] != crate::protocols::dlt645::frame::WAKEUP {
            return Err(SimError::transient("lost DL/T 645 framing"));
        }
    }

    let mut rest_header = [0u8; 9];
    stream.read_exact(&mut rest_header).await?;
    let len = rest_header[8] as usize;
    let mut tail = vec![0u8; len + 2];
    stream.read_exact(&mut tail).await?;

    let mut frame = vec![first[0]];
    frame.extend_from_slice(&rest_header);
    frame.extend_from_slice(&tail);
    Ok(frame)
}

async fn serve_connection(
    mut stream: TcpStream,
    items: ItemStore,
    capture: Arc<MessageCapture>,
    meter_address: [u8; 6],
    idle_timeout: Duration,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let wire = tokio::select! {
            _ = stop.changed() => return Ok(()),
            read = timeout(idle_timeout, read_frame(&mut stream)) => match read {
                Ok(Ok(frame)) => frame,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!("dlt645 connection idle, closing");
                    return Ok(());
                }
            }
        };
        capture.record_rx(&wire);

        let Ok(request) = Dlt645Frame::decode(&wire) else {
            continue; // framing noise, the master retries
        };
        if !request.addresses(&meter_address) {
            continue;
        }

        let response = match request.control {
            control::READ_DATA => serve_read(&items, meter_address, &request),
            control::WRITE_DATA => serve_write(&items, meter_address, &request),
            _ => None,
        };
        if let Some(response) = response {
            let wire = response.encode();
            capture.record_tx(&wire);
            stream.write_all(&wire).await?;
        }
    }
}

fn serve_read(items: &ItemStore, meter: [u8; 6], request: &Dlt645Frame) -> Option<Dlt645Frame> {
    let Some(di) = request.data_identifier() else {
        return Some(Dlt645Frame::new(meter, control::READ_ERROR, vec![0x02]));
    };
    match items.get(&di).map(|v| *v) {
        Some(value) => {
            let mut data = di.to_le_bytes().to_vec();
            data.extend_from_slice(&value_to_bcd(value));
            Some(Dlt645Frame::new(meter, control::READ_REPLY, data))
        }
        // 0x02: the requested data does not exist.
        None => Some(Dlt645Frame::new(meter, control::READ_ERROR, vec![0x02])),
    }
}

fn serve_write(items: &ItemStore, meter: [u8; 6], request: &Dlt645Frame) -> Option<Dlt645Frame> {
    let Some(di) = request.data_identifier() else {
        return Some(Dlt645Frame::new(meter, control::WRITE_ERROR, vec![0x02]));
    };
    // Only parametric data (family 04) accepts writes.
    if di_family(di) != 0x04 {
        return Some(Dlt645Frame::new(meter, control::WRITE_ERROR, vec![0x04]));
    }
    // DI + password[4] + operator[4] + value
    if request.data.len() < 12 {
        return Some(Dlt645Frame::new(meter, control::WRITE_ERROR, vec![0x02]));
    }
    let value = bcd_to_value(&request.data[12..]);
    items.insert(di, value);
    Some(Dlt645Frame::new(meter, control::WRITE_REPLY, Vec::new()))
}
