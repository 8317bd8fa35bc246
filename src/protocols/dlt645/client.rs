//! DL/T 645-2007 meter client adapter.
//!
//! Reads dispatch on the data identifier's method family (the high
//! byte); responses carry engineering values that are unscaled back into
//! the register image through the point's coefficients. Only parametric
//! data (family 04) accepts writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::capture::{FrameFlavor, MessageCapture};
use crate::config::CAPTURE_CAPACITY;
use crate::core::error::{Result, SimError};
use crate::core::point::Point;
use crate::protocols::adapter::{ProtocolAdapter, ProtocolKind};
use crate::protocols::dlt645::frame::{
    bcd_to_value, control, di_family, value_to_bcd, Dlt645Frame, FRAME_START, WAKEUP,
};

/// DL/T 645 client endpoint.
pub struct Dlt645ClientAdapter {
    peer_addr: String,
    meter_address: [u8; 6],
    io_timeout: Duration,
    conn: Mutex<Option<TcpStream>>,
    capture: Arc<MessageCapture>,
    running: AtomicBool,
}

impl Dlt645ClientAdapter {
    pub fn new(
        peer_addr: impl Into<String>,
        meter_address: [u8; 6],
        io_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer_addr: peer_addr.into(),
            meter_address,
            io_timeout,
            conn: Mutex::new(None),
            capture: Arc::new(MessageCapture::new(CAPTURE_CAPACITY, FrameFlavor::Dlt645)),
            running: AtomicBool::new(false),
        })
    }

    async fn connect(&self) -> Result<TcpStream> {
        let stream = timeout(self.io_timeout, TcpStream::connect(&self.peer_addr))
            .await
            .map_err(|_| SimError::link(format!("connect {} timed out", self.peer_addr)))?
            .map_err(|e| SimError::link(format!("connect {}: {e}", self.peer_addr)))?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    /// Exchange one request/response pair.
    async fn exchange(&self, request: &Dlt645Frame) -> Result<Dlt645Frame> {
        if !self.is_running() {
            return Err(SimError::state("client stopped"));
        }
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(SimError::NotConnected);
        };

        let result = self.exchange_inner(stream, request).await;
        if result.is_err() {
            *guard = None;
        }
        result
    }

    async fn exchange_inner(
        &self,
        stream: &mut TcpStream,
        request: &Dlt645Frame,
    ) -> Result<Dlt645Frame> {
        let wire = request.encode();
        timeout(self.io_timeout, stream.write_all(&wire))
            .await
            .map_err(|_| SimError::WriteTimeout)??;
        self.capture.record_tx(&wire);

        let response = timeout(self.io_timeout, read_frame(stream))
            .await
            .map_err(|_| SimError::ReadTimeout)??;
        self.capture.record_rx(&response);
        Dlt645Frame::decode(&response)
    }
}

/// Read one frame off the stream.
async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut first = [0u8; 1];
    loop {
        stream.read_exact(&mut first).await?;
        if first[0] == FRAME_START {
            break;
        }
        if first[0] != WAKEUP {
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

#[async_trait]
impl ProtocolAdapter for Dlt645ClientAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Dlt645Client
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<()> {
        let stream = self.connect().await?;
        *self.conn.lock().await = Some(stream);
        self.running.store(true, Ordering::SeqCst);
        info!(peer = %self.peer_addr, "dlt645 client connected");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        *self.conn.lock().await = None;
        Ok(())
    }

    fn add_points(&self, _points: &[Arc<Point>]) {
        // The meter is addressed per data identifier; nothing to register.
    }

    async fn read_value(&self, point: &Point) -> Result<Option<i64>> {
        let di = point.address();
        if di_family(di) > 0x04 {
            debug!(di = format!("0x{di:08X}"), "unsupported DI family");
            return Ok(None);
        }

        let request = Dlt645Frame::new(
            self.meter_address,
            control::READ_DATA,
            di.to_le_bytes().to_vec(),
        );
        let response = self.exchange(&request).await?;

        if response.control == control::READ_ERROR {
            return Err(SimError::transient(format!(
                "meter rejected read of DI 0x{di:08X}"
            )));
        }
        if response.control != control::READ_REPLY || response.data.len() < 8 {
            return Err(SimError::transient("malformed read reply"));
        }
        let wire = bcd_to_value(&response.data[4..]);

        // The response is unscaled through the point's coefficients.
        if point.kind().is_scaled() {
            let scaling = point.scaling();
            if scaling.mul_coe == 0.0 {
                return Ok(None);
            }
            Ok(Some(
                ((wire - scaling.add_coe) / scaling.mul_coe).round() as i64
            ))
        } else {
            Ok(Some((wire != 0.0) as i64))
        }
    }

    async fn write_value(&self, point: &Point, raw: i64) -> Result<bool> {
        let di = point.address();
        // Parametric data only; everything else on the meter is read-only.
        if di_family(di) != 0x04 {
            debug!(di = format!("0x{di:08X}"), "write refused: not a parameter");
            return Ok(false);
        }

        let wire = if point.kind().is_scaled() {
            let scaling = point.scaling();
            raw as f64 * scaling.mul_coe + scaling.add_coe
        } else {
            (raw != 0) as i64 as f64
        };

        let mut data = di.to_le_bytes().to_vec();
        data.extend_from_slice(&[0u8; 4]); // password
        data.extend_from_slice(&[0u8; 4]); // operator code
        data.extend_from_slice(&value_to_bcd(wire));
        let request = Dlt645Frame::new(self.meter_address, control::WRITE_DATA, data);
        let response = self.exchange(&request).await?;
        Ok(response.control == control::WRITE_REPLY)
    }

    fn capture(&self) -> Arc<MessageCapture> {
        self.capture.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::point::PointKind;
    use crate::protocols::dlt645::frame::meter_address_from_str;
    use crate::protocols::dlt645::server::Dlt645ServerAdapter;
    use tokio::net::TcpListener;

    fn meter_point(code: &str, di: u32, mul_coe: f64) -> Arc<Point> {
        Point::builder(PointKind::Analog, code, 1, di, 3)
            .decode_code(0x42)
            .scaling(mul_coe, 0.0)
            .build()
    }

    async fn free_addr() -> String {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap().to_string();
        drop(probe);
        addr
    }

    #[tokio::test]
    async fn test_read_unscales_through_point() {
        let addr = free_addr().await;
        let meter = meter_address_from_str("000000000001").unwrap();
        let server = Dlt645ServerAdapter::new(addr.clone(), meter, Duration::from_secs(30));
        let p = meter_point("energy", 0x0001_0000, 0.01);
        server.add_points(&[p.clone()]);
        server.write_value(&p, 12345).await.unwrap(); // wire 123.45
        server.start().await.unwrap();

        let client = Dlt645ClientAdapter::new(addr, meter, Duration::from_secs(3));
        client.start().await.unwrap();

        assert_eq!(client.read_value(&p).await.unwrap(), Some(12345));

        // Exactly one request/response pair was captured.
        let stats = client.capture().stats();
        assert_eq!(stats.tx_count, 1);
        assert_eq!(stats.pair_count, 1);

        client.stop().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_parameter_roundtrip() {
        let addr = free_addr().await;
        let meter = meter_address_from_str("000000000001").unwrap();
        let server = Dlt645ServerAdapter::new(addr.clone(), meter, Duration::from_secs(30));
        let p = meter_point("param", 0x0400_0101, 1.0);
        server.add_points(&[p.clone()]);
        server.start().await.unwrap();

        let client = Dlt645ClientAdapter::new(addr, meter, Duration::from_secs(3));
        client.start().await.unwrap();

        assert!(client.write_value(&p, 77).await.unwrap());
        assert_eq!(server.read_value(&p).await.unwrap(), Some(77));

        client.stop().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_refused_for_energy_di() {
        let addr = free_addr().await;
        let meter = meter_address_from_str("000000000001").unwrap();
        let client = Dlt645ClientAdapter::new(addr, meter, Duration::from_secs(1));
        let p = meter_point("energy", 0x0001_0000, 1.0);
        // Refused locally, before any connection is attempted.
        client.running.store(true, Ordering::SeqCst);
        assert!(!client.write_value(&p, 1).await.unwrap());
    }
}
