//! Serial transport (`spec.md` §4.1, §4.6): Blockstream Jade over a plain serial port.
//!
//! Jade has no extra packet framing: CBOR's own self-delimiting encoding is the framing. A
//! response is read by growing a buffer and re-attempting a CBOR parse until one value decodes
//! cleanly off its front, which is the same polling shape Jade's own Python/JS clients use.

use async_trait::async_trait;
use std::io::Cursor;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::SerialPortBuilderExt;

use crate::error::Error;
use crate::transport::Transport;

const BAUD_RATE: u32 = 115_200;

pub struct SerialTransport {
    port: tokio_serial::SerialStream,
    timeout: Duration,
}

impl SerialTransport {
    /// `timeout` is the overall deadline for a reply to finish decoding (`spec.md` §4.2's
    /// per-roundtrip deadline); it is unrelated to the fixed 100ms poll granularity the serial
    /// port itself is opened with below.
    pub fn open(path: &str, timeout: Duration) -> Result<Self, Error> {
        let port = tokio_serial::new(path, BAUD_RATE)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(|e| {
                log::warn!("could not open Jade serial port {}: {}", path, e);
                Error::NotConnected
            })?;
        Ok(SerialTransport { port, timeout })
    }
}

/// Try to decode exactly one CBOR value off the front of `buf`. `Ok(None)` means "not enough
/// bytes yet", `Err` means the bytes received so far are not valid CBOR at all.
fn try_decode(buf: &[u8]) -> Result<Option<ciborium::Value>, Error> {
    let mut cursor = Cursor::new(buf);
    match ciborium::de::from_reader::<ciborium::Value, _>(&mut cursor) {
        Ok(value) => Ok(Some(value)),
        Err(ciborium::de::Error::Io(_)) => Ok(None),
        Err(e) => Err(Error::Protocol(format!("malformed CBOR from Jade: {}", e))),
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, Error> {
        self.port
            .write_all(request)
            .await
            .map_err(|_| Error::TransportLost)?;

        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            if try_decode(&buf)?.is_some() {
                return Ok(buf);
            }
            let read = tokio::time::timeout(Duration::from_millis(500), self.port.read(&mut chunk))
                .await;
            match read {
                Ok(Ok(0)) => return Err(Error::TransportLost),
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(_)) => return Err(Error::TransportLost),
                Err(_) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}
