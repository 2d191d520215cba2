//! Transport abstraction (`spec.md` §4.1, C1): byte-stream I/O to a device over HID, USB,
//! serial, or a bridge daemon, with everything above (C2 codecs, C6 adapters) blind to which
//! one is in use.

use async_trait::async_trait;

use crate::error::Error;

#[cfg(feature = "hid")]
pub mod hid;
#[cfg(feature = "serial")]
pub mod serial;
#[cfg(feature = "usb")]
pub mod usb;
#[cfg(feature = "bridge")]
pub mod bridge;

/// A single request/response roundtrip (or a one-way write, when the caller discards the
/// response) against an open device or daemon connection. Adapters never see the transport
/// directly; they hand framed bytes to a C2 codec, which calls `exchange`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and return the device's reply. For streaming wire formats (Jade's CBOR
    /// messages) a "reply" is simply the next complete message read off the stream.
    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, Error>;

    /// Close the connection. Idempotent: calling it twice, or on an already-lost connection, is
    /// not an error (`spec.md` §4.6 `disconnect()`).
    async fn close(&mut self) -> Result<(), Error>;
}
