//! HID transport (`spec.md` §4.1): Ledger devices over USB-HID.
//!
//! `ledger-transport-hidapi`'s `TransportNativeHID` already does U2F-HID framing/chunking and is
//! synchronous; we run it on the blocking pool so the rest of the core can stay `async`, the same
//! pattern `liana`'s bitcoind RPC client uses for its own blocking `jsonrpc` calls.

use async_trait::async_trait;
use hidapi::HidApi;
use ledger_apdu::{APDUCommand, APDUErrorCode};
use ledger_transport_hidapi::TransportNativeHID;
use std::sync::Arc;

use crate::error::Error;
use crate::transport::Transport;

pub struct HidTransport {
    inner: Arc<TransportNativeHID>,
}

impl HidTransport {
    /// Open the first Ledger device found over HID. `spec.md`'s `is_supported()`/`connect()`
    /// split lives in the adapter; this is the transport-level open call it invokes.
    pub fn open_first() -> Result<Self, Error> {
        let api = HidApi::new().map_err(|e| Error::Unsupported(format!("hidapi: {}", e)))?;
        let inner = TransportNativeHID::new(&api)
            .map_err(|e| Error::Internal(format!("opening Ledger over HID: {}", e), None))?;
        Ok(HidTransport {
            inner: Arc::new(inner),
        })
    }
}

#[async_trait]
impl Transport for HidTransport {
    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, Error> {
        if request.len() < 4 {
            return Err(Error::Protocol("APDU command shorter than 4 header bytes".to_string()));
        }
        let command = APDUCommand {
            cla: request[0],
            ins: request[1],
            p1: request[2],
            p2: request[3],
            data: request[4..].to_vec(),
        };
        let inner = self.inner.clone();
        let answer = tokio::task::spawn_blocking(move || inner.exchange(&command))
            .await
            .map_err(|e| Error::Internal(format!("HID worker panicked: {}", e), None))?
            .map_err(|e| Error::Internal(format!("Ledger HID transport error: {}", e), None))?;
        match answer.error_code() {
            Ok(APDUErrorCode::NoError) => Ok(answer.data().to_vec()),
            Ok(code) => Err(Error::Internal(
                format!("Ledger returned status word {:?}", code),
                Some(answer.retcode() as u32),
            )),
            Err(retcode) => Err(Error::Internal(
                "Ledger returned an unrecognized status word".to_string(),
                Some(retcode as u32),
            )),
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        // TransportNativeHID closes its HID handle on drop; there is no explicit close call.
        Ok(())
    }
}
