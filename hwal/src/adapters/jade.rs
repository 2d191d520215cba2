//! Blockstream Jade adapter (`spec.md` §4.6): CBOR-over-serial signing.
//!
//! Jade takes a whole base64 PSBT and hands back a whole signed base64 PSBT; it reports no
//! per-input signature count, so `spec.md` §9 keeps the documented quirk rather than "fixing" it:
//! `signature_count` is reported as the PSBT's input count, not the number of inputs actually
//! newly signed.

use async_trait::async_trait;
use base64::Engine;
use ciborium::Value;
use miniscript::bitcoin::bip32::Fingerprint;
use miniscript::bitcoin::Network;
use std::time::Duration;

use crate::adapters::{Capability, DeviceDescriptor, DeviceKind, SignRequest, SignResponse, XpubResult, HWI};
use crate::codec::cbor;
use crate::error::Error;
use crate::path::Bip32Path;
use crate::transport::serial::SerialTransport;
use crate::transport::Transport;

const CAPABILITIES: &[Capability] = &[Capability::Xpub, Capability::SignPsbt, Capability::VerifyAddress];
const DEFAULT_SERIAL_PATH: &str = "/dev/ttyUSB0";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

fn b64() -> base64::engine::general_purpose::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

pub struct JadeAdapter {
    serial_path: String,
    transport: Option<SerialTransport>,
    descriptor: Option<DeviceDescriptor>,
    next_id: u64,
    timeout: Duration,
}

impl JadeAdapter {
    pub fn new() -> Self {
        JadeAdapter {
            serial_path: DEFAULT_SERIAL_PATH.to_string(),
            transport: None,
            descriptor: None,
            next_id: 0,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_serial_path(mut self, path: impl Into<String>) -> Self {
        self.serial_path = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn next_request_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    fn transport_mut(&mut self) -> Result<&mut SerialTransport, Error> {
        self.transport.as_mut().ok_or(Error::NotConnected)
    }

    async fn call(&mut self, method: &str, params: Value) -> Result<Value, Error> {
        let id = self.next_request_id();
        let request = cbor::build_request(&id, method, params)?;
        let transport = self.transport_mut()?;
        let reply = transport.exchange(&request).await?;
        cbor::parse_response(&id, &reply)
    }
}

impl Default for JadeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HWI for JadeAdapter {
    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Jade
    }

    fn is_supported(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn connect(&mut self) -> Result<DeviceDescriptor, Error> {
        self.transport = Some(SerialTransport::open(&self.serial_path, self.timeout)?);
        let info = self.call("get_version_info", Value::Map(vec![])).await?;
        let Value::Map(map) = &info else {
            return Err(Error::Protocol("Jade version info is not a CBOR map".to_string()));
        };
        let fingerprint_hex = map
            .iter()
            .find(|(k, _)| k.as_text() == Some("EFUSEMAC"))
            .and_then(|(_, v)| v.as_text())
            .unwrap_or("00000000");
        let fingerprint = {
            let bytes = hex::decode(&fingerprint_hex[..8.min(fingerprint_hex.len())])
                .unwrap_or_else(|_| vec![0, 0, 0, 0]);
            let mut arr = [0u8; 4];
            arr[..bytes.len().min(4)].copy_from_slice(&bytes[..bytes.len().min(4)]);
            Fingerprint::from(arr)
        };
        let version = map
            .iter()
            .find(|(k, _)| k.as_text() == Some("JADE_VERSION"))
            .and_then(|(_, v)| v.as_text())
            .unwrap_or("unknown")
            .to_string();
        let descriptor = DeviceDescriptor {
            kind: DeviceKind::Jade,
            fingerprint,
            version,
        };
        self.descriptor = Some(descriptor.clone());
        Ok(descriptor)
    }

    async fn disconnect(&mut self) -> Result<(), Error> {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await?;
        }
        self.descriptor = None;
        Ok(())
    }

    async fn get_device(&self) -> Option<DeviceDescriptor> {
        self.descriptor.clone()
    }

    async fn get_xpub(&mut self, path: &Bip32Path) -> Result<XpubResult, Error> {
        let descriptor = self.descriptor.clone().ok_or(Error::NotConnected)?;
        let params = Value::Map(vec![
            (Value::Text("network".to_string()), Value::Text("mainnet".to_string())),
            (
                Value::Text("path".to_string()),
                Value::Array(path.to_u32_array().into_iter().map(|i| Value::Integer(i.into())).collect()),
            ),
        ]);
        let result = self.call("get_xpub", params).await?;
        let xpub_str = result
            .as_text()
            .ok_or_else(|| Error::InvalidXpub("Jade did not return an xpub string".to_string()))?;
        let xpub = crate::xpub::to_xpub(xpub_str)?;
        Ok(XpubResult {
            xpub,
            master_fingerprint: descriptor.fingerprint,
            path: path.clone(),
        })
    }

    async fn sign_psbt(&mut self, request: SignRequest) -> Result<SignResponse, Error> {
        if self.descriptor.is_none() {
            return Err(Error::NotConnected);
        }
        let network = crate::psbt::detect_network(&request.psbt).unwrap_or(Network::Bitcoin);
        let input_count = request.psbt.unsigned_tx.input.len();

        let mut psbt_bytes = Vec::new();
        request
            .psbt
            .serialize_to_writer(&mut psbt_bytes)
            .map_err(|e| Error::IncompletePsbt(e.to_string()))?;
        let psbt_b64 = b64().encode(&psbt_bytes);

        let params = Value::Map(vec![
            (
                Value::Text("network".to_string()),
                Value::Text(if network == Network::Bitcoin { "mainnet".to_string() } else { "testnet".to_string() }),
            ),
            (Value::Text("psbt_base64".to_string()), Value::Text(psbt_b64)),
        ]);
        let result = self.call("sign_psbt", params).await?;
        let signed_b64 = result
            .as_text()
            .ok_or_else(|| Error::Protocol("Jade sign_psbt reply is not a base64 string".to_string()))?;
        let signed_bytes = b64()
            .decode(signed_b64)
            .map_err(|e| Error::Protocol(format!("Jade returned non-base64 PSBT: {}", e)))?;
        let psbt = crate::psbt::parse(&signed_bytes)?;

        Ok(SignResponse {
            // Jade does not report how many inputs it actually signed; the documented quirk is
            // to report the PSBT's input count rather than invent a real signature count.
            signature_count: input_count,
            psbt,
            raw_tx: None,
        })
    }
}
