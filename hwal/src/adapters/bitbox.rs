//! BitBox02 adapter (`spec.md` §4.6): simple-RPC signing over USB.

use async_trait::async_trait;
use miniscript::bitcoin::bip32::Fingerprint;
use miniscript::bitcoin::Network;
use serde_json::json;
use std::time::Duration;

use crate::adapters::{
    resolve_account_path, Capability, DeviceDescriptor, DeviceKind, SignRequest, SignResponse,
    XpubResult, HWI,
};
use crate::codec::bridge_rpc;
use crate::error::Error;
use crate::finalize::{apply_signature, RawSignature};
use crate::path::Bip32Path;
use crate::psbt::paths_for_fingerprint;
use crate::transport::usb::UsbTransport;
use crate::transport::Transport;

const CAPABILITIES: &[Capability] = &[Capability::Xpub, Capability::SignPsbt, Capability::VerifyAddress];

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct BitBox02Adapter {
    transport: Option<UsbTransport>,
    descriptor: Option<DeviceDescriptor>,
    timeout: Duration,
}

impl BitBox02Adapter {
    pub fn new() -> Self {
        BitBox02Adapter {
            transport: None,
            descriptor: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn transport_mut(&mut self) -> Result<&mut UsbTransport, Error> {
        self.transport.as_mut().ok_or(Error::NotConnected)
    }
}

impl Default for BitBox02Adapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HWI for BitBox02Adapter {
    fn device_kind(&self) -> DeviceKind {
        DeviceKind::BitBox02
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
        let mut transport = UsbTransport::open_first(self.timeout)?;
        let request = bridge_rpc::build_call("device-info", json!({}))?;
        let reply = transport.exchange(&request).await?;
        let info: DeviceInfo = bridge_rpc::parse_result(&reply)?;
        let fingerprint = Fingerprint::from_str_checked(&info.root_fingerprint)?;
        let descriptor = DeviceDescriptor {
            kind: DeviceKind::BitBox02,
            fingerprint,
            version: info.version,
        };
        self.transport = Some(transport);
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
        let request = bridge_rpc::build_call("btc-xpub", json!({"keypath": path.to_u32_array()}))?;
        let transport = self.transport_mut()?;
        let reply = transport.exchange(&request).await?;
        let xpub_reply: XpubReply = bridge_rpc::parse_result(&reply)?;
        let xpub = crate::xpub::to_xpub(&xpub_reply.xpub)?;
        Ok(XpubResult {
            xpub,
            master_fingerprint: descriptor.fingerprint,
            path: path.clone(),
        })
    }

    async fn sign_psbt(&mut self, request: SignRequest) -> Result<SignResponse, Error> {
        let descriptor = self.descriptor.clone().ok_or(Error::NotConnected)?;
        let device_fingerprint = descriptor.fingerprint;
        let network = crate::psbt::detect_network(&request.psbt).unwrap_or(Network::Bitcoin);
        let account_keypath = resolve_account_path(&request, device_fingerprint);

        let mut inputs = Vec::with_capacity(request.psbt.inputs.len());
        for (index, (input, txin)) in request
            .psbt
            .inputs
            .iter()
            .zip(request.psbt.unsigned_tx.input.iter())
            .enumerate()
        {
            let paths = paths_for_fingerprint(input, device_fingerprint);
            let path = paths.first().ok_or_else(|| Error::NotACosigner {
                expected: input
                    .bip32_derivation
                    .values()
                    .map(|(fg, _)| fg.to_string())
                    .collect(),
            })?;
            let value = input
                .witness_utxo
                .as_ref()
                .map(|u| u.value.to_sat())
                .ok_or_else(|| Error::IncompletePsbt(format!("input {} missing witness_utxo", index)))?;
            inputs.push(json!({
                "prev_hash": txin.previous_output.txid.to_string(),
                "prev_index": txin.previous_output.vout,
                "prev_value": value.to_string(),
                "sequence": txin.sequence.0,
                "keypath": path.to_u32_array(),
            }));
        }

        let mut outputs = Vec::with_capacity(request.psbt.outputs.len());
        for (output, txout) in request.psbt.outputs.iter().zip(request.psbt.unsigned_tx.output.iter()) {
            if let Some((_, path)) = output.bip32_derivation.values().next() {
                outputs.push(json!({
                    "ours": true,
                    "keypath": Bip32Path::from(path).to_u32_array(),
                    "value": txout.value.to_sat().to_string(),
                }));
            } else {
                outputs.push(json!({
                    "ours": false,
                    "payload": hex::encode(txout.script_pubkey.as_bytes()),
                    "value": txout.value.to_sat().to_string(),
                }));
            }
        }

        let call = bridge_rpc::build_call(
            "btc-sign-simple",
            json!({
                "coin": if network == Network::Bitcoin { "BTC" } else { "TBTC" },
                "account_keypath": account_keypath.to_u32_array(),
                "inputs": inputs,
                "outputs": outputs,
                "tx_version": request.psbt.unsigned_tx.version.0,
                "locktime": request.psbt.unsigned_tx.lock_time.to_consensus_u32(),
            }),
        )?;
        let transport = self.transport_mut()?;
        let reply = transport.exchange(&call).await?;
        let signed: SignSimpleReply = bridge_rpc::parse_result(&reply)?;

        let mut psbt = request.psbt;
        for (index, sig_hex) in signed.signatures.iter().enumerate() {
            let raw = hex::decode(sig_hex).map_err(|e| Error::BadSignature(e.to_string()))?;
            if raw.len() != 64 {
                return Err(Error::BadSignature(format!(
                    "expected a 64-byte (r||s) signature, got {} bytes",
                    raw.len()
                )));
            }
            let input = psbt
                .inputs
                .get_mut(index)
                .ok_or_else(|| Error::Protocol("signature for out-of-range input index".to_string()))?;
            let der = raw_to_der(&raw)?;
            let pubkey = input
                .bip32_derivation
                .iter()
                .find(|(_, (fg, _))| *fg == device_fingerprint)
                .map(|(pk, _)| *pk)
                .ok_or_else(|| Error::NotACosigner { expected: vec![] })?;
            apply_signature(input, pubkey, RawSignature::Ecdsa(der))?;
        }

        Ok(SignResponse {
            signature_count: signed.signatures.len(),
            psbt,
            raw_tx: None,
        })
    }
}

fn raw_to_der(raw: &[u8]) -> Result<Vec<u8>, Error> {
    let sig = miniscript::bitcoin::secp256k1::ecdsa::Signature::from_compact(raw)
        .map_err(|e| Error::BadSignature(e.to_string()))?;
    Ok(sig.serialize_der().to_vec())
}

trait FingerprintFromHex: Sized {
    fn from_str_checked(s: &str) -> Result<Self, Error>;
}

impl FingerprintFromHex for Fingerprint {
    fn from_str_checked(s: &str) -> Result<Self, Error> {
        let bytes = hex::decode(s).map_err(|e| Error::Protocol(e.to_string()))?;
        if bytes.len() != 4 {
            return Err(Error::Protocol("fingerprint must be 4 bytes".to_string()));
        }
        Ok(Fingerprint::from([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

#[derive(serde::Deserialize)]
struct DeviceInfo {
    version: String,
    root_fingerprint: String,
}

#[derive(serde::Deserialize)]
struct XpubReply {
    xpub: String,
}

#[derive(serde::Deserialize)]
struct SignSimpleReply {
    signatures: Vec<String>,
}
