//! Trezor adapter (`spec.md` §4.6): structured-input signing over the Trezor Bridge daemon.
//!
//! Trezor does not take a PSBT: it signs from vendor-structured inputs/outputs and returns a
//! fully serialized raw transaction, so C7 (`hwal::finalize`) is bypassed entirely for this
//! vendor — the raw tx Trezor returns is the canonical signed artifact.

use async_trait::async_trait;
use miniscript::bitcoin::bip32::{ChildNumber, Fingerprint};
use miniscript::bitcoin::Network;
use serde_json::json;
use std::time::Duration;

use crate::adapters::{
    Capability, DeviceDescriptor, DeviceKind, RefTxFetcher, ScriptType, SignRequest, SignResponse,
    XpubResult, HWI,
};
use crate::codec::bridge_rpc;
use crate::error::Error;
use crate::path::Bip32Path;
use crate::psbt::paths_for_fingerprint;
use crate::transport::bridge::BridgeTransport;
use crate::transport::Transport;

const CAPABILITIES: &[Capability] = &[Capability::Xpub, Capability::SignPsbt];
const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:21325";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TrezorAdapter {
    bridge_url: String,
    transport: Option<BridgeTransport>,
    descriptor: Option<DeviceDescriptor>,
    fetch_raw_tx: Option<RefTxFetcher>,
    timeout: Duration,
}

impl TrezorAdapter {
    pub fn new() -> Self {
        TrezorAdapter {
            bridge_url: DEFAULT_BRIDGE_URL.to_string(),
            transport: None,
            descriptor: None,
            fetch_raw_tx: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_ref_tx_fetcher(mut self, fetcher: RefTxFetcher) -> Self {
        self.fetch_raw_tx = Some(fetcher);
        self
    }

    pub fn with_bridge_url(mut self, url: impl Into<String>) -> Self {
        self.bridge_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn transport_mut(&mut self) -> Result<&mut BridgeTransport, Error> {
        self.transport.as_mut().ok_or(Error::NotConnected)
    }

    /// `m/purpose'/...` → Trezor `InputScriptType`, per `spec.md` §4.6's prefix table. BIP-48
    /// additionally distinguishes multisig script families by the fourth component.
    fn script_type_for_path(path: &Bip32Path) -> Result<&'static str, Error> {
        let purpose = path
            .nth(0)
            .and_then(|cn| match cn {
                ChildNumber::Hardened { index } => Some(*index),
                ChildNumber::Normal { index } => Some(*index),
            })
            .ok_or_else(|| Error::BadDerivation("empty derivation path".to_string()))?;
        Ok(match purpose {
            44 => "SPENDADDRESS",
            49 => "SPENDP2SHWITNESS",
            84 => "SPENDWITNESS",
            86 => "SPENDTAPROOT",
            48 => match path.nth(3) {
                Some(ChildNumber::Hardened { index: 2 }) => "SPENDWITNESS",
                Some(ChildNumber::Hardened { index: 1 }) => "SPENDP2SHWITNESS",
                _ => {
                    return Err(Error::BadDerivation(
                        "BIP-48 path missing script-family component".to_string(),
                    ))
                }
            },
            _ => return Err(Error::BadDerivation(format!("unrecognized purpose {}'", purpose))),
        })
    }
}

impl Default for TrezorAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HWI for TrezorAdapter {
    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Trezor
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
        let mut transport = BridgeTransport::connect(&self.bridge_url, self.timeout)?;
        // Master fingerprint is obtained from the parent fingerprint of the pubkey at m/0'
        // (`spec.md` §4.6's Trezor-specific rules), using unsigned 32-bit conversion.
        let request = bridge_rpc::build_call("get_public_key", json!({"address_n": [0x8000_0000u32]}))?;
        let reply = transport.exchange(&request).await?;
        let node: TrezorPublicKeyNode = bridge_rpc::parse_result(&reply)?;
        let fingerprint = Fingerprint::from(node.fingerprint.to_be_bytes());
        let descriptor = DeviceDescriptor {
            kind: DeviceKind::Trezor,
            fingerprint,
            version: node.device_version.unwrap_or_else(|| "unknown".to_string()),
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
        let request = bridge_rpc::build_call("get_public_key", json!({"address_n": path.to_u32_array()}))?;
        let transport = self.transport_mut()?;
        let reply = transport.exchange(&request).await?;
        let node: TrezorPublicKeyNode = bridge_rpc::parse_result(&reply)?;
        let xpub = node
            .xpub
            .as_deref()
            .map(crate::xpub::to_xpub)
            .transpose()?
            .ok_or_else(|| Error::InvalidXpub("Trezor did not return an xpub string".to_string()))?;
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

        let mut inputs = Vec::with_capacity(request.psbt.inputs.len());
        let mut ref_txids = std::collections::BTreeSet::new();
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
            let script_type = Self::script_type_for_path(path)?;
            let amount = input
                .witness_utxo
                .as_ref()
                .map(|u| u.value.to_sat())
                .ok_or_else(|| Error::IncompletePsbt(format!("input {} missing witness_utxo", index)))?;

            if input.non_witness_utxo.is_some() {
                ref_txids.insert(txin.previous_output.txid);
            }

            inputs.push(json!({
                "address_n": path.to_u32_array(),
                "prev_hash": txin.previous_output.txid.to_string(),
                "prev_index": txin.previous_output.vout,
                "sequence": txin.sequence.0,
                "script_type": script_type,
                "amount": amount.to_string(),
            }));
        }

        let mut ref_txs = Vec::new();
        if let Some(fetcher) = &self.fetch_raw_tx {
            for txid in ref_txids {
                match fetcher(&txid.to_string()) {
                    Ok(raw) => ref_txs.push(json!({"txid": txid.to_string(), "raw": hex::encode(raw)})),
                    Err(e) => log::warn!("failed to fetch reference tx {}: {}", txid, e),
                }
            }
        }

        let mut outputs = Vec::with_capacity(request.psbt.outputs.len());
        for (index, (output, txout)) in request
            .psbt
            .outputs
            .iter()
            .zip(request.psbt.unsigned_tx.output.iter())
            .enumerate()
        {
            if !output.bip32_derivation.is_empty() || !output.tap_key_origins.is_empty() {
                let path = output
                    .bip32_derivation
                    .values()
                    .map(|(_, p)| Bip32Path::from(p))
                    .next()
                    .ok_or_else(|| Error::IncompletePsbt(format!("output {} missing path", index)))?;
                outputs.push(json!({
                    "address_n": path.to_u32_array(),
                    "amount": txout.value.to_sat().to_string(),
                    "script_type": "PAYTOWITNESS",
                }));
            } else {
                let address = miniscript::bitcoin::Address::from_script(&txout.script_pubkey, network)
                    .map_err(|e| Error::IncompletePsbt(format!("output {} has undecodable script: {}", index, e)))?;
                outputs.push(json!({
                    "address": address.to_string(),
                    "amount": txout.value.to_sat().to_string(),
                }));
            }
        }

        let call = bridge_rpc::build_call(
            "sign_tx",
            json!({
                "inputs": inputs,
                "outputs": outputs,
                "refs": ref_txs,
                "coin_name": if network == Network::Bitcoin { "Bitcoin" } else { "Testnet" },
                "version": request.psbt.unsigned_tx.version.0,
                "lock_time": request.psbt.unsigned_tx.lock_time.to_consensus_u32(),
            }),
        )?;
        let transport = self.transport_mut()?;
        let reply = transport.exchange(&call).await?;
        let signed: TrezorSignedTx = bridge_rpc::parse_result(&reply)?;
        let raw_tx = hex::decode(&signed.serialized_tx)
            .map_err(|e| Error::Protocol(format!("Trezor returned non-hex raw tx: {}", e)))?;

        Ok(SignResponse {
            signature_count: request.psbt.unsigned_tx.input.len(),
            psbt: request.psbt,
            raw_tx: Some(raw_tx),
        })
    }
}

#[derive(serde::Deserialize)]
struct TrezorPublicKeyNode {
    xpub: Option<String>,
    fingerprint: u32,
    #[serde(default)]
    device_version: Option<String>,
}

#[derive(serde::Deserialize)]
struct TrezorSignedTx {
    serialized_tx: String,
}
