//! Device adapters (`spec.md` §4.6, C6): one capability set, implemented once per vendor.
//!
//! `spec.md` §9 flags "optional capabilities" as a source pattern needing re-architecture: rather
//! than `verify_address`/`enumerate_authorized` throwing `Unsupported` at call time, every adapter
//! advertises its `capabilities()` up front so callers (and the registry) can query instead of
//! probe-by-calling.

use async_trait::async_trait;
use miniscript::bitcoin::bip32::Fingerprint;
use miniscript::bitcoin::psbt::Psbt;
use miniscript::bitcoin::{Address, Network};
use std::collections::BTreeMap;

use crate::error::Error;
use crate::path::Bip32Path;

#[cfg(feature = "usb")]
pub mod bitbox;
#[cfg(feature = "serial")]
pub mod jade;
#[cfg(feature = "hid")]
pub mod ledger;
#[cfg(feature = "bridge")]
pub mod trezor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Ledger,
    Trezor,
    BitBox02,
    Jade,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Ledger => "ledger",
            DeviceKind::Trezor => "trezor",
            DeviceKind::BitBox02 => "bitbox02",
            DeviceKind::Jade => "jade",
        }
    }
}

/// The script type a signing request targets, either given explicitly or inferred from the PSBT
/// (`spec.md` §3's `SignRequest.script_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptType {
    P2pkh,
    P2shP2wpkh,
    P2wpkh,
    P2tr,
    WshMultisig,
    ShWshMultisig,
}

impl ScriptType {
    /// Ledger wallet-policy descriptor template for this script type (`spec.md` §4.6).
    pub fn ledger_template(&self) -> &'static str {
        match self {
            ScriptType::P2pkh => "pkh(@0/**)",
            ScriptType::P2shP2wpkh => "sh(wpkh(@0/**))",
            ScriptType::P2wpkh => "wpkh(@0/**)",
            ScriptType::P2tr => "tr(@0/**)",
            ScriptType::WshMultisig => "wsh(sortedmulti(@0/**))",
            ScriptType::ShWshMultisig => "sh(wsh(sortedmulti(@0/**)))",
        }
    }
}

/// A capability an adapter may or may not implement. Queried via `HWI::capabilities`, never
/// discovered by calling the operation and catching `Unsupported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Xpub,
    SignPsbt,
    VerifyAddress,
    EnumerateAuthorized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub kind: DeviceKind,
    pub fingerprint: Fingerprint,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct XpubResult {
    pub xpub: miniscript::bitcoin::bip32::Xpub,
    pub master_fingerprint: Fingerprint,
    pub path: Bip32Path,
}

/// `spec.md` §3's sign request shape. `multisig_xpubs` maps master fingerprints to a
/// caller-supplied canonical xpub string, used by C5 when a device demands full cosigner nodes.
#[derive(Debug, Clone)]
pub struct SignRequest {
    pub psbt: Psbt,
    pub input_paths: Option<BTreeMap<usize, Bip32Path>>,
    pub change_output_indices: Option<Vec<usize>>,
    pub account_path: Option<Bip32Path>,
    pub script_type: Option<ScriptType>,
    pub multisig_xpubs: BTreeMap<Fingerprint, String>,
    /// Whether a mismatched `bip32Derivation` master fingerprint should be silently overwritten
    /// with the connected device's own fingerprint (Ledger's recovery behavior, `spec.md` §4.6
    /// and §9's open question). Defaults to `true` via `SignRequest::new`.
    pub allow_fingerprint_recovery: bool,
}

impl SignRequest {
    pub fn new(psbt: Psbt) -> Self {
        SignRequest {
            psbt,
            input_paths: None,
            change_output_indices: None,
            account_path: None,
            script_type: None,
            multisig_xpubs: BTreeMap::new(),
            allow_fingerprint_recovery: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignResponse {
    pub psbt: Psbt,
    pub raw_tx: Option<Vec<u8>>,
    pub signature_count: usize,
}

/// Callback the caller supplies so Trezor's legacy-input signing can fetch a previous
/// transaction's raw hex by txid (`spec.md` §6's "Reference-transaction fetcher").
pub type RefTxFetcher = std::sync::Arc<dyn Fn(&str) -> Result<Vec<u8>, Error> + Send + Sync>;

/// The uniform capability set every vendor adapter implements (`spec.md` §4.6).
#[async_trait]
pub trait HWI: Send + Sync {
    fn device_kind(&self) -> DeviceKind;

    /// Environmental preconditions only (e.g. the transport's shared library loads); does not
    /// require a device to be physically attached.
    fn is_supported(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// Capability query, replacing the "maybe throws NotImplemented" pattern `spec.md` §9 flags.
    fn capabilities(&self) -> &[Capability];

    async fn connect(&mut self) -> Result<DeviceDescriptor, Error>;

    /// Idempotent: safe to call from any state, including on an adapter that never connected.
    async fn disconnect(&mut self) -> Result<(), Error>;

    async fn get_device(&self) -> Option<DeviceDescriptor>;

    /// Previously-authorized devices the adapter can reconnect to without a fresh pairing
    /// prompt. Only meaningful for WebUSB-style transports; adapters that don't support it
    /// simply never advertise `Capability::EnumerateAuthorized`.
    async fn enumerate_authorized(&self) -> Result<Vec<DeviceDescriptor>, Error> {
        Err(Error::Unsupported(format!(
            "{} does not support enumerate_authorized",
            self.device_kind().as_str()
        )))
    }

    async fn get_xpub(&mut self, path: &Bip32Path) -> Result<XpubResult, Error>;

    async fn sign_psbt(&mut self, request: SignRequest) -> Result<SignResponse, Error>;

    /// Display a derived address on the device and return whether the user confirmed it matches
    /// `expected`. Optional; adapters that don't support it omit `Capability::VerifyAddress`.
    async fn verify_address(&mut self, path: &Bip32Path, expected: &Address) -> Result<bool, Error> {
        let _ = (path, expected);
        Err(Error::Unsupported(format!(
            "{} does not support verify_address",
            self.device_kind().as_str()
        )))
    }
}

/// Infer the account-level path, script type and network to use for a sign request when the
/// caller didn't supply them explicitly: fall back to the PSBT's own derivation data, and
/// ultimately to the well-known default account (`spec.md` §9's unresolved "hard error vs.
/// default path" question, decided in favor of keeping the default as a last resort).
pub fn resolve_account_path(request: &SignRequest, fingerprint: Fingerprint) -> Bip32Path {
    if let Some(path) = &request.account_path {
        return path.clone();
    }
    for input in &request.psbt.inputs {
        let paths = crate::psbt::paths_for_fingerprint(input, fingerprint);
        if let Some(path) = paths.first() {
            if let Some(account) = crate::psbt::account_path(path) {
                return account;
            }
        }
    }
    "m/84'/0'/0'".parse().expect("well-formed default path")
}

pub fn default_network(request: &SignRequest) -> Network {
    crate::psbt::detect_network(&request.psbt).unwrap_or(Network::Bitcoin)
}
