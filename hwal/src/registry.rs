//! Adapter registry / service façade (`spec.md` §4.8, C8).
//!
//! Holds one boxed adapter per registered `DeviceKind` and enforces "at most one active adapter"
//! across the process lifetime: connecting to a different type transparently disconnects the
//! previous session first. All registry state lives behind a single `tokio::sync::Mutex`, the same
//! shape `liana-gui`'s `HardwareWallets` registry uses for its `Arc<Mutex<...>>` device list
//! (`examples/wizardsardine-liana/liana-gui/src/hw.rs`).

use miniscript::bitcoin::Address;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::adapters::{DeviceDescriptor, DeviceKind, SignRequest, SignResponse, XpubResult, HWI};
use crate::error::Error;
use crate::path::Bip32Path;

struct State {
    adapters: HashMap<DeviceKind, Box<dyn HWI>>,
    active: Option<DeviceKind>,
}

pub struct Registry {
    state: Mutex<State>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            state: Mutex::new(State {
                adapters: HashMap::new(),
                active: None,
            }),
        }
    }

    /// Register an adapter for a device type. Registering a type twice replaces the previous
    /// adapter instance.
    pub async fn register_adapter(&self, adapter: Box<dyn HWI>) {
        let mut state = self.state.lock().await;
        state.adapters.insert(adapter.device_kind(), adapter);
    }

    fn ordered_kinds_key(kind: &DeviceKind) -> u8 {
        match kind {
            DeviceKind::Ledger => 0,
            DeviceKind::Trezor => 1,
            DeviceKind::BitBox02 => 2,
            DeviceKind::Jade => 3,
        }
    }

    /// Resolve which adapter `connect` should use: the explicit type if given, the sole
    /// registered adapter if there's only one, or `Ambiguous` otherwise (`spec.md` §4.8).
    fn resolve(state: &State, device_type: Option<DeviceKind>) -> Result<DeviceKind, Error> {
        if let Some(kind) = device_type {
            if state.adapters.contains_key(&kind) {
                return Ok(kind);
            }
            return Err(Error::Unsupported(format!("no adapter registered for {}", kind.as_str())));
        }
        let mut kinds: Vec<&DeviceKind> = state.adapters.keys().collect();
        kinds.sort_by_key(|k| Self::ordered_kinds_key(k));
        match kinds.as_slice() {
            [] => Err(Error::Unsupported("no adapters registered".to_string())),
            [only] => Ok(**only),
            _ => Err(Error::Ambiguous),
        }
    }

    /// Connect to `device_type` (or the sole registered adapter). If a different adapter is
    /// currently active, it is disconnected first, preserving the "at most one active adapter"
    /// invariant.
    pub async fn connect(&self, device_type: Option<DeviceKind>) -> Result<DeviceDescriptor, Error> {
        let mut state = self.state.lock().await;
        let kind = Self::resolve(&state, device_type)?;
        if let Some(current) = state.active {
            if current != kind {
                if let Some(adapter) = state.adapters.get_mut(&current) {
                    adapter.disconnect().await?;
                }
            }
        }
        let adapter = state.adapters.get_mut(&kind).ok_or(Error::NotConnected)?;
        let descriptor = adapter.connect().await?;
        state.active = Some(kind);
        Ok(descriptor)
    }

    pub async fn disconnect(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if let Some(kind) = state.active.take() {
            if let Some(adapter) = state.adapters.get_mut(&kind) {
                adapter.disconnect().await?;
            }
        }
        Ok(())
    }

    pub async fn get_device(&self) -> Option<DeviceDescriptor> {
        let state = self.state.lock().await;
        let kind = state.active?;
        state.adapters.get(&kind)?.get_device().await
    }

    pub async fn enumerate_devices(&self) -> Vec<DeviceDescriptor> {
        let state = self.state.lock().await;
        let mut out = Vec::new();
        for adapter in state.adapters.values() {
            if let Ok(devices) = adapter.enumerate_authorized().await {
                out.extend(devices);
            }
        }
        out
    }

    pub async fn get_xpub(&self, path: &Bip32Path) -> Result<XpubResult, Error> {
        let mut state = self.state.lock().await;
        let kind = state.active.ok_or(Error::NotConnected)?;
        let adapter = state.adapters.get_mut(&kind).ok_or(Error::NotConnected)?;
        adapter.get_xpub(path).await
    }

    pub async fn sign_psbt(&self, request: SignRequest) -> Result<SignResponse, Error> {
        let mut state = self.state.lock().await;
        let kind = state.active.ok_or(Error::NotConnected)?;
        let adapter = state.adapters.get_mut(&kind).ok_or(Error::NotConnected)?;
        adapter.sign_psbt(request).await
    }

    pub async fn verify_address(&self, path: &Bip32Path, expected: &Address) -> Result<bool, Error> {
        let mut state = self.state.lock().await;
        let kind = state.active.ok_or(Error::NotConnected)?;
        let adapter = state.adapters.get_mut(&kind).ok_or(Error::NotConnected)?;
        adapter.verify_address(path, expected).await
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
