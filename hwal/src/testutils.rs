//! Mock adapter for exercising `Registry` and callers of `HWI` without physical hardware,
//! following `liana::testutils::DummyBitcoind`'s pattern of a hand-written trait implementation
//! driven by canned in-memory state rather than a mocking framework.

use std::sync::Mutex;

use async_trait::async_trait;
use miniscript::bitcoin::bip32::{Fingerprint, Xpub};
use miniscript::bitcoin::psbt::Psbt;
use miniscript::bitcoin::Address;

use crate::adapters::{Capability, DeviceDescriptor, DeviceKind, SignRequest, SignResponse, XpubResult, HWI};
use crate::error::Error;
use crate::path::Bip32Path;

struct MockState {
    connected: bool,
    descriptor: DeviceDescriptor,
    xpub: Xpub,
    sign_result: Option<Result<SignResponse, Error>>,
    verify_result: bool,
}

/// A stand-in `HWI` implementation returning pre-programmed responses, for tests that exercise
/// `Registry` routing (ambiguity, "at most one active adapter", `NotConnected`) without touching
/// a real transport.
pub struct MockAdapter {
    kind: DeviceKind,
    capabilities: Vec<Capability>,
    state: Mutex<MockState>,
}

impl MockAdapter {
    pub fn new(kind: DeviceKind, fingerprint: Fingerprint, xpub: Xpub) -> Self {
        MockAdapter {
            kind,
            capabilities: vec![Capability::Xpub, Capability::SignPsbt, Capability::VerifyAddress],
            state: Mutex::new(MockState {
                connected: false,
                descriptor: DeviceDescriptor {
                    kind,
                    fingerprint,
                    version: "mock-1.0".to_string(),
                },
                xpub,
                sign_result: None,
                verify_result: true,
            }),
        }
    }

    /// Program the response `sign_psbt` returns on its next call.
    pub fn set_sign_result(&self, result: Result<SignResponse, Error>) {
        self.state.lock().unwrap().sign_result = Some(result);
    }

    pub fn set_verify_result(&self, confirmed: bool) {
        self.state.lock().unwrap().verify_result = confirmed;
    }
}

#[async_trait]
impl HWI for MockAdapter {
    fn device_kind(&self) -> DeviceKind {
        self.kind
    }

    fn is_supported(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn connect(&mut self) -> Result<DeviceDescriptor, Error> {
        let mut state = self.state.lock().unwrap();
        state.connected = true;
        Ok(state.descriptor.clone())
    }

    async fn disconnect(&mut self) -> Result<(), Error> {
        self.state.lock().unwrap().connected = false;
        Ok(())
    }

    async fn get_device(&self) -> Option<DeviceDescriptor> {
        let state = self.state.lock().unwrap();
        state.connected.then(|| state.descriptor.clone())
    }

    async fn get_xpub(&mut self, path: &Bip32Path) -> Result<XpubResult, Error> {
        let state = self.state.lock().unwrap();
        if !state.connected {
            return Err(Error::NotConnected);
        }
        Ok(XpubResult {
            xpub: state.xpub,
            master_fingerprint: state.descriptor.fingerprint,
            path: path.clone(),
        })
    }

    async fn sign_psbt(&mut self, request: SignRequest) -> Result<SignResponse, Error> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(Error::NotConnected);
        }
        state.sign_result.take().unwrap_or(Ok(SignResponse {
            psbt: request.psbt,
            raw_tx: None,
            signature_count: 0,
        }))
    }

    async fn verify_address(&mut self, _path: &Bip32Path, _expected: &Address) -> Result<bool, Error> {
        let state = self.state.lock().unwrap();
        if !state.connected {
            return Err(Error::NotConnected);
        }
        Ok(state.verify_result)
    }
}

/// Build a syntactically-valid, empty PSBT for a single input/output, for tests that only care
/// about routing and don't need a realistic transaction.
pub fn empty_psbt() -> Psbt {
    use miniscript::bitcoin::absolute::LockTime;
    use miniscript::bitcoin::transaction::Version;
    use miniscript::bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxIn, TxOut};

    Psbt {
        unsigned_tx: Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                ..Default::default()
            }],
            output: vec![TxOut {
                value: Amount::from_sat(1000),
                script_pubkey: ScriptBuf::new(),
            }],
        },
        version: 0,
        xpub: Default::default(),
        proprietary: Default::default(),
        unknown: Default::default(),
        inputs: vec![Default::default()],
        outputs: vec![Default::default()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use miniscript::bitcoin::secp256k1::Secp256k1;
    use std::str::FromStr;

    fn dummy_xpub() -> Xpub {
        Xpub::from_str("xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8").unwrap()
    }

    #[tokio::test]
    async fn mock_adapter_requires_connect_before_use() {
        let _secp = Secp256k1::new();
        let mut adapter = MockAdapter::new(DeviceKind::Ledger, Fingerprint::from([1, 2, 3, 4]), dummy_xpub());
        let path: Bip32Path = "m/84'/0'/0'".parse().unwrap();
        assert!(matches!(adapter.get_xpub(&path).await, Err(Error::NotConnected)));
        adapter.connect().await.unwrap();
        assert!(adapter.get_xpub(&path).await.is_ok());
    }
}
