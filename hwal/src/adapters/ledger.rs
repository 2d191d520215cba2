//! Ledger adapter (`spec.md` §4.6): wallet-policy signing over APDU/HID.

use async_trait::async_trait;
use miniscript::bitcoin::bip32::Fingerprint;
use miniscript::bitcoin::psbt::Psbt;

use crate::adapters::{
    resolve_account_path, Capability, DeviceDescriptor, DeviceKind, HWI, ScriptType, SignRequest,
    SignResponse, XpubResult,
};
use crate::codec::apdu;
use crate::error::Error;
use crate::finalize::{apply_signature, RawSignature};
use crate::path::Bip32Path;
use crate::psbt::{classify_input, InputKind};
use crate::transport::hid::HidTransport;
use crate::transport::Transport;

const CAPABILITIES: &[Capability] = &[Capability::Xpub, Capability::SignPsbt];

pub struct LedgerAdapter {
    transport: Option<HidTransport>,
    descriptor: Option<DeviceDescriptor>,
}

impl LedgerAdapter {
    pub fn new() -> Self {
        LedgerAdapter {
            transport: None,
            descriptor: None,
        }
    }

    fn transport_mut(&mut self) -> Result<&mut HidTransport, Error> {
        self.transport.as_mut().ok_or(Error::NotConnected)
    }

    async fn fetch_master_fingerprint(transport: &mut HidTransport) -> Result<Fingerprint, Error> {
        let reply = transport.exchange(&apdu::get_master_fingerprint()).await?;
        if reply.len() != 4 {
            return Err(Error::Protocol(format!(
                "expected a 4-byte master fingerprint, got {} bytes",
                reply.len()
            )));
        }
        Ok(Fingerprint::from([reply[0], reply[1], reply[2], reply[3]]))
    }

    fn script_type_for(request: &SignRequest) -> ScriptType {
        request.script_type.unwrap_or(ScriptType::P2wpkh)
    }

    fn wallet_policy(fingerprint: Fingerprint, account_path: &Bip32Path, xpub: &str, script_type: ScriptType) -> String {
        let path_no_m = account_path.to_string();
        let path_no_m = path_no_m.strip_prefix('m').unwrap_or(&path_no_m);
        format!(
            "[{}{}]{}",
            fingerprint,
            path_no_m,
            script_type.ledger_template().replace("@0", xpub)
        )
    }
}

impl Default for LedgerAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HWI for LedgerAdapter {
    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Ledger
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
        let mut transport = HidTransport::open_first()?;
        let fingerprint = Self::fetch_master_fingerprint(&mut transport).await?;
        let descriptor = DeviceDescriptor {
            kind: DeviceKind::Ledger,
            fingerprint,
            version: "unknown".to_string(),
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
        let transport = self.transport_mut()?;
        let reply = transport
            .exchange(&apdu::get_extended_pubkey(path, false))
            .await?;
        let xpub_str = String::from_utf8(reply)
            .map_err(|e| Error::Protocol(format!("non-utf8 xpub from Ledger: {}", e)))?;
        let xpub = crate::xpub::to_xpub(&xpub_str)?;
        Ok(XpubResult {
            xpub,
            master_fingerprint: descriptor.fingerprint,
            path: path.clone(),
        })
    }

    async fn sign_psbt(&mut self, mut request: SignRequest) -> Result<SignResponse, Error> {
        let descriptor = self.descriptor.clone().ok_or(Error::NotConnected)?;
        let device_fingerprint = descriptor.fingerprint;

        reconcile_fingerprints(&mut request.psbt, device_fingerprint, request.allow_fingerprint_recovery)?;

        let script_type = Self::script_type_for(&request);
        let account_path = resolve_account_path(&request, device_fingerprint);

        let xpub_result = self.get_xpub(&account_path).await?;
        let policy = Self::wallet_policy(
            device_fingerprint,
            &account_path,
            &xpub_result.xpub.to_string(),
            script_type,
        );

        let mut psbt_bytes = Vec::new();
        request
            .psbt
            .serialize_to_writer(&mut psbt_bytes)
            .map_err(|e| Error::IncompletePsbt(e.to_string()))?;

        let transport = self.transport_mut()?;
        let reply = transport
            .exchange(&apdu::sign_psbt(&account_path, &policy, &psbt_bytes))
            .await?;
        let partial_sigs = apdu::decode_partial_sigs(&reply)?;

        let mut psbt = request.psbt;
        for sig in &partial_sigs {
            let input = psbt
                .inputs
                .get_mut(sig.input_index as usize)
                .ok_or_else(|| Error::Protocol("signature for out-of-range input index".to_string()))?;
            let pubkey = miniscript::bitcoin::secp256k1::PublicKey::from_slice(&sig.pubkey)
                .map_err(|e| Error::BadSignature(e.to_string()))?;
            let raw = match classify_input(input)? {
                InputKind::Taproot => {
                    let bytes: [u8; 64] = sig.signature.as_slice().try_into().map_err(|_| {
                        Error::BadSignature("expected a 64-byte Schnorr signature from Ledger".to_string())
                    })?;
                    RawSignature::Schnorr(bytes)
                }
                InputKind::SegwitV0 | InputKind::Legacy => RawSignature::Ecdsa(sig.signature.clone()),
            };
            apply_signature(input, pubkey, raw)?;
        }

        Ok(SignResponse {
            signature_count: partial_sigs.len(),
            psbt,
            raw_tx: None,
        })
    }
}

/// Ledger's fingerprint-reconciliation recovery (`spec.md` §4.6, §9): overwrite a mismatched
/// `bip32Derivation` master fingerprint with the connected device's own, logging the rewrite.
/// Missing `bip32Derivation` entirely is a hard error for Ledger.
fn reconcile_fingerprints(psbt: &mut Psbt, device_fingerprint: Fingerprint, allow_recovery: bool) -> Result<(), Error> {
    for (index, input) in psbt.inputs.iter_mut().enumerate() {
        if input.bip32_derivation.is_empty() && input.tap_key_origins.is_empty() {
            return Err(Error::IncompletePsbt(format!(
                "input {} has no bip32Derivation entries, required for Ledger",
                index
            )));
        }
        if !allow_recovery {
            continue;
        }
        for (fingerprint, _) in input.bip32_derivation.values_mut() {
            if *fingerprint != device_fingerprint {
                log::info!(
                    "rewriting stale master fingerprint {} to connected device fingerprint {} on input {}",
                    fingerprint,
                    device_fingerprint,
                    index
                );
                *fingerprint = device_fingerprint;
            }
        }
        for (_, (fingerprint, _)) in input.tap_key_origins.values_mut() {
            if *fingerprint != device_fingerprint {
                log::info!(
                    "rewriting stale taproot master fingerprint {} to connected device fingerprint {} on input {}",
                    fingerprint,
                    device_fingerprint,
                    index
                );
                *fingerprint = device_fingerprint;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use miniscript::bitcoin::absolute::LockTime;
    use miniscript::bitcoin::bip32::DerivationPath;
    use miniscript::bitcoin::psbt::Input;
    use miniscript::bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
    use miniscript::bitcoin::transaction::Version;
    use miniscript::bitcoin::{Amount, OutPoint, Transaction, TxIn, TxOut};
    use std::str::FromStr;

    fn test_pubkey() -> PublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        PublicKey::from_secret_key(&secp, &sk)
    }

    fn psbt_with_one_input(input: Input) -> Psbt {
        Psbt {
            unsigned_tx: Transaction {
                version: Version::TWO,
                lock_time: LockTime::ZERO,
                input: vec![TxIn {
                    previous_output: OutPoint::null(),
                    ..Default::default()
                }],
                output: vec![TxOut {
                    value: Amount::from_sat(50_000),
                    script_pubkey: miniscript::bitcoin::ScriptBuf::new(),
                }],
            },
            version: 0,
            xpub: Default::default(),
            proprietary: Default::default(),
            unknown: Default::default(),
            inputs: vec![input],
            outputs: vec![Default::default()],
        }
    }

    #[test]
    fn stale_fingerprint_is_rewritten_to_the_connected_device() {
        let device_fingerprint = Fingerprint::from([0xca, 0xfe, 0xba, 0xbe]);
        let mut input = Input::default();
        input.bip32_derivation.insert(
            test_pubkey(),
            (
                Fingerprint::from([0xde, 0xad, 0xbe, 0xef]),
                DerivationPath::from_str("m/84'/0'/0'/0/5").unwrap(),
            ),
        );
        let mut psbt = psbt_with_one_input(input);

        reconcile_fingerprints(&mut psbt, device_fingerprint, true).unwrap();

        let (fingerprint, _) = psbt.inputs[0].bip32_derivation.values().next().unwrap();
        assert_eq!(*fingerprint, device_fingerprint);
    }

    #[test]
    fn recovery_disabled_leaves_a_stale_fingerprint_untouched() {
        let stale = Fingerprint::from([0xde, 0xad, 0xbe, 0xef]);
        let mut input = Input::default();
        input.bip32_derivation.insert(
            test_pubkey(),
            (stale, DerivationPath::from_str("m/84'/0'/0'/0/5").unwrap()),
        );
        let mut psbt = psbt_with_one_input(input);

        reconcile_fingerprints(&mut psbt, Fingerprint::from([0xca, 0xfe, 0xba, 0xbe]), false).unwrap();

        let (fingerprint, _) = psbt.inputs[0].bip32_derivation.values().next().unwrap();
        assert_eq!(*fingerprint, stale);
    }

    #[test]
    fn missing_bip32_derivation_is_a_hard_error() {
        let mut psbt = psbt_with_one_input(Input::default());
        assert!(matches!(
            reconcile_fingerprints(&mut psbt, Fingerprint::from([1, 2, 3, 4]), true),
            Err(Error::IncompletePsbt(_))
        ));
    }
}
