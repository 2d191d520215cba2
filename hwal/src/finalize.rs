//! Signature applier / finalizer (`spec.md` §4.7, C7).
//!
//! Finalization is atomic across inputs: if any input cannot be finalized, the whole PSBT is
//! returned with whatever partial signatures adapters already wrote, but with no
//! `finalScriptSig`/`finalScriptWitness` fields at all, so a caller can hand it to another device
//! rather than get a half-finalized transaction.

use miniscript::bitcoin::psbt::{Input, Psbt};
use miniscript::bitcoin::script::{Builder, PushBytesBuf};
use miniscript::bitcoin::secp256k1::PublicKey;
use miniscript::bitcoin::sighash::TapSighashType;
use miniscript::bitcoin::{ecdsa, taproot, EcdsaSighashType, ScriptBuf, Witness};

use crate::error::Error;
use crate::multisig::{reconstruct, MultisigPolicy};
use crate::psbt::{classify_input, InputKind};

/// Curve-specific raw signature bytes as a device's wire codec returns them, with no sighash
/// byte appended yet.
pub enum RawSignature {
    /// DER-encoded ECDSA signature.
    Ecdsa(Vec<u8>),
    /// 64-byte BIP-340 Schnorr signature.
    Schnorr([u8; 64]),
}

/// Store one device-returned signature into `input`, per `spec.md` §4.7: ECDSA signatures always
/// get the input's declared sighash appended (default `SIGHASH_ALL`) before being inserted into
/// `partial_sigs`; Schnorr signatures are stored into `tap_key_sig`, with a sighash byte appended
/// only when the input's declared sighash is not the taproot default. `pubkey` is unused for the
/// Schnorr case (an input has a single `tap_key_sig` slot) but every adapter's wire codec hands
/// back a `(pubkey, signature)` pair regardless of curve, so callers pass it through unconditionally.
pub fn apply_signature(input: &mut Input, pubkey: PublicKey, sig: RawSignature) -> Result<(), Error> {
    match sig {
        RawSignature::Ecdsa(der) => {
            let sighash_type = input
                .sighash_type
                .map(|t| t.ecdsa_hash_ty().unwrap_or(EcdsaSighashType::All))
                .unwrap_or(EcdsaSighashType::All);
            let mut bytes = der;
            bytes.push(sighash_type as u8);
            let signature =
                ecdsa::Signature::from_slice(&bytes).map_err(|e| Error::BadSignature(e.to_string()))?;
            input.partial_sigs.insert(pubkey, signature);
        }
        RawSignature::Schnorr(raw) => {
            let sighash_type = input
                .sighash_type
                .map(|t| t.taproot_hash_ty().unwrap_or(TapSighashType::Default))
                .unwrap_or(TapSighashType::Default);
            let mut bytes = raw.to_vec();
            if sighash_type != TapSighashType::Default {
                bytes.push(sighash_type as u8);
            }
            let signature =
                taproot::Signature::from_slice(&bytes).map_err(|e| Error::BadSignature(e.to_string()))?;
            input.tap_key_sig = Some(signature);
        }
    }
    Ok(())
}

struct FinalizedInput {
    script_sig: Option<ScriptBuf>,
    witness: Option<Witness>,
}

fn finalize_p2wpkh(input: &Input) -> Result<FinalizedInput, Error> {
    let (pubkey, sig) = input
        .partial_sigs
        .iter()
        .next()
        .ok_or_else(|| Error::IncompletePsbt("no partial signature for P2WPKH input".to_string()))?;
    let mut witness = Witness::new();
    witness.push(sig.to_vec());
    witness.push(pubkey.to_bytes());
    Ok(FinalizedInput {
        script_sig: Some(ScriptBuf::new()),
        witness: Some(witness),
    })
}

fn finalize_p2sh_p2wpkh(input: &Input) -> Result<FinalizedInput, Error> {
    let redeem_script = input
        .redeem_script
        .as_ref()
        .ok_or_else(|| Error::IncompletePsbt("P2SH-P2WPKH input missing redeem_script".to_string()))?;
    let mut finalized = finalize_p2wpkh(input)?;
    let push = PushBytesBuf::try_from(redeem_script.as_bytes().to_vec())
        .map_err(|e| Error::Protocol(e.to_string()))?;
    finalized.script_sig = Some(Builder::new().push_slice(push).into_script());
    Ok(finalized)
}

fn finalize_p2pkh(input: &Input) -> Result<FinalizedInput, Error> {
    let (pubkey, sig) = input
        .partial_sigs
        .iter()
        .next()
        .ok_or_else(|| Error::IncompletePsbt("no partial signature for P2PKH input".to_string()))?;
    let sig_push = PushBytesBuf::try_from(sig.to_vec()).map_err(|e| Error::Protocol(e.to_string()))?;
    let pk_push =
        PushBytesBuf::try_from(pubkey.to_bytes()).map_err(|e| Error::Protocol(e.to_string()))?;
    let script_sig = Builder::new().push_slice(sig_push).push_slice(pk_push).into_script();
    Ok(FinalizedInput {
        script_sig: Some(script_sig),
        witness: None,
    })
}

/// P2WSH multisig: witness is `OP_0 <sig>... <witnessScript>`, signatures ordered to match the
/// BIP-67-sorted cosigner list C5 reconstructed, not signing order.
fn finalize_wsh_multisig(input: &Input, policy: &MultisigPolicy) -> Result<FinalizedInput, Error> {
    let witness_script = input
        .witness_script
        .as_ref()
        .ok_or_else(|| Error::IncompletePsbt("multisig input missing witness_script".to_string()))?;

    let mut sigs = Vec::new();
    for cosigner in &policy.cosigners {
        if let Some(sig) = input.partial_sigs.get(&cosigner.pubkey) {
            sigs.push(sig.to_vec());
            if sigs.len() == policy.m as usize {
                break;
            }
        }
    }
    if sigs.len() < policy.m as usize {
        return Err(Error::IncompletePsbt(format!(
            "multisig input has {} of {} required signatures",
            sigs.len(),
            policy.m
        )));
    }

    let mut witness = Witness::new();
    witness.push(Vec::new()); // OP_CHECKMULTISIG off-by-one dummy element
    for sig in sigs {
        witness.push(sig);
    }
    witness.push(witness_script.as_bytes().to_vec());
    Ok(FinalizedInput {
        script_sig: Some(ScriptBuf::new()),
        witness: Some(witness),
    })
}

fn finalize_p2tr(input: &Input) -> Result<FinalizedInput, Error> {
    let sig = input
        .tap_key_sig
        .ok_or_else(|| Error::IncompletePsbt("no taproot key-path signature for input".to_string()))?;
    let mut witness = Witness::new();
    witness.push(sig.to_vec());
    Ok(FinalizedInput {
        script_sig: Some(ScriptBuf::new()),
        witness: Some(witness),
    })
}

fn finalize_one(input: &Input, policy: Option<&MultisigPolicy>) -> Result<FinalizedInput, Error> {
    match classify_input(input)? {
        InputKind::Taproot => finalize_p2tr(input),
        InputKind::SegwitV0 => {
            if let Some(policy) = policy {
                finalize_wsh_multisig(input, policy)
            } else if input.redeem_script.is_some() {
                finalize_p2sh_p2wpkh(input)
            } else {
                finalize_p2wpkh(input)
            }
        }
        InputKind::Legacy => finalize_p2pkh(input),
    }
}

/// Apply returned partial signatures (already written into each input's `partial_sigs`/
/// `tap_key_sig` by the adapter) and finalize every input into `final_script_sig`/
/// `final_script_witness`. Returns `Ok(true)` if every input finalized, `Ok(false)` if at least
/// one input lacked enough signatures (partial signatures are kept, no `finalScript*` fields are
/// written to any input). Multisig inputs need their `witnessScript` reconstructed via C5 first;
/// pass the per-input policy for any input that is a P2WSH multisig.
pub fn finalize(psbt: &mut Psbt, multisig_policies: &std::collections::BTreeMap<usize, MultisigPolicy>) -> Result<bool, Error> {
    let mut results = Vec::with_capacity(psbt.inputs.len());
    for (index, input) in psbt.inputs.iter().enumerate() {
        match finalize_one(input, multisig_policies.get(&index)) {
            Ok(finalized) => results.push(Some(finalized)),
            Err(Error::IncompletePsbt(_)) => return Ok(false),
            Err(e) => return Err(e),
        }
    }

    for (input, finalized) in psbt.inputs.iter_mut().zip(results.into_iter()) {
        let finalized = finalized.expect("every input produced a result above");
        input.final_script_sig = finalized.script_sig;
        input.final_script_witness = finalized.witness;
        // BIP-174: a finalized input no longer carries signing-time fields.
        input.partial_sigs.clear();
        input.bip32_derivation.clear();
        input.witness_script = None;
        input.redeem_script = None;
        input.tap_key_sig = None;
        input.tap_script_sigs.clear();
        input.tap_key_origins.clear();
    }
    Ok(true)
}

/// Reconstruct the multisig policy for every P2WSH-multisig input in the PSBT, keyed by input
/// index, for callers that want to finalize without tracking policies themselves.
pub fn multisig_policies(
    psbt: &Psbt,
    xpubs_by_fingerprint: &std::collections::BTreeMap<miniscript::bitcoin::bip32::Fingerprint, String>,
) -> Result<std::collections::BTreeMap<usize, MultisigPolicy>, Error> {
    let mut policies = std::collections::BTreeMap::new();
    for (index, input) in psbt.inputs.iter().enumerate() {
        if let Some(witness_script) = &input.witness_script {
            if input.bip32_derivation.len() > 1 {
                let policy = reconstruct(witness_script, input, xpubs_by_fingerprint)?;
                policies.insert(index, policy);
            }
        }
    }
    Ok(policies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use miniscript::bitcoin::absolute::LockTime;
    use miniscript::bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
    use miniscript::bitcoin::transaction::Version;
    use miniscript::bitcoin::{Amount, OutPoint, Transaction, TxIn, TxOut};

    fn key(i: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let mut sk_bytes = [0u8; 32];
        sk_bytes[31] = i;
        let sk = SecretKey::from_slice(&sk_bytes).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        (sk, pk)
    }

    fn dummy_ecdsa_sig() -> miniscript::bitcoin::ecdsa::Signature {
        let secp = Secp256k1::new();
        let (sk, _) = key(1);
        let msg = miniscript::bitcoin::secp256k1::Message::from_digest([7u8; 32]);
        let sig = secp.sign_ecdsa(&msg, &sk);
        miniscript::bitcoin::ecdsa::Signature::sighash_all(sig)
    }

    fn base_psbt() -> Psbt {
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
            inputs: vec![Input::default()],
            outputs: vec![Default::default()],
        }
    }

    #[test]
    fn p2wpkh_finalizes_with_one_signature() {
        let mut psbt = base_psbt();
        let (_, pubkey) = key(2);
        psbt.inputs[0].witness_utxo = Some(TxOut {
            value: Amount::from_sat(1000),
            script_pubkey: ScriptBuf::new(),
        });
        psbt.inputs[0].partial_sigs.insert(pubkey, dummy_ecdsa_sig());

        let done = finalize(&mut psbt, &Default::default()).unwrap();
        assert!(done);
        assert!(psbt.inputs[0].final_script_witness.is_some());
        assert!(psbt.inputs[0].partial_sigs.is_empty());
    }

    #[test]
    fn incomplete_input_returns_false_without_touching_psbt() {
        let mut psbt = base_psbt();
        psbt.inputs[0].witness_utxo = Some(TxOut {
            value: Amount::from_sat(1000),
            script_pubkey: ScriptBuf::new(),
        });
        // no partial_sigs inserted
        let done = finalize(&mut psbt, &Default::default()).unwrap();
        assert!(!done);
        assert!(psbt.inputs[0].final_script_witness.is_none());
    }

    #[test]
    fn apply_signature_appends_default_sighash_to_ecdsa() {
        let mut input = Input::default();
        let (_, pubkey) = key(3);
        let secp = Secp256k1::new();
        let (sk, _) = key(1);
        let msg = miniscript::bitcoin::secp256k1::Message::from_digest([9u8; 32]);
        let der = secp.sign_ecdsa(&msg, &sk).serialize_der().to_vec();

        apply_signature(&mut input, pubkey, RawSignature::Ecdsa(der)).unwrap();

        let stored = input.partial_sigs.get(&pubkey).unwrap();
        assert_eq!(stored.sighash_type, EcdsaSighashType::All);
    }

    #[test]
    fn apply_signature_stores_schnorr_into_tap_key_sig() {
        let mut input = Input::default();
        let (_, pubkey) = key(4);

        apply_signature(&mut input, pubkey, RawSignature::Schnorr([0x11; 64])).unwrap();

        let stored = input.tap_key_sig.unwrap();
        assert_eq!(stored.sighash_type, TapSighashType::Default);
    }

    #[test]
    fn apply_signature_appends_non_default_taproot_sighash() {
        let mut input = Input::default();
        let (_, pubkey) = key(5);
        input.sighash_type = Some(TapSighashType::All.into());

        apply_signature(&mut input, pubkey, RawSignature::Schnorr([0x22; 64])).unwrap();

        let stored = input.tap_key_sig.unwrap();
        assert_eq!(stored.sighash_type, TapSighashType::All);
    }
}
