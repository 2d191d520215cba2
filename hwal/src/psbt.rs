//! PSBT normalizer (`spec.md` §4.3, C3): classify inputs, find the paths and origins a
//! connected device needs to sign against, independent of which vendor adapter reads them.
//!
//! Field access mirrors `liana`'s own descriptor/PSBT code (`change_indexes`,
//! `prune_bip32_derivs` in `examples/wizardsardine-liana/liana/src/descriptors/mod.rs`): walk
//! `bip32_derivation` for legacy/segwit-v0 keys and `tap_key_origins` for taproot ones, keyed by
//! `(Fingerprint, DerivationPath)` pairs.

use miniscript::bitcoin::bip32::Fingerprint;
use miniscript::bitcoin::psbt::{Input, Psbt};
use miniscript::bitcoin::Network;
use std::convert::TryFrom;

use crate::error::Error;
use crate::path::Bip32Path;

/// Which witness/signing program a PSBT input spends, the detail an adapter needs to pick a
/// signature type and sighash default (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Pre-segwit: `non_witness_utxo` only, script-sig signatures.
    Legacy,
    /// P2WPKH/P2WSH/P2SH-wrapped segwit v0.
    SegwitV0,
    /// P2TR key-path or script-path spend.
    Taproot,
}

/// Parse raw bytes (not base64) into a `Psbt`. `spec.md` leaves the outer transport encoding
/// (base64 vs raw) to the caller; this operates on the deserialized binary form.
pub fn parse(bytes: &[u8]) -> Result<Psbt, Error> {
    Psbt::deserialize(bytes).map_err(|e| Error::IncompletePsbt(e.to_string()))
}

/// Determine which kind of input this is by inspecting the UTXO and script fields present,
/// preferring the most specific evidence (taproot fields, then witness script/utxo, then
/// falling back to legacy).
pub fn classify_input(input: &Input) -> Result<InputKind, Error> {
    if input.tap_internal_key.is_some() || !input.tap_key_origins.is_empty() {
        return Ok(InputKind::Taproot);
    }
    if let Some(utxo) = &input.witness_utxo {
        if utxo.script_pubkey.is_p2tr() {
            return Ok(InputKind::Taproot);
        }
        return Ok(InputKind::SegwitV0);
    }
    if input.witness_script.is_some() || input.redeem_script.is_some() {
        return Ok(InputKind::SegwitV0);
    }
    if input.non_witness_utxo.is_some() {
        return Ok(InputKind::Legacy);
    }
    Err(Error::IncompletePsbt(
        "input has neither a witness_utxo nor a non_witness_utxo".to_string(),
    ))
}

/// Find the derivation path this input's `bip32_derivation`/`tap_key_origins` records for the
/// given master fingerprint. Returns every matching path: a multisig input may list more than
/// one key for the same fingerprint only in pathological descriptors, but generally returns one.
pub fn paths_for_fingerprint(input: &Input, fingerprint: Fingerprint) -> Vec<Bip32Path> {
    let mut paths: Vec<Bip32Path> = input
        .bip32_derivation
        .values()
        .filter(|(fg, _)| *fg == fingerprint)
        .map(|(_, der_path)| Bip32Path::from(der_path))
        .collect();
    paths.extend(
        input
            .tap_key_origins
            .values()
            .filter(|(_, (fg, _))| *fg == fingerprint)
            .map(|(_, (_, der_path))| Bip32Path::from(der_path)),
    );
    paths
}

/// The account-level path common to every signer of this input: the full path minus its last two
/// components (change and address index), per the standard single-sig/multisig layout
/// `m/purpose'/coin'/account'/change/index`. Returns `None` if the path is too short to have an
/// account level (used as a last-resort fallback site, not a parsing failure).
pub fn account_path(path: &Bip32Path) -> Option<Bip32Path> {
    if path.len() < 2 {
        return None;
    }
    Some(path.take(path.len() - 2))
}

/// Best-effort network detection from an input's derivation paths, reading the BIP-44-style coin
/// type component (`m/purpose'/coin'/...`): `0'` is mainnet, `1'` is any test network. Returns
/// `None` when no path carries enough information (no bip32_derivation/tap_key_origins at all).
pub fn detect_network(psbt: &Psbt) -> Option<Network> {
    for input in &psbt.inputs {
        let coin_type = input
            .bip32_derivation
            .values()
            .map(|(_, p)| p)
            .chain(input.tap_key_origins.values().map(|(_, (_, p))| p))
            .find_map(|p| p.into_iter().nth(1));
        if let Some(cn) = coin_type {
            let index = u32::from(*cn) & 0x7fff_ffff;
            return Some(if index == 0 {
                Network::Bitcoin
            } else {
                Network::Testnet
            });
        }
    }
    None
}

/// Index of this input/output within the unsigned transaction, used by adapters that need to
/// pass an input index on the wire alongside its path (e.g. Ledger's `sign_psbt`).
pub fn input_count(psbt: &Psbt) -> usize {
    psbt.unsigned_tx.input.len()
}

impl TryFrom<&Psbt> for Network {
    type Error = Error;

    fn try_from(psbt: &Psbt) -> Result<Self, Error> {
        detect_network(psbt).ok_or_else(|| {
            Error::IncompletePsbt("could not detect the network from any input's derivation path".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use miniscript::bitcoin::absolute::LockTime;
    use miniscript::bitcoin::transaction::Version;
    use miniscript::bitcoin::{Transaction, TxOut};

    fn empty_psbt() -> Psbt {
        Psbt {
            unsigned_tx: Transaction {
                version: Version::TWO,
                lock_time: LockTime::ZERO,
                input: vec![],
                output: vec![],
            },
            version: 0,
            xpub: Default::default(),
            proprietary: Default::default(),
            unknown: Default::default(),
            inputs: vec![],
            outputs: vec![],
        }
    }

    #[test]
    fn classify_legacy_input_requires_some_utxo() {
        let input = Input::default();
        assert!(matches!(
            classify_input(&input),
            Err(Error::IncompletePsbt(_))
        ));
    }

    #[test]
    fn classify_taproot_from_internal_key() {
        let mut input = Input::default();
        let (xonly, _) = miniscript::bitcoin::secp256k1::Secp256k1::new()
            .generate_keypair(&mut miniscript::bitcoin::secp256k1::rand::thread_rng())
            .1
            .x_only_public_key();
        input.tap_internal_key = Some(xonly);
        assert_eq!(classify_input(&input).unwrap(), InputKind::Taproot);
    }

    #[test]
    fn segwit_v0_from_witness_script() {
        let mut input = Input::default();
        input.witness_utxo = Some(TxOut {
            value: miniscript::bitcoin::Amount::from_sat(1000),
            script_pubkey: miniscript::bitcoin::ScriptBuf::new(),
        });
        assert_eq!(classify_input(&input).unwrap(), InputKind::SegwitV0);
    }

    #[test]
    fn account_path_drops_change_and_index() {
        let path: Bip32Path = "m/84'/0'/2'/0/5".parse().unwrap();
        assert_eq!(account_path(&path).unwrap().to_string(), "m/84'/0'/2'");
    }

    #[test]
    fn account_path_none_when_too_short() {
        let path: Bip32Path = "m/0".parse().unwrap();
        assert!(account_path(&path).is_none());
    }

    #[test]
    fn detect_network_none_without_derivations() {
        assert_eq!(detect_network(&empty_psbt()), None);
    }
}
