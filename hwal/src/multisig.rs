//! Multisig script reconstructor (`spec.md` §4.5, C5).
//!
//! Multisig-aware devices only sign once they can re-derive the full witness script themselves,
//! so they demand the full cosigner set (xpub + child path), not just the raw pubkeys the PSBT
//! already carries inline. This module parses the `OP_M <pubkey>×n OP_N OP_CHECKMULTISIG` witness
//! script, matches each pubkey back to its `bip32Derivation` entry, and sorts the result per
//! BIP-67 so the reconstructed script is byte-identical regardless of signing order.

use miniscript::bitcoin::bip32::Fingerprint;
use miniscript::bitcoin::psbt::Input;
use miniscript::bitcoin::secp256k1::PublicKey;
use miniscript::bitcoin::ScriptBuf;
use std::collections::BTreeMap;

use crate::error::Error;
use crate::path::Bip32Path;

/// OP_1 through OP_16 occupy opcodes 0x51 through 0x60.
const OP_1: u8 = 0x51;
const OP_CHECKMULTISIG: u8 = 0xae;

/// One participant of a multisig policy, as a device needs it to re-derive the script: either the
/// canonical xpub (when the caller supplied one for this fingerprint) or, failing that, the raw
/// compressed pubkey — which some vendors will reject, a rejection this core does not mask
/// (`spec.md` §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CosignerNode {
    Xpub(String),
    RawPubkey([u8; 33]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cosigner {
    pub pubkey: PublicKey,
    pub fingerprint: Fingerprint,
    pub node: CosignerNode,
    /// The last two unhardened components of this cosigner's derivation path (change, index).
    pub child_path: Bip32Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigPolicy {
    pub m: u8,
    pub n: u8,
    /// Ascending by compressed pubkey bytes (BIP-67).
    pub cosigners: Vec<Cosigner>,
}

fn decode_threshold(byte: u8) -> Option<u8> {
    if !(OP_1..=OP_1 + 15).contains(&byte) {
        return None;
    }
    Some(byte - OP_1 + 1)
}

/// Parse a `witnessScript` as a `sortedmulti`/`multi`-style `OP_M <pubkey>×n OP_N
/// OP_CHECKMULTISIG` script. Does not assume the pubkeys already appear in BIP-67 order; the
/// caller-facing `reconstruct` below re-sorts them regardless.
fn parse_script(script: &ScriptBuf) -> Result<(u8, Vec<PublicKey>), Error> {
    let bytes = script.as_bytes();
    if bytes.len() < 3 {
        return Err(Error::PolicyMismatch("witness script too short to be multisig".to_string()));
    }
    let m = decode_threshold(bytes[0])
        .ok_or_else(|| Error::PolicyMismatch("witness script does not start with OP_M".to_string()))?;
    let n = decode_threshold(bytes[bytes.len() - 2])
        .ok_or_else(|| Error::PolicyMismatch("witness script does not end with OP_N before OP_CHECKMULTISIG".to_string()))?;
    if bytes[bytes.len() - 1] != OP_CHECKMULTISIG {
        return Err(Error::PolicyMismatch("witness script missing OP_CHECKMULTISIG".to_string()));
    }
    if !(1..=16).contains(&m) || !(1..=16).contains(&n) || m > n {
        return Err(Error::PolicyMismatch(format!(
            "invalid multisig threshold {} of {}",
            m, n
        )));
    }

    let mut pubkeys = Vec::with_capacity(n as usize);
    let mut cursor = &bytes[1..bytes.len() - 2];
    while !cursor.is_empty() {
        let len = cursor[0] as usize;
        if len != 33 || cursor.len() < 1 + len {
            return Err(Error::PolicyMismatch(
                "multisig witness script contains a non-compressed-pubkey push".to_string(),
            ));
        }
        let pubkey = PublicKey::from_slice(&cursor[1..1 + len])
            .map_err(|e| Error::PolicyMismatch(format!("invalid pubkey in witness script: {}", e)))?;
        pubkeys.push(pubkey);
        cursor = &cursor[1 + len..];
    }
    if pubkeys.len() != n as usize {
        return Err(Error::PolicyMismatch(format!(
            "witness script declares {} keys but lists {}",
            n,
            pubkeys.len()
        )));
    }
    Ok((m, pubkeys))
}

/// Reconstruct the vendor-neutral multisig policy for an input: parse the witness script,
/// match every pubkey to its `bip32Derivation` entry, prefer the caller-supplied canonical xpub
/// for each fingerprint (falling back to the raw pubkey), and sort ascending by compressed pubkey
/// bytes (BIP-67) so the result is identical across any cosigner permutation.
pub fn reconstruct(
    witness_script: &ScriptBuf,
    input: &Input,
    xpubs_by_fingerprint: &BTreeMap<Fingerprint, String>,
) -> Result<MultisigPolicy, Error> {
    let (m, pubkeys) = parse_script(witness_script)?;
    let n = pubkeys.len() as u8;

    let mut cosigners = Vec::with_capacity(pubkeys.len());
    for pubkey in pubkeys {
        let compressed = pubkey.serialize();
        let (fingerprint, der_path) = input
            .bip32_derivation
            .get(&pubkey)
            .map(|(fg, p)| (*fg, Bip32Path::from(p)))
            .ok_or_else(|| {
                Error::PolicyMismatch(format!(
                    "witness script pubkey {} has no bip32Derivation entry",
                    hex::encode(compressed)
                ))
            })?;
        let node = match xpubs_by_fingerprint.get(&fingerprint) {
            Some(xpub) => CosignerNode::Xpub(xpub.clone()),
            None => CosignerNode::RawPubkey(compressed),
        };
        cosigners.push(Cosigner {
            pubkey,
            fingerprint,
            node,
            child_path: der_path.last(2),
        });
    }
    cosigners.sort_by(|a, b| a.pubkey.serialize().cmp(&b.pubkey.serialize()));

    Ok(MultisigPolicy { m, n, cosigners })
}

#[cfg(test)]
mod tests {
    use super::*;
    use miniscript::bitcoin::bip32::DerivationPath;
    use miniscript::bitcoin::opcodes::all::OP_PUSHBYTES_33;
    use miniscript::bitcoin::secp256k1::Secp256k1;
    use miniscript::bitcoin::script::Builder;
    use std::str::FromStr;

    fn test_keys(n: usize) -> Vec<PublicKey> {
        let secp = Secp256k1::new();
        (0..n)
            .map(|i| {
                let mut sk_bytes = [0u8; 32];
                sk_bytes[31] = (i + 1) as u8;
                let sk = miniscript::bitcoin::secp256k1::SecretKey::from_slice(&sk_bytes).unwrap();
                PublicKey::from_secret_key(&secp, &sk)
            })
            .collect()
    }

    fn two_of_three_script(keys: &[PublicKey]) -> ScriptBuf {
        let mut builder = Builder::new().push_opcode(miniscript::bitcoin::opcodes::all::OP_PUSHNUM_2);
        for k in keys {
            let _ = OP_PUSHBYTES_33; // compressed pubkeys always push 33 bytes
            builder = builder.push_slice(k.serialize());
        }
        builder
            .push_opcode(miniscript::bitcoin::opcodes::all::OP_PUSHNUM_3)
            .push_opcode(miniscript::bitcoin::opcodes::all::OP_CHECKMULTISIG)
            .into_script()
    }

    #[test]
    fn parses_threshold_and_keys() {
        let keys = test_keys(3);
        let script = two_of_three_script(&keys);
        let (m, parsed) = parse_script(&script).unwrap();
        assert_eq!(m, 2);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed, keys);
    }

    #[test]
    fn rejects_bad_threshold() {
        let keys = test_keys(1);
        // m=0 is not a valid OP_M.
        let script = Builder::new()
            .push_opcode(miniscript::bitcoin::opcodes::OP_0)
            .push_slice(keys[0].serialize())
            .push_opcode(miniscript::bitcoin::opcodes::all::OP_PUSHNUM_1)
            .push_opcode(miniscript::bitcoin::opcodes::all::OP_CHECKMULTISIG)
            .into_script();
        assert!(matches!(parse_script(&script), Err(Error::PolicyMismatch(_))));
    }

    #[test]
    fn reconstruct_is_invariant_under_permutation() {
        let keys = test_keys(3);
        let script = two_of_three_script(&keys);

        let mut input = Input::default();
        for (i, k) in keys.iter().enumerate() {
            let fg = Fingerprint::from([i as u8, 0, 0, 0]);
            let path = DerivationPath::from_str(&format!("m/48'/0'/0'/2'/0/{}", i)).unwrap();
            input.bip32_derivation.insert(*k, (fg, path));
        }

        let policy_a = reconstruct(&script, &input, &BTreeMap::new()).unwrap();

        // Re-derive from a differently-ordered key list in a fresh script; the cosigner list
        // should still come out sorted identically.
        let mut shuffled_keys = keys.clone();
        shuffled_keys.reverse();
        let shuffled_script = two_of_three_script(&shuffled_keys);
        let policy_b = reconstruct(&shuffled_script, &input, &BTreeMap::new()).unwrap();

        assert_eq!(policy_a.cosigners, policy_b.cosigners);
        assert_eq!(policy_a.m, 2);
        assert_eq!(policy_a.n, 3);
        // ascending by compressed pubkey bytes
        for w in policy_a.cosigners.windows(2) {
            assert!(w[0].pubkey.serialize() <= w[1].pubkey.serialize());
        }
    }

    #[test]
    fn missing_bip32_derivation_is_policy_mismatch() {
        let keys = test_keys(2);
        let script = Builder::new()
            .push_opcode(miniscript::bitcoin::opcodes::all::OP_PUSHNUM_2)
            .push_slice(keys[0].serialize())
            .push_slice(keys[1].serialize())
            .push_opcode(miniscript::bitcoin::opcodes::all::OP_PUSHNUM_2)
            .push_opcode(miniscript::bitcoin::opcodes::all::OP_CHECKMULTISIG)
            .into_script();
        let input = Input::default();
        assert!(matches!(
            reconstruct(&script, &input, &BTreeMap::new()),
            Err(Error::PolicyMismatch(_))
        ));
    }
}
