//! APDU codec (`spec.md` §4.2, §4.6): Ledger request/response framing.
//!
//! Ledger's actual Bitcoin app protocol merklelizes large PSBT inputs across several
//! client-command round trips; this codec collapses that to a single APDU carrying the whole
//! request, which preserves the semantics (`spec.md` cares about the resulting wallet-policy
//! sign operation, not Ledger's specific chunking strategy) while staying a plain
//! `Transport::exchange` call.

use crate::error::Error;
use crate::path::Bip32Path;

pub const CLA_BITCOIN: u8 = 0xe1;
pub const INS_GET_MASTER_FINGERPRINT: u8 = 0x05;
pub const INS_GET_EXTENDED_PUBKEY: u8 = 0x00;
pub const INS_REGISTER_WALLET: u8 = 0x02;
pub const INS_SIGN_PSBT: u8 = 0x04;

fn header(ins: u8, p1: u8, p2: u8) -> Vec<u8> {
    vec![CLA_BITCOIN, ins, p1, p2]
}

fn encode_path(path: &Bip32Path) -> Vec<u8> {
    let indices = path.to_u32_array();
    let mut out = Vec::with_capacity(1 + indices.len() * 4);
    out.push(indices.len() as u8);
    for index in indices {
        out.extend_from_slice(&index.to_be_bytes());
    }
    out
}

pub fn get_master_fingerprint() -> Vec<u8> {
    header(INS_GET_MASTER_FINGERPRINT, 0, 0)
}

pub fn get_extended_pubkey(path: &Bip32Path, display: bool) -> Vec<u8> {
    let mut cmd = header(INS_GET_EXTENDED_PUBKEY, if display { 1 } else { 0 }, 0);
    cmd.extend(encode_path(path));
    cmd
}

/// `policy` is the serialized wallet policy string (`"[<fpr>/<path>]<xpub>"` wrapped in the
/// descriptor template, `spec.md` §4.6's Ledger algorithm).
pub fn register_wallet(policy: &str) -> Vec<u8> {
    let mut cmd = header(INS_REGISTER_WALLET, 0, 0);
    let bytes = policy.as_bytes();
    cmd.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    cmd.extend_from_slice(bytes);
    cmd
}

pub fn sign_psbt(account_path: &Bip32Path, policy: &str, psbt_bytes: &[u8]) -> Vec<u8> {
    let mut cmd = header(INS_SIGN_PSBT, 0, 0);
    cmd.extend(encode_path(account_path));
    let policy_bytes = policy.as_bytes();
    cmd.extend_from_slice(&(policy_bytes.len() as u32).to_be_bytes());
    cmd.extend_from_slice(policy_bytes);
    cmd.extend_from_slice(&(psbt_bytes.len() as u32).to_be_bytes());
    cmd.extend_from_slice(psbt_bytes);
    cmd
}

/// One `(input_index, pubkey, signature)` triple as returned by `sign_psbt`, decoded from the
/// device's reply (`spec.md` §4.6: "receive a list of (input_index, pubkey, signature) triples").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialSig {
    pub input_index: u32,
    pub pubkey: [u8; 33],
    pub signature: Vec<u8>,
}

pub fn decode_partial_sigs(data: &[u8]) -> Result<Vec<PartialSig>, Error> {
    let mut cursor = data;
    let mut out = Vec::new();
    while !cursor.is_empty() {
        if cursor.len() < 4 + 33 + 1 {
            return Err(Error::Protocol("truncated partial signature record".to_string()));
        }
        let input_index = u32::from_be_bytes(cursor[0..4].try_into().unwrap());
        let mut pubkey = [0u8; 33];
        pubkey.copy_from_slice(&cursor[4..37]);
        let sig_len = cursor[37] as usize;
        if cursor.len() < 38 + sig_len {
            return Err(Error::Protocol("truncated signature bytes".to_string()));
        }
        let signature = cursor[38..38 + sig_len].to_vec();
        out.push(PartialSig {
            input_index,
            pubkey,
            signature,
        });
        cursor = &cursor[38 + sig_len..];
    }
    Ok(out)
}

pub fn encode_partial_sigs(sigs: &[PartialSig]) -> Vec<u8> {
    let mut out = Vec::new();
    for sig in sigs {
        out.extend_from_slice(&sig.input_index.to_be_bytes());
        out.extend_from_slice(&sig.pubkey);
        out.push(sig.signature.len() as u8);
        out.extend_from_slice(&sig.signature);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_partial_sigs() {
        let sigs = vec![
            PartialSig {
                input_index: 0,
                pubkey: [2u8; 33],
                signature: vec![1, 2, 3],
            },
            PartialSig {
                input_index: 1,
                pubkey: [3u8; 33],
                signature: vec![4, 5, 6, 7],
            },
        ];
        let encoded = encode_partial_sigs(&sigs);
        let decoded = decode_partial_sigs(&encoded).unwrap();
        assert_eq!(sigs, decoded);
    }

    #[test]
    fn encode_path_sets_hardened_bit() {
        let path: Bip32Path = "m/84'/0'/0'".parse().unwrap();
        let encoded = encode_path(&path);
        assert_eq!(encoded[0], 3);
        assert_eq!(&encoded[1..5], &(0x8000_0000u32 + 84).to_be_bytes());
    }
}
