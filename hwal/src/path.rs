//! Derivation path parsing and canonicalization (`spec.md` §3).
//!
//! Both `'` and `h` are accepted as hardened markers on input; `Bip32Path::to_string` always
//! emits the `'` form, so parsing then formatting a path normalizes it to a single canonical
//! representation regardless of which marker the source used.

use miniscript::bitcoin::bip32::{ChildNumber, DerivationPath};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// An ordered sequence of BIP-32 child indices, with a canonical string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bip32Path(Vec<ChildNumber>);

impl Bip32Path {
    pub fn empty() -> Self {
        Bip32Path(Vec::new())
    }

    pub fn from_child_numbers(children: Vec<ChildNumber>) -> Self {
        Bip32Path(children)
    }

    pub fn as_child_numbers(&self) -> &[ChildNumber] {
        &self.0
    }

    /// The big-endian `u32` array representation every adapter needs on the wire, with the
    /// hardened bit (`0x8000_0000`) set for hardened components (`spec.md` §4.6).
    pub fn to_u32_array(&self) -> Vec<u32> {
        self.0
            .iter()
            .map(|cn| match cn {
                ChildNumber::Normal { index } => *index,
                ChildNumber::Hardened { index } => index | 0x8000_0000,
            })
            .collect()
    }

    /// Truncate to the first `n` components (used to derive an account-level path).
    pub fn take(&self, n: usize) -> Bip32Path {
        Bip32Path(self.0.iter().take(n).cloned().collect())
    }

    /// The last `n` components (used by the multisig reconstructor for child paths).
    pub fn last(&self, n: usize) -> Bip32Path {
        let start = self.0.len().saturating_sub(n);
        Bip32Path(self.0[start..].to_vec())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The second component (0-indexed), used by `detect_network` to read the coin type.
    pub fn nth(&self, i: usize) -> Option<&ChildNumber> {
        self.0.get(i)
    }

    pub fn as_derivation_path(&self) -> DerivationPath {
        DerivationPath::from(self.0.clone())
    }
}

impl From<DerivationPath> for Bip32Path {
    fn from(path: DerivationPath) -> Self {
        Bip32Path(path.into_iter().cloned().collect())
    }
}

impl From<&DerivationPath> for Bip32Path {
    fn from(path: &DerivationPath) -> Self {
        Bip32Path(path.into_iter().cloned().collect())
    }
}

impl FromStr for Bip32Path {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("m/").or_else(|| s.strip_prefix('m')).unwrap_or(s);
        if s.is_empty() {
            return Ok(Bip32Path::empty());
        }
        let mut children = Vec::new();
        for component in s.split('/') {
            if component.is_empty() {
                continue;
            }
            // Both `'` and `h` are accepted hardened markers; normalize both.
            let (raw, hardened) = if let Some(stripped) = component.strip_suffix('\'') {
                (stripped, true)
            } else if let Some(stripped) = component
                .strip_suffix('h')
                .or_else(|| component.strip_suffix('H'))
            {
                (stripped, true)
            } else {
                (component, false)
            };
            let index: u32 = raw
                .parse()
                .map_err(|_| Error::BadDerivation(format!("invalid path component '{}'", component)))?;
            if index >= 0x8000_0000 {
                return Err(Error::BadDerivation(format!(
                    "path component '{}' out of range",
                    component
                )));
            }
            children.push(if hardened {
                ChildNumber::Hardened { index }
            } else {
                ChildNumber::Normal { index }
            });
        }
        Ok(Bip32Path(children))
    }
}

impl fmt::Display for Bip32Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "m")?;
        for cn in &self.0 {
            match cn {
                ChildNumber::Normal { index } => write!(f, "/{}", index)?,
                ChildNumber::Hardened { index } => write!(f, "/{}'", index)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_both_hardened_markers() {
        let from_tick: Bip32Path = "m/84'/0'/0'/0/5".parse().unwrap();
        let from_h: Bip32Path = "m/84h/0h/0h/0/5".parse().unwrap();
        assert_eq!(from_tick, from_h);
        assert_eq!(from_tick.to_string(), "m/84'/0'/0'/0/5");
    }

    #[test]
    fn rejects_out_of_range_index() {
        assert!("m/2147483648".parse::<Bip32Path>().is_err());
    }

    #[test]
    fn take_and_last() {
        let path: Bip32Path = "m/84'/0'/0'/1/3".parse().unwrap();
        assert_eq!(path.take(3).to_string(), "m/84'/0'/0'");
        assert_eq!(path.last(2).to_string(), "m/1/3");
    }

    #[test]
    fn empty_path_roundtrips() {
        let path: Bip32Path = "m".parse().unwrap();
        assert!(path.is_empty());
        assert_eq!(path.to_string(), "m");
    }
}
