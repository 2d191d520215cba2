use std::fmt;

/// The core's error taxonomy (`spec.md` §4.9).
///
/// Every public operation returns `Result<_, Error>`. Vendor-specific failures are classified
/// into one of these kinds by each adapter's own `classify_status` table (the one place
/// substring/status-code matching on a vendor's own error vocabulary is allowed, per the
/// "duck-typed error strings" redesign note).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The requested adapter/feature is not available in this environment (no transport).
    Unsupported(String),
    /// A public operation was called while no adapter session is open.
    NotConnected,
    /// Two operations were attempted concurrently against the same session.
    ConcurrentUse,
    /// A roundtrip did not complete before its deadline.
    Timeout,
    /// The user explicitly cancelled an on-device prompt.
    UserAbort,
    /// The device is locked (PIN/passphrase required).
    DeviceLocked,
    /// The vendor's Bitcoin application is not the currently open application.
    WrongApp,
    /// None of a multisig input's `bip32Derivation` entries match the connected device.
    NotACosigner {
        /// Master fingerprints listed in the input, for the caller to act on.
        expected: Vec<String>,
    },
    /// A derivation path could not be resolved from the request or the PSBT.
    BadDerivation(String),
    /// A SLIP-132/BIP-32 extended public key is malformed.
    InvalidXpub(String),
    /// The PSBT is missing data this operation requires.
    IncompletePsbt(String),
    /// A multisig or script policy does not match what the device (or PSBT) describes.
    PolicyMismatch(String),
    /// A partial signature returned by a device could not be validated/encoded.
    BadSignature(String),
    /// The transport was lost mid-operation (unplugged, `disconnect` called concurrently).
    TransportLost,
    /// A bridge daemon (Trezor Bridge-style) is not reachable.
    BridgeUnavailable(String),
    /// Catch-all for malformed responses at the wire level.
    Protocol(String),
    /// More than one adapter is registered and no device type was specified.
    Ambiguous,
    /// Anything else; carries a vendor-provided code when one is available.
    Internal(String, Option<u32>),
}

impl Error {
    /// Whether an adapter session should remain open after this error (`spec.md` §7).
    pub fn keeps_session_open(&self) -> bool {
        matches!(
            self,
            Error::UserAbort
                | Error::DeviceLocked
                | Error::WrongApp
                | Error::BadDerivation(_)
                | Error::PolicyMismatch(_)
                | Error::IncompletePsbt(_)
                | Error::BadSignature(_)
                | Error::NotACosigner { .. }
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Unsupported(m) => write!(f, "Unsupported: {}", m),
            Error::NotConnected => write!(f, "No device is currently connected."),
            Error::ConcurrentUse => write!(f, "Concurrent use of the same device session."),
            Error::Timeout => write!(f, "The device did not respond in time."),
            Error::UserAbort => write!(f, "The user cancelled the operation on the device."),
            Error::DeviceLocked => write!(f, "The device is locked."),
            Error::WrongApp => write!(f, "The Bitcoin application is not open on the device."),
            Error::NotACosigner { expected } => write!(
                f,
                "Connected device is not a cosigner of this input. Expected one of: {}.",
                expected.join(", ")
            ),
            Error::BadDerivation(m) => write!(f, "Could not resolve a derivation path: {}", m),
            Error::InvalidXpub(m) => write!(f, "Invalid extended public key: {}", m),
            Error::IncompletePsbt(m) => write!(f, "Incomplete PSBT: {}", m),
            Error::PolicyMismatch(m) => write!(f, "Script policy mismatch: {}", m),
            Error::BadSignature(m) => write!(f, "Invalid signature: {}", m),
            Error::TransportLost => write!(f, "Lost connection to the device."),
            Error::BridgeUnavailable(m) => write!(f, "Bridge daemon unavailable: {}", m),
            Error::Protocol(m) => write!(f, "Wire protocol error: {}", m),
            Error::Ambiguous => write!(
                f,
                "Multiple device types are registered; specify which one to connect to."
            ),
            Error::Internal(m, Some(code)) => write!(f, "Internal error ({:#x}): {}", code, m),
            Error::Internal(m, None) => write!(f, "Internal error: {}", m),
        }
    }
}

impl std::error::Error for Error {}
