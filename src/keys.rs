//! Publisher keys and the hostname labels that carry them.

use bech32::{Bech32, Hrp};

/// Human-readable prefix for encoded publisher keys.
const PUBKEY_HRP: &str = "npub";

/// 32-byte public key identifying a publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pubkey([u8; 32]);

impl Pubkey {
    /// Decode a bech32 label; `None` on bad encoding, wrong prefix, or wrong length.
    pub fn from_npub(label: &str) -> Option<Self> {
        let (hrp, data) = bech32::decode(label).ok()?;
        if hrp != Hrp::parse_unchecked(PUBKEY_HRP) {
            return None;
        }
        let bytes: [u8; 32] = data.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Encode as the bech32 subdomain form.
    pub fn to_npub(&self) -> String {
        bech32::encode::<Bech32>(Hrp::parse_unchecked(PUBKEY_HRP), &self.0).unwrap_or_default()
    }

    /// Parse a 64-character hex key.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Lowercase hex form used as the wire author and cache key.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for Pubkey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hex())
    }
}

/// Slice the subdomain label out of `host` for the configured base domain.
///
/// The host is lowercased and stripped of any port. Only a single direct
/// subdomain label qualifies; deeper hosts and the bare base domain do not.
pub fn host_label(host: &str, base_domain: &str) -> Option<String> {
    let host = host.to_lowercase();
    let host = host.split(':').next().unwrap_or(&host);
    let label = host.strip_suffix(base_domain)?.strip_suffix('.')?;
    if label.is_empty() || label.contains('.') {
        return None;
    }
    Some(label.to_string())
}
