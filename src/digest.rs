//! Content digests: a 256-bit SHA-256 hash, rendered as lowercase hex.

use std::fmt;

use openssl::sha::Sha256;

pub const DIGEST_BYTES: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_BYTES]);

impl Digest {
    pub fn from_bytes(bytes: [u8; DIGEST_BYTES]) -> Self {
        Digest(bytes)
    }

    /// Parses a lowercase or uppercase 64-character hex string.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != DIGEST_BYTES * 2 {
            return None;
        }
        let mut out = [0u8; DIGEST_BYTES];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).ok()?;
            out[i] = u8::from_str_radix(s, 16).ok()?;
        }
        Some(Digest(out))
    }

    /// Accepts either standard base64 or lowercase hex, as the cloud's hash
    /// field does for remote file descriptors.
    pub fn from_base64_or_hex(value: &str) -> Option<Self> {
        if let Some(digest) = Digest::from_hex(value) {
            return Some(digest);
        }
        let bytes = base64::decode(value).ok()?;
        if bytes.len() != DIGEST_BYTES {
            return None;
        }
        let mut out = [0u8; DIGEST_BYTES];
        out.copy_from_slice(&bytes);
        Some(Digest(out))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(DIGEST_BYTES * 2);
        for byte in &self.0 {
            s.push_str(&format!("{:02x}", byte));
        }
        s
    }

    pub fn to_base64(&self) -> String {
        base64::encode(&self.0)
    }

    /// The two-level shard prefix used for the on-disk path: first two and
    /// next two hex characters.
    pub fn shard(&self) -> (String, String) {
        let hex = self.to_hex();
        (hex[0..2].to_string(), hex[2..4].to_string())
    }

    /// The digest of the empty byte string, used by zero-byte finalize.
    pub fn of_empty() -> Self {
        Digest::of_bytes(&[])
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Digest(hasher.finish())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Computes a digest incrementally as bytes flow through, mirroring
/// [`Sha256`] but exposed as a small wrapper so ingest code does not
/// depend on `openssl` directly.
pub struct DigestHasher(Sha256);

impl DigestHasher {
    pub fn new() -> Self {
        DigestHasher(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> Digest {
        Digest(self.0.finish())
    }
}

impl Default for DigestHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Scans `haystack` for a trailing run of 64 hex characters, as used to
/// recover a digest from an opaque alias string as a last resort.
pub fn trailing_hex64(haystack: &str) -> Option<&str> {
    let bytes = haystack.as_bytes();
    if bytes.len() < 64 {
        return None;
    }
    let candidate = &haystack[haystack.len() - 64..];
    if candidate.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(candidate)
    } else {
        None
    }
}
