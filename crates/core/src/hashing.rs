//! Shared SHA-256 hex digest utility.
//!
//! Used for worker command fingerprints written into lease files.

use sha2::{Digest, Sha256};

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Fingerprint a process command line.
///
/// Arguments are joined with a NUL separator so `["a b"]` and `["a", "b"]`
/// produce different fingerprints.
pub fn command_fingerprint<S: AsRef<str>>(args: &[S]) -> String {
    let joined = args
        .iter()
        .map(|a| a.as_ref())
        .collect::<Vec<_>>()
        .join("\0");
    sha256_hex(joined.as_bytes())
}
