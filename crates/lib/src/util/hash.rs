//! Hash helpers for validation records and upload markers.

use sha2::{Digest, Sha256};

/// Sha256 of raw bytes as a lowercase hex string.
pub fn hash_bytes(data: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(data);
  hex::encode(hasher.finalize())
}

/// Combine several component hashes into one deterministic fingerprint.
///
/// Components are joined with newlines before hashing, so order matters;
/// callers pass them in a fixed (sorted) order.
pub fn combine_hashes<I, S>(components: I) -> String
where
  I: IntoIterator<Item = S>,
  S: AsRef<str>,
{
  let joined = components
    .into_iter()
    .map(|c| c.as_ref().to_string())
    .collect::<Vec<_>>()
    .join("\n");
  hash_bytes(joined.as_bytes())
}
