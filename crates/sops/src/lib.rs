//! fleetvars-sops: age key management and sops tool integration.
//!
//! The encrypted store backend in `fleetvars-lib` never touches asymmetric
//! crypto primitives directly. This crate owns that boundary:
//! - generating, persisting, and loading age x25519 keypairs (machine and
//!   user keys), with idempotent first-use provisioning
//! - invoking the external `sops` binary to encrypt, decrypt, and re-key
//!   secret documents against an explicit age recipient list
//!
//! Secret payloads are arbitrary bytes; they travel inside the JSON
//! document sops encrypts, base64-wrapped under a single `data` key.

pub mod error;
pub mod keys;
pub mod tool;

pub use error::SopsError;
pub use keys::{KeyRecord, ProvisionedKey, load_identity, provision_key, read_key_record, write_key_record};
pub use tool::SopsTool;

pub type Result<T> = std::result::Result<T, SopsError>;
