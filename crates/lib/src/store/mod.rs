//! The pluggable persistence layer for var values.
//!
//! Two value-kinds (public, secret), each with interchangeable backends
//! behind the [`VarStore`] trait. Backends are selected by identifier
//! through a static registry at machine construction time; one store
//! instance exists per machine per value-kind.
//!
//! Backends:
//! - `in_repo` (public): plaintext files committed to the repository
//! - `sops` (secret): sops-encrypted files with a symlink access-control
//!   tree deciding recipients
//! - `password_store` (secret): delegates storage to the external `pass`
//!   tool
//! - `ephemeral` (secret): plaintext under a runtime directory, for
//!   disposable targets

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::acl::AclError;
use crate::generator::{Generator, GeneratorKey, Var};

pub mod ephemeral;
pub mod in_repo;
pub mod password_store;
pub mod sops_store;

pub use ephemeral::EphemeralStore;
pub use in_repo::InRepoStore;
pub use password_store::PasswordStore;
pub use sops_store::SopsStore;

/// Which value-kind a store persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
  Public,
  Secret,
}

impl fmt::Display for StoreKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StoreKind::Public => write!(f, "public"),
      StoreKind::Secret => write!(f, "secret"),
    }
  }
}

/// Configuration for store construction, loaded once per process
/// invocation and passed down explicitly.
#[derive(Debug, Clone)]
pub struct StoreSettings {
  /// Repository root; holds `vars/` and `sops/`.
  pub flake_root: PathBuf,
  /// Root of the ephemeral backend's state directories.
  pub runtime_dir: PathBuf,
  /// Age key file used for decryption (`SOPS_AGE_KEY_FILE`).
  pub age_key_file: Option<PathBuf>,
  /// Groups granted access to every new secret.
  pub default_groups: Vec<String>,
  /// Overrides `PASSWORD_STORE_DIR` for the password_store backend.
  pub password_store_dir: Option<PathBuf>,
}

/// The common store contract.
///
/// Operations are keyed by `(generator key, var name)`; the generator key
/// encodes whether the value is shared or per-machine. `set` returns a
/// repository path to hand to the version-control collaborator, or `None`
/// when the backend persists outside the repository.
pub trait VarStore {
  fn kind(&self) -> StoreKind;
  fn backend(&self) -> &'static str;

  fn exists(&self, key: &GeneratorKey, name: &str) -> bool;
  fn get(&self, key: &GeneratorKey, name: &str) -> Result<Vec<u8>, StoreError>;
  fn set(&self, key: &GeneratorKey, var: &Var, value: &[u8])
  -> Result<Option<PathBuf>, StoreError>;
  fn delete(&self, key: &GeneratorKey, name: &str) -> Result<(), StoreError>;

  fn get_validation(&self, key: &GeneratorKey) -> Result<Option<String>, StoreError>;
  fn set_validation(&self, key: &GeneratorKey, hash: &str)
  -> Result<Option<PathBuf>, StoreError>;

  /// Staleness check: a generator with a declared hash is valid only if
  /// the stored record matches it. Without a declared hash there is
  /// nothing to compare, so stored records are ignored.
  fn hash_is_valid(&self, key: &GeneratorKey, current: Option<&str>) -> bool {
    match current {
      None => true,
      Some(hash) => match self.get_validation(key) {
        Ok(Some(stored)) => stored == hash,
        _ => false,
      },
    }
  }

  /// Backend-specific consistency scan; returns human-readable findings.
  fn health_check(&self, _machine: &str) -> Result<Vec<String>, StoreError> {
    Ok(Vec::new())
  }

  /// Backend-specific repair of inconsistent on-disk state, optionally
  /// scoped to a single generator.
  fn fix(&self, _machine: &str, _generator: Option<&GeneratorKey>) -> Result<(), StoreError> {
    Ok(())
  }

  /// Whether the machine's values must be re-uploaded, given the marker
  /// the transport collaborator read from the target host (if any).
  fn needs_upload(
    &self,
    _machine: &str,
    _remote_marker: Option<&str>,
  ) -> Result<bool, StoreError> {
    Ok(true)
  }

  /// Stage everything the target host needs into `dest` for the
  /// transport collaborator. Default: nothing to stage.
  fn upload(
    &self,
    _machine: &str,
    _generators: &[Generator],
    _dest: &Path,
  ) -> Result<(), StoreError> {
    Ok(())
  }
}

/// Construct the public store for `machine` from a backend identifier.
pub fn public_store(
  id: &str,
  machine: &str,
  settings: &StoreSettings,
) -> Result<Box<dyn VarStore>, StoreError> {
  match id {
    "in_repo" => Ok(Box::new(InRepoStore::new(&settings.flake_root))),
    "ephemeral" => Ok(Box::new(EphemeralStore::new(
      &settings.runtime_dir,
      machine,
      StoreKind::Public,
    ))),
    _ => Err(StoreError::UnknownBackend {
      kind: StoreKind::Public,
      id: id.to_string(),
    }),
  }
}

/// Construct the secret store for `machine` from a backend identifier.
pub fn secret_store(
  id: &str,
  machine: &str,
  settings: &StoreSettings,
) -> Result<Box<dyn VarStore>, StoreError> {
  match id {
    "sops" => Ok(Box::new(SopsStore::new(machine, settings))),
    "password_store" => Ok(Box::new(PasswordStore::new(machine, settings))),
    "ephemeral" => Ok(Box::new(EphemeralStore::new(
      &settings.runtime_dir,
      machine,
      StoreKind::Secret,
    ))),
    _ => Err(StoreError::UnknownBackend {
      kind: StoreKind::Secret,
      id: id.to_string(),
    }),
  }
}

/// Errors from store operations, annotated with backend and operation.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("no value for '{generator}/{name}' in {backend} store")]
  MissingValue {
    backend: &'static str,
    generator: String,
    name: String,
  },

  #[error("unknown {kind} store backend '{id}'")]
  UnknownBackend { kind: StoreKind, id: String },

  #[error("{backend} backend failed during {operation}: {message}")]
  Backend {
    backend: &'static str,
    operation: &'static str,
    message: String,
  },

  #[error("sops error: {0}")]
  Sops(#[from] fleetvars_sops::SopsError),

  #[error("access control error: {0}")]
  Acl(#[from] AclError),
}
