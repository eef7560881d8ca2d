//! Plaintext store under a runtime directory.
//!
//! Layout: `<runtime_dir>/machines/<machine>/<generator>/<var>` for
//! machine-scoped values and `<runtime_dir>/shared/<generator>/<var>` for
//! shared ones, so every machine's store instance sees the same shared
//! values.
//!
//! Used for disposable targets (test VMs, throwaway containers) where
//! encryption at rest buys nothing and the values must not land in the
//! repository. `set` therefore never returns a path to commit.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::generator::{Generator, GeneratorKey, Var};
use crate::store::{StoreError, StoreKind, VarStore};
use crate::util::paths::{replace_tree, write_atomic};

const BACKEND: &str = "ephemeral";
const VALIDATION_FILE: &str = ".validation";

pub struct EphemeralStore {
  root: PathBuf,
  machine: String,
  kind: StoreKind,
}

impl EphemeralStore {
  pub fn new(runtime_dir: &Path, machine: &str, kind: StoreKind) -> Self {
    Self {
      root: runtime_dir.to_path_buf(),
      machine: machine.to_string(),
      kind,
    }
  }

  /// Shared values live outside the machine directories so every
  /// machine's store instance resolves them to the same path.
  fn generator_dir(&self, key: &GeneratorKey) -> PathBuf {
    match &key.machine {
      None => self.root.join("shared").join(&key.name),
      Some(machine) => self.root.join("machines").join(machine).join(&key.name),
    }
  }

  fn machine_dir(&self) -> PathBuf {
    self.root.join("machines").join(&self.machine)
  }

  fn value_file(&self, key: &GeneratorKey, name: &str) -> PathBuf {
    self.generator_dir(key).join(name)
  }
}

impl VarStore for EphemeralStore {
  fn kind(&self) -> StoreKind {
    self.kind
  }

  fn backend(&self) -> &'static str {
    BACKEND
  }

  fn exists(&self, key: &GeneratorKey, name: &str) -> bool {
    self.value_file(key, name).is_file()
  }

  fn get(&self, key: &GeneratorKey, name: &str) -> Result<Vec<u8>, StoreError> {
    let path = self.value_file(key, name);
    if !path.is_file() {
      return Err(StoreError::MissingValue {
        backend: BACKEND,
        generator: key.to_string(),
        name: name.to_string(),
      });
    }
    Ok(fs::read(path)?)
  }

  fn set(
    &self,
    key: &GeneratorKey,
    var: &Var,
    value: &[u8],
  ) -> Result<Option<PathBuf>, StoreError> {
    write_atomic(&self.value_file(key, &var.name), value)?;
    debug!(generator = %key, var = %var.name, "wrote ephemeral value");
    Ok(None)
  }

  fn delete(&self, key: &GeneratorKey, name: &str) -> Result<(), StoreError> {
    let path = self.value_file(key, name);
    if path.exists() {
      fs::remove_file(path)?;
    }
    Ok(())
  }

  fn get_validation(&self, key: &GeneratorKey) -> Result<Option<String>, StoreError> {
    let path = self.generator_dir(key).join(VALIDATION_FILE);
    if !path.is_file() {
      return Ok(None);
    }
    Ok(Some(fs::read_to_string(path)?.trim().to_string()))
  }

  fn set_validation(
    &self,
    key: &GeneratorKey,
    hash: &str,
  ) -> Result<Option<PathBuf>, StoreError> {
    write_atomic(&self.generator_dir(key).join(VALIDATION_FILE), hash.as_bytes())?;
    Ok(None)
  }

  /// Copy the machine's tree plus the shared values into `dest`,
  /// removing whatever was there before.
  fn upload(
    &self,
    machine: &str,
    _generators: &[Generator],
    dest: &Path,
  ) -> Result<(), StoreError> {
    let machine_dir = self.machine_dir();
    if !machine_dir.is_dir() {
      return Err(StoreError::Backend {
        backend: BACKEND,
        operation: "upload",
        message: format!("no state directory for machine '{machine}'"),
      });
    }
    replace_tree(&machine_dir, dest)?;
    let shared = self.root.join("shared");
    if shared.is_dir() {
      replace_tree(&shared, &dest.join("shared"))?;
    }
    debug!(machine, dest = %dest.display(), "staged ephemeral values for upload");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn round_trip_and_no_commit_path() {
    let tmp = TempDir::new().unwrap();
    let store = EphemeralStore::new(tmp.path(), "vm-test", StoreKind::Secret);
    let key = GeneratorKey::machine("vm-test", "root-password");

    let committed = store
      .set(&key, &Var::hidden("hash"), b"$6$salt$digest")
      .unwrap();
    assert_eq!(committed, None);
    assert_eq!(store.get(&key, "hash").unwrap(), b"$6$salt$digest");
  }

  #[test]
  fn upload_replaces_destination() {
    let tmp = TempDir::new().unwrap();
    let store = EphemeralStore::new(&tmp.path().join("run"), "vm-test", StoreKind::Secret);
    let key = GeneratorKey::machine("vm-test", "root-password");
    store.set(&key, &Var::hidden("hash"), b"secret").unwrap();

    let dest = tmp.path().join("staged");
    fs::create_dir_all(&dest).unwrap();
    fs::write(dest.join("leftover"), b"old").unwrap();

    store.upload("vm-test", &[], &dest).unwrap();
    assert!(!dest.join("leftover").exists());
    assert_eq!(
      fs::read(dest.join("root-password/hash")).unwrap(),
      b"secret"
    );
  }

  #[test]
  fn a_var_named_validation_does_not_collide_with_the_record() {
    let tmp = TempDir::new().unwrap();
    let store = EphemeralStore::new(tmp.path(), "vm-test", StoreKind::Secret);
    let key = GeneratorKey::machine("vm-test", "cert");

    store.set(&key, &Var::hidden("validation"), b"payload").unwrap();
    store.set_validation(&key, "abc").unwrap();
    assert_eq!(store.get(&key, "validation").unwrap(), b"payload");
    assert_eq!(store.get_validation(&key).unwrap().as_deref(), Some("abc"));
  }

  #[test]
  fn shared_values_resolve_machine_independently() {
    let tmp = TempDir::new().unwrap();
    let writer = EphemeralStore::new(tmp.path(), "alpha", StoreKind::Secret);
    let reader = EphemeralStore::new(tmp.path(), "beta", StoreKind::Secret);
    let key = GeneratorKey::shared("ca");

    writer.set(&key, &Var::hidden("key"), b"ca-key").unwrap();
    assert!(reader.exists(&key, "key"));
    assert_eq!(reader.get(&key, "key").unwrap(), b"ca-key");
  }

  #[test]
  fn upload_includes_shared_values() {
    let tmp = TempDir::new().unwrap();
    let store = EphemeralStore::new(&tmp.path().join("run"), "vm-test", StoreKind::Secret);
    store
      .set(
        &GeneratorKey::machine("vm-test", "root-password"),
        &Var::hidden("hash"),
        b"secret",
      )
      .unwrap();
    store
      .set(&GeneratorKey::shared("ca"), &Var::hidden("key"), b"ca-key")
      .unwrap();

    let dest = tmp.path().join("staged");
    store.upload("vm-test", &[], &dest).unwrap();
    assert_eq!(fs::read(dest.join("root-password/hash")).unwrap(), b"secret");
    assert_eq!(fs::read(dest.join("shared/ca/key")).unwrap(), b"ca-key");
  }

  #[test]
  fn upload_without_state_is_a_backend_error() {
    let tmp = TempDir::new().unwrap();
    let store = EphemeralStore::new(tmp.path(), "ghost", StoreKind::Secret);
    let err = store.upload("ghost", &[], &tmp.path().join("dest")).unwrap_err();
    assert!(matches!(err, StoreError::Backend { operation: "upload", .. }));
  }
}
