//! Public plaintext store, committed to the repository as-is.
//!
//! Layout:
//! ```text
//! <flake_root>/vars/
//! ├── shared/<generator>/<name>/value
//! ├── shared/<generator>/.validation
//! ├── per-machine/<machine>/<generator>/<name>/value
//! └── per-machine/<machine>/<generator>/.validation
//! ```
//!
//! The validation record carries a leading dot so it can never collide
//! with a var directory of the same name.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::generator::{GeneratorKey, Var};
use crate::store::{StoreError, StoreKind, VarStore};
use crate::util::paths::write_atomic;

const BACKEND: &str = "in_repo";
const VALUE_FILE: &str = "value";
const VALIDATION_FILE: &str = ".validation";

pub struct InRepoStore {
  root: PathBuf,
}

impl InRepoStore {
  pub fn new(flake_root: &Path) -> Self {
    Self {
      root: flake_root.to_path_buf(),
    }
  }

  fn generator_dir(&self, key: &GeneratorKey) -> PathBuf {
    let vars = self.root.join("vars");
    match &key.machine {
      None => vars.join("shared").join(&key.name),
      Some(machine) => vars.join("per-machine").join(machine).join(&key.name),
    }
  }

  fn value_file(&self, key: &GeneratorKey, name: &str) -> PathBuf {
    self.generator_dir(key).join(name).join(VALUE_FILE)
  }
}

impl VarStore for InRepoStore {
  fn kind(&self) -> StoreKind {
    StoreKind::Public
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
    let path = self.value_file(key, &var.name);
    write_atomic(&path, value)?;
    debug!(generator = %key, var = %var.name, "wrote public value");
    Ok(Some(path))
  }

  fn delete(&self, key: &GeneratorKey, name: &str) -> Result<(), StoreError> {
    let dir = self.generator_dir(key).join(name);
    if dir.exists() {
      fs::remove_dir_all(dir)?;
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
    let path = self.generator_dir(key).join(VALIDATION_FILE);
    write_atomic(&path, hash.as_bytes())?;
    Ok(Some(path))
  }

  /// Flag var directories that lost their `value` file, e.g. through a
  /// partial checkout or a stray delete.
  fn health_check(&self, _machine: &str) -> Result<Vec<String>, StoreError> {
    let vars = self.root.join("vars");
    if !vars.is_dir() {
      return Ok(Vec::new());
    }
    let mut findings = Vec::new();
    for entry in WalkDir::new(&vars).min_depth(2) {
      let entry = entry.map_err(|err| StoreError::Backend {
        backend: BACKEND,
        operation: "health_check",
        message: err.to_string(),
      })?;
      if !entry.file_type().is_dir() {
        continue;
      }
      let path = entry.path();
      let is_var_dir = path
        .read_dir()
        .map(|mut d| d.next().is_none())
        .unwrap_or(false);
      if is_var_dir {
        findings.push(format!("empty var directory: {}", path.display()));
      }
    }
    Ok(findings)
  }

  /// Remove the empty var directories reported by `health_check`,
  /// restricted to one generator's tree when a scope is given.
  fn fix(&self, machine: &str, generator: Option<&GeneratorKey>) -> Result<(), StoreError> {
    let scope = generator.map(|key| self.generator_dir(key));
    for finding in self.health_check(machine)? {
      if let Some(path) = finding.strip_prefix("empty var directory: ") {
        if let Some(scope) = &scope
          && !Path::new(path).starts_with(scope)
        {
          continue;
        }
        fs::remove_dir_all(path)?;
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn store() -> (TempDir, InRepoStore) {
    let tmp = TempDir::new().unwrap();
    let store = InRepoStore::new(tmp.path());
    (tmp, store)
  }

  #[test]
  fn set_then_get_round_trips() {
    let (_tmp, store) = store();
    let key = GeneratorKey::machine("web01", "wireguard");
    let var = Var::public("pubkey");

    assert!(!store.exists(&key, "pubkey"));
    let path = store.set(&key, &var, b"wg-pub-bytes").unwrap().unwrap();
    assert!(path.ends_with("vars/per-machine/web01/wireguard/pubkey/value"));
    assert!(store.exists(&key, "pubkey"));
    assert_eq!(store.get(&key, "pubkey").unwrap(), b"wg-pub-bytes");
  }

  #[test]
  fn shared_values_live_outside_machine_trees() {
    let (tmp, store) = store();
    let key = GeneratorKey::shared("ca");
    store.set(&key, &Var::public("cert"), b"pem").unwrap();
    assert!(tmp.path().join("vars/shared/ca/cert/value").is_file());
  }

  #[test]
  fn get_missing_value_is_an_error() {
    let (_tmp, store) = store();
    let key = GeneratorKey::machine("web01", "wireguard");
    let err = store.get(&key, "absent").unwrap_err();
    assert!(matches!(err, StoreError::MissingValue { .. }));
  }

  #[test]
  fn validation_round_trips_and_gates() {
    let (_tmp, store) = store();
    let key = GeneratorKey::machine("web01", "wireguard");

    assert_eq!(store.get_validation(&key).unwrap(), None);
    // No declared hash: nothing to compare, always valid.
    assert!(store.hash_is_valid(&key, None));
    // Declared hash but no record: stale.
    assert!(!store.hash_is_valid(&key, Some("abc")));

    store.set_validation(&key, "abc").unwrap();
    assert_eq!(store.get_validation(&key).unwrap().as_deref(), Some("abc"));
    assert!(store.hash_is_valid(&key, Some("abc")));
    assert!(!store.hash_is_valid(&key, Some("def")));
  }

  #[test]
  fn a_var_named_validation_does_not_collide_with_the_record() {
    let (_tmp, store) = store();
    let key = GeneratorKey::machine("web01", "wireguard");

    store.set(&key, &Var::public("validation"), b"payload").unwrap();
    store.set_validation(&key, "abc").unwrap();
    assert_eq!(store.get(&key, "validation").unwrap(), b"payload");
    assert_eq!(store.get_validation(&key).unwrap().as_deref(), Some("abc"));
  }

  #[test]
  fn health_check_flags_and_fix_removes_empty_var_dirs() {
    let (tmp, store) = store();
    let key = GeneratorKey::machine("web01", "wireguard");
    store.set(&key, &Var::public("pubkey"), b"x").unwrap();

    let empty = tmp.path().join("vars/per-machine/web01/wireguard/stray");
    fs::create_dir_all(&empty).unwrap();

    let findings = store.health_check("web01").unwrap();
    assert_eq!(findings.len(), 1);
    assert!(findings[0].contains("stray"));

    store.fix("web01", None).unwrap();
    assert!(!empty.exists());
    assert!(store.health_check("web01").unwrap().is_empty());
  }

  #[test]
  fn fix_scoped_to_a_generator_leaves_other_trees_alone() {
    let (tmp, store) = store();
    let wireguard = tmp.path().join("vars/per-machine/web01/wireguard/stray");
    let ssh = tmp.path().join("vars/per-machine/web01/ssh/stray");
    fs::create_dir_all(&wireguard).unwrap();
    fs::create_dir_all(&ssh).unwrap();

    store
      .fix("web01", Some(&GeneratorKey::machine("web01", "wireguard")))
      .unwrap();
    assert!(!wireguard.exists());
    assert!(ssh.exists());
  }

  #[test]
  fn delete_removes_the_var_directory() {
    let (_tmp, store) = store();
    let key = GeneratorKey::machine("web01", "wireguard");
    store.set(&key, &Var::public("pubkey"), b"x").unwrap();
    store.delete(&key, "pubkey").unwrap();
    assert!(!store.exists(&key, "pubkey"));
  }
}
