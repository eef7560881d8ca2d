//! Secret store delegating persistence to the external `pass` tool.
//!
//! Entries follow a deterministic path scheme inside the password store:
//! `machines/<machine>/<generator>/<name>` for machine-scoped values and
//! `shared/<generator>/<name>` for shared ones. Deployment readiness is
//! decided by combining the git history hashes of the relevant paths and
//! comparing the result against a marker previously uploaded to the
//! target host.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::generator::{Generator, GeneratorKey, Var};
use crate::store::{StoreError, StoreKind, StoreSettings, VarStore};
use crate::util::hash::combine_hashes;
use crate::util::paths::write_atomic;

const BACKEND: &str = "password_store";
// Leading dot keeps the record out of the var namespace.
const VALIDATION_ENTRY: &str = ".validation";
/// Marker file staged next to the uploaded values; the transport
/// collaborator reads it back from the host on the next run.
pub const UPLOAD_MARKER: &str = ".pass_info";

pub struct PasswordStore {
  machine: String,
  store_dir: PathBuf,
}

impl PasswordStore {
  pub fn new(machine: &str, settings: &StoreSettings) -> Self {
    let store_dir = settings
      .password_store_dir
      .clone()
      .or_else(|| std::env::var_os("PASSWORD_STORE_DIR").map(PathBuf::from))
      .unwrap_or_else(|| {
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
        home.join(".password-store")
      });
    Self {
      machine: machine.to_string(),
      store_dir,
    }
  }

  fn entry(&self, key: &GeneratorKey, name: &str) -> String {
    match &key.machine {
      None => format!("shared/{}/{name}", key.name),
      Some(machine) => format!("machines/{machine}/{}/{name}", key.name),
    }
  }

  fn entry_file(&self, entry: &str) -> PathBuf {
    self.store_dir.join(format!("{entry}.gpg"))
  }

  fn pass(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>, StoreError> {
    run_tool(&self.store_dir, "pass", args, stdin, BACKEND)
  }

  /// Combined fingerprint of the machine's history in the store.
  pub fn generate_marker(&self, machine: &str) -> Result<String, StoreError> {
    let mut components = Vec::new();
    for path in [format!("machines/{machine}"), "shared".to_string()] {
      let output = run_tool(
        &self.store_dir,
        "git",
        &["log", "-1", "--format=%H", "--", &path],
        None,
        BACKEND,
      )?;
      components.push(String::from_utf8_lossy(&output).trim().to_string());
    }
    Ok(combine_hashes(components))
  }
}

impl VarStore for PasswordStore {
  fn kind(&self) -> StoreKind {
    StoreKind::Secret
  }

  fn backend(&self) -> &'static str {
    BACKEND
  }

  fn exists(&self, key: &GeneratorKey, name: &str) -> bool {
    self.entry_file(&self.entry(key, name)).is_file()
  }

  fn get(&self, key: &GeneratorKey, name: &str) -> Result<Vec<u8>, StoreError> {
    let entry = self.entry(key, name);
    if !self.exists(key, name) {
      return Err(StoreError::MissingValue {
        backend: BACKEND,
        generator: key.to_string(),
        name: name.to_string(),
      });
    }
    self.pass(&["show", &entry], None)
  }

  fn set(
    &self,
    key: &GeneratorKey,
    var: &Var,
    value: &[u8],
  ) -> Result<Option<PathBuf>, StoreError> {
    let entry = self.entry(key, &var.name);
    self.pass(&["insert", "-m", "--force", &entry], Some(value))?;
    debug!(generator = %key, var = %var.name, "stored value in password store");
    // pass manages persistence (and its own git history) outside the repo.
    Ok(None)
  }

  fn delete(&self, key: &GeneratorKey, name: &str) -> Result<(), StoreError> {
    let entry = self.entry(key, name);
    if self.exists(key, name) {
      self.pass(&["rm", "--force", &entry], None)?;
    }
    Ok(())
  }

  fn get_validation(&self, key: &GeneratorKey) -> Result<Option<String>, StoreError> {
    if !self.exists(key, VALIDATION_ENTRY) {
      return Ok(None);
    }
    let bytes = self.get(key, VALIDATION_ENTRY)?;
    Ok(Some(String::from_utf8_lossy(&bytes).trim().to_string()))
  }

  fn set_validation(
    &self,
    key: &GeneratorKey,
    hash: &str,
  ) -> Result<Option<PathBuf>, StoreError> {
    let entry = self.entry(key, VALIDATION_ENTRY);
    self.pass(&["insert", "-m", "--force", &entry], Some(hash.as_bytes()))?;
    Ok(None)
  }

  fn needs_upload(
    &self,
    machine: &str,
    remote_marker: Option<&str>,
  ) -> Result<bool, StoreError> {
    let Some(marker) = remote_marker else {
      return Ok(true);
    };
    Ok(self.generate_marker(machine)? != marker)
  }

  /// Stage every deployable secret plus the readiness marker.
  fn upload(
    &self,
    machine: &str,
    generators: &[Generator],
    dest: &Path,
  ) -> Result<(), StoreError> {
    for generator in generators {
      let key = generator.key(machine);
      for var in generator.files.iter().filter(|v| v.secret && v.deploy) {
        let value = self.get(&key, &var.name)?;
        write_atomic(&dest.join(&generator.name).join(&var.name), &value)?;
      }
    }
    write_atomic(
      &dest.join(UPLOAD_MARKER),
      self.generate_marker(machine)?.as_bytes(),
    )?;
    debug!(machine, dest = %dest.display(), "staged password-store values for upload");
    Ok(())
  }
}

/// Run an external tool inside the password store directory.
fn run_tool(
  cwd: &Path,
  tool: &str,
  args: &[&str],
  stdin: Option<&[u8]>,
  backend: &'static str,
) -> Result<Vec<u8>, StoreError> {
  use std::io::Write;

  let mut command = Command::new(tool);
  command
    .args(args)
    .current_dir(cwd)
    .stdin(if stdin.is_some() {
      Stdio::piped()
    } else {
      Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());
  if tool == "pass" {
    command.env("PASSWORD_STORE_DIR", cwd);
  }

  debug!(tool, ?args, "invoking external tool");
  let mut child = command.spawn().map_err(|err| {
    if err.kind() == std::io::ErrorKind::NotFound {
      StoreError::Backend {
        backend,
        operation: "spawn",
        message: format!("`{tool}` not found on PATH"),
      }
    } else {
      StoreError::Io(err)
    }
  })?;

  if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
    pipe.write_all(input)?;
  }

  let output = child.wait_with_output()?;
  if !output.status.success() {
    return Err(StoreError::Backend {
      backend,
      operation: "run",
      message: format!(
        "`{tool} {}` failed (exit code {:?}): {}",
        args.join(" "),
        output.status.code(),
        String::from_utf8_lossy(&output.stderr).trim()
      ),
    });
  }
  Ok(output.stdout)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn store(dir: &Path) -> PasswordStore {
    let settings = StoreSettings {
      flake_root: dir.to_path_buf(),
      runtime_dir: dir.join("runtime"),
      age_key_file: None,
      default_groups: Vec::new(),
      password_store_dir: Some(dir.join("pass")),
    };
    PasswordStore::new("web01", &settings)
  }

  #[test]
  fn entry_paths_are_deterministic() {
    let tmp = TempDir::new().unwrap();
    let store = store(tmp.path());
    assert_eq!(
      store.entry(&GeneratorKey::machine("web01", "ssh"), "id_ed25519"),
      "machines/web01/ssh/id_ed25519"
    );
    assert_eq!(
      store.entry(&GeneratorKey::shared("ca"), "key"),
      "shared/ca/key"
    );
  }

  #[test]
  fn exists_checks_the_gpg_file() {
    let tmp = TempDir::new().unwrap();
    let store = store(tmp.path());
    let key = GeneratorKey::machine("web01", "ssh");
    assert!(!store.exists(&key, "id_ed25519"));

    let entry = tmp.path().join("pass/machines/web01/ssh/id_ed25519.gpg");
    std::fs::create_dir_all(entry.parent().unwrap()).unwrap();
    std::fs::write(&entry, b"gpg-blob").unwrap();
    assert!(store.exists(&key, "id_ed25519"));
  }

  #[test]
  fn get_missing_value_is_an_error_without_spawning_pass() {
    let tmp = TempDir::new().unwrap();
    let store = store(tmp.path());
    let err = store
      .get(&GeneratorKey::machine("web01", "ssh"), "absent")
      .unwrap_err();
    assert!(matches!(err, StoreError::MissingValue { .. }));
  }

  #[test]
  fn needs_upload_without_remote_marker() {
    let tmp = TempDir::new().unwrap();
    let store = store(tmp.path());
    assert!(store.needs_upload("web01", None).unwrap());
  }
}
