//! Encrypted secret store backed by sops and the access-control tree.
//!
//! Each secret lives in its own folder under `sops/secrets/`, holding the
//! sops-encrypted document plus the recipient symlink folders managed by
//! [`crate::acl`]. The recipient list of a new secret is the target
//! machine's own key (auto-provisioned on first use) plus the configured
//! default groups.

use std::fs;
use std::path::{Path, PathBuf};

use fleetvars_sops::SopsTool;
use tracing::debug;

use crate::acl::{AclError, AclTree, Recipient};
use crate::generator::{Generator, GeneratorKey, Var};
use crate::store::{StoreError, StoreKind, StoreSettings, VarStore};
use crate::util::paths::write_atomic;

const BACKEND: &str = "sops";
const VALIDATION_FILE: &str = ".validation";

pub struct SopsStore {
  machine: String,
  tree: AclTree,
  tool: SopsTool,
  default_groups: Vec<String>,
}

impl SopsStore {
  pub fn new(machine: &str, settings: &StoreSettings) -> Self {
    let mut tool = SopsTool::new();
    if let Some(key_file) = &settings.age_key_file {
      tool = tool.with_age_key_file(key_file);
    }
    Self {
      machine: machine.to_string(),
      tree: AclTree::new(settings.flake_root.join("sops")),
      tool,
      default_groups: settings.default_groups.clone(),
    }
  }

  /// Name of the secret holding `(key, name)`, relative to `secrets/`.
  fn secret_name(&self, key: &GeneratorKey, name: &str) -> String {
    match &key.machine {
      None => format!("shared/{}/{name}", key.name),
      Some(machine) => format!("per-machine/{machine}/{}/{name}", key.name),
    }
  }

  fn generator_dir(&self, key: &GeneratorKey) -> PathBuf {
    match &key.machine {
      None => self.tree.secrets_dir().join("shared").join(&key.name),
      Some(machine) => self
        .tree
        .secrets_dir()
        .join("per-machine")
        .join(machine)
        .join(&key.name),
    }
  }

  /// Recipient keys a written secret must carry: the machine's own key,
  /// the configured default groups, and every key the membership links
  /// already grant. Overwriting a value must never shrink access.
  fn desired_recipients(
    &self,
    db: &crate::acl::AclDb,
    secret: &str,
    machine_key: &str,
  ) -> Result<std::collections::BTreeSet<String>, AclError> {
    let mut keys = std::collections::BTreeSet::new();
    keys.insert(machine_key.to_string());
    for group in &self.default_groups {
      let members = db
        .groups
        .get(group)
        .ok_or_else(|| AclError::UnknownGroup {
          name: group.clone(),
        })?;
      for user in &members.users {
        let user_key = db.users.get(user).ok_or_else(|| AclError::UnknownUser {
          name: user.clone(),
        })?;
        keys.insert(user_key.clone());
      }
      for machine in &members.machines {
        let member_key =
          db.machines
            .get(machine)
            .ok_or_else(|| AclError::UnknownMachine {
              name: machine.clone(),
            })?;
        keys.insert(member_key.clone());
      }
    }
    if db.secrets.contains_key(secret) {
      match db.recipient_keys(secret) {
        Ok(existing) => keys.extend(existing),
        Err(AclError::EmptyRecipients { .. }) => {}
        Err(err) => return Err(err),
      }
    }
    Ok(keys)
  }

  /// Secrets of this store's machine, shared ones included.
  fn relevant_secrets(&self, secrets: &std::collections::BTreeMap<String, crate::acl::RecipientSet>) -> Vec<String> {
    let machine_prefix = format!("per-machine/{}/", self.machine);
    secrets
      .keys()
      .filter(|name| name.starts_with(&machine_prefix) || name.starts_with("shared/"))
      .cloned()
      .collect()
  }
}

impl VarStore for SopsStore {
  fn kind(&self) -> StoreKind {
    StoreKind::Secret
  }

  fn backend(&self) -> &'static str {
    BACKEND
  }

  fn exists(&self, key: &GeneratorKey, name: &str) -> bool {
    self.tree.has_secret(&self.secret_name(key, name))
  }

  fn get(&self, key: &GeneratorKey, name: &str) -> Result<Vec<u8>, StoreError> {
    let secret = self.secret_name(key, name);
    if !self.tree.has_secret(&secret) {
      return Err(StoreError::MissingValue {
        backend: BACKEND,
        generator: key.to_string(),
        name: name.to_string(),
      });
    }
    Ok(self.tool.decrypt(&self.tree.secret_file(&secret))?)
  }

  fn set(
    &self,
    key: &GeneratorKey,
    var: &Var,
    value: &[u8],
  ) -> Result<Option<PathBuf>, StoreError> {
    let secret = self.secret_name(key, &var.name);

    // First use of a machine provisions its keypair; concurrent
    // provisioning is resolved inside the acl layer.
    let machine_key = self.tree.ensure_machine_key(&self.machine)?;

    // Resolve the intended recipient set up front so encryption and
    // the membership links cannot diverge. Existing grants survive
    // the rewrite.
    let db = self.tree.load()?;
    let keys = self.desired_recipients(&db, &secret, &machine_key.publickey)?;

    let recipients: Vec<String> = keys.into_iter().collect();
    let path = self.tree.secret_file(&secret);
    self.tool.encrypt(value, &recipients, &path)?;

    self.tree
      .allow(&secret, &Recipient::Machine(self.machine.clone()))?;
    for group in &self.default_groups {
      self.tree.allow(&secret, &Recipient::Group(group.clone()))?;
    }

    debug!(generator = %key, var = %var.name, "wrote encrypted value");
    Ok(Some(path))
  }

  fn delete(&self, key: &GeneratorKey, name: &str) -> Result<(), StoreError> {
    let dir = self.tree.secret_dir(&self.secret_name(key, name));
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
    // The hash is a fingerprint, not a secret; it stays plaintext so
    // staleness checks never need decryption.
    let path = self.generator_dir(key).join(VALIDATION_FILE);
    write_atomic(&path, hash.as_bytes())?;
    Ok(Some(path))
  }

  /// Detect secrets whose sops envelope no longer matches the recipient
  /// set declared by the membership links.
  fn health_check(&self, _machine: &str) -> Result<Vec<String>, StoreError> {
    let db = self.tree.load()?;
    let mut findings = Vec::new();
    for secret in self.relevant_secrets(&db.secrets) {
      let desired = match db.recipient_keys(&secret) {
        Ok(keys) => keys.into_iter().collect(),
        Err(err) => {
          findings.push(format!("secret '{secret}': {err}"));
          continue;
        }
      };
      let actual = self.tool.recipients(&self.tree.secret_file(&secret))?;
      if actual != desired {
        findings.push(format!(
          "secret '{secret}' is encrypted for an outdated recipient set"
        ));
      }
    }
    Ok(findings)
  }

  /// Re-encrypt every secret flagged by `health_check`, restricted to
  /// one generator's secrets when a scope is given.
  fn fix(&self, _machine: &str, generator: Option<&GeneratorKey>) -> Result<(), StoreError> {
    // With an empty var name this is the generator's prefix.
    let scope = generator.map(|key| self.secret_name(key, ""));
    let db = self.tree.load()?;
    for secret in self.relevant_secrets(&db.secrets) {
      if let Some(prefix) = &scope
        && !secret.starts_with(prefix.as_str())
      {
        continue;
      }
      let desired: std::collections::BTreeSet<String> =
        db.recipient_keys(&secret)?.into_iter().collect();
      let actual = self.tool.recipients(&self.tree.secret_file(&secret))?;
      if actual != desired {
        self.tree.reencrypt_secret(&self.tool, &db, &secret)?;
      }
    }
    Ok(())
  }

  /// Stage decrypted deployable values for the transport collaborator.
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
    debug!(machine, dest = %dest.display(), "staged decrypted values for upload");
    Ok(())
  }
}
