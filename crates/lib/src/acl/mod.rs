//! Access control for the encrypted store backend.
//!
//! On disk, membership is a symlink structure (kept for compatibility):
//!
//! ```text
//! <flake_root>/sops/
//! ├── users/<name>/key.json
//! ├── machines/<name>/{key.json,key.txt}
//! ├── groups/<name>/{users,machines}/<member> -> ../../../{users,machines}/<member>
//! └── secrets/<secret>/
//!     ├── secret                      # the sops-encrypted document
//!     └── {users,machines,groups}/<name> -> link into the registries
//! ```
//!
//! Internally the tree is loaded into an explicit relation ([`AclDb`]) so
//! recipient resolution and the affected-secret computation are plain set
//! logic, testable without touching the filesystem. Any membership change
//! re-encrypts every secret whose recipient list it alters — that is the
//! mechanism keeping ciphertext synchronized with policy.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use fleetvars_sops::{KeyRecord, ProvisionedKey, SopsTool, provision_key, read_key_record, write_key_record};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::util::paths::relative_to;

/// File name of the encrypted document inside a secret's folder.
pub const SECRET_FILE: &str = "secret";

/// A principal that can be a group member.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Principal {
  User(String),
  Machine(String),
}

impl Principal {
  fn folder(&self) -> &'static str {
    match self {
      Principal::User(_) => "users",
      Principal::Machine(_) => "machines",
    }
  }

  fn name(&self) -> &str {
    match self {
      Principal::User(name) | Principal::Machine(name) => name,
    }
  }
}

impl fmt::Display for Principal {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Principal::User(name) => write!(f, "user '{name}'"),
      Principal::Machine(name) => write!(f, "machine '{name}'"),
    }
  }
}

/// A recipient entry of a secret.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Recipient {
  User(String),
  Machine(String),
  Group(String),
}

impl Recipient {
  fn folder(&self) -> &'static str {
    match self {
      Recipient::User(_) => "users",
      Recipient::Machine(_) => "machines",
      Recipient::Group(_) => "groups",
    }
  }

  fn name(&self) -> &str {
    match self {
      Recipient::User(name) | Recipient::Machine(name) | Recipient::Group(name) => name,
    }
  }
}

impl fmt::Display for Recipient {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Recipient::User(name) => write!(f, "user '{name}'"),
      Recipient::Machine(name) => write!(f, "machine '{name}'"),
      Recipient::Group(name) => write!(f, "group '{name}'"),
    }
  }
}

/// Members of a group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupMembers {
  pub users: BTreeSet<String>,
  pub machines: BTreeSet<String>,
}

/// Declared recipients of a secret.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientSet {
  pub users: BTreeSet<String>,
  pub machines: BTreeSet<String>,
  pub groups: BTreeSet<String>,
}

/// The membership relation, loaded once from the symlink tree.
#[derive(Debug, Clone, Default)]
pub struct AclDb {
  /// User name -> age public key.
  pub users: BTreeMap<String, String>,
  /// Machine name -> age public key.
  pub machines: BTreeMap<String, String>,
  pub groups: BTreeMap<String, GroupMembers>,
  /// Secret name (path relative to `secrets/`) -> recipients.
  pub secrets: BTreeMap<String, RecipientSet>,
}

impl AclDb {
  /// The age public keys allowed to decrypt `secret`, groups flattened,
  /// sorted and deduplicated.
  pub fn recipient_keys(&self, secret: &str) -> Result<Vec<String>, AclError> {
    let set = self
      .secrets
      .get(secret)
      .ok_or_else(|| AclError::UnknownSecret {
        name: secret.to_string(),
      })?;

    let mut keys = BTreeSet::new();
    for user in &set.users {
      keys.insert(self.user_key(user)?.to_string());
    }
    for machine in &set.machines {
      keys.insert(self.machine_key(machine)?.to_string());
    }
    for group in &set.groups {
      let members = self.groups.get(group).ok_or_else(|| AclError::UnknownGroup {
        name: group.to_string(),
      })?;
      for user in &members.users {
        keys.insert(self.user_key(user)?.to_string());
      }
      for machine in &members.machines {
        keys.insert(self.machine_key(machine)?.to_string());
      }
    }

    if keys.is_empty() {
      return Err(AclError::EmptyRecipients {
        secret: secret.to_string(),
      });
    }
    Ok(keys.into_iter().collect())
  }

  /// Secrets whose effective recipient list involves `recipient`,
  /// directly or through group membership.
  pub fn affected_secrets(&self, recipient: &Recipient) -> Vec<String> {
    // Groups the recipient reaches secrets through.
    let via_groups: BTreeSet<&String> = match recipient {
      Recipient::Group(name) => std::iter::once(name).collect(),
      Recipient::User(name) => self
        .groups
        .iter()
        .filter(|(_, members)| members.users.contains(name))
        .map(|(group, _)| group)
        .collect(),
      Recipient::Machine(name) => self
        .groups
        .iter()
        .filter(|(_, members)| members.machines.contains(name))
        .map(|(group, _)| group)
        .collect(),
    };

    self.secrets
      .iter()
      .filter(|(_, set)| {
        let direct = match recipient {
          Recipient::User(name) => set.users.contains(name),
          Recipient::Machine(name) => set.machines.contains(name),
          Recipient::Group(name) => set.groups.contains(name),
        };
        direct || set.groups.iter().any(|g| via_groups.contains(g))
      })
      .map(|(name, _)| name.clone())
      .collect()
  }

  fn user_key(&self, name: &str) -> Result<&str, AclError> {
    self.users
      .get(name)
      .map(String::as_str)
      .ok_or_else(|| AclError::UnknownUser {
        name: name.to_string(),
      })
  }

  fn machine_key(&self, name: &str) -> Result<&str, AclError> {
    self.machines
      .get(name)
      .map(String::as_str)
      .ok_or_else(|| AclError::UnknownMachine {
        name: name.to_string(),
      })
  }
}

/// The on-disk symlink tree.
pub struct AclTree {
  root: PathBuf,
}

impl AclTree {
  /// `root` is the `sops/` directory inside the repository.
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn user_dir(&self, name: &str) -> PathBuf {
    self.root.join("users").join(name)
  }

  pub fn machine_dir(&self, name: &str) -> PathBuf {
    self.root.join("machines").join(name)
  }

  pub fn group_dir(&self, name: &str) -> PathBuf {
    self.root.join("groups").join(name)
  }

  pub fn secrets_dir(&self) -> PathBuf {
    self.root.join("secrets")
  }

  pub fn secret_dir(&self, secret: &str) -> PathBuf {
    self.secrets_dir().join(secret)
  }

  pub fn secret_file(&self, secret: &str) -> PathBuf {
    self.secret_dir(secret).join(SECRET_FILE)
  }

  pub fn has_secret(&self, secret: &str) -> bool {
    self.secret_file(secret).is_file()
  }

  /// Register a user by public key.
  pub fn add_user(&self, name: &str, publickey: &str) -> Result<(), AclError> {
    write_key_record(&self.user_dir(name), &KeyRecord::age(publickey))?;
    info!(user = name, "registered user key");
    Ok(())
  }

  /// Register a machine by public key (for externally managed keys).
  pub fn add_machine(&self, name: &str, publickey: &str) -> Result<(), AclError> {
    write_key_record(&self.machine_dir(name), &KeyRecord::age(publickey))?;
    info!(machine = name, "registered machine key");
    Ok(())
  }

  /// Ensure a machine keypair exists, generating one on first use.
  /// Concurrent provisioning for the same machine is safe; the loser of
  /// the race observes the existing key.
  pub fn ensure_machine_key(&self, name: &str) -> Result<ProvisionedKey, AclError> {
    Ok(provision_key(&self.machine_dir(name))?)
  }

  /// Load the whole tree into the explicit relation.
  pub fn load(&self) -> Result<AclDb, AclError> {
    let mut db = AclDb::default();

    for (dir, map) in [
      (self.root.join("users"), &mut db.users),
      (self.root.join("machines"), &mut db.machines),
    ] {
      for name in list_dirs(&dir)? {
        match read_key_record(&dir.join(&name)) {
          Ok(record) => {
            map.insert(name, record.publickey);
          }
          // Registry dirs without a readable record are skipped;
          // health_check on the store surfaces them.
          Err(err) => debug!(entry = %name, error = %err, "skipping registry entry"),
        }
      }
    }

    for group in list_dirs(&self.root.join("groups"))? {
      let dir = self.group_dir(&group);
      let members = GroupMembers {
        users: list_entries(&dir.join("users"))?,
        machines: list_entries(&dir.join("machines"))?,
      };
      db.groups.insert(group, members);
    }

    let secrets_dir = self.secrets_dir();
    if secrets_dir.is_dir() {
      for entry in WalkDir::new(&secrets_dir).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_dir() || !entry.path().join(SECRET_FILE).is_file() {
          continue;
        }
        let Ok(relative) = entry.path().strip_prefix(&secrets_dir) else {
          continue;
        };
        let name = relative.to_string_lossy().to_string();
        let set = RecipientSet {
          users: list_entries(&entry.path().join("users"))?,
          machines: list_entries(&entry.path().join("machines"))?,
          groups: list_entries(&entry.path().join("groups"))?,
        };
        db.secrets.insert(name, set);
      }
    }

    Ok(db)
  }

  /// Grant `recipient` access to `secret`. Returns false if the link
  /// already existed. The caller is responsible for re-encrypting.
  pub fn allow(&self, secret: &str, recipient: &Recipient) -> Result<bool, AclError> {
    self.require_registered(recipient)?;
    if !self.has_secret(secret) {
      return Err(AclError::UnknownSecret {
        name: secret.to_string(),
      });
    }
    let membership_dir = self.secret_dir(secret).join(recipient.folder());
    let target = self.root.join(recipient.folder()).join(recipient.name());
    self.link(&membership_dir, recipient.name(), &target)
  }

  /// Revoke `recipient`'s access to `secret`, pruning membership folders
  /// that become empty. Returns false if there was nothing to revoke.
  pub fn revoke(&self, secret: &str, recipient: &Recipient) -> Result<bool, AclError> {
    let link = self
      .secret_dir(secret)
      .join(recipient.folder())
      .join(recipient.name());
    self.unlink_and_prune(&link, &self.secrets_dir())
  }

  /// Add a principal to a group, creating the group on first member.
  pub fn group_add(&self, group: &str, member: &Principal) -> Result<bool, AclError> {
    self.require_principal(member)?;
    let membership_dir = self.group_dir(group).join(member.folder());
    let target = self.root.join(member.folder()).join(member.name());
    self.link(&membership_dir, member.name(), &target)
  }

  /// Remove a principal from a group, pruning the group's folders (and
  /// the group itself) when they become empty.
  pub fn group_remove(&self, group: &str, member: &Principal) -> Result<bool, AclError> {
    let link = self.group_dir(group).join(member.folder()).join(member.name());
    self.unlink_and_prune(&link, &self.root.join("groups"))
  }

  /// Grant `recipient` access to `secret` and re-encrypt it so the
  /// ciphertext matches the new recipient set. Returns false (without
  /// touching the ciphertext) when the grant already existed.
  pub fn grant(
    &self,
    tool: &SopsTool,
    secret: &str,
    recipient: &Recipient,
  ) -> Result<bool, AclError> {
    if !self.allow(secret, recipient)? {
      return Ok(false);
    }
    let db = self.load()?;
    self.reencrypt_secret(tool, &db, secret)?;
    Ok(true)
  }

  /// Revoke `recipient`'s access to `secret` and re-encrypt it against
  /// the remaining recipients. Removing the last recipient is refused
  /// and the link restored.
  pub fn withdraw(
    &self,
    tool: &SopsTool,
    secret: &str,
    recipient: &Recipient,
  ) -> Result<bool, AclError> {
    if !self.revoke(secret, recipient)? {
      return Ok(false);
    }
    let db = self.load()?;
    match self.reencrypt_secret(tool, &db, secret) {
      Ok(()) => Ok(true),
      Err(err @ AclError::EmptyRecipients { .. }) => {
        self.allow(secret, recipient)?;
        Err(err)
      }
      Err(err) => Err(err),
    }
  }

  /// Add a principal to a group and re-encrypt every secret the group
  /// can decrypt. Returns the re-keyed secret names.
  pub fn group_grant(
    &self,
    tool: &SopsTool,
    group: &str,
    member: &Principal,
  ) -> Result<Vec<String>, AclError> {
    if !self.group_add(group, member)? {
      return Ok(Vec::new());
    }
    self.reencrypt_affected(tool, &Recipient::Group(group.to_string()))
  }

  /// Remove a principal from a group and re-encrypt every secret the
  /// group can decrypt, so the removed member loses access for real.
  pub fn group_withdraw(
    &self,
    tool: &SopsTool,
    group: &str,
    member: &Principal,
  ) -> Result<Vec<String>, AclError> {
    if !self.group_remove(group, member)? {
      return Ok(Vec::new());
    }
    self.reencrypt_affected(tool, &Recipient::Group(group.to_string()))
  }

  /// Re-encrypt every secret whose recipient list involves `changed`.
  /// Returns the names of the secrets that were re-keyed.
  pub fn reencrypt_affected(
    &self,
    tool: &SopsTool,
    changed: &Recipient,
  ) -> Result<Vec<String>, AclError> {
    let db = self.load()?;
    let affected = db.affected_secrets(changed);
    for secret in &affected {
      self.reencrypt_secret(tool, &db, secret)?;
    }
    info!(recipient = %changed, count = affected.len(), "re-encrypted affected secrets");
    Ok(affected)
  }

  /// Re-encrypt one secret against its current recipient set.
  pub fn reencrypt_secret(
    &self,
    tool: &SopsTool,
    db: &AclDb,
    secret: &str,
  ) -> Result<(), AclError> {
    let keys = db.recipient_keys(secret)?;
    tool.rekey(&self.secret_file(secret), &keys)?;
    debug!(secret, recipients = keys.len(), "re-encrypted secret");
    Ok(())
  }

  fn require_registered(&self, recipient: &Recipient) -> Result<(), AclError> {
    let known = match recipient {
      Recipient::User(name) => self.user_dir(name).join("key.json").is_file(),
      Recipient::Machine(name) => self.machine_dir(name).join("key.json").is_file(),
      Recipient::Group(name) => self.group_dir(name).is_dir(),
    };
    if known {
      return Ok(());
    }
    Err(match recipient {
      Recipient::User(name) => AclError::UnknownUser { name: name.clone() },
      Recipient::Machine(name) => AclError::UnknownMachine { name: name.clone() },
      Recipient::Group(name) => AclError::UnknownGroup { name: name.clone() },
    })
  }

  fn require_principal(&self, member: &Principal) -> Result<(), AclError> {
    let dir = self.root.join(member.folder()).join(member.name());
    if dir.join("key.json").is_file() {
      return Ok(());
    }
    Err(match member {
      Principal::User(name) => AclError::UnknownUser { name: name.clone() },
      Principal::Machine(name) => AclError::UnknownMachine { name: name.clone() },
    })
  }

  fn link(&self, dir: &Path, name: &str, target: &Path) -> Result<bool, AclError> {
    fs::create_dir_all(dir)?;
    let link = dir.join(name);
    if link.symlink_metadata().is_ok() {
      return Ok(false);
    }
    let relative = relative_to(dir, target);
    symlink(&relative, &link).map_err(|err| AclError::Symlink {
      link: link.display().to_string(),
      target: relative.display().to_string(),
      message: err.to_string(),
    })?;
    debug!(link = %link.display(), target = %relative.display(), "granted access");
    Ok(true)
  }

  fn unlink_and_prune(&self, link: &Path, stop: &Path) -> Result<bool, AclError> {
    if link.symlink_metadata().is_err() {
      return Ok(false);
    }
    fs::remove_file(link)?;

    let mut dir = link.parent().map(Path::to_path_buf);
    while let Some(current) = dir {
      if current == *stop || !dir_is_empty(&current)? {
        break;
      }
      fs::remove_dir(&current)?;
      dir = current.parent().map(Path::to_path_buf);
    }
    Ok(true)
  }
}

fn dir_is_empty(dir: &Path) -> std::io::Result<bool> {
  Ok(fs::read_dir(dir)?.next().is_none())
}

/// Directory names directly under `dir` (empty if `dir` is absent).
fn list_dirs(dir: &Path) -> Result<Vec<String>, AclError> {
  list(dir, true)
}

/// Entry names directly under `dir`, symlinks included.
fn list_entries(dir: &Path) -> Result<BTreeSet<String>, AclError> {
  Ok(list(dir, false)?.into_iter().collect())
}

fn list(dir: &Path, dirs_only: bool) -> Result<Vec<String>, AclError> {
  if !dir.is_dir() {
    return Ok(Vec::new());
  }
  let mut names = Vec::new();
  for entry in fs::read_dir(dir)? {
    let entry = entry?;
    if dirs_only && !entry.path().is_dir() {
      continue;
    }
    names.push(entry.file_name().to_string_lossy().to_string());
  }
  names.sort();
  Ok(names)
}

/// Errors from the access-control layer.
#[derive(Debug, Error)]
pub enum AclError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("key error: {0}")]
  Key(#[from] fleetvars_sops::SopsError),

  #[error("unknown user '{name}'")]
  UnknownUser { name: String },

  #[error("unknown machine '{name}'")]
  UnknownMachine { name: String },

  #[error("unknown group '{name}'")]
  UnknownGroup { name: String },

  #[error("unknown secret '{name}'")]
  UnknownSecret { name: String },

  #[error("secret '{secret}' would have no recipients")]
  EmptyRecipients { secret: String },

  #[error("failed to create symlink {link} -> {target}: {message}")]
  Symlink {
    link: String,
    target: String,
    message: String,
  },
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn tree() -> (TempDir, AclTree) {
    let tmp = TempDir::new().unwrap();
    let tree = AclTree::new(tmp.path().join("sops"));
    tree.add_user("alice", "age1alice").unwrap();
    tree.add_user("bob", "age1bob").unwrap();
    tree.add_machine("web01", "age1web01").unwrap();
    (tmp, tree)
  }

  fn seed_secret(tree: &AclTree, name: &str) {
    let file = tree.secret_file(name);
    fs::create_dir_all(file.parent().unwrap()).unwrap();
    fs::write(file, b"{}").unwrap();
  }

  #[test]
  fn allow_load_and_flatten_groups() {
    let (_tmp, tree) = tree();
    seed_secret(&tree, "per-machine/web01/ssh/key");

    tree.group_add("admins", &Principal::User("alice".into())).unwrap();
    tree.group_add("admins", &Principal::User("bob".into())).unwrap();
    assert!(tree.allow("per-machine/web01/ssh/key", &Recipient::Machine("web01".into())).unwrap());
    assert!(tree.allow("per-machine/web01/ssh/key", &Recipient::Group("admins".into())).unwrap());
    // Granting again is a no-op.
    assert!(!tree.allow("per-machine/web01/ssh/key", &Recipient::Machine("web01".into())).unwrap());

    let db = tree.load().unwrap();
    let keys = db.recipient_keys("per-machine/web01/ssh/key").unwrap();
    assert_eq!(keys, vec!["age1alice", "age1bob", "age1web01"]);
  }

  #[test]
  fn recipients_must_be_registered() {
    let (_tmp, tree) = tree();
    seed_secret(&tree, "shared/ca/key");
    let err = tree.allow("shared/ca/key", &Recipient::User("mallory".into())).unwrap_err();
    assert!(matches!(err, AclError::UnknownUser { .. }));
  }

  #[test]
  fn affected_secrets_follow_group_membership() {
    let (_tmp, tree) = tree();
    seed_secret(&tree, "shared/ca/key");
    seed_secret(&tree, "per-machine/web01/ssh/key");

    tree.group_add("admins", &Principal::User("alice".into())).unwrap();
    tree.allow("shared/ca/key", &Recipient::Group("admins".into())).unwrap();
    tree.allow("per-machine/web01/ssh/key", &Recipient::Machine("web01".into())).unwrap();

    let db = tree.load().unwrap();
    // alice reaches shared/ca/key only through the admins group.
    assert_eq!(
      db.affected_secrets(&Recipient::User("alice".into())),
      vec!["shared/ca/key".to_string()]
    );
    assert_eq!(
      db.affected_secrets(&Recipient::Group("admins".into())),
      vec!["shared/ca/key".to_string()]
    );
    assert_eq!(
      db.affected_secrets(&Recipient::Machine("web01".into())),
      vec!["per-machine/web01/ssh/key".to_string()]
    );
  }

  #[test]
  fn revoke_prunes_empty_membership_folders() {
    let (_tmp, tree) = tree();
    seed_secret(&tree, "shared/ca/key");
    tree.allow("shared/ca/key", &Recipient::User("alice".into())).unwrap();

    let users_folder = tree.secret_dir("shared/ca/key").join("users");
    assert!(users_folder.is_dir());

    assert!(tree.revoke("shared/ca/key", &Recipient::User("alice".into())).unwrap());
    assert!(!users_folder.exists());
    // The secret itself stays.
    assert!(tree.has_secret("shared/ca/key"));
    // Revoking twice is a no-op.
    assert!(!tree.revoke("shared/ca/key", &Recipient::User("alice".into())).unwrap());
  }

  #[test]
  fn group_remove_cascades_to_empty_group() {
    let (_tmp, tree) = tree();
    tree.group_add("admins", &Principal::User("alice".into())).unwrap();
    assert!(tree.group_dir("admins").is_dir());

    tree.group_remove("admins", &Principal::User("alice".into())).unwrap();
    assert!(!tree.group_dir("admins").exists());
  }

  #[test]
  fn machine_key_provisioning_is_idempotent() {
    let (_tmp, tree) = tree();
    let first = tree.ensure_machine_key("db01").unwrap();
    assert!(first.created);
    let second = tree.ensure_machine_key("db01").unwrap();
    assert!(!second.created);
    assert_eq!(first.publickey, second.publickey);

    let db = tree.load().unwrap();
    assert_eq!(db.machines.get("db01"), Some(&first.publickey));
  }

  #[test]
  fn empty_recipient_list_is_rejected() {
    let (_tmp, tree) = tree();
    seed_secret(&tree, "shared/ca/key");
    let db = tree.load().unwrap();
    let err = db.recipient_keys("shared/ca/key").unwrap_err();
    assert!(matches!(err, AclError::EmptyRecipients { .. }));
  }

  /// A stand-in sops binary: decrypt emits a fixed payload document,
  /// encrypt emits an envelope recording the requested age recipients.
  fn fake_sops(dir: &Path) -> SopsTool {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-sops");
    let script = r#"#!/bin/sh
case "$1" in
  --decrypt)
  printf '{"data":"cGF5bG9hZA=="}'
  ;;
  --encrypt)
  printf '{"data":"ENC","sops":{"age":['
  first=1
  IFS=,
  for r in $7; do
    [ "$first" = 1 ] || printf ','
    first=0
    printf '{"recipient":"%s"}' "$r"
  done
  printf ']}}'
  ;;
  *)
  exit 1
  ;;
esac
"#;
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    SopsTool::new().with_binary(&path)
  }

  #[test]
  fn grant_rekeys_the_secret_for_the_new_recipient() {
    let (tmp, tree) = tree();
    let tool = fake_sops(tmp.path());
    seed_secret(&tree, "shared/ca/key");
    tree.allow("shared/ca/key", &Recipient::Machine("web01".into())).unwrap();

    assert!(tree.grant(&tool, "shared/ca/key", &Recipient::User("alice".into())).unwrap());
    let recipients = tool.recipients(&tree.secret_file("shared/ca/key")).unwrap();
    assert_eq!(
      recipients.into_iter().collect::<Vec<_>>(),
      vec!["age1alice", "age1web01"]
    );

    // Granting again changes nothing and skips the rekey.
    assert!(!tree.grant(&tool, "shared/ca/key", &Recipient::User("alice".into())).unwrap());
  }

  #[test]
  fn withdraw_rekeys_against_the_remaining_recipients() {
    let (tmp, tree) = tree();
    let tool = fake_sops(tmp.path());
    seed_secret(&tree, "shared/ca/key");
    tree.allow("shared/ca/key", &Recipient::User("alice".into())).unwrap();
    tree.allow("shared/ca/key", &Recipient::User("bob".into())).unwrap();

    assert!(tree.withdraw(&tool, "shared/ca/key", &Recipient::User("bob".into())).unwrap());
    let recipients = tool.recipients(&tree.secret_file("shared/ca/key")).unwrap();
    assert_eq!(recipients.into_iter().collect::<Vec<_>>(), vec!["age1alice"]);
  }

  #[test]
  fn withdrawing_the_last_recipient_is_refused() {
    let (tmp, tree) = tree();
    let tool = fake_sops(tmp.path());
    seed_secret(&tree, "shared/ca/key");
    tree.allow("shared/ca/key", &Recipient::User("alice".into())).unwrap();

    let err = tree
      .withdraw(&tool, "shared/ca/key", &Recipient::User("alice".into()))
      .unwrap_err();
    assert!(matches!(err, AclError::EmptyRecipients { .. }));
    // The grant is restored, so the secret stays decryptable.
    let db = tree.load().unwrap();
    assert_eq!(db.recipient_keys("shared/ca/key").unwrap(), vec!["age1alice"]);
  }

  #[test]
  fn group_membership_change_rekeys_exactly_the_affected_secrets() {
    let (tmp, tree) = tree();
    let tool = fake_sops(tmp.path());
    seed_secret(&tree, "shared/ca/key");
    seed_secret(&tree, "per-machine/web01/ssh/key");

    tree.group_add("admins", &Principal::User("alice".into())).unwrap();
    tree.allow("shared/ca/key", &Recipient::Group("admins".into())).unwrap();
    tree.allow("per-machine/web01/ssh/key", &Recipient::Machine("web01".into())).unwrap();
    tree.reencrypt_affected(&tool, &Recipient::Machine("web01".into())).unwrap();

    // Adding bob touches only the group-reachable secret.
    let rekeyed = tree
      .group_grant(&tool, "admins", &Principal::User("bob".into()))
      .unwrap();
    assert_eq!(rekeyed, vec!["shared/ca/key".to_string()]);
    let recipients = tool.recipients(&tree.secret_file("shared/ca/key")).unwrap();
    assert_eq!(
      recipients.into_iter().collect::<Vec<_>>(),
      vec!["age1alice", "age1bob"]
    );
    // The machine secret's envelope is untouched by the group change.
    let ssh = tool.recipients(&tree.secret_file("per-machine/web01/ssh/key")).unwrap();
    assert_eq!(ssh.into_iter().collect::<Vec<_>>(), vec!["age1web01"]);

    // Removing bob again drops him from the ciphertext.
    let rekeyed = tree
      .group_withdraw(&tool, "admins", &Principal::User("bob".into()))
      .unwrap();
    assert_eq!(rekeyed, vec!["shared/ca/key".to_string()]);
    let recipients = tool.recipients(&tree.secret_file("shared/ca/key")).unwrap();
    assert_eq!(recipients.into_iter().collect::<Vec<_>>(), vec!["age1alice"]);
  }
}
