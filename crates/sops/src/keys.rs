//! Age keypair generation, persistence, and idempotent provisioning.
//!
//! A registry entry (a machine or user directory inside the sops tree)
//! holds up to two files:
//! - `key.json` — the public half, always present
//! - `key.txt` — the private half, present only for keys provisioned here
//!   (user keys typically live outside the repo; only their public record
//!   is registered)

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use age::secrecy::ExposeSecret;
use age::x25519::Identity;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Result, SopsError};

const PUBLIC_RECORD: &str = "key.json";
const PRIVATE_KEY: &str = "key.txt";

/// The public half of a registry entry, serialized as `key.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
  pub publickey: String,
  pub r#type: String,
}

impl KeyRecord {
  pub fn age(publickey: impl Into<String>) -> Self {
    Self {
      publickey: publickey.into(),
      r#type: "age".to_string(),
    }
  }
}

/// Outcome of [`provision_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedKey {
  /// The age public key ("age1...").
  pub publickey: String,
  /// True if this call generated the key, false if one already existed.
  pub created: bool,
}

/// Ensure a keypair exists in `dir`, generating one on first use.
///
/// Idempotent under concurrent invocation: the private key file is opened
/// with `create_new`, so a second concurrent caller loses the race, observes
/// the now-existing key, and loads it instead of overwriting.
pub fn provision_key(dir: &Path) -> Result<ProvisionedKey> {
  fs::create_dir_all(dir)?;
  let key_path = dir.join(PRIVATE_KEY);

  match OpenOptions::new().write(true).create_new(true).open(&key_path) {
    Ok(mut file) => {
      let identity = Identity::generate();
      let publickey = identity.to_public().to_string();

      restrict_permissions(&file)?;
      writeln!(file, "# public key: {publickey}")?;
      writeln!(file, "{}", identity.to_string().expose_secret())?;
      file.sync_all()?;

      write_key_record(dir, &KeyRecord::age(&publickey))?;
      info!(dir = %dir.display(), "generated age key");
      Ok(ProvisionedKey {
        publickey,
        created: true,
      })
    }
    Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
      let identity = load_identity(&key_path)?;
      let publickey = identity.to_public().to_string();
      // The public record may be missing if a previous provisioning
      // was interrupted between the two writes.
      if !dir.join(PUBLIC_RECORD).exists() {
        write_key_record(dir, &KeyRecord::age(&publickey))?;
      }
      debug!(dir = %dir.display(), "age key already provisioned");
      Ok(ProvisionedKey {
        publickey,
        created: false,
      })
    }
    Err(err) => Err(err.into()),
  }
}

/// Load a private age identity from a key file.
///
/// The file format matches `age-keygen` output: comment lines starting with
/// `#`, then the `AGE-SECRET-KEY-1...` line.
pub fn load_identity(path: &Path) -> Result<Identity> {
  let content = fs::read_to_string(path)?;
  let line = content
    .lines()
    .map(str::trim)
    .find(|l| !l.is_empty() && !l.starts_with('#'))
    .ok_or_else(|| SopsError::KeyMissing {
      path: path.display().to_string(),
    })?;

  Identity::from_str(line).map_err(|message| SopsError::KeyInvalid {
    path: path.display().to_string(),
    message: message.to_string(),
  })
}

/// Read the public record of a registry entry.
pub fn read_key_record(dir: &Path) -> Result<KeyRecord> {
  let path = dir.join(PUBLIC_RECORD);
  if !path.exists() {
    return Err(SopsError::KeyMissing {
      path: path.display().to_string(),
    });
  }
  let content = fs::read_to_string(&path)?;
  Ok(serde_json::from_str(&content)?)
}

/// Write the public record of a registry entry.
pub fn write_key_record(dir: &Path, record: &KeyRecord) -> Result<()> {
  fs::create_dir_all(dir)?;
  let json = serde_json::to_string_pretty(record)?;
  fs::write(dir.join(PUBLIC_RECORD), json)?;
  Ok(())
}

#[cfg(unix)]
fn restrict_permissions(file: &fs::File) -> std::io::Result<()> {
  use std::os::unix::fs::PermissionsExt;
  file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &fs::File) -> std::io::Result<()> {
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn provision_generates_then_reuses() -> Result<()> {
    let dir = TempDir::new()?;

    let first = provision_key(dir.path())?;
    assert!(first.created);
    assert!(first.publickey.starts_with("age1"));

    let second = provision_key(dir.path())?;
    assert!(!second.created);
    assert_eq!(first.publickey, second.publickey);
    Ok(())
  }

  #[test]
  fn provisioned_identity_round_trips() -> Result<()> {
    let dir = TempDir::new()?;
    let provisioned = provision_key(dir.path())?;

    let identity = load_identity(&dir.path().join(PRIVATE_KEY))?;
    assert_eq!(identity.to_public().to_string(), provisioned.publickey);

    let record = read_key_record(dir.path())?;
    assert_eq!(record.publickey, provisioned.publickey);
    assert_eq!(record.r#type, "age");
    Ok(())
  }

  #[test]
  fn public_record_rewritten_when_missing() -> Result<()> {
    let dir = TempDir::new()?;
    let provisioned = provision_key(dir.path())?;

    std::fs::remove_file(dir.path().join(PUBLIC_RECORD))?;
    let again = provision_key(dir.path())?;
    assert!(!again.created);
    assert_eq!(read_key_record(dir.path())?.publickey, provisioned.publickey);
    Ok(())
  }

  #[test]
  fn load_identity_rejects_garbage() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(PRIVATE_KEY);
    std::fs::write(&path, "# only comments\n").unwrap();
    assert!(matches!(load_identity(&path), Err(SopsError::KeyMissing { .. })));

    std::fs::write(&path, "not-a-key\n").unwrap();
    assert!(matches!(load_identity(&path), Err(SopsError::KeyInvalid { .. })));
  }
}
