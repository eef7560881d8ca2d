//! Wrapper over the external `sops` binary.
//!
//! Secrets are stored as sops-encrypted JSON documents with a single
//! `data` key holding the base64-wrapped payload. Recipient lists are
//! passed explicitly as age public keys; no `.sops.yaml` is consulted.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Result, SopsError};

/// The plaintext document handed to sops for encryption.
#[derive(Debug, Serialize, Deserialize)]
struct SecretDocument {
  data: String,
}

/// Handle on the external sops binary.
#[derive(Debug, Clone)]
pub struct SopsTool {
  binary: PathBuf,
  age_key_file: Option<PathBuf>,
}

impl Default for SopsTool {
  fn default() -> Self {
    Self::new()
  }
}

impl SopsTool {
  pub fn new() -> Self {
    Self {
      binary: PathBuf::from("sops"),
      age_key_file: None,
    }
  }

  /// Use a specific binary instead of `sops` from PATH.
  pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
    self.binary = binary.into();
    self
  }

  /// Decrypt using this age key file (exported as `SOPS_AGE_KEY_FILE`).
  pub fn with_age_key_file(mut self, path: impl Into<PathBuf>) -> Self {
    self.age_key_file = Some(path.into());
    self
  }

  /// Encrypt `plaintext` for `recipients` and write the result to `dest`.
  pub fn encrypt(&self, plaintext: &[u8], recipients: &[String], dest: &Path) -> Result<()> {
    if recipients.is_empty() {
      return Err(SopsError::NoRecipients {
        path: dest.display().to_string(),
      });
    }
    if let Some(parent) = dest.parent() {
      fs::create_dir_all(parent)?;
    }

    let document = SecretDocument {
      data: BASE64.encode(plaintext),
    };
    let json = serde_json::to_vec(&document)?;

    // sops reads the plaintext from a file; stage it next to the
    // destination so it never leaves the secret's directory.
    let staging = PlaintextStaging::write(dest, &json)?;
    let args = encrypt_args(recipients, staging.path());
    let ciphertext = self.run(&args, "encrypt", dest)?;
    drop(staging);

    write_atomic(dest, &ciphertext)?;
    debug!(path = %dest.display(), recipients = recipients.len(), "encrypted secret");
    Ok(())
  }

  /// Decrypt the document at `path` and return the raw payload bytes.
  pub fn decrypt(&self, path: &Path) -> Result<Vec<u8>> {
    let args = decrypt_args(path);
    let output = self.run(&args, "decrypt", path)?;

    let document: SecretDocument =
      serde_json::from_slice(&output).map_err(|err| SopsError::PayloadMalformed {
        path: path.display().to_string(),
        message: err.to_string(),
      })?;
    BASE64
      .decode(document.data.as_bytes())
      .map_err(|err| SopsError::PayloadMalformed {
        path: path.display().to_string(),
        message: format!("invalid base64 payload: {err}"),
      })
  }

  /// Re-encrypt the document at `path` for a new recipient list.
  ///
  /// The plaintext is unchanged; only the key envelope is rebuilt.
  pub fn rekey(&self, path: &Path, recipients: &[String]) -> Result<()> {
    let plaintext = self.decrypt(path)?;
    self.encrypt(&plaintext, recipients, path)
  }

  /// Read the age recipients recorded in the sops envelope of `path`.
  pub fn recipients(&self, path: &Path) -> Result<BTreeSet<String>> {
    let content = fs::read_to_string(path)?;
    let envelope: serde_json::Value =
      serde_json::from_str(&content).map_err(|err| SopsError::PayloadMalformed {
        path: path.display().to_string(),
        message: err.to_string(),
      })?;

    let mut recipients = BTreeSet::new();
    if let Some(entries) = envelope
      .get("sops")
      .and_then(|s| s.get("age"))
      .and_then(|a| a.as_array())
    {
      for entry in entries {
        if let Some(recipient) = entry.get("recipient").and_then(|r| r.as_str()) {
          recipients.insert(recipient.to_string());
        }
      }
    }
    Ok(recipients)
  }

  fn run(&self, args: &[String], operation: &'static str, subject: &Path) -> Result<Vec<u8>> {
    let mut command = Command::new(&self.binary);
    command
      .args(args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());
    if let Some(key_file) = &self.age_key_file {
      command.env("SOPS_AGE_KEY_FILE", key_file);
    }

    debug!(binary = %self.binary.display(), operation, "invoking sops");
    let output = command.output().map_err(|err| {
      if err.kind() == std::io::ErrorKind::NotFound {
        SopsError::ToolMissing {
          tool: self.binary.display().to_string(),
        }
      } else {
        err.into()
      }
    })?;

    if !output.status.success() {
      return Err(SopsError::ToolFailed {
        operation,
        path: subject.display().to_string(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }
    Ok(output.stdout)
  }
}

/// Arguments for `sops --encrypt` against an explicit recipient list.
fn encrypt_args(recipients: &[String], plaintext_file: &Path) -> Vec<String> {
  vec![
    "--encrypt".to_string(),
    "--input-type".to_string(),
    "json".to_string(),
    "--output-type".to_string(),
    "json".to_string(),
    "--age".to_string(),
    recipients.join(","),
    plaintext_file.display().to_string(),
  ]
}

/// Arguments for `sops --decrypt`.
fn decrypt_args(path: &Path) -> Vec<String> {
  vec![
    "--decrypt".to_string(),
    "--input-type".to_string(),
    "json".to_string(),
    "--output-type".to_string(),
    "json".to_string(),
    path.display().to_string(),
  ]
}

/// Temporary plaintext file removed again on drop.
struct PlaintextStaging {
  path: PathBuf,
}

impl PlaintextStaging {
  fn write(dest: &Path, content: &[u8]) -> Result<Self> {
    let path = dest.with_extension("plaintext.tmp");
    let mut file = fs::OpenOptions::new()
      .write(true)
      .create(true)
      .truncate(true)
      .open(&path)?;
    restrict_permissions(&file)?;
    file.write_all(content)?;
    file.sync_all()?;
    Ok(Self { path })
  }

  fn path(&self) -> &Path {
    &self.path
  }
}

impl Drop for PlaintextStaging {
  fn drop(&mut self) {
    let _ = fs::remove_file(&self.path);
  }
}

fn write_atomic(dest: &Path, content: &[u8]) -> Result<()> {
  let tmp = dest.with_extension("write.tmp");
  fs::write(&tmp, content)?;
  fs::rename(&tmp, dest)?;
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
