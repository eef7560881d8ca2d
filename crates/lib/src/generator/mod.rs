//! The generator data model.
//!
//! Generators arrive as plain data from an external configuration
//! evaluator, once per machine per invocation. They are never persisted as
//! objects; only their *outputs* persist, through the store layer.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Deployment phase a var is needed for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NeededFor {
  #[default]
  Activation,
  Users,
  Services,
  Partitioning,
}

/// A single named output value with its access metadata.
///
/// Identity is `(generator_name, name)`; a var is owned by exactly one
/// generator and binds at read/write time to exactly one store (the secret
/// store if `secret`, the public store otherwise).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Var {
  pub name: String,
  #[serde(default)]
  pub secret: bool,
  #[serde(default = "default_true")]
  pub deploy: bool,
  #[serde(default = "default_root")]
  pub owner: String,
  #[serde(default = "default_root")]
  pub group: String,
  #[serde(default = "default_mode")]
  pub mode: u32,
  #[serde(default)]
  pub needed_for: NeededFor,
}

impl Var {
  /// A secret var with default metadata, as used for persisted prompts.
  pub fn hidden(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      secret: true,
      deploy: false,
      owner: default_root(),
      group: default_root(),
      mode: default_mode(),
      needed_for: NeededFor::default(),
    }
  }

  /// A public var with default metadata.
  pub fn public(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      secret: false,
      deploy: true,
      owner: default_root(),
      group: default_root(),
      mode: default_mode(),
      needed_for: NeededFor::default(),
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_root() -> String {
  "root".to_string()
}

fn default_mode() -> u32 {
  0o400
}

/// How a prompt value is collected from the terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptKind {
  /// A single line, echoed.
  #[default]
  Line,
  /// Lines until end-of-input.
  MultiLine,
  /// A single line, not echoed.
  Hidden,
}

/// An interactive input a generator needs at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
  pub name: String,
  #[serde(default)]
  pub kind: PromptKind,
  #[serde(default)]
  pub description: String,
  /// If set, the collected value is stored in the secret store and
  /// offered back as a default on the next run.
  #[serde(default)]
  pub persist: bool,
}

/// A reference to another generator's outputs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyRef {
  pub name: String,
  /// True if the referenced generator is shared across machines.
  #[serde(default)]
  pub shared: bool,
}

impl DependencyRef {
  pub fn machine_scoped(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      shared: false,
    }
  }

  pub fn shared(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      shared: true,
    }
  }
}

/// Identity of a node in the generator graph.
///
/// `machine = None` denotes a shared generator: one instance of output
/// reused by every machine that references it by name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GeneratorKey {
  pub machine: Option<String>,
  pub name: String,
}

impl GeneratorKey {
  pub fn shared(name: impl Into<String>) -> Self {
    Self {
      machine: None,
      name: name.into(),
    }
  }

  pub fn machine(machine: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      machine: Some(machine.into()),
      name: name.into(),
    }
  }

  pub fn is_shared(&self) -> bool {
    self.machine.is_none()
  }
}

impl fmt::Display for GeneratorKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.machine {
      Some(machine) => write!(f, "{machine}/{}", self.name),
      None => write!(f, "shared/{}", self.name),
    }
  }
}

/// A named unit of work producing one or more vars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generator {
  pub name: String,
  /// The shell-executable command producing the declared files.
  pub script: String,
  /// One output instance reused by every machine that references this
  /// generator, instead of one per machine.
  #[serde(default)]
  pub share: bool,
  pub files: Vec<Var>,
  #[serde(default)]
  pub prompts: Vec<Prompt>,
  #[serde(default)]
  pub dependencies: Vec<DependencyRef>,
  /// Legacy service name whose stored values are adopted instead of
  /// running the script, when they are all present.
  #[serde(default)]
  pub migrate_from: Option<String>,
  /// Fingerprint of the definition, used for staleness detection.
  /// Supplied by the configuration evaluator; [`Generator::definition_hash`]
  /// computes one when the evaluator does not.
  #[serde(default)]
  pub validation_hash: Option<String>,
}

impl Generator {
  /// The graph key of this generator as seen from `machine`.
  pub fn key(&self, machine: &str) -> GeneratorKey {
    if self.share {
      GeneratorKey::shared(&self.name)
    } else {
      GeneratorKey::machine(machine, &self.name)
    }
  }

  /// Look up a declared var by name.
  pub fn file(&self, name: &str) -> Option<&Var> {
    self.files.iter().find(|v| v.name == name)
  }

  /// Sha256 over the canonical JSON rendering of the definition.
  ///
  /// The hash covers everything that affects outputs: files, prompts,
  /// dependencies, and the share flag. It deliberately excludes
  /// `validation_hash` itself and `migrate_from`.
  pub fn definition_hash(&self) -> Result<String, GeneratorError> {
    #[derive(Serialize)]
    struct Canonical<'a> {
      name: &'a str,
      script: &'a str,
      share: bool,
      files: &'a [Var],
      prompts: &'a [Prompt],
      dependencies: &'a [DependencyRef],
    }
    let canonical = serde_json::to_string(&Canonical {
      name: &self.name,
      script: &self.script,
      share: self.share,
      files: &self.files,
      prompts: &self.prompts,
      dependencies: &self.dependencies,
    })
    .map_err(GeneratorError::Hash)?;

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
  }

  /// Compare this definition against the same shared generator as seen
  /// from another machine; returns the first differing field.
  pub fn shared_divergence(&self, other: &Generator) -> Option<&'static str> {
    if self.script != other.script {
      Some("script")
    } else if self.files != other.files {
      Some("files")
    } else if self.prompts != other.prompts {
      Some("prompts")
    } else if self.dependencies != other.dependencies {
      Some("dependencies")
    } else if self.validation_hash != other.validation_hash {
      Some("validation_hash")
    } else {
      None
    }
  }
}

/// Configuration errors in generator definitions.
#[derive(Debug, Error)]
pub enum GeneratorError {
  #[error(
    "shared generator '{name}' differs between machines '{machine_a}' and '{machine_b}' \
     in field '{field}'"
  )]
  SharedMismatch {
    name: String,
    field: &'static str,
    machine_a: String,
    machine_b: String,
  },

  #[error("failed to hash generator definition: {0}")]
  Hash(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
  use super::*;

  fn generator(name: &str) -> Generator {
    Generator {
      name: name.to_string(),
      script: "true".to_string(),
      share: false,
      files: vec![Var::public("value")],
      prompts: Vec::new(),
      dependencies: Vec::new(),
      migrate_from: None,
      validation_hash: None,
    }
  }

  #[test]
  fn var_defaults_from_minimal_json() {
    let var: Var = serde_json::from_str(r#"{"name": "password"}"#).unwrap();
    assert!(!var.secret);
    assert!(var.deploy);
    assert_eq!(var.owner, "root");
    assert_eq!(var.group, "root");
    assert_eq!(var.mode, 0o400);
    assert_eq!(var.needed_for, NeededFor::Activation);
  }

  #[test]
  fn key_reflects_share_flag() {
    let mut g = generator("ssh");
    assert_eq!(g.key("web01"), GeneratorKey::machine("web01", "ssh"));
    g.share = true;
    assert_eq!(g.key("web01"), GeneratorKey::shared("ssh"));
  }

  #[test]
  fn definition_hash_is_stable_and_sensitive() {
    let g = generator("ssh");
    let h1 = g.definition_hash().unwrap();
    let h2 = g.definition_hash().unwrap();
    assert_eq!(h1, h2);

    let mut changed = g.clone();
    changed.files.push(Var::hidden("extra"));
    assert_ne!(h1, changed.definition_hash().unwrap());

    // migrate_from does not affect outputs, so it must not affect the hash.
    let mut migrated = g.clone();
    migrated.migrate_from = Some("legacy-ssh".to_string());
    assert_eq!(h1, migrated.definition_hash().unwrap());
  }

  #[test]
  fn shared_divergence_names_the_field() {
    let a = generator("ssh");
    let mut b = a.clone();
    assert_eq!(a.shared_divergence(&b), None);

    b.prompts.push(Prompt {
      name: "passphrase".to_string(),
      kind: PromptKind::Hidden,
      description: String::new(),
      persist: false,
    });
    assert_eq!(a.shared_divergence(&b), Some("prompts"));
  }

  #[test]
  fn key_display() {
    assert_eq!(GeneratorKey::shared("ssh").to_string(), "shared/ssh");
    assert_eq!(
      GeneratorKey::machine("web01", "ssh").to_string(),
      "web01/ssh"
    );
  }
}
