//! Per-machine state: identity, generator set, and the two stores.
//!
//! The generator set is supplied per invocation by the external
//! configuration evaluator and treated as read-only input. Stores are
//! resolved through the backend registry at construction time — one
//! public and one secret store per machine.

use std::collections::BTreeMap;

use crate::Result;
use crate::generator::{Generator, GeneratorKey, Var};
use crate::graph::GeneratorNode;
use crate::store::{self, StoreSettings, VarStore};

pub struct Machine {
  name: String,
  generators: BTreeMap<String, Generator>,
  public: Box<dyn VarStore>,
  secret: Box<dyn VarStore>,
}

impl Machine {
  pub fn new(
    name: impl Into<String>,
    generators: Vec<Generator>,
    public_backend: &str,
    secret_backend: &str,
    settings: &StoreSettings,
  ) -> Result<Self> {
    let name = name.into();
    let public = store::public_store(public_backend, &name, settings)?;
    let secret = store::secret_store(secret_backend, &name, settings)?;
    let generators = generators
      .into_iter()
      .map(|g| (g.name.clone(), g))
      .collect();
    Ok(Self {
      name,
      generators,
      public,
      secret,
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn generators(&self) -> impl Iterator<Item = &Generator> {
    self.generators.values()
  }

  pub fn generator(&self, name: &str) -> Option<&Generator> {
    self.generators.get(name)
  }

  pub fn public_store(&self) -> &dyn VarStore {
    self.public.as_ref()
  }

  pub fn secret_store(&self) -> &dyn VarStore {
    self.secret.as_ref()
  }

  /// The store a var binds to: secret vars to the secret store,
  /// everything else to the public store.
  pub fn store_for(&self, var: &Var) -> &dyn VarStore {
    if var.secret {
      self.secret.as_ref()
    } else {
      self.public.as_ref()
    }
  }

  /// A generator exists iff every declared var is present in its store
  /// and each involved store's validation record matches the
  /// generator's hash.
  pub fn generator_exists(&self, generator: &Generator) -> bool {
    let key = generator.key(&self.name);
    for var in &generator.files {
      if !self.store_for(var).exists(&key, &var.name) {
        return false;
      }
    }

    let hash = generator.validation_hash.as_deref();
    let has_secret = generator.files.iter().any(|v| v.secret);
    let has_public = generator.files.iter().any(|v| !v.secret);
    if has_secret && !self.secret.hash_is_valid(&key, hash) {
      return false;
    }
    if has_public && !self.public.hash_is_valid(&key, hash) {
      return false;
    }
    true
  }

  /// Graph nodes for this machine's generators, annotated with `exists`.
  pub fn graph_nodes(&self) -> BTreeMap<GeneratorKey, GeneratorNode> {
    self.generators
      .values()
      .map(|generator| {
        (
          generator.key(&self.name),
          GeneratorNode {
            exists: self.generator_exists(generator),
            generator: generator.clone(),
          },
        )
      })
      .collect()
  }
}
