//! Error types for fleetvars-lib

use std::fmt;

use thiserror::Error;

use crate::acl::AclError;
use crate::execute::ExecuteError;
use crate::generator::GeneratorError;
use crate::graph::ClosureError;
use crate::store::StoreError;

/// Errors that can occur in fleetvars operations.
#[derive(Debug, Error)]
pub enum Error {
  #[error("generator error: {0}")]
  Generator(#[from] GeneratorError),

  #[error("closure error: {0}")]
  Closure(#[from] ClosureError),

  #[error("store error: {0}")]
  Store(#[from] StoreError),

  #[error("execution error: {0}")]
  Execute(#[from] ExecuteError),

  #[error("access control error: {0}")]
  Acl(#[from] AclError),

  #[error("sops error: {0}")]
  Sops(#[from] fleetvars_sops::SopsError),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("unknown generator '{name}' on machine '{machine}'")]
  UnknownGenerator { machine: String, name: String },

  #[error("unknown var '{generator}/{name}' on machine '{machine}'")]
  UnknownVar {
    machine: String,
    generator: String,
    name: String,
  },

  /// Per-machine failures collected across a multi-machine run.
  #[error("{0}")]
  Aggregate(MachineFailures),
}

/// Failures collected per machine; generation of the remaining machines
/// continues before these are re-raised together.
#[derive(Debug)]
pub struct MachineFailures(pub Vec<(String, Error)>);

impl fmt::Display for MachineFailures {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "generation failed for {} machine(s):", self.0.len())?;
    for (machine, error) in &self.0 {
      writeln!(f, "  {machine}: {error}")?;
    }
    Ok(())
  }
}
