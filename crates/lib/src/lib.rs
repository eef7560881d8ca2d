//! fleetvars-lib: declarative generation and distribution of machine vars.
//!
//! This crate provides the core machinery for managing configuration
//! values ("vars") across a fleet of machines:
//! - `generator`: the data model — vars, prompts, generators, graph keys
//! - `graph`: the closure engine computing which generators run, and in
//!   what order
//! - `store`: the pluggable persistence layer (public plaintext, sops
//!   encrypted, external password manager, ephemeral)
//! - `acl`: the symlink-based access-control tree for the encrypted
//!   backend, with re-encryption on membership change
//! - `execute`: the sandboxed generator executor
//! - `machine` / `ops`: per-machine state and the caller-facing operations
//!   (`generate`, `check`, `fix`, `get`, `set_value`, `list`)
//!
//! Configuration evaluation, command-line parsing, version-control
//! commits, and remote transport are external collaborators; the seams are
//! the plain-data inputs of [`machine::Machine`] and the
//! [`ops::CommitSink`] / [`ops::UploadTransport`] traits.

pub mod acl;
pub mod error;
pub mod execute;
pub mod generator;
pub mod graph;
pub mod machine;
pub mod ops;
pub mod store;
pub mod util;

pub use error::{Error, MachineFailures};
pub use generator::{DependencyRef, Generator, GeneratorKey, NeededFor, Prompt, PromptKind, Var};
pub use machine::Machine;
pub use ops::{CheckReport, CommitSink, GenerateOptions, UploadTransport, VarEntry};
pub use store::{StoreKind, StoreSettings, VarStore};

pub type Result<T> = std::result::Result<T, Error>;
