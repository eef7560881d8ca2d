//! Caller-facing operations over one or more machines.
//!
//! `generate` is the heart: merge the machines' generator sets into one
//! graph, pick a closure, execute it in order, and hand the changed
//! repository paths to the commit collaborator. The remaining operations
//! (`check`, `fix`, `get`, `set_value`, `list`, `upload`) are thin wrappers
//! over the store layer for a single machine.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{Error, MachineFailures};
use crate::execute::{self, ExecuteOptions};
use crate::generator::{GeneratorError, GeneratorKey};
use crate::graph::{GeneratorGraph, GeneratorNode};
use crate::machine::Machine;
use crate::{Result, Var};

/// Receives repository paths that changed during generation. Committing is
/// deliberately outside this crate; a sink may batch, commit per call, or
/// ignore paths entirely.
pub trait CommitSink {
  fn commit(&mut self, paths: &[PathBuf], message: &str) -> Result<()>;
}

/// Moves staged values to a target host. The transport owns connectivity;
/// this crate only decides *whether* an upload is needed and stages the
/// files.
pub trait UploadTransport {
  /// The upload marker previously written on the host, if any.
  fn read_marker(&mut self, machine: &str) -> Result<Option<String>>;

  /// Deliver the staged directory to the host.
  fn deliver(&mut self, machine: &str, staged: &Path) -> Result<()>;
}

/// Options for [`generate`].
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
  /// Restrict generation to these generator names. `None` means every
  /// generator of every requested machine.
  pub generators: Option<Vec<String>>,
  /// Re-run generators even when their outputs are present and valid.
  pub regenerate: bool,
  pub execute: ExecuteOptions,
}

/// One row of [`list`] output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarEntry {
  pub generator: String,
  pub name: String,
  pub secret: bool,
  pub exists: bool,
  /// Value preview; secret values are masked.
  pub preview: String,
}

/// What [`check`] found for one machine.
#[derive(Debug, Default)]
pub struct CheckReport {
  /// Missing public values, as `generator/var`.
  pub missing_public: Vec<String>,
  /// Missing secret values, as `generator/var`.
  pub missing_secret: Vec<String>,
  /// Generators whose stored validation record no longer matches.
  pub stale_generators: Vec<String>,
  /// Backend consistency findings, repairable via [`fix`].
  pub findings: Vec<String>,
}

impl CheckReport {
  pub fn is_healthy(&self) -> bool {
    self.missing_public.is_empty()
      && self.missing_secret.is_empty()
      && self.stale_generators.is_empty()
      && self.findings.is_empty()
  }
}

/// Generate vars for the given machines.
///
/// The closure depends on the options: with no explicit generators a plain
/// run executes everything missing (plus dependents of missing), while
/// `regenerate` re-runs everything. With explicit generators, a plain run
/// executes the minimal set needed for their data to exist, while
/// `regenerate` re-runs them and their dependents.
///
/// Execution failures on one machine do not stop the others; they are
/// collected and re-raised together. Returns whether anything changed.
pub fn generate(
  machines: &[Machine],
  sink: Option<&mut dyn CommitSink>,
  options: &GenerateOptions,
) -> Result<bool> {
  let mut by_name: Vec<&Machine> = machines.iter().collect();
  by_name.sort_by(|a, b| a.name().cmp(b.name()));

  let (nodes, shared_owner) = merge_generator_sets(&by_name)?;
  let graph = GeneratorGraph::new(nodes)?;

  let order = match (&options.generators, options.regenerate) {
    (None, false) => graph.all_missing_closure()?,
    (None, true) => graph.full_closure()?,
    (Some(names), false) => graph.minimal_closure(&resolve_requested(&by_name, names)?)?,
    (Some(names), true) => graph.requested_closure(&resolve_requested(&by_name, names)?)?,
  };
  info!(generators = order.len(), "generation closure computed");

  let machine_index: BTreeMap<&str, &Machine> =
    by_name.iter().map(|m| (m.name(), *m)).collect();
  let mut changed_paths = Vec::new();
  let mut changed = false;
  let mut failures: Vec<(String, Error)> = Vec::new();
  let mut failed: BTreeSet<String> = BTreeSet::new();

  for key in &order {
    let executor = match &key.machine {
      Some(machine) => machine.as_str(),
      // Shared generators run once, on the first machine (by name)
      // that references them.
      None => match shared_owner.get(&key.name) {
        Some(owner) => owner.as_str(),
        None => continue,
      },
    };
    if failed.contains(executor) {
      continue;
    }
    let Some(machine) = machine_index.get(executor) else {
      continue;
    };

    match run_one(machine, &graph, key, options) {
      Ok(report) => {
        changed |= report.changed;
        changed_paths.extend(report.changed_paths);
      }
      Err(error) => {
        warn!(machine = executor, generator = %key, %error, "generation failed");
        failures.push((executor.to_string(), error));
        failed.insert(executor.to_string());
      }
    }
  }

  if let Some(sink) = sink
    && !changed_paths.is_empty()
  {
    changed_paths.sort();
    changed_paths.dedup();
    let message = format!("Update vars ({} generator(s))", order.len());
    sink.commit(&changed_paths, &message)?;
  }

  if failures.is_empty() {
    Ok(changed)
  } else {
    Err(Error::Aggregate(MachineFailures(failures)))
  }
}

fn run_one(
  machine: &Machine,
  graph: &GeneratorGraph,
  key: &GeneratorKey,
  options: &GenerateOptions,
) -> Result<execute::ExecutionReport> {
  // A missing generator with a migration source adopts the legacy values
  // instead of running its script.
  if !graph.exists(key)
    && let Some(generator) = graph.generator(key)
    && let Some(report) = execute::try_migrate(machine, key, generator)?
  {
    return Ok(report);
  }
  Ok(execute::run_generator(machine, graph, key, &options.execute)?)
}

/// Merge the machines' generator sets into one node map.
///
/// Shared generators appear once; every machine referencing one must carry
/// an identical definition, and the merged node only counts as existing if
/// it is valid from every machine's view. Returns the nodes and, for each
/// shared generator, the machine that will execute it.
fn merge_generator_sets<'a>(
  machines: &[&'a Machine],
) -> Result<(BTreeMap<GeneratorKey, GeneratorNode>, BTreeMap<String, String>)> {
  let mut nodes: BTreeMap<GeneratorKey, GeneratorNode> = BTreeMap::new();
  let mut shared_owner: BTreeMap<String, String> = BTreeMap::new();

  for machine in machines {
    for (key, node) in machine.graph_nodes() {
      if key.machine.is_some() {
        nodes.insert(key, node);
        continue;
      }
      match nodes.get_mut(&key) {
        None => {
          shared_owner.insert(key.name.clone(), machine.name().to_string());
          nodes.insert(key, node);
        }
        Some(existing) => {
          if let Some(field) = existing.generator.shared_divergence(&node.generator) {
            let first = shared_owner.get(&key.name).cloned().unwrap_or_default();
            return Err(GeneratorError::SharedMismatch {
              name: key.name.clone(),
              field,
              machine_a: first,
              machine_b: machine.name().to_string(),
            }
            .into());
          }
          existing.exists &= node.exists;
        }
      }
    }
  }
  Ok((nodes, shared_owner))
}

/// Resolve requested generator names to keys across the machines.
fn resolve_requested(machines: &[&Machine], names: &[String]) -> Result<Vec<GeneratorKey>> {
  let mut keys = BTreeSet::new();
  for name in names {
    let mut found = false;
    for machine in machines {
      if let Some(generator) = machine.generator(name) {
        keys.insert(generator.key(machine.name()));
        found = true;
      }
    }
    if !found {
      let machine = machines
        .iter()
        .map(|m| m.name())
        .collect::<Vec<_>>()
        .join(", ");
      return Err(Error::UnknownGenerator {
        machine,
        name: name.clone(),
      });
    }
  }
  Ok(keys.into_iter().collect())
}

/// Inspect one machine's stores without modifying anything.
pub fn check(machine: &Machine, generator: Option<&str>) -> Result<CheckReport> {
  let mut report = CheckReport::default();

  for g in machine.generators() {
    if let Some(only) = generator
      && g.name != only
    {
      continue;
    }
    let key = g.key(machine.name());
    for var in &g.files {
      if !machine.store_for(var).exists(&key, &var.name) {
        let entry = format!("{}/{}", g.name, var.name);
        if var.secret {
          report.missing_secret.push(entry);
        } else {
          report.missing_public.push(entry);
        }
      }
    }

    let hash = g.validation_hash.as_deref();
    let has_secret = g.files.iter().any(|v| v.secret);
    let has_public = g.files.iter().any(|v| !v.secret);
    let stale = (has_secret && !machine.secret_store().hash_is_valid(&key, hash))
      || (has_public && !machine.public_store().hash_is_valid(&key, hash));
    if stale {
      report.stale_generators.push(g.name.clone());
    }
  }
  if let Some(only) = generator
    && machine.generator(only).is_none()
  {
    return Err(Error::UnknownGenerator {
      machine: machine.name().to_string(),
      name: only.to_string(),
    });
  }

  report
    .findings
    .extend(machine.public_store().health_check(machine.name())?);
  report
    .findings
    .extend(machine.secret_store().health_check(machine.name())?);
  Ok(report)
}

/// Repair backend inconsistencies reported by [`check`], optionally
/// restricted to one generator.
pub fn fix(machine: &Machine, generator: Option<&str>) -> Result<()> {
  let key = match generator {
    None => None,
    Some(name) => match machine.generator(name) {
      Some(g) => Some(g.key(machine.name())),
      None => {
        return Err(Error::UnknownGenerator {
          machine: machine.name().to_string(),
          name: name.to_string(),
        });
      }
    },
  };
  machine.public_store().fix(machine.name(), key.as_ref())?;
  machine.secret_store().fix(machine.name(), key.as_ref())?;
  Ok(())
}

/// Read one var's value.
pub fn get(machine: &Machine, generator: &str, name: &str) -> Result<Vec<u8>> {
  let (key, var) = resolve_var(machine, generator, name)?;
  Ok(machine.store_for(&var).get(&key, name)?)
}

/// Overwrite one var's value directly, bypassing the generator script.
/// Returns the repository path to commit, if the backend has one.
pub fn set_value(
  machine: &Machine,
  generator: &str,
  name: &str,
  value: &[u8],
) -> Result<Option<PathBuf>> {
  let (key, var) = resolve_var(machine, generator, name)?;
  info!(machine = machine.name(), generator, var = name, "setting value directly");
  Ok(machine.store_for(&var).set(&key, &var, value)?)
}

fn resolve_var(machine: &Machine, generator: &str, name: &str) -> Result<(GeneratorKey, Var)> {
  let g = machine
    .generator(generator)
    .ok_or_else(|| Error::UnknownGenerator {
      machine: machine.name().to_string(),
      name: generator.to_string(),
    })?;
  let var = g.file(name).ok_or_else(|| Error::UnknownVar {
    machine: machine.name().to_string(),
    generator: generator.to_string(),
    name: name.to_string(),
  })?;
  Ok((g.key(machine.name()), var.clone()))
}

/// List every var of one machine, with secret values masked.
pub fn list(machine: &Machine) -> Result<Vec<VarEntry>> {
  let mut entries = Vec::new();
  for g in machine.generators() {
    let key = g.key(machine.name());
    for var in &g.files {
      let store = machine.store_for(var);
      let exists = store.exists(&key, &var.name);
      let preview = if !exists {
        "<not set>".to_string()
      } else if var.secret {
        "********".to_string()
      } else {
        String::from_utf8_lossy(&store.get(&key, &var.name)?)
          .trim_end()
          .to_string()
      };
      entries.push(VarEntry {
        generator: g.name.clone(),
        name: var.name.clone(),
        secret: var.secret,
        exists,
        preview,
      });
    }
  }
  Ok(entries)
}

/// Upload one machine's secret values to its host if they are out of date.
/// Returns whether an upload happened.
pub fn upload(machine: &Machine, transport: &mut dyn UploadTransport) -> Result<bool> {
  let marker = transport.read_marker(machine.name())?;
  if !machine
    .secret_store()
    .needs_upload(machine.name(), marker.as_deref())?
  {
    info!(machine = machine.name(), "secrets on host are up to date");
    return Ok(false);
  }

  let staging = tempfile::Builder::new().prefix("fleetvars-upload-").tempdir()?;
  let generators: Vec<_> = machine.generators().cloned().collect();
  machine
    .secret_store()
    .upload(machine.name(), &generators, staging.path())?;
  transport.deliver(machine.name(), staging.path())?;
  info!(machine = machine.name(), "secrets uploaded");
  Ok(true)
}
