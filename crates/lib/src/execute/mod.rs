//! The generator executor.
//!
//! For one generator at a time (in closure order): stage dependency
//! outputs and prompt values into isolated directories, run the script in
//! a sandbox, route the produced files into the stores, and persist
//! per-store validation records. Execution blocks the calling thread until
//! the script exits; ordering guarantees come from the closure engine, not
//! from here.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

use crate::generator::{Generator, GeneratorKey, Var};
use crate::graph::GeneratorGraph;
use crate::machine::Machine;
use crate::store::StoreError;

pub mod prompts;
pub mod sandbox;

pub use sandbox::SandboxMode;

/// Caller-supplied execution knobs.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
  pub sandbox: SandboxMode,
  /// Pre-supplied prompt values: generator name -> prompt name -> value.
  pub prompt_values: BTreeMap<String, BTreeMap<String, String>>,
  /// Whether missing prompt values may be collected at the terminal.
  pub interactive: bool,
}

impl Default for ExecuteOptions {
  fn default() -> Self {
    Self {
      sandbox: SandboxMode::Required,
      prompt_values: BTreeMap::new(),
      interactive: false,
    }
  }
}

/// What one generator run changed.
#[derive(Debug, Default)]
pub struct ExecutionReport {
  /// Repository paths to hand to the version-control collaborator.
  pub changed_paths: Vec<PathBuf>,
  /// True if any store content changed.
  pub changed: bool,
}

/// Adopt a legacy generator's stored values instead of running the
/// script. Succeeds only when every declared file is present under the
/// legacy name; the values are copied and the validation record written.
pub fn try_migrate(
  machine: &Machine,
  key: &GeneratorKey,
  generator: &Generator,
) -> Result<Option<ExecutionReport>, ExecuteError> {
  let Some(legacy_name) = &generator.migrate_from else {
    return Ok(None);
  };
  let legacy_key = GeneratorKey {
    machine: key.machine.clone(),
    name: legacy_name.clone(),
  };

  let complete = generator
    .files
    .iter()
    .all(|var| machine.store_for(var).exists(&legacy_key, &var.name));
  if !complete {
    return Ok(None);
  }

  let mut report = ExecutionReport::default();
  for var in &generator.files {
    let store = machine.store_for(var);
    let value = store.get(&legacy_key, &var.name)?;
    if let Some(path) = store.set(key, var, &value)? {
      report.changed_paths.push(path);
    }
    report.changed = true;
  }
  write_validation(machine, key, generator, true, true, &mut report)?;
  info!(generator = %key, from = %legacy_name, "migrated values from legacy generator");
  Ok(Some(report))
}

/// Run one generator and persist its outputs.
pub fn run_generator(
  machine: &Machine,
  graph: &GeneratorGraph,
  key: &GeneratorKey,
  options: &ExecuteOptions,
) -> Result<ExecutionReport, ExecuteError> {
  let generator = graph
    .generator(key)
    .ok_or_else(|| ExecuteError::UnknownGenerator {
      generator: key.to_string(),
    })?;
  info!(generator = %key, "running generator");

  let staging = tempfile::Builder::new().prefix("fleetvars-").tempdir()?;
  let in_dir = stage_dependencies(machine, graph, key, &staging)?;
  let (prompts_dir, prompt_values) = stage_prompts(machine, key, generator, options, &staging)?;
  let out_dir = staging.path().join("out");
  fs::create_dir(&out_dir)?;

  let mut command = sandbox::command(
    &generator.script,
    &in_dir,
    &out_dir,
    prompts_dir.as_deref(),
    options.sandbox,
  )?;
  command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

  debug!(generator = %key, "spawning generator script");
  let output = command.output()?;
  if !output.status.success() {
    return Err(ExecuteError::ScriptFailed {
      generator: key.to_string(),
      code: output.status.code(),
      stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    });
  }
  if !output.stdout.is_empty() {
    debug!(stdout = %String::from_utf8_lossy(&output.stdout), "script output");
  }

  let mut report = ExecutionReport::default();
  let mut secret_changed = false;
  let mut public_changed = false;

  for var in &generator.files {
    let produced = out_dir.join(&var.name);
    if !produced.is_file() {
      return Err(ExecuteError::MissingOutput {
        generator: key.to_string(),
        var: var.name.clone(),
        produced: list_produced(&out_dir),
      });
    }
    let value = fs::read(&produced)?;

    let store = machine.store_for(var);
    let unchanged = matches!(store.get(key, &var.name), Ok(previous) if previous == value);
    if unchanged {
      debug!(generator = %key, var = %var.name, "value unchanged");
      continue;
    }
    if let Some(path) = store.set(key, var, &value)? {
      report.changed_paths.push(path);
    }
    report.changed = true;
    if var.secret {
      secret_changed = true;
    } else {
      public_changed = true;
    }
  }

  // Persist collected prompt values marked for reuse.
  for (prompt_name, value) in prompt_values {
    let var = Var::hidden(&prompt_name);
    if let Some(path) = machine.secret_store().set(key, &var, value.as_bytes())? {
      report.changed_paths.push(path);
    }
  }

  write_validation(machine, key, generator, secret_changed, public_changed, &mut report)?;
  Ok(report)
}

/// Decrypt dependency outputs into `in/<dependency>/<var>`.
fn stage_dependencies(
  machine: &Machine,
  graph: &GeneratorGraph,
  key: &GeneratorKey,
  staging: &TempDir,
) -> Result<PathBuf, ExecuteError> {
  let in_dir = staging.path().join("in");
  fs::create_dir(&in_dir)?;
  for dep_key in graph.dependencies_of(key) {
    let dep = graph
      .generator(&dep_key)
      .ok_or_else(|| ExecuteError::UnknownGenerator {
        generator: dep_key.to_string(),
      })?;
    let dep_dir = in_dir.join(&dep.name);
    fs::create_dir_all(&dep_dir)?;
    for var in &dep.files {
      let value = machine.store_for(var).get(&dep_key, &var.name)?;
      fs::write(dep_dir.join(&var.name), value)?;
    }
  }
  Ok(in_dir)
}

/// Resolve prompt values and write them into `prompts/<name>`.
///
/// Returns the prompts directory (when the generator declares prompts) and
/// the values that must be persisted after a successful run.
fn stage_prompts(
  machine: &Machine,
  key: &GeneratorKey,
  generator: &Generator,
  options: &ExecuteOptions,
  staging: &TempDir,
) -> Result<(Option<PathBuf>, BTreeMap<String, String>), ExecuteError> {
  if generator.prompts.is_empty() {
    return Ok((None, BTreeMap::new()));
  }

  let prompts_dir = staging.path().join("prompts");
  fs::create_dir(&prompts_dir)?;
  let supplied = options.prompt_values.get(&generator.name);
  let mut to_persist = BTreeMap::new();

  for prompt in &generator.prompts {
    let previous = if prompt.persist && machine.secret_store().exists(key, &prompt.name) {
      let bytes = machine.secret_store().get(key, &prompt.name)?;
      Some(String::from_utf8_lossy(&bytes).to_string())
    } else {
      None
    };

    let value = match supplied.and_then(|values| values.get(&prompt.name)) {
      Some(value) => value.clone(),
      None if options.interactive => {
        prompts::collect(&generator.name, prompt, previous.as_deref())?
      }
      None => match previous {
        // A persisted value satisfies the prompt without a terminal.
        Some(previous) => previous,
        None => {
          return Err(ExecuteError::MissingPromptValue {
            generator: generator.name.clone(),
            prompt: prompt.name.clone(),
          });
        }
      },
    };

    fs::write(prompts_dir.join(&prompt.name), &value)?;
    if prompt.persist {
      to_persist.insert(prompt.name.clone(), value);
    }
  }
  Ok((Some(prompts_dir), to_persist))
}

/// Refresh the validation record of every store involved with this
/// generator. Hashes are tracked per store because the two stores may be
/// updated independently; a record is also rewritten when it is merely
/// stale, so an unchanged re-run still clears staleness.
fn write_validation(
  machine: &Machine,
  key: &GeneratorKey,
  generator: &Generator,
  secret_changed: bool,
  public_changed: bool,
  report: &mut ExecutionReport,
) -> Result<(), ExecuteError> {
  let Some(hash) = generator.validation_hash.as_deref() else {
    return Ok(());
  };
  let has_secret = generator.files.iter().any(|v| v.secret);
  let has_public = generator.files.iter().any(|v| !v.secret);

  if has_secret && (secret_changed || !machine.secret_store().hash_is_valid(key, Some(hash))) {
    if let Some(path) = machine.secret_store().set_validation(key, hash)? {
      report.changed_paths.push(path);
    }
    report.changed = true;
  }
  if has_public && (public_changed || !machine.public_store().hash_is_valid(key, Some(hash))) {
    if let Some(path) = machine.public_store().set_validation(key, hash)? {
      report.changed_paths.push(path);
    }
    report.changed = true;
  }
  Ok(())
}

fn list_produced(out_dir: &std::path::Path) -> Vec<String> {
  let mut names: Vec<String> = fs::read_dir(out_dir)
    .map(|entries| {
      entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect()
    })
    .unwrap_or_default();
  names.sort();
  names
}

/// Errors during generator execution. Fatal for the machine being
/// generated; other machines continue and failures are aggregated.
#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("store error: {0}")]
  Store(#[from] StoreError),

  #[error("sandboxed execution unavailable: {reason} (pass an explicit opt-out to run unsandboxed)")]
  SandboxUnavailable { reason: String },

  #[error("generator '{generator}' script failed (exit code {code:?}): {stderr}")]
  ScriptFailed {
    generator: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error(
    "generator '{generator}' did not produce declared output '{var}'; \
     files actually produced: [{}]", .produced.join(", ")
  )]
  MissingOutput {
    generator: String,
    var: String,
    produced: Vec<String>,
  },

  #[error("no value supplied for prompt '{prompt}' of generator '{generator}'")]
  MissingPromptValue { generator: String, prompt: String },

  #[error("prompt '{prompt}' of generator '{generator}' needs a terminal")]
  NotInteractive { generator: String, prompt: String },

  #[error("generator '{generator}' is not part of the computed closure")]
  UnknownGenerator { generator: String },
}
