//! Sandboxed command construction for generator scripts.
//!
//! On Linux the script runs under bubblewrap: no network, a fresh
//! environment, fixed non-privileged uid/gid, a read-only view of the
//! interpreter roots, and write access only to the staged `out` directory.
//! Where bubblewrap is unavailable, execution is refused unless the caller
//! explicitly opted out of sandboxing.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use super::ExecuteError;

/// Non-privileged identity the script runs under inside the sandbox.
const SANDBOX_UID: &str = "1000";
const SANDBOX_GID: &str = "1000";

/// Host paths exposed read-only so interpreters and their libraries work.
const INTERPRETER_ROOTS: &[&str] = &["/bin", "/usr", "/lib", "/lib64", "/etc", "/nix", "/opt"];

/// How a generator script is isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
  /// Sandbox or refuse (the default).
  Required,
  /// Explicit opt-out: run directly with a cleared environment.
  Disabled,
}

/// Build the command to run `script` against the staged directories.
pub fn command(
  script: &str,
  in_dir: &Path,
  out_dir: &Path,
  prompts_dir: Option<&Path>,
  mode: SandboxMode,
) -> Result<Command, ExecuteError> {
  match mode {
    SandboxMode::Required => {
      if !cfg!(target_os = "linux") {
        return Err(ExecuteError::SandboxUnavailable {
          reason: "sandboxed execution is only supported on Linux".to_string(),
        });
      }
      let bwrap = find_bwrap().ok_or_else(|| ExecuteError::SandboxUnavailable {
        reason: "bubblewrap (bwrap) not found on PATH".to_string(),
      })?;
      Ok(bwrap_command(&bwrap, script, in_dir, out_dir, prompts_dir))
    }
    SandboxMode::Disabled => {
      debug!("sandbox disabled by caller, running script directly");
      Ok(direct_command(script, in_dir, out_dir, prompts_dir))
    }
  }
}

fn find_bwrap() -> Option<PathBuf> {
  let path = env::var_os("PATH")?;
  env::split_paths(&path)
    .map(|dir| dir.join("bwrap"))
    .find(|candidate| candidate.is_file())
}

/// The bubblewrap invocation.
///
/// The staged directories are bound at their real paths; everything else
/// the script sees is a read-only bind of the host's interpreter roots.
fn bwrap_command(
  bwrap: &Path,
  script: &str,
  in_dir: &Path,
  out_dir: &Path,
  prompts_dir: Option<&Path>,
) -> Command {
  let mut cmd = Command::new(bwrap);
  cmd.arg("--die-with-parent")
    .arg("--clearenv")
    .arg("--unshare-all")
    .args(["--uid", SANDBOX_UID])
    .args(["--gid", SANDBOX_GID])
    .args(["--dev", "/dev"])
    .args(["--proc", "/proc"])
    .args(["--tmpfs", "/tmp"]);

  for root in INTERPRETER_ROOTS {
    if Path::new(root).exists() {
      cmd.args(["--ro-bind", root, root]);
    }
  }

  cmd.arg("--ro-bind").arg(in_dir).arg(in_dir);
  cmd.arg("--bind").arg(out_dir).arg(out_dir);
  cmd.arg("--setenv").arg("in").arg(in_dir);
  cmd.arg("--setenv").arg("out").arg(out_dir);
  if let Some(prompts) = prompts_dir {
    cmd.arg("--ro-bind").arg(prompts).arg(prompts);
    cmd.arg("--setenv").arg("prompts").arg(prompts);
  }
  cmd.args(["--setenv", "PATH", "/usr/bin:/bin"])
    .args(["--setenv", "HOME", "/homeless-shelter"])
    .args(["--setenv", "LANG", "C"])
    .arg("--")
    .args(["/bin/sh", "-c"])
    .arg(script);
  cmd
}

/// Unsandboxed fallback: same contract, same cleared environment, but no
/// isolation beyond that.
fn direct_command(
  script: &str,
  in_dir: &Path,
  out_dir: &Path,
  prompts_dir: Option<&Path>,
) -> Command {
  let mut cmd = Command::new("/bin/sh");
  cmd.args(["-c", script])
    .env_clear()
    .env("PATH", "/usr/bin:/bin")
    .env("HOME", "/homeless-shelter")
    .env("LANG", "C")
    .env("in", in_dir)
    .env("out", out_dir);
  if let Some(prompts) = prompts_dir {
    cmd.env("prompts", prompts);
  }
  cmd
}
