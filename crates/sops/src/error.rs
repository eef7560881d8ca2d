//! Error types for fleetvars-sops

use thiserror::Error;

/// Errors from age key handling or the external sops tool.
#[derive(Debug, Error)]
pub enum SopsError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("`{tool}` not found on PATH")]
  ToolMissing { tool: String },

  #[error("sops {operation} failed for '{path}' (exit code {code:?}): {stderr}")]
  ToolFailed {
    operation: &'static str,
    path: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("no age key material found at '{path}'")]
  KeyMissing { path: String },

  #[error("invalid age key at '{path}': {message}")]
  KeyInvalid { path: String, message: String },

  #[error("secret payload at '{path}' is malformed: {message}")]
  PayloadMalformed { path: String, message: String },

  #[error("refusing to encrypt '{path}' with an empty recipient list")]
  NoRecipients { path: String },
}
