//! Interactive prompt collection.
//!
//! Collection is synchronous and blocking; it may require a human at a
//! terminal. Callers that cannot prompt supply values up front through
//! [`super::ExecuteOptions::prompt_values`].

use std::io::{self, Read};

use console::Term;

use crate::generator::{Prompt, PromptKind};

use super::ExecuteError;

/// Collect one prompt value from the terminal.
///
/// For persisted prompts the previously stored value is offered as a
/// default: empty input keeps it.
pub fn collect(
  generator: &str,
  prompt: &Prompt,
  default: Option<&str>,
) -> Result<String, ExecuteError> {
  let term = Term::stderr();
  if !term.is_term() {
    return Err(ExecuteError::NotInteractive {
      generator: generator.to_string(),
      prompt: prompt.name.clone(),
    });
  }

  let description = if prompt.description.is_empty() {
    &prompt.name
  } else {
    &prompt.description
  };
  match default {
    Some(_) => term.write_line(&format!(
      "{description} (empty input keeps the stored value)"
    ))?,
    None => term.write_line(description)?,
  }

  let input = match prompt.kind {
    PromptKind::Line => term.read_line()?,
    PromptKind::Hidden => term.read_secure_line()?,
    PromptKind::MultiLine => {
      term.write_line("(finish with end-of-input, usually ctrl-d)")?;
      let mut buffer = String::new();
      io::stdin().lock().read_to_string(&mut buffer)?;
      buffer
    }
  };

  if input.is_empty()
    && let Some(previous) = default
  {
    return Ok(previous.to_string());
  }
  Ok(input)
}
