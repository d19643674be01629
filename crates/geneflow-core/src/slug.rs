//! Slug normalization for job directories, output names and backend job
//! names.

use std::io;

use regex::Regex;

use crate::error::Result;

/// Lowercase `s` and replace every run of characters outside `[-a-z0-9_]`
/// with a single `-`. Leading and trailing dashes are trimmed. Idempotent.
pub fn slugify(s: &str) -> Result<String> {
    let disallowed = Regex::new(r"[^-a-z0-9_]+")
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let lowered = s.to_lowercase();
    let replaced = disallowed.replace_all(&lowered, "-");
    Ok(replaced.trim_matches('-').to_string())
}
