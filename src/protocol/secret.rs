//! The shared bearer token.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use subtle::ConstantTimeEq;

/// Static credential every upgrade request must present verbatim.
///
/// Read-only after startup; shared between connections behind an `Arc`.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            anyhow::bail!("Secret must not be empty");
        }
        Ok(Self(value))
    }

    /// Load a secret from a file, ignoring a trailing newline.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read secret file: {}", path.display()))?;
        Self::new(contents.trim_end_matches(['\r', '\n']))
    }

    /// Exact, constant-time comparison against a presented credential.
    pub fn matches(&self, candidate: Option<&[u8]>) -> bool {
        match candidate {
            Some(candidate) => self.0.as_bytes().ct_eq(candidate).into(),
            None => false,
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}
