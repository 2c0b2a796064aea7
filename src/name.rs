//! Directory names
//!
//! Just enough name handling for routing: a name is split into its
//! comma-separated components, each normalized so that comparison ignores
//! case and the spacing around separators. `cn=Test, dc=Example` and
//! `CN=test,DC=example` are the same name.

use std::fmt;

use crate::error::{AtlasError, Result};
use crate::protocol::ResultCode;

/// A normalized directory name
///
/// Components are stored leaf first, the way they are written.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DirName {
    components: Vec<String>,
}

impl DirName {
    /// The empty name (directory root)
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse and normalize a name
    ///
    /// Fails with `InvalidDnSyntax` on empty components or a dangling escape.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        let components = split_escaped(trimmed)?
            .into_iter()
            .map(|component| normalize_component(&component))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { components })
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// True if `self` equals `other` or is one of its ancestors
    pub fn is_suffix_of(&self, other: &DirName) -> bool {
        other.components.len() >= self.components.len()
            && other.components[other.components.len() - self.components.len()..]
                == self.components[..]
    }
}

impl fmt::Display for DirName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.components.join(","))
    }
}

/// Split a name into its leaf component and its parent, keeping the text
/// as written
///
/// `cn=Bob,ou=People,dc=example` gives `("cn=Bob", Some("ou=People,dc=example"))`.
pub fn split_leaf(input: &str) -> Result<(String, Option<String>)> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid(input, "empty name"));
    }
    let mut parts = split_escaped(trimmed)?.into_iter().map(|part| part.trim().to_string());
    let leaf = parts.next().unwrap_or_default();
    let parent: Vec<String> = parts.collect();
    let parent = (!parent.is_empty()).then(|| parent.join(","));
    Ok((leaf, parent))
}

fn invalid(input: &str, reason: &str) -> AtlasError {
    AtlasError::operation(
        ResultCode::InvalidDnSyntax,
        format!("invalid name '{}': {}", input, reason),
    )
}

/// Split on commas that are not escaped with a backslash
fn split_escaped(input: &str) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| invalid(input, "unterminated escape"))?;
                current.push('\\');
                current.push(escaped);
            }
            ',' => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    parts.push(current);

    if parts.iter().any(|part| part.trim().is_empty()) {
        return Err(invalid(input, "empty component"));
    }
    Ok(parts)
}

fn normalize_component(component: &str) -> Result<String> {
    let component = component.trim();
    match component.split_once('=') {
        Some((attribute, value)) => {
            let attribute = attribute.trim();
            if attribute.is_empty() {
                return Err(invalid(component, "missing attribute"));
            }
            Ok(format!(
                "{}={}",
                attribute.to_ascii_lowercase(),
                value.trim().to_lowercase()
            ))
        }
        // Bare tokens (e.g. an extended operation OID) compare as-is
        None => Ok(component.to_lowercase()),
    }
}
