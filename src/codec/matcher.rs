//! Path matchers for object specs.
//!
//! A matcher combines up to three tests with AND: a path prefix, a set of
//! file extensions, and a glob. A matcher with no tests matches everything.
//! Directory paths are presented with a trailing slash, so a glob such as
//! `/units/*/` selects directories while `/units/*.json` selects files.

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use super::CodecError;

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Serializable form of a [`PathMatcher`], as supplied over RPC.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MatcherDescriptor {
    /// Paths strictly below this prefix match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    /// File extensions (without the dot); directories never match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
    /// A `glob` pattern over the full canonical path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glob: Option<String>,
}

/// A compiled path predicate.
#[derive(Clone, Debug, Default)]
pub struct PathMatcher {
    prefix: Option<String>,
    extensions: Vec<String>,
    pattern: Option<Pattern>,
}

impl PathMatcher {
    /// A matcher that accepts every path.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Paths strictly below `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Self::default()
        }
    }

    /// Paths matching a glob pattern.
    ///
    /// # Errors
    /// [`CodecError`] if the pattern does not compile.
    pub fn glob(pattern: &str) -> Result<Self, CodecError> {
        Ok(Self {
            pattern: Some(compile(pattern)?),
            ..Self::default()
        })
    }

    /// Additionally require one of `extensions`.
    #[must_use]
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.into().trim_start_matches('.').to_owned())
            .collect();
        self
    }

    /// Compile a descriptor.
    ///
    /// # Errors
    /// [`CodecError`] if the glob does not compile.
    pub fn from_descriptor(descriptor: &MatcherDescriptor) -> Result<Self, CodecError> {
        let pattern = descriptor.glob.as_deref().map(compile).transpose()?;
        Ok(Self {
            prefix: descriptor.path_prefix.clone(),
            pattern,
            ..Self::default()
        }
        .with_extensions(descriptor.extensions.iter().cloned()))
    }

    /// Whether `path` satisfies every configured test.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        if let Some(prefix) = &self.prefix
            && !(path.starts_with(prefix.as_str()) && path.len() > prefix.len())
        {
            return false;
        }
        if !self.extensions.is_empty() {
            if path.ends_with('/') {
                return false;
            }
            let name = path.rsplit('/').next().unwrap_or(path);
            let Some((_, ext)) = name.rsplit_once('.') else {
                return false;
            };
            if !self.extensions.iter().any(|e| e == ext) {
                return false;
            }
        }
        if let Some(pattern) = &self.pattern
            && !pattern.matches_with(path, GLOB_OPTIONS)
        {
            return false;
        }
        true
    }
}

fn compile(pattern: &str) -> Result<Pattern, CodecError> {
    Pattern::new(pattern).map_err(|e| CodecError::new(format!("invalid glob {pattern:?}: {e}")))
}
