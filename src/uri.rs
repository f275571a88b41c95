//! URI Model
//!
//! Light-weight parser for location strings of the form
//! `scheme://authority/path/to/name`.
//!
//! - `scheme` defaults to `local`
//! - `authority` is empty for local data
//! - the path is always absolute, with redundant and trailing slashes removed
//!
//! Query strings and fragments are not part of the grammar.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::UriError;

/// Scheme applied when a location carries none.
pub const DEFAULT_SCHEME: &str = "local";

/// A parsed, normalized location.
///
/// Parsing the [`Uri::normalized_uri`] of a value yields an identical value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Uri {
    scheme: String,
    authority: String,
    path: String,
    folder: String,
    name: String,
}

impl Uri {
    /// Parses a location string.
    ///
    /// Missing scheme and authority never fail; only strings carrying a
    /// query, a fragment or a line break are rejected.
    ///
    /// # Example
    ///
    /// ```
    /// use pipeflow::uri::Uri;
    ///
    /// let uri = Uri::parse("gsiftp://cluster//data/run1/").unwrap();
    /// assert_eq!(uri.scheme(), "gsiftp");
    /// assert_eq!(uri.authority(), "cluster");
    /// assert_eq!(uri.path(), "/data/run1");
    /// assert_eq!(uri.folder(), "/data");
    /// assert_eq!(uri.name(), "run1");
    /// ```
    pub fn parse(raw: &str) -> Result<Self, UriError> {
        if let Some(bad) = raw.chars().find(|c| matches!(c, '?' | '#' | '\n' | '\r')) {
            return Err(UriError::Invalid {
                uri: raw.to_string(),
                reason: format!("unexpected character {:?}", bad),
            });
        }

        let (scheme, rest) = match raw.split_once(':') {
            Some((prefix, rest)) if !prefix.is_empty() && !prefix.contains('/') => {
                (prefix.to_string(), rest)
            }
            _ => (DEFAULT_SCHEME.to_string(), raw),
        };

        let (authority, rest) = match rest.strip_prefix("//") {
            Some(after) => match after.find('/') {
                Some(idx) => (after[..idx].to_string(), &after[idx..]),
                None => (after.to_string(), ""),
            },
            None => (String::new(), rest),
        };

        let path = normalize_path(rest);
        let (folder, name) = match path.rfind('/') {
            Some(0) => ("/".to_string(), path[1..].to_string()),
            Some(idx) => (path[..idx].to_string(), path[idx + 1..].to_string()),
            None => ("/".to_string(), path.clone()),
        };

        Ok(Self {
            scheme,
            authority,
            path,
            folder,
            name,
        })
    }

    /// Relocates `raw` under `new_base`, keeping its leaf name.
    ///
    /// The result has the scheme and authority of `new_base`. A location
    /// with no leaf name (the root) maps to `new_base` itself.
    pub fn switch_context(raw: &str, new_base: &str) -> Result<Self, UriError> {
        let old = Self::parse(raw)?;
        let base = Self::parse(new_base)?;
        base.join(&old.name)
    }

    /// Appends a path segment and reparses.
    pub fn join(&self, segment: &str) -> Result<Self, UriError> {
        if segment.is_empty() {
            return Ok(self.clone());
        }
        let path = if self.path == "/" {
            format!("/{}", segment)
        } else {
            format!("{}/{}", self.path, segment)
        };
        Self::parse(&self.assemble(&path))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Absolute path with redundant and trailing slashes removed.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path up to, not including, the last segment.
    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// Last path segment; empty only for the root.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if the path is the filesystem or bucket root.
    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// Scheme, authority and path reassembled.
    pub fn normalized_uri(&self) -> String {
        self.assemble(&self.path)
    }

    fn assemble(&self, path: &str) -> String {
        if self.authority.is_empty() {
            format!("{}:{}", self.scheme, path)
        } else {
            format!("{}://{}{}", self.scheme, self.authority, path)
        }
    }
}

/// Collapses slash runs, forces a leading slash and drops a trailing one.
fn normalize_path(raw: &str) -> String {
    let segments: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized_uri())
    }
}

impl TryFrom<String> for Uri {
    type Error = UriError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Uri> for String {
    fn from(uri: Uri) -> Self {
        uri.normalized_uri()
    }
}

impl std::str::FromStr for Uri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
