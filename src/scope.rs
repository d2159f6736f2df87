//! Scope parsing, normalization and restriction
//!
//! Requested scope arrives either as OAuth's space separated text form or as
//! a list of names. Both are normalized into a [`Scope`]: an ordered set that
//! keeps the first occurrence of every name. Tokens persist their scope in a
//! canonical comma-joined form, which is why `,` is rejected inside names.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

const CANONICAL_SEPARATOR: char = ',';

/// A scope specification as handed over by the grant flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeSpec {
    /// Space separated names, e.g. `"read write"`
    Text(String),
    /// Individual names; entries are themselves split on whitespace
    List(Vec<String>),
}

impl From<&str> for ScopeSpec {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ScopeSpec {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<String>> for ScopeSpec {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

impl From<&[&str]> for ScopeSpec {
    fn from(value: &[&str]) -> Self {
        Self::List(value.iter().map(ToString::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for ScopeSpec {
    fn from(value: [&str; N]) -> Self {
        Self::List(value.iter().map(ToString::to_string).collect())
    }
}

impl From<&Scope> for ScopeSpec {
    fn from(value: &Scope) -> Self {
        Self::List(value.0.clone())
    }
}

impl TryFrom<&serde_json::Value> for ScopeSpec {
    type Error = Error;

    fn try_from(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Ok(Self::List(Vec::new())),
            serde_json::Value::String(text) => Ok(Self::Text(text.clone())),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str().map(ToString::to_string).ok_or_else(|| {
                        Error::InvalidScope(format!("scope entries must be strings, got {item}"))
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(Self::List),
            other => Err(Error::InvalidScope(format!(
                "expected a string or an array of strings, got {other}"
            ))),
        }
    }
}

/// Ordered set of scope names
///
/// Iteration order is the order in which names were first requested.
/// Equality is order-sensitive; use [`Scope::same_names`] for set equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Scope(Vec<String>);

impl Scope {
    /// The empty scope
    #[must_use]
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    /// Number of names in the set
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set has no names
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `name` is part of the set
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    /// Iterate the names in order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Names in order
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Every name of `self` is also in `other`
    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        self.iter().all(|name| other.contains(name))
    }

    /// Same names, regardless of order
    #[must_use]
    pub fn same_names(&self, other: &Self) -> bool {
        self.len() == other.len() && self.is_subset(other)
    }

    /// Names of `self` that `allowed` also holds, in the order of `self`
    #[must_use]
    pub fn intersect(&self, allowed: &Self) -> Self {
        Self(
            self.0
                .iter()
                .filter(|name| allowed.contains(name))
                .cloned()
                .collect(),
        )
    }

    /// Comma-joined storage form
    #[must_use]
    pub fn to_canonical(&self) -> String {
        self.0.join(",")
    }

    /// Reads the comma-joined storage form back
    #[must_use]
    pub fn from_canonical(raw: &str) -> Self {
        let mut scope = Self::empty();
        for name in raw.split(CANONICAL_SEPARATOR).filter(|n| !n.is_empty()) {
            scope.insert(name);
        }
        scope
    }

    fn insert(&mut self, name: &str) {
        if !self.contains(name) {
            self.0.push(name.to_string());
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

impl From<String> for Scope {
    fn from(raw: String) -> Self {
        Self::from_canonical(&raw)
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.to_canonical()
    }
}

/// Resolves requested scope against what a client may grant
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeResolver;

impl ScopeResolver {
    /// Parses a scope specification into a deduplicated, order-preserving set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidScope`] if a name contains a character outside
    /// the RFC 6749 `scope-token` alphabet or the `,` separator.
    pub fn normalize(requested: &ScopeSpec) -> Result<Scope> {
        let mut scope = Scope::empty();
        let entries: Box<dyn Iterator<Item = &str> + '_> = match requested {
            ScopeSpec::Text(text) => Box::new(text.split_whitespace()),
            ScopeSpec::List(items) => {
                Box::new(items.iter().flat_map(|item| item.split_whitespace()))
            }
        };

        for name in entries {
            validate_name(name)?;
            scope.insert(name);
        }

        Ok(scope)
    }

    /// Intersects the requested scope with the client's permitted scope.
    ///
    /// Lenient: an absent or malformed request yields the empty scope
    /// instead of an error. Entry points that must reject bad input call
    /// [`ScopeResolver::normalize`] first.
    #[must_use]
    pub fn restrict(requested: Option<&ScopeSpec>, allowed: &Scope) -> Scope {
        requested
            .and_then(|spec| Self::normalize(spec).ok())
            .map(|scope| scope.intersect(allowed))
            .unwrap_or_default()
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = name.bytes().all(|b| {
        matches!(b, 0x21 | 0x23..=0x5B | 0x5D..=0x7E) && b != CANONICAL_SEPARATOR as u8
    });

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidScope(format!("malformed scope name {name:?}")))
    }
}
