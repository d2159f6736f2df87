//! Resource owner identity

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Canonical text form of the subject a token acts on behalf of
///
/// Built only through the `TryFrom` conversions: strings are taken as-is,
/// integers are rendered in decimal. Anything else, including the empty
/// string, is rejected with [`Error::InvalidArgument`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// The identity as text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_text(text: String) -> Result<Self> {
        if text.is_empty() {
            return Err(Error::InvalidArgument("identity must not be empty".into()));
        }
        Ok(Self(text))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::from_text(value)
    }
}

impl TryFrom<&String> for Identity {
    type Error = Error;

    fn try_from(value: &String) -> Result<Self> {
        Self::from_text(value.clone())
    }
}

impl TryFrom<&str> for Identity {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::from_text(value.to_string())
    }
}

macro_rules! identity_from_integer {
    ($($int:ty),*) => {
        $(
            impl TryFrom<$int> for Identity {
                type Error = Error;

                fn try_from(value: $int) -> Result<Self> {
                    Ok(Self(value.to_string()))
                }
            }
        )*
    };
}

identity_from_integer!(i32, i64, u32, u64);

impl TryFrom<&serde_json::Value> for Identity {
    type Error = Error;

    fn try_from(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::String(text) => Self::from_text(text.clone()),
            serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => Ok(Self(n.to_string())),
            other => Err(Error::InvalidArgument(format!(
                "identity must be a string or an integer, got {other}"
            ))),
        }
    }
}

impl TryFrom<serde_json::Value> for Identity {
    type Error = Error;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        Self::try_from(&value)
    }
}
