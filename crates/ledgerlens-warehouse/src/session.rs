//! Session identifiers.
//!
//! Every stored row, derived relation, and query is scoped by a [`SessionId`].
//! This is the single place where session identifiers are validated.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::WarehouseError;

const MAX_SESSION_ID_LEN: usize = 64;

/// Opaque, validated identifier of one user session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh identifier (UUID v4 with underscores).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string().replace('-', "_"))
    }

    /// Parse and validate an identifier supplied by a caller.
    ///
    /// # Errors
    /// Returns [`WarehouseError::InvalidSessionId`] when the value is empty, longer
    /// than 64 characters, or contains characters other than ASCII letters, digits,
    /// `_` and `-`.
    pub fn parse(value: &str) -> Result<Self, WarehouseError> {
        let value = value.trim();
        let valid = !value.is_empty()
            && value.len() <= MAX_SESSION_ID_LEN
            && value
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !valid {
            return Err(WarehouseError::InvalidSessionId(value.to_owned()));
        }
        Ok(Self(value.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = WarehouseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for SessionId {
    type Error = WarehouseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid_and_unique() {
        let first = SessionId::generate();
        let second = SessionId::generate();
        assert_ne!(first, second);
        assert!(!first.as_str().contains('-'));
        assert_eq!(SessionId::parse(first.as_str()).expect("valid"), first);
    }

    #[test]
    fn rejects_injection_attempts() {
        let err = SessionId::parse("abc'; DROP TABLE transactions; --").expect_err("must fail");
        assert!(matches!(err, WarehouseError::InvalidSessionId(_)));
    }

    #[test]
    fn rejects_empty_and_oversized_ids() {
        assert!(SessionId::parse("   ").is_err());
        assert!(SessionId::parse(&"a".repeat(65)).is_err());
    }
}
