//! Validated commit object ids

use crate::error::{StrataError, StrataResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A full 40-hex-character commit id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommitId(String);

impl CommitId {
    /// Parse a commit id, naming `role` ("from", "to", "commit") in the error
    pub fn parse_as(role: &'static str, value: &str) -> StrataResult<Self> {
        let valid = value.len() == 40 && value.chars().all(|c| c.is_ascii_hexdigit());
        if !valid {
            return Err(StrataError::BadCommit {
                role,
                commit: value.to_string(),
                reason: "expected a 40-character hex object id".to_string(),
            });
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    pub fn parse(value: &str) -> StrataResult<Self> {
        Self::parse_as("commit", value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    pub fn oid(&self) -> git2::Oid {
        // Validated on construction
        git2::Oid::from_str(&self.0).unwrap_or_else(|_| git2::Oid::zero())
    }
}

impl From<git2::Oid> for CommitId {
    fn from(oid: git2::Oid) -> Self {
        Self(oid.to_string())
    }
}

impl TryFrom<String> for CommitId {
    type Error = StrataError;

    fn try_from(value: String) -> StrataResult<Self> {
        Self::parse(&value)
    }
}

impl From<CommitId> for String {
    fn from(id: CommitId) -> Self {
        id.0
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_full_hex() {
        let id = CommitId::parse("0123456789ABCDEF0123456789abcdef01234567").unwrap();
        assert_eq!(id.as_str(), "0123456789abcdef0123456789abcdef01234567");
        assert_eq!(id.short(), "0123456789ab");
        assert_eq!(id.oid().to_string(), id.as_str());
    }

    #[test]
    fn parse_rejects_short_and_symbolic() {
        let non_hex = "g".repeat(40);
        for bad in ["HEAD", "", "abc123", non_hex.as_str()] {
            let err = CommitId::parse_as("to", bad).unwrap_err();
            assert!(matches!(err, StrataError::BadCommit { role: "to", .. }));
        }
    }

    #[test]
    fn serde_validates() {
        let ok: Result<CommitId, _> =
            serde_json::from_str("\"0123456789abcdef0123456789abcdef01234567\"");
        assert!(ok.is_ok());
        let bad: Result<CommitId, _> = serde_json::from_str("\"HEAD\"");
        assert!(bad.is_err());
    }
}
