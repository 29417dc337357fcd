//! Error types surfaced by the access control engine.
//!
//! `AciDecodeError` covers everything that can go wrong turning ACI text into
//! a policy. These are returned to the operation layer so a write carrying a
//! malformed aci value can be rejected with the offending detail, and
//! collected as per-policy diagnostics at startup load. Systemic evaluation
//! problems are reported as `OperationError` and always fail closed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A syntax or structural fault in an ACI value. Decode errors never yield a
/// partially populated policy.
#[derive(Serialize, Deserialize, Error, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AciDecodeError {
    #[error("unsupported aci version {0}, only 3.0 is accepted")]
    UnsupportedVersion(String),
    #[error("target keyword {0} appears more than once")]
    DuplicateTargetKeyword(String),
    #[error("unknown target keyword {0}")]
    UnknownTargetKeyword(String),
    #[error("operator not permitted for keyword {0}")]
    InvalidOperatorForKeyword(String),
    #[error("unknown access right {0}")]
    UnknownRight(String),
    #[error("unknown bind rule keyword {0}")]
    UnknownBindRuleKeyword(String),
    #[error("invalid targetscope value {0}")]
    InvalidTargetScope(String),
    #[error("invalid dn {0}")]
    InvalidDn(String),
    #[error("invalid search filter {0}")]
    InvalidFilter(String),
    #[error("invalid ldap url {0}")]
    InvalidLdapUrl(String),
    #[error("invalid bind rule value {0}")]
    InvalidBindRuleValue(String),
    #[error("statement not terminated - expected ';' after bind rule")]
    UnterminatedStatement,
    #[error("aci syntax could not be parsed at offset {offset}")]
    GeneralParseFailure { offset: usize },
}

/// Engine and directory lookup failures. Lookup faults degrade to a local
/// no-match during evaluation; the variants here are the systemic cases a
/// caller may need to distinguish.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "lowercase")]
pub enum OperationError {
    InvalidDn(String),
    NoMatchingEntries,
    LockUnavailable,
    Backend,
    InvalidAciState(String),
    AccessDenied,
}

impl PartialEq for OperationError {
    fn eq(&self, other: &Self) -> bool {
        // Variant identity is all the callers ever need to distinguish here.
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for OperationError {}
