//! Distinguished name handling for the access control engine.
//!
//! The engine needs a small but precise slice of DN behaviour: normalised
//! equality, parent/descendant tests for target scoping and cache walks, and
//! wildcard patterns for `target`/`userdn` values. DNs are normalised at
//! parse time (lowercased, whitespace trimmed around components) so that
//! every later comparison is a plain structural compare.

use std::cmp::Ordering;
use std::fmt;

use regex::Regex;

use crate::error::OperationError;

/// One relative distinguished name component, normalised.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rdn {
    attr: String,
    value: String,
}

impl Rdn {
    pub fn attr(&self) -> &str {
        &self.attr
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.attr, escape_value(&self.value))
    }
}

/// A normalised distinguished name. The leftmost (leaf) RDN is index 0. The
/// empty sequence is the null DN, which anchors global policies.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dn {
    rdns: Vec<Rdn>,
}

impl Dn {
    /// The null DN.
    pub fn null() -> Self {
        Dn { rdns: Vec::new() }
    }

    pub fn parse(s: &str) -> Result<Self, OperationError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Dn::null());
        }

        let mut rdns = Vec::new();
        for comp in split_unescaped(trimmed, ',') {
            let comp = comp.trim();
            if comp.is_empty() {
                return Err(OperationError::InvalidDn(s.to_string()));
            }
            let mut parts = split_unescaped(comp, '=');
            let attr = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default();
            if attr.trim().is_empty() || value.trim().is_empty() || parts.next().is_some() {
                return Err(OperationError::InvalidDn(s.to_string()));
            }
            rdns.push(Rdn {
                attr: unescape(attr.trim()).to_lowercase(),
                value: unescape(value.trim()).to_lowercase(),
            });
        }
        Ok(Dn { rdns })
    }

    pub fn is_null(&self) -> bool {
        self.rdns.is_empty()
    }

    pub fn rdn_count(&self) -> usize {
        self.rdns.len()
    }

    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    /// The immediate superior of this DN. The null DN has no parent; a
    /// single component DN parents to the null DN.
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            None
        } else {
            Some(Dn {
                rdns: self.rdns[1..].to_vec(),
            })
        }
    }

    /// True if `self` is `other` or sits below it in the tree. Everything is
    /// a descendant of the null DN.
    pub fn is_descendant_or_self(&self, other: &Dn) -> bool {
        let skip = match self.rdns.len().checked_sub(other.rdns.len()) {
            Some(n) => n,
            None => return false,
        };
        self.rdns[skip..] == other.rdns[..]
    }

    /// True if `self` sits strictly below `other` - a self match is not a
    /// descendant here.
    pub fn is_strict_descendant(&self, other: &Dn) -> bool {
        self.rdn_count() > other.rdn_count() && self.is_descendant_or_self(other)
    }

    /// True if `other` is the immediate superior of `self`.
    pub fn is_child_of(&self, other: &Dn) -> bool {
        match self.parent() {
            Some(p) => p == *other,
            None => false,
        }
    }

    /// Re-anchor a DN below `old_suffix` to sit below `new_suffix` instead.
    /// Returns None when `self` is not at or under `old_suffix`.
    pub fn rebase(&self, old_suffix: &Dn, new_suffix: &Dn) -> Option<Dn> {
        if !self.is_descendant_or_self(old_suffix) {
            return None;
        }
        let keep = self.rdns.len() - old_suffix.rdns.len();
        let mut rdns = self.rdns[..keep].to_vec();
        rdns.extend_from_slice(&new_suffix.rdns);
        Some(Dn { rdns })
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for rdn in &self.rdns {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{rdn}")?;
            first = false;
        }
        Ok(())
    }
}

/// A DN wildcard pattern from a `target` or `userdn` value. `*` matches any
/// run of characters within a single RDN component - it never crosses a
/// component separator.
#[derive(Debug, Clone)]
pub struct DnPattern {
    raw: String,
    re: Regex,
}

impl DnPattern {
    pub fn parse(s: &str) -> Result<Self, OperationError> {
        let raw = s.trim().to_lowercase();
        let mut expr = String::with_capacity(raw.len() + 8);
        expr.push('^');
        for c in raw.chars() {
            match c {
                '*' => expr.push_str("[^,]*"),
                c => expr.push_str(regex::escape(&c.to_string()).as_str()),
            }
        }
        expr.push('$');
        let re =
            Regex::new(&expr).map_err(|_| OperationError::InvalidDn(s.to_string()))?;
        Ok(DnPattern { raw, re })
    }

    pub fn matches(&self, dn: &Dn) -> bool {
        self.re.is_match(&dn.to_string())
    }
}

impl fmt::Display for DnPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl PartialEq for DnPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for DnPattern {}

impl PartialOrd for DnPattern {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DnPattern {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

fn split_unescaped(s: &str, sep: char) -> impl Iterator<Item = &str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            parts.push(&s[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts.into_iter()
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    out
}

fn escape_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, ',' | '=' | '\\' | '+') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
