//! LDAP search filter parsing and entry matching.
//!
//! The ACI grammar embeds RFC 4515 filter strings in `targetfilter`,
//! `targattrfilters` and URL style `userdn` values. We keep the decoded
//! representation on `ldap3_proto::proto::LdapFilter` rather than inventing
//! another filter type, and match it directly against [`Entry`] values.
//!
//! String matching is case-insensitive, which is the behaviour directory
//! string syntaxes give for every attribute this engine cares about.

use ldap3_proto::proto::{LdapFilter, LdapSubstringFilter};

use crate::entry::Entry;
use crate::error::AciDecodeError;

/// Parse an RFC 4515 filter string.
pub fn parse_ldap_filter_str(s: &str) -> Result<LdapFilter, AciDecodeError> {
    let mut p = FilterParser {
        chars: s.char_indices().peekable(),
        src: s,
    };
    let f = p.parse_filter()?;
    p.skip_ws();
    if p.chars.next().is_some() {
        return Err(AciDecodeError::InvalidFilter(s.to_string()));
    }
    Ok(f)
}

struct FilterParser<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    src: &'a str,
}

impl FilterParser<'_> {
    fn err(&self) -> AciDecodeError {
        AciDecodeError::InvalidFilter(self.src.to_string())
    }

    fn skip_ws(&mut self) {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn expect(&mut self, want: char) -> Result<(), AciDecodeError> {
        match self.chars.next() {
            Some((_, c)) if c == want => Ok(()),
            _ => Err(self.err()),
        }
    }

    fn parse_filter(&mut self) -> Result<LdapFilter, AciDecodeError> {
        self.skip_ws();
        self.expect('(')?;
        let f = match self.chars.peek().copied() {
            Some((_, '&')) => {
                self.chars.next();
                LdapFilter::And(self.parse_filter_list()?)
            }
            Some((_, '|')) => {
                self.chars.next();
                LdapFilter::Or(self.parse_filter_list()?)
            }
            Some((_, '!')) => {
                self.chars.next();
                let inner = self.parse_filter()?;
                LdapFilter::Not(Box::new(inner))
            }
            Some(_) => self.parse_item()?,
            None => return Err(self.err()),
        };
        self.skip_ws();
        self.expect(')')?;
        Ok(f)
    }

    fn parse_filter_list(&mut self) -> Result<Vec<LdapFilter>, AciDecodeError> {
        let mut out = Vec::new();
        loop {
            self.skip_ws();
            match self.chars.peek() {
                Some((_, '(')) => out.push(self.parse_filter()?),
                _ => break,
            }
        }
        if out.is_empty() {
            return Err(self.err());
        }
        Ok(out)
    }

    fn parse_item(&mut self) -> Result<LdapFilter, AciDecodeError> {
        let mut attr = String::new();
        loop {
            match self.chars.peek().copied() {
                Some((_, c)) if c == '=' || c == '>' || c == '<' || c == '~' => break,
                Some((_, c)) if c == ')' || c == '(' => return Err(self.err()),
                Some((_, c)) => {
                    attr.push(c);
                    self.chars.next();
                }
                None => return Err(self.err()),
            }
        }
        let attr = attr.trim().to_lowercase();
        if attr.is_empty() {
            return Err(self.err());
        }

        enum Op {
            Eq,
            Ge,
            Le,
            Approx,
        }
        let op = match self.chars.next() {
            Some((_, '=')) => Op::Eq,
            Some((_, '>')) => {
                self.expect('=')?;
                Op::Ge
            }
            Some((_, '<')) => {
                self.expect('=')?;
                Op::Le
            }
            Some((_, '~')) => {
                self.expect('=')?;
                Op::Approx
            }
            _ => return Err(self.err()),
        };

        // The value runs to the closing paren. A '*' inside an equality
        // value turns the item into a presence or substring assertion.
        let mut raw = String::new();
        while let Some((_, c)) = self.chars.peek().copied() {
            if c == ')' {
                break;
            }
            raw.push(c);
            self.chars.next();
        }

        match op {
            Op::Ge => Ok(LdapFilter::GreaterOrEqual(attr, unescape_value(&raw)?)),
            Op::Le => Ok(LdapFilter::LessOrEqual(attr, unescape_value(&raw)?)),
            Op::Approx => Ok(LdapFilter::Approx(attr, unescape_value(&raw)?)),
            Op::Eq => {
                if raw == "*" {
                    Ok(LdapFilter::Present(attr))
                } else if raw.contains('*') {
                    Ok(LdapFilter::Substring(attr, parse_substring(&raw)?))
                } else {
                    Ok(LdapFilter::Equality(attr, unescape_value(&raw)?))
                }
            }
        }
    }
}

fn parse_substring(raw: &str) -> Result<LdapSubstringFilter, AciDecodeError> {
    let parts: Vec<&str> = raw.split('*').collect();
    // raw contains at least one '*', so parts.len() >= 2.
    let initial = match parts[0] {
        "" => None,
        s => Some(unescape_value(s)?),
    };
    let final_ = match parts[parts.len() - 1] {
        "" => None,
        s => Some(unescape_value(s)?),
    };
    let any = parts[1..parts.len() - 1]
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| unescape_value(s))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(LdapSubstringFilter {
        initial,
        any,
        final_,
    })
}

// RFC 4515 hex escapes: a backslash is always followed by two hex digits.
fn unescape_value(s: &str) -> Result<String, AciDecodeError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let hi = chars.next();
            let lo = chars.next();
            let byte = match (hi, lo) {
                (Some(h), Some(l)) => u8::from_str_radix(&format!("{h}{l}"), 16).ok(),
                _ => None,
            };
            match byte {
                Some(b) => out.push(b as char),
                None => return Err(AciDecodeError::InvalidFilter(s.to_string())),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

/// Assert the filter against a single entry, no index involvement.
pub fn entry_matches_filter(e: &Entry, f: &LdapFilter) -> bool {
    match f {
        LdapFilter::And(fs) => fs.iter().all(|f| entry_matches_filter(e, f)),
        LdapFilter::Or(fs) => fs.iter().any(|f| entry_matches_filter(e, f)),
        LdapFilter::Not(f) => !entry_matches_filter(e, f),
        LdapFilter::Equality(a, v) | LdapFilter::Approx(a, v) => e.attribute_equality(a, v),
        LdapFilter::Present(a) => e.attribute_pres(a),
        LdapFilter::Substring(a, sub) => e
            .get_ava(a)
            .map(|vs| vs.iter().any(|v| substring_match(v, sub)))
            .unwrap_or(false),
        LdapFilter::GreaterOrEqual(a, v) => e
            .get_ava(a)
            .map(|vs| vs.iter().any(|c| ordered_cmp(c, v).is_ge()))
            .unwrap_or(false),
        LdapFilter::LessOrEqual(a, v) => e
            .get_ava(a)
            .map(|vs| vs.iter().any(|c| ordered_cmp(c, v).is_le()))
            .unwrap_or(false),
        // Extensible matching rules are not supported by this engine.
        _ => false,
    }
}

fn substring_match(value: &str, sub: &LdapSubstringFilter) -> bool {
    let v = value.to_lowercase();
    let mut pos = 0;
    if let Some(i) = &sub.initial {
        let i = i.to_lowercase();
        if !v.starts_with(&i) {
            return false;
        }
        pos = i.len();
    }
    for a in &sub.any {
        let a = a.to_lowercase();
        match v[pos..].find(&a) {
            Some(idx) => pos += idx + a.len(),
            None => return false,
        }
    }
    if let Some(fi) = &sub.final_ {
        let fi = fi.to_lowercase();
        if v.len() < pos + fi.len() || !v.ends_with(&fi) {
            return false;
        }
    }
    true
}

// Integer attributes compare numerically, everything else as lowercased
// strings.
fn ordered_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.to_lowercase().cmp(&b.to_lowercase()),
    }
}
