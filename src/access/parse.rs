//! The ACI grammar decoder.
//!
//! One aci attribute value has the shape:
//!
//! ```text
//! (target clauses)* ( version 3.0; acl "name"; allow|deny (rights) rule; ... )
//! ```
//!
//! Decoding is an explicit cursor over the text: leading target clauses,
//! then the version/acl header, then permission and bind rule pairs anchored
//! at the exact offset where the header match ended. Anything left over
//! before the closing paren is a hard error - there is no resynchronisation.
//! A decode either produces a complete [`Aci`] or a typed error, never a
//! partial policy.

use crate::dn::Dn;
use crate::error::AciDecodeError;

use super::aci::{AccessType, Aci, EqOp, PermBindPair, Right, ACI_VERSION};
use super::bindrule::parse_bind_rule;
use super::targets::{
    AciTargets, OidSelector, StoredFilter, TargAttrFilters, TargetAttr, TargetDn, TargetScope,
};
use crate::dn::DnPattern;

impl Aci {
    /// Decode one aci attribute value held by the entry at `anchor`.
    pub fn decode(text: &str, anchor: Dn) -> Result<Aci, AciDecodeError> {
        let mut p = AciParser { src: text, pos: 0 };

        let mut targets = AciTargets::default();
        loop {
            p.skip_ws();
            let mark = p.pos;
            p.eat_char('(')?;
            p.skip_ws();
            let word = p
                .peek_word()
                .ok_or(AciDecodeError::GeneralParseFailure { offset: p.pos })?;
            if word.eq_ignore_ascii_case("version") {
                p.pos = mark;
                break;
            }
            let kw = word.to_lowercase();
            let _ = p.take_word();
            p.skip_ws();
            let op = p.take_eq_op()?;
            p.skip_ws();
            let value = p.take_quoted()?;
            p.skip_ws();
            p.eat_char(')')?;
            apply_target_clause(&mut targets, &kw, op, &value)?;
        }

        // The header envelope.
        p.skip_ws();
        p.eat_char('(')?;
        p.skip_ws();
        p.expect_word("version")?;
        p.skip_ws();
        let version = p.take_while(|c| c.is_ascii_digit() || c == '.');
        if version.is_empty() {
            return Err(AciDecodeError::GeneralParseFailure { offset: p.pos });
        }
        if version != ACI_VERSION {
            return Err(AciDecodeError::UnsupportedVersion(version.to_string()));
        }
        p.skip_ws();
        p.eat_char(';')?;
        p.skip_ws();
        p.expect_word("acl")?;
        p.skip_ws();
        let name = p.take_quoted()?;
        p.skip_ws();
        p.eat_char(';')?;

        // Pair parsing is anchored exactly here - any text the pair grammar
        // cannot consume is an error, not something to skip.
        let source_offset = p.pos;

        let mut pairs = Vec::new();
        loop {
            p.skip_ws();
            if p.peek_char() == Some(')') {
                p.eat_char(')')?;
                p.skip_ws();
                if p.pos != p.src.len() {
                    return Err(AciDecodeError::GeneralParseFailure { offset: p.pos });
                }
                break;
            }
            let at = p.pos;
            let word = p
                .take_word()
                .ok_or(AciDecodeError::GeneralParseFailure { offset: at })?;
            let access_type = if word.eq_ignore_ascii_case("allow") {
                AccessType::Allow
            } else if word.eq_ignore_ascii_case("deny") {
                AccessType::Deny
            } else {
                return Err(AciDecodeError::GeneralParseFailure { offset: at });
            };
            p.skip_ws();
            p.eat_char('(')?;
            let rights_text = p.take_until(')')?;
            p.eat_char(')')?;
            let rights = parse_rights(&rights_text)?;

            let rule_text = p.take_until_statement_end()?;
            let bind_rule = parse_bind_rule(rule_text.trim())?;

            pairs.push(PermBindPair {
                access_type,
                rights,
                bind_rule,
            });
        }

        if pairs.is_empty() {
            return Err(AciDecodeError::GeneralParseFailure {
                offset: source_offset,
            });
        }

        Ok(Aci {
            version: version.to_string(),
            name,
            source_offset,
            anchor,
            pairs,
            targets,
        })
    }
}

fn parse_rights(s: &str) -> Result<Right, AciDecodeError> {
    let mut rights = Right::empty();
    for tok in s.split(',') {
        let tok = tok.trim();
        if tok.is_empty() {
            return Err(AciDecodeError::UnknownRight(tok.to_string()));
        }
        match Right::parse_token(tok) {
            Some(r) => rights |= r,
            None => return Err(AciDecodeError::UnknownRight(tok.to_string())),
        }
    }
    if rights.is_empty() {
        return Err(AciDecodeError::UnknownRight(s.to_string()));
    }
    Ok(rights)
}

fn apply_target_clause(
    targets: &mut AciTargets,
    kw: &str,
    op: EqOp,
    value: &str,
) -> Result<(), AciDecodeError> {
    let dup = || AciDecodeError::DuplicateTargetKeyword(kw.to_string());
    let eq_only = |field: &str| match op {
        EqOp::Eq => Ok(()),
        EqOp::Ne => Err(AciDecodeError::InvalidOperatorForKeyword(field.to_string())),
    };
    match kw {
        "target" => {
            if targets.target.is_some() {
                return Err(dup());
            }
            let lower = value.trim().to_lowercase();
            let suffix = lower
                .strip_prefix("ldap:///")
                .ok_or_else(|| AciDecodeError::InvalidLdapUrl(value.to_string()))?;
            let tdn = if suffix.contains('*') {
                TargetDn::Pattern(
                    DnPattern::parse(suffix)
                        .map_err(|_| AciDecodeError::InvalidDn(value.to_string()))?,
                )
            } else {
                TargetDn::Literal(
                    Dn::parse(suffix)
                        .map_err(|_| AciDecodeError::InvalidDn(value.to_string()))?,
                )
            };
            targets.target = Some((op, tdn));
        }
        "targetattr" => {
            if targets.target_attr.is_some() {
                return Err(dup());
            }
            targets.target_attr = Some(TargetAttr::parse_value(op, value)?);
        }
        "targetfilter" => {
            if targets.target_filter.is_some() {
                return Err(dup());
            }
            targets.target_filter = Some((op, StoredFilter::parse(value.trim())?));
        }
        "targetscope" => {
            if targets.target_scope.is_some() {
                return Err(dup());
            }
            eq_only("targetscope")?;
            targets.target_scope = Some(TargetScope::parse_value(value)?);
        }
        "targattrfilters" => {
            if targets.targattr_filters.is_some() {
                return Err(dup());
            }
            eq_only("targattrfilters")?;
            targets.targattr_filters = Some(TargAttrFilters::parse_value(value)?);
        }
        "targetcontrol" => {
            if targets.target_control.is_some() {
                return Err(dup());
            }
            targets.target_control = Some(OidSelector::parse_value(op, value)?);
        }
        "extop" => {
            if targets.ext_op.is_some() {
                return Err(dup());
            }
            targets.ext_op = Some(OidSelector::parse_value(op, value)?);
        }
        other => {
            return Err(AciDecodeError::UnknownTargetKeyword(other.to_string()));
        }
    }
    Ok(())
}

struct AciParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> AciParser<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn peek_char(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn eat_char(&mut self, want: char) -> Result<(), AciDecodeError> {
        if self.peek_char() == Some(want) {
            self.pos += want.len_utf8();
            Ok(())
        } else {
            Err(AciDecodeError::GeneralParseFailure { offset: self.pos })
        }
    }

    fn peek_word(&self) -> Option<&'a str> {
        let rest = self.rest();
        let end = rest
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        if end == 0 {
            None
        } else {
            Some(&rest[..end])
        }
    }

    fn take_word(&mut self) -> Option<&'a str> {
        let w = self.peek_word()?;
        self.pos += w.len();
        Some(w)
    }

    fn expect_word(&mut self, want: &str) -> Result<(), AciDecodeError> {
        let at = self.pos;
        match self.take_word() {
            Some(w) if w.eq_ignore_ascii_case(want) => Ok(()),
            _ => Err(AciDecodeError::GeneralParseFailure { offset: at }),
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let rest = self.rest();
        let end = rest
            .char_indices()
            .find(|(_, c)| !pred(*c))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        self.pos += end;
        &rest[..end]
    }

    fn take_eq_op(&mut self) -> Result<EqOp, AciDecodeError> {
        if self.rest().starts_with("!=") {
            self.pos += 2;
            Ok(EqOp::Ne)
        } else if self.rest().starts_with('=') {
            self.pos += 1;
            Ok(EqOp::Eq)
        } else {
            Err(AciDecodeError::GeneralParseFailure { offset: self.pos })
        }
    }

    fn take_quoted(&mut self) -> Result<String, AciDecodeError> {
        self.eat_char('"')?;
        let rest = self.rest();
        let mut out = String::new();
        let mut escaped = false;
        for c in rest.chars() {
            self.pos += c.len_utf8();
            if escaped {
                out.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                return Ok(out);
            } else {
                out.push(c);
            }
        }
        Err(AciDecodeError::UnterminatedStatement)
    }

    /// Take raw text up to (not including) `stop`, failing at end of input.
    fn take_until(&mut self, stop: char) -> Result<String, AciDecodeError> {
        let rest = self.rest();
        match rest.find(stop) {
            Some(i) => {
                self.pos += i;
                Ok(rest[..i].to_string())
            }
            None => Err(AciDecodeError::GeneralParseFailure { offset: self.pos }),
        }
    }

    /// Take the bind rule text: everything up to the statement separator
    /// `;`, honouring quoting so a `;` inside an expression value does not
    /// terminate early. Consumes the separator.
    fn take_until_statement_end(&mut self) -> Result<String, AciDecodeError> {
        let rest = self.rest();
        let mut out = String::new();
        let mut in_quote = false;
        let mut escaped = false;
        for c in rest.chars() {
            self.pos += c.len_utf8();
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_quote = !in_quote;
                    out.push(c);
                }
                ';' if !in_quote => return Ok(out),
                _ => out.push(c),
            }
        }
        Err(AciDecodeError::UnterminatedStatement)
    }
}
