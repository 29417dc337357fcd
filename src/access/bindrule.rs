//! Bind rule expressions - who a permission applies to.
//!
//! A bind rule is a boolean expression over keyword predicates evaluated
//! against the requester identity and connection state. The expression is a
//! closed sum over the supported keywords plus the and/or/not combinators,
//! so evaluation is one recursive function and the compiler checks keyword
//! coverage for us.
//!
//! Evaluation is three valued (true/false/undefined) with a fourth `Fail`
//! state for systemic errors. `Fail` is a hard stop: it propagates through
//! every combinator and forces the surrounding decision to deny.

use std::fmt;
use std::sync::Arc;

use ldap3_proto::proto::{LdapFilter, LdapSearchScope};
use url::Url;

use crate::access::{EvalContext, RootDnMap};
use crate::dn::{Dn, DnPattern};
use crate::entry::Entry;
use crate::error::AciDecodeError;
use crate::filter::{entry_matches_filter, parse_ldap_filter_str};

use super::aci::{CmpOp, EqOp};

/// Result of evaluating a bind rule against a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalResult {
    True,
    False,
    Undefined,
    Fail,
}

/// How the requester authenticated, for the `authmethod` keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Simple,
    Ssl,
    Sasl(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindRuleExpr {
    And(Vec<BindRuleExpr>),
    Or(Vec<BindRuleExpr>),
    Not(Box<BindRuleExpr>),
    UserDn(UserDnRule),
    GroupDn(GroupDnRule),
    AuthMethod(AuthMethodRule),
    Ssf(SsfRule),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDnRule {
    pub op: EqOp,
    pub clauses: Vec<UserDnClause>,
}

/// One `||` separated token of a userdn expression. Classification happens
/// before any URL parsing, so the pseudo tokens (anyone/all/self/parent) are
/// never treated as URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserDnClause {
    Anyone,
    All,
    SelfDn,
    Parent,
    Pattern(DnPattern),
    Url(LdapUrl),
    Dn(Dn),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDnRule {
    pub op: EqOp,
    pub groups: Vec<Dn>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthMethodRule {
    pub op: EqOp,
    pub method: AuthMethod,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsfRule {
    pub op: CmpOp,
    pub value: u32,
}

/// A decoded `ldap:///base??scope?filter` URL from a userdn value. The raw
/// text is retained for round trip serialisation.
#[derive(Debug, Clone)]
pub struct LdapUrl {
    raw: String,
    pub base: Dn,
    pub scope: LdapSearchScope,
    pub filter: Option<LdapFilter>,
}

impl PartialEq for LdapUrl {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base && self.scope == other.scope && self.filter == other.filter
    }
}

impl Eq for LdapUrl {}

impl LdapUrl {
    pub fn parse(token: &str) -> Result<Self, AciDecodeError> {
        let url = Url::parse(token)
            .map_err(|_| AciDecodeError::InvalidLdapUrl(token.to_string()))?;
        if url.scheme() != "ldap" {
            return Err(AciDecodeError::InvalidLdapUrl(token.to_string()));
        }
        let path = url.path().trim_start_matches('/');
        let base = Dn::parse(path)
            .map_err(|_| AciDecodeError::InvalidLdapUrl(token.to_string()))?;

        let mut scope = LdapSearchScope::Base;
        let mut filter = None;
        if let Some(q) = url.query() {
            // q is "attrs?scope?filter" with the attribute list always
            // empty in an aci context.
            let mut parts = q.split('?');
            let _attrs = parts.next();
            if let Some(s) = parts.next() {
                scope = match s.to_lowercase().as_str() {
                    "" | "base" => LdapSearchScope::Base,
                    "one" | "onelevel" => LdapSearchScope::OneLevel,
                    "sub" | "subtree" => LdapSearchScope::Subtree,
                    _ => return Err(AciDecodeError::InvalidLdapUrl(token.to_string())),
                };
            }
            if let Some(fs) = parts.next() {
                if !fs.is_empty() {
                    filter = Some(parse_ldap_filter_str(fs)?);
                }
            }
        }
        Ok(LdapUrl {
            raw: token.to_string(),
            base,
            scope,
            filter,
        })
    }
}

impl fmt::Display for LdapUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl BindRuleExpr {
    /// Evaluate this expression for the requester in `ctx`.
    pub fn evaluate(&self, ctx: &EvalContext<'_>, roots: &RootDnMap) -> EvalResult {
        match self {
            BindRuleExpr::And(subs) => {
                let mut out = EvalResult::True;
                for s in subs {
                    match s.evaluate(ctx, roots) {
                        EvalResult::Fail => return EvalResult::Fail,
                        EvalResult::False => return EvalResult::False,
                        EvalResult::Undefined => out = EvalResult::Undefined,
                        EvalResult::True => {}
                    }
                }
                out
            }
            BindRuleExpr::Or(subs) => {
                let mut out = EvalResult::False;
                for s in subs {
                    match s.evaluate(ctx, roots) {
                        EvalResult::Fail => return EvalResult::Fail,
                        EvalResult::True => return EvalResult::True,
                        EvalResult::Undefined => out = EvalResult::Undefined,
                        EvalResult::False => {}
                    }
                }
                out
            }
            BindRuleExpr::Not(sub) => match sub.evaluate(ctx, roots) {
                EvalResult::Fail => EvalResult::Fail,
                EvalResult::True => EvalResult::False,
                EvalResult::False => EvalResult::True,
                EvalResult::Undefined => EvalResult::Undefined,
            },
            BindRuleExpr::UserDn(r) => r.evaluate(ctx, roots),
            BindRuleExpr::GroupDn(r) => r.evaluate(ctx),
            BindRuleExpr::AuthMethod(r) => r.evaluate(ctx),
            BindRuleExpr::Ssf(r) => r.evaluate(ctx),
        }
    }
}

/// Map a raw keyword result through the rule's comparison operator. The
/// undefined state survives inversion.
fn apply_eq_op(op: EqOp, raw: EvalResult) -> EvalResult {
    match (op, raw) {
        (EqOp::Eq, r) => r,
        (EqOp::Ne, EvalResult::True) => EvalResult::False,
        (EqOp::Ne, EvalResult::False) => EvalResult::True,
        (EqOp::Ne, r) => r,
    }
}

impl UserDnRule {
    fn evaluate(&self, ctx: &EvalContext<'_>, roots: &RootDnMap) -> EvalResult {
        let mut raw = EvalResult::False;
        for clause in &self.clauses {
            match clause.evaluate(ctx, roots) {
                EvalResult::Fail => return EvalResult::Fail,
                EvalResult::True => {
                    raw = EvalResult::True;
                    break;
                }
                _ => {}
            }
        }
        apply_eq_op(self.op, raw)
    }
}

impl UserDnClause {
    fn evaluate(&self, ctx: &EvalContext<'_>, roots: &RootDnMap) -> EvalResult {
        // An anonymous requester can only ever satisfy the anyone token.
        if ctx.anonymous {
            return if matches!(self, UserDnClause::Anyone) {
                EvalResult::True
            } else {
                EvalResult::False
            };
        }
        match self {
            UserDnClause::Anyone | UserDnClause::All => EvalResult::True,
            UserDnClause::SelfDn => {
                if ctx.client_dn == ctx.resource_dn {
                    EvalResult::True
                } else {
                    EvalResult::False
                }
            }
            UserDnClause::Parent => match ctx.resource_dn.parent() {
                Some(p) if p == ctx.client_dn => EvalResult::True,
                _ => EvalResult::False,
            },
            UserDnClause::Pattern(p) => {
                if p.matches(&ctx.client_dn) {
                    EvalResult::True
                } else {
                    EvalResult::False
                }
            }
            UserDnClause::Dn(d) => {
                if roots.canonical(d) == roots.canonical(&ctx.client_dn) {
                    EvalResult::True
                } else {
                    EvalResult::False
                }
            }
            UserDnClause::Url(url) => url_clause_matches(url, ctx),
        }
    }
}

fn url_clause_matches(url: &LdapUrl, ctx: &EvalContext<'_>) -> EvalResult {
    let in_scope = match &url.scope {
        LdapSearchScope::Base => ctx.client_dn == url.base,
        LdapSearchScope::OneLevel => ctx.client_dn.is_child_of(&url.base),
        LdapSearchScope::Subtree => ctx.client_dn.is_descendant_or_self(&url.base),
        LdapSearchScope::Children => ctx.client_dn.is_strict_descendant(&url.base),
    };
    if !in_scope {
        return EvalResult::False;
    }
    let filter = match &url.filter {
        Some(f) => f,
        None => return EvalResult::True,
    };
    // The filter applies to the requester's own resolved entry.
    let entry: Option<Arc<Entry>> = match &ctx.client_entry {
        Some(e) => Some(e.clone()),
        None => match ctx.resolver.resolve(&ctx.client_dn) {
            Ok(e) => e,
            Err(e) => {
                error!(client = %ctx.client_dn, err = ?e, "userdn url evaluation failed");
                return EvalResult::Fail;
            }
        },
    };
    match entry {
        Some(e) => {
            if entry_matches_filter(&e, filter) {
                EvalResult::True
            } else {
                EvalResult::False
            }
        }
        None => EvalResult::False,
    }
}

impl GroupDnRule {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> EvalResult {
        let mut raw = EvalResult::False;
        if !ctx.anonymous {
            for group in &self.groups {
                match group_contains(group, ctx) {
                    EvalResult::Fail => return EvalResult::Fail,
                    EvalResult::True => {
                        raw = EvalResult::True;
                        break;
                    }
                    _ => {}
                }
            }
        }
        apply_eq_op(self.op, raw)
    }
}

fn group_contains(group: &Dn, ctx: &EvalContext<'_>) -> EvalResult {
    let entry = match ctx.resolver.resolve(group) {
        Ok(Some(e)) => e,
        Ok(None) => return EvalResult::False,
        Err(e) => {
            error!(group = %group, err = ?e, "groupdn evaluation failed");
            return EvalResult::Fail;
        }
    };
    for attr in ["member", "uniquemember"] {
        if let Some(values) = entry.get_ava(attr) {
            for v in values {
                match Dn::parse(v) {
                    Ok(d) if d == ctx.client_dn => return EvalResult::True,
                    Ok(_) => {}
                    Err(_) => {
                        // A malformed member value cannot match anyone.
                        trace!(group = %group, value = %v, "skipping unparseable member value");
                    }
                }
            }
        }
    }
    EvalResult::False
}

impl AuthMethodRule {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> EvalResult {
        let raw = match &self.method {
            // authmethod = "none" imposes no requirement at all.
            AuthMethod::None => EvalResult::True,
            AuthMethod::Simple => bool_result(ctx.auth_method == AuthMethod::Simple),
            AuthMethod::Ssl => bool_result(ctx.auth_method == AuthMethod::Ssl),
            AuthMethod::Sasl(mech) => match &ctx.auth_method {
                AuthMethod::Sasl(m) => bool_result(m.eq_ignore_ascii_case(mech)),
                _ => EvalResult::False,
            },
        };
        apply_eq_op(self.op, raw)
    }
}

impl SsfRule {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> EvalResult {
        let ssf = ctx.ssf;
        let v = self.value;
        bool_result(match self.op {
            CmpOp::Eq => ssf == v,
            CmpOp::Ne => ssf != v,
            CmpOp::Ge => ssf >= v,
            CmpOp::Gt => ssf > v,
            CmpOp::Le => ssf <= v,
            CmpOp::Lt => ssf < v,
        })
    }
}

fn bool_result(b: bool) -> EvalResult {
    if b {
        EvalResult::True
    } else {
        EvalResult::False
    }
}

// =========================================================================
// Bind rule sub-parser
// =========================================================================

/// Parse a bind rule expression string - the text between a permission
/// clause and its terminating `;`.
pub fn parse_bind_rule(s: &str) -> Result<BindRuleExpr, AciDecodeError> {
    let mut p = RuleParser { src: s, pos: 0 };
    let expr = p.parse_or()?;
    p.skip_ws();
    if p.pos != p.src.len() {
        return Err(AciDecodeError::GeneralParseFailure { offset: p.pos });
    }
    Ok(expr)
}

struct RuleParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> RuleParser<'a> {
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

    // A bare word - keyword, combinator, or comparison operand.
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

    fn parse_or(&mut self) -> Result<BindRuleExpr, AciDecodeError> {
        let mut subs = vec![self.parse_and()?];
        loop {
            self.skip_ws();
            match self.peek_word() {
                Some(w) if w.eq_ignore_ascii_case("or") => {
                    let _ = self.take_word();
                    subs.push(self.parse_and()?);
                }
                _ => break,
            }
        }
        if subs.len() == 1 {
            Ok(subs.swap_remove(0))
        } else {
            Ok(BindRuleExpr::Or(subs))
        }
    }

    fn parse_and(&mut self) -> Result<BindRuleExpr, AciDecodeError> {
        let mut subs = vec![self.parse_unary()?];
        loop {
            self.skip_ws();
            match self.peek_word() {
                Some(w) if w.eq_ignore_ascii_case("and") => {
                    let _ = self.take_word();
                    subs.push(self.parse_unary()?);
                }
                _ => break,
            }
        }
        if subs.len() == 1 {
            Ok(subs.swap_remove(0))
        } else {
            Ok(BindRuleExpr::And(subs))
        }
    }

    fn parse_unary(&mut self) -> Result<BindRuleExpr, AciDecodeError> {
        self.skip_ws();
        if let Some(w) = self.peek_word() {
            if w.eq_ignore_ascii_case("not") {
                let _ = self.take_word();
                let inner = self.parse_unary()?;
                return Ok(BindRuleExpr::Not(Box::new(inner)));
            }
        }
        if self.peek_char() == Some('(') {
            self.eat_char('(')?;
            let inner = self.parse_or()?;
            self.skip_ws();
            self.eat_char(')')?;
            return Ok(inner);
        }
        self.parse_leaf()
    }

    fn parse_leaf(&mut self) -> Result<BindRuleExpr, AciDecodeError> {
        self.skip_ws();
        let keyword = self
            .take_word()
            .ok_or(AciDecodeError::GeneralParseFailure { offset: self.pos })?
            .to_lowercase();
        self.skip_ws();
        let op = self.take_cmp_op()?;
        self.skip_ws();
        let value = self.take_quoted()?;
        build_leaf(&keyword, op, &value)
    }

    fn take_cmp_op(&mut self) -> Result<CmpOp, AciDecodeError> {
        let rest = self.rest();
        let (op, len) = if rest.starts_with("!=") {
            (CmpOp::Ne, 2)
        } else if rest.starts_with(">=") {
            (CmpOp::Ge, 2)
        } else if rest.starts_with("<=") {
            (CmpOp::Le, 2)
        } else if rest.starts_with('>') {
            (CmpOp::Gt, 1)
        } else if rest.starts_with('<') {
            (CmpOp::Lt, 1)
        } else if rest.starts_with('=') {
            (CmpOp::Eq, 1)
        } else {
            return Err(AciDecodeError::GeneralParseFailure { offset: self.pos });
        };
        self.pos += len;
        Ok(op)
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
}

fn build_leaf(keyword: &str, op: CmpOp, value: &str) -> Result<BindRuleExpr, AciDecodeError> {
    let eq_op = |kw: &str| match op {
        CmpOp::Eq => Ok(EqOp::Eq),
        CmpOp::Ne => Ok(EqOp::Ne),
        _ => Err(AciDecodeError::InvalidOperatorForKeyword(kw.to_string())),
    };
    match keyword {
        "userdn" => {
            let op = eq_op("userdn")?;
            let mut clauses = Vec::new();
            for token in value.split("||") {
                clauses.push(parse_userdn_token(token.trim())?);
            }
            if clauses.is_empty() {
                return Err(AciDecodeError::InvalidLdapUrl(value.to_string()));
            }
            Ok(BindRuleExpr::UserDn(UserDnRule { op, clauses }))
        }
        "groupdn" => {
            let op = eq_op("groupdn")?;
            let mut groups = Vec::new();
            for token in value.split("||") {
                let token = token.trim();
                let suffix = strip_ldap_prefix(token)?;
                let dn = Dn::parse(suffix)
                    .map_err(|_| AciDecodeError::InvalidDn(token.to_string()))?;
                groups.push(dn);
            }
            if groups.is_empty() {
                return Err(AciDecodeError::InvalidDn(value.to_string()));
            }
            Ok(BindRuleExpr::GroupDn(GroupDnRule { op, groups }))
        }
        "authmethod" => {
            let op = eq_op("authmethod")?;
            let v = value.trim();
            let method = if v.eq_ignore_ascii_case("none") {
                AuthMethod::None
            } else if v.eq_ignore_ascii_case("simple") {
                AuthMethod::Simple
            } else if v.eq_ignore_ascii_case("ssl") {
                AuthMethod::Ssl
            } else if let Some(mech) = v
                .to_lowercase()
                .strip_prefix("sasl")
                .map(str::trim)
                .filter(|m| !m.is_empty())
            {
                AuthMethod::Sasl(mech.to_string())
            } else {
                return Err(AciDecodeError::InvalidBindRuleValue(v.to_string()));
            };
            Ok(BindRuleExpr::AuthMethod(AuthMethodRule { op, method }))
        }
        "ssf" => {
            let v: u32 = value
                .trim()
                .parse()
                .map_err(|_| AciDecodeError::InvalidBindRuleValue(value.to_string()))?;
            Ok(BindRuleExpr::Ssf(SsfRule { op, value: v }))
        }
        kw => Err(AciDecodeError::UnknownBindRuleKeyword(kw.to_string())),
    }
}

fn strip_ldap_prefix(token: &str) -> Result<&str, AciDecodeError> {
    let lower = token.to_lowercase();
    if lower.starts_with("ldap:///") {
        Ok(&token["ldap:///".len()..])
    } else {
        Err(AciDecodeError::InvalidLdapUrl(token.to_string()))
    }
}

fn parse_userdn_token(token: &str) -> Result<UserDnClause, AciDecodeError> {
    let suffix = strip_ldap_prefix(token)?;
    // Classify before URL parsing: the pseudo tokens are not URLs and must
    // never reach the URL parser.
    if suffix.eq_ignore_ascii_case("anyone") {
        Ok(UserDnClause::Anyone)
    } else if suffix.eq_ignore_ascii_case("all") {
        Ok(UserDnClause::All)
    } else if suffix.eq_ignore_ascii_case("self") {
        Ok(UserDnClause::SelfDn)
    } else if suffix.eq_ignore_ascii_case("parent") {
        Ok(UserDnClause::Parent)
    } else if suffix.contains('?') {
        Ok(UserDnClause::Url(LdapUrl::parse(token)?))
    } else if suffix.contains('*') {
        let p = DnPattern::parse(suffix)
            .map_err(|_| AciDecodeError::InvalidDn(token.to_string()))?;
        Ok(UserDnClause::Pattern(p))
    } else {
        let d =
            Dn::parse(suffix).map_err(|_| AciDecodeError::InvalidDn(token.to_string()))?;
        Ok(UserDnClause::Dn(d))
    }
}

// =========================================================================
// Canonical re-serialisation
// =========================================================================

impl fmt::Display for BindRuleExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindRuleExpr::And(subs) => {
                let mut first = true;
                for s in subs {
                    if !first {
                        write!(f, " and ")?;
                    }
                    write!(f, "({s})")?;
                    first = false;
                }
                Ok(())
            }
            BindRuleExpr::Or(subs) => {
                let mut first = true;
                for s in subs {
                    if !first {
                        write!(f, " or ")?;
                    }
                    write!(f, "({s})")?;
                    first = false;
                }
                Ok(())
            }
            BindRuleExpr::Not(sub) => write!(f, "not ({sub})"),
            BindRuleExpr::UserDn(r) => {
                write!(f, "userdn {} \"", r.op)?;
                let mut first = true;
                for c in &r.clauses {
                    if !first {
                        write!(f, " || ")?;
                    }
                    write!(f, "{c}")?;
                    first = false;
                }
                write!(f, "\"")
            }
            BindRuleExpr::GroupDn(r) => {
                write!(f, "groupdn {} \"", r.op)?;
                let mut first = true;
                for g in &r.groups {
                    if !first {
                        write!(f, " || ")?;
                    }
                    write!(f, "ldap:///{g}")?;
                    first = false;
                }
                write!(f, "\"")
            }
            BindRuleExpr::AuthMethod(r) => {
                let m = match &r.method {
                    AuthMethod::None => "none".to_string(),
                    AuthMethod::Simple => "simple".to_string(),
                    AuthMethod::Ssl => "ssl".to_string(),
                    AuthMethod::Sasl(m) => format!("sasl {m}"),
                };
                write!(f, "authmethod {} \"{}\"", r.op, m)
            }
            BindRuleExpr::Ssf(r) => write!(f, "ssf {} \"{}\"", r.op, r.value),
        }
    }
}

impl fmt::Display for UserDnClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserDnClause::Anyone => write!(f, "ldap:///anyone"),
            UserDnClause::All => write!(f, "ldap:///all"),
            UserDnClause::SelfDn => write!(f, "ldap:///self"),
            UserDnClause::Parent => write!(f, "ldap:///parent"),
            UserDnClause::Pattern(p) => write!(f, "ldap:///{p}"),
            UserDnClause::Url(u) => write!(f, "{}", u.raw),
            UserDnClause::Dn(d) => write!(f, "ldap:///{d}"),
        }
    }
}
