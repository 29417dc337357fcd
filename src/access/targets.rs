//! Target matching - which requests an ACI is in scope for.
//!
//! All of these checks are pure functions over the decoded target clauses
//! and the request context. The only mutation is the per-request bookkeeping
//! the context exposes for effective rights summarisation: the entry-test
//! rule flag and the matched attribute class record.

use std::collections::BTreeSet;
use std::fmt;

use ldap3_proto::proto::LdapFilter;

use crate::access::EvalContext;
use crate::dn::{Dn, DnPattern};
use crate::entry::{is_operational_attr, Entry};
use crate::error::AciDecodeError;
use crate::filter::{entry_matches_filter, parse_ldap_filter_str};

use super::aci::{Aci, EqOp, Right};

/// The scope modifier of the `target` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScope {
    Base,
    OneLevel,
    Subtree,
    Subordinate,
}

impl TargetScope {
    pub(crate) fn parse_value(s: &str) -> Result<Self, AciDecodeError> {
        match s.trim().to_lowercase().as_str() {
            "base" => Ok(TargetScope::Base),
            "onelevel" => Ok(TargetScope::OneLevel),
            "subtree" => Ok(TargetScope::Subtree),
            "subordinate" => Ok(TargetScope::Subordinate),
            _ => Err(AciDecodeError::InvalidTargetScope(s.to_string())),
        }
    }
}

impl fmt::Display for TargetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetScope::Base => "base",
            TargetScope::OneLevel => "onelevel",
            TargetScope::Subtree => "subtree",
            TargetScope::Subordinate => "subordinate",
        };
        write!(f, "{s}")
    }
}

/// The dn half of a `target` clause - literal or wildcard pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetDn {
    Literal(Dn),
    Pattern(DnPattern),
}

impl fmt::Display for TargetDn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetDn::Literal(d) => write!(f, "{d}"),
            TargetDn::Pattern(p) => write!(f, "{p}"),
        }
    }
}

/// A parsed filter that remembers its source text for re-serialisation.
/// Equality is on the parsed form.
#[derive(Debug, Clone)]
pub struct StoredFilter {
    raw: String,
    pub filter: LdapFilter,
}

impl StoredFilter {
    pub(crate) fn parse(raw: &str) -> Result<Self, AciDecodeError> {
        let filter = parse_ldap_filter_str(raw)?;
        Ok(StoredFilter {
            raw: raw.to_string(),
            filter,
        })
    }
}

impl PartialEq for StoredFilter {
    fn eq(&self, other: &Self) -> bool {
        self.filter == other.filter
    }
}

impl Eq for StoredFilter {}

impl fmt::Display for StoredFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// The `targetattr` selector: explicit types, `*` for all user attributes,
/// `+` for all operational attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAttr {
    pub op: EqOp,
    pub all_user: bool,
    pub all_op: bool,
    pub attrs: BTreeSet<String>,
}

impl TargetAttr {
    pub(crate) fn parse_value(op: EqOp, s: &str) -> Result<Self, AciDecodeError> {
        let mut out = TargetAttr {
            op,
            all_user: false,
            all_op: false,
            attrs: BTreeSet::new(),
        };
        for tok in s.split("||") {
            let tok = tok.trim();
            match tok {
                "*" => out.all_user = true,
                "+" => out.all_op = true,
                "" => {
                    return Err(AciDecodeError::InvalidBindRuleValue(s.to_string()));
                }
                name => {
                    if !name
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == ';' || c == '.')
                    {
                        return Err(AciDecodeError::InvalidBindRuleValue(s.to_string()));
                    }
                    out.attrs.insert(name.to_lowercase());
                }
            }
        }
        Ok(out)
    }

    /// Selector match for one attribute type, recording which class of rule
    /// matched for effective rights summarisation.
    fn matches(&self, attr: &str, ctx: &mut EvalContext<'_>) -> bool {
        let operational = is_operational_attr(attr);
        let hit = if self.attrs.contains(attr) {
            if operational {
                ctx.match_class.op_explicit = true;
            } else {
                ctx.match_class.user_explicit = true;
            }
            true
        } else if self.all_user && !operational {
            ctx.match_class.user_wildcard = true;
            true
        } else if self.all_op && operational {
            ctx.match_class.op_wildcard = true;
            true
        } else {
            false
        };
        match self.op {
            EqOp::Eq => hit,
            EqOp::Ne => !hit,
        }
    }
}

impl fmt::Display for TargetAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut put = |f: &mut fmt::Formatter<'_>, s: &str| -> fmt::Result {
            if !first {
                write!(f, " || ")?;
            }
            first = false;
            write!(f, "{s}")
        };
        if self.all_user {
            put(f, "*")?;
        }
        if self.all_op {
            put(f, "+")?;
        }
        for a in &self.attrs {
            put(f, a)?;
        }
        Ok(())
    }
}

/// OID list for `targetcontrol` and `extop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidSelector {
    pub op: EqOp,
    pub oids: Vec<String>,
}

impl OidSelector {
    pub(crate) fn parse_value(op: EqOp, s: &str) -> Result<Self, AciDecodeError> {
        let mut oids = Vec::new();
        for tok in s.split("||") {
            let tok = tok.trim();
            if tok.is_empty()
                || !tok.chars().all(|c| c.is_ascii_digit() || c == '.')
            {
                return Err(AciDecodeError::InvalidBindRuleValue(s.to_string()));
            }
            oids.push(tok.to_string());
        }
        Ok(OidSelector { op, oids })
    }

    fn matches(&self, oid: &str) -> bool {
        let hit = self.oids.iter().any(|o| o == oid);
        match self.op {
            EqOp::Eq => hit,
            EqOp::Ne => !hit,
        }
    }
}

impl fmt::Display for OidSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for o in &self.oids {
            if !first {
                write!(f, " || ")?;
            }
            write!(f, "{o}")?;
            first = false;
        }
        Ok(())
    }
}

/// One `attr:(filter)` element of a targattrfilters list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargAttrFilter {
    pub attr: String,
    pub filter: StoredFilter,
}

/// The `targattrfilters` clause: value level filtering for attributes being
/// added or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TargAttrFilters {
    pub add: Vec<TargAttrFilter>,
    pub del: Vec<TargAttrFilter>,
}

impl TargAttrFilters {
    pub(crate) fn parse_value(s: &str) -> Result<Self, AciDecodeError> {
        // A comma only separates the add and del operation lists when it is
        // followed by one of those keywords - commas inside embedded filter
        // values (dn assertions) stay put.
        let mut segments: Vec<String> = Vec::new();
        for part in s.split(',') {
            let head = part.trim_start().to_lowercase();
            if head.starts_with("add=") || head.starts_with("del=") || segments.is_empty() {
                segments.push(part.to_string());
            } else if let Some(last) = segments.last_mut() {
                last.push(',');
                last.push_str(part);
            }
        }

        let mut out = TargAttrFilters::default();
        let mut seen_add = false;
        let mut seen_del = false;
        for part in &segments {
            let part = part.trim();
            let (kw, rest) = part
                .split_once('=')
                .ok_or_else(|| AciDecodeError::InvalidBindRuleValue(s.to_string()))?;
            let list = parse_attr_filter_list(rest)?;
            match kw.trim().to_lowercase().as_str() {
                "add" if !seen_add => {
                    seen_add = true;
                    out.add = list;
                }
                "del" if !seen_del => {
                    seen_del = true;
                    out.del = list;
                }
                _ => {
                    return Err(AciDecodeError::InvalidBindRuleValue(s.to_string()));
                }
            }
        }
        if !seen_add && !seen_del {
            return Err(AciDecodeError::InvalidBindRuleValue(s.to_string()));
        }
        Ok(out)
    }
}

fn parse_attr_filter_list(s: &str) -> Result<Vec<TargAttrFilter>, AciDecodeError> {
    let mut out = Vec::new();
    for item in s.split("&&") {
        let item = item.trim();
        let (attr, filter) = item
            .split_once(':')
            .ok_or_else(|| AciDecodeError::InvalidBindRuleValue(s.to_string()))?;
        out.push(TargAttrFilter {
            attr: attr.trim().to_lowercase(),
            filter: StoredFilter::parse(filter.trim())?,
        });
    }
    Ok(out)
}

impl fmt::Display for TargAttrFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        for (kw, list) in [("add", &self.add), ("del", &self.del)] {
            if list.is_empty() {
                continue;
            }
            if wrote {
                write!(f, ", ")?;
            }
            write!(f, "{kw}=")?;
            let mut first = true;
            for t in list {
                if !first {
                    write!(f, " && ")?;
                }
                write!(f, "{}:{}", t.attr, t.filter)?;
                first = false;
            }
            wrote = true;
        }
        Ok(())
    }
}

/// The full target specification of one ACI. Every clause is optional and
/// may appear at most once; `targetscope` defaults to subtree when absent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AciTargets {
    pub target: Option<(EqOp, TargetDn)>,
    pub target_scope: Option<TargetScope>,
    pub target_attr: Option<TargetAttr>,
    pub target_filter: Option<(EqOp, StoredFilter)>,
    pub targattr_filters: Option<TargAttrFilters>,
    pub target_control: Option<OidSelector>,
    pub ext_op: Option<OidSelector>,
}

impl AciTargets {
    pub fn scope(&self) -> TargetScope {
        self.target_scope.unwrap_or(TargetScope::Subtree)
    }
}

impl fmt::Display for AciTargets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some((op, dn)) = &self.target {
            write!(f, "(target {op} \"ldap:///{dn}\")")?;
        }
        if let Some(scope) = &self.target_scope {
            write!(f, "(targetscope = \"{scope}\")")?;
        }
        if let Some(ta) = &self.target_attr {
            write!(f, "(targetattr {} \"{ta}\")", ta.op)?;
        }
        if let Some((op, sf)) = &self.target_filter {
            write!(f, "(targetfilter {op} \"{sf}\")")?;
        }
        if let Some(taf) = &self.targattr_filters {
            write!(f, "(targattrfilters = \"{taf}\")")?;
        }
        if let Some(tc) = &self.target_control {
            write!(f, "(targetcontrol {} \"{tc}\")", tc.op)?;
        }
        if let Some(eo) = &self.ext_op {
            write!(f, "(extop {} \"{eo}\")", eo.op)?;
        }
        Ok(())
    }
}

// =========================================================================
// Request matching
// =========================================================================

/// The dn scoping predicate: does this ACI reach `request_dn` at all?
///
/// The effective target dn is the anchor entry unless an equality `target`
/// clause names a literal dn. Scope is tested first; the inequality and
/// wildcard refinements only ever reject a request the scope let in.
pub(crate) fn is_target_applicable(aci: &Aci, request_dn: &Dn) -> bool {
    let targets = &aci.targets;
    let effective: &Dn = match &targets.target {
        Some((EqOp::Eq, TargetDn::Literal(d))) => d,
        _ => &aci.anchor,
    };

    // onelevel is immediate children only - the target entry itself does
    // not match. This deviates from some other servers and is retained on
    // purpose.
    let scope_ok = match targets.scope() {
        TargetScope::Base => request_dn == effective,
        TargetScope::OneLevel => request_dn.is_child_of(effective),
        TargetScope::Subtree => request_dn.is_descendant_or_self(effective),
        TargetScope::Subordinate => request_dn.is_strict_descendant(effective),
    };
    if !scope_ok {
        return false;
    }

    match &targets.target {
        Some((EqOp::Ne, TargetDn::Literal(d))) => !request_dn.is_descendant_or_self(d),
        Some((op, TargetDn::Pattern(p))) => {
            let hit = p.matches(request_dn);
            match op {
                EqOp::Eq => hit,
                EqOp::Ne => !hit,
            }
        }
        _ => true,
    }
}

/// The attribute-level predicate, evaluated once per attribute under test.
///
/// During the entry level second pass the attribute dimension is moot and
/// the check passes outright. Otherwise, unless both sides hold an
/// attribute, the skip-rights shortcut applies: an ACI whose rights live
/// entirely in {add,delete,proxy} matches a request whose rights do too,
/// because those rights are not about any particular attribute. Separately,
/// a targetattr ACI still reaches an attribute-less test carrying write
/// rights.
pub(crate) fn is_target_attr_applicable(aci: &Aci, ctx: &mut EvalContext<'_>) -> bool {
    if ctx.entry_test_active {
        return true;
    }
    let targets = &aci.targets;
    let current_attr = ctx.current_attr.clone();
    match (&targets.target_attr, current_attr) {
        (Some(sel), Some(attr)) => sel.matches(&attr, ctx),
        (sel, attr) => {
            if attr.is_some()
                && ctx.is_first_attribute
                && targets.target_attr.is_none()
                && targets.targattr_filters.is_none()
            {
                // This ACI tests the entry as a whole, not the attribute we
                // happen to be holding. The engine re-runs it attribute-less
                // in the entry level pass.
                ctx.entry_test_rule_found = true;
            }

            // An aci that constrains values through targattrfilters reaches
            // the attribute level without a targetattr clause - the value
            // gating has already been applied by its own matcher.
            if targets.target_attr.is_none()
                && targets.targattr_filters.is_some()
                && attr.is_some()
            {
                return true;
            }

            let aci_rights = union_rights(aci);
            let skip = Right::skip_attr_rights();
            if !aci_rights.is_empty()
                && skip.contains(aci_rights)
                && skip.contains(ctx.rights & !Right::SKIP_PROXY)
            {
                true
            } else {
                sel.is_some() && attr.is_none() && ctx.rights.intersects(Right::WRITE)
            }
        }
    }
}

fn union_rights(aci: &Aci) -> Right {
    aci.pairs
        .iter()
        .fold(Right::empty(), |acc, p| acc | p.rights)
}

/// `targetfilter` - absent means vacuously applicable.
pub(crate) fn is_target_filter_applicable(aci: &Aci, ctx: &EvalContext<'_>) -> bool {
    match &aci.targets.target_filter {
        None => true,
        Some((op, sf)) => {
            let hit = entry_matches_filter(&ctx.resource_entry, &sf.filter);
            match op {
                EqOp::Eq => hit,
                EqOp::Ne => !hit,
            }
        }
    }
}

/// `targetcontrol` is opt-in: an ACI with no clause never applies to a
/// control access check.
pub(crate) fn is_target_control_applicable(aci: &Aci, oid: Option<&str>) -> bool {
    match (&aci.targets.target_control, oid) {
        (Some(sel), Some(oid)) => sel.matches(oid),
        _ => false,
    }
}

/// `extop` is opt-in in the same way.
pub(crate) fn is_ext_op_applicable(aci: &Aci, oid: Option<&str>) -> bool {
    match (&aci.targets.ext_op, oid) {
        (Some(sel), Some(oid)) => sel.matches(oid),
        _ => false,
    }
}

/// `targattrfilters` - gate the value being added or removed through the
/// filter listed for its attribute type. The request rights pick the list:
/// entry add/delete use the add/del lists directly, the modify value split
/// maps write_add to add and write_delete to del.
pub(crate) fn is_targattr_filters_applicable(aci: &Aci, ctx: &mut EvalContext<'_>) -> bool {
    let taf = match &aci.targets.targattr_filters {
        None => return true,
        Some(t) => t,
    };
    let attr = match &ctx.current_attr {
        Some(a) => a.clone(),
        None => return true,
    };
    let list = if ctx.rights.intersects(Right::ADD | Right::WRITE_ADD) {
        &taf.add
    } else if ctx.rights.intersects(Right::DELETE | Right::WRITE_DELETE) {
        &taf.del
    } else {
        return true;
    };
    let item = match list.iter().find(|t| t.attr == attr) {
        // An attribute type the clause does not mention is unconstrained.
        None => return true,
        Some(t) => t,
    };
    let value = match &ctx.current_value {
        Some(v) => v.clone(),
        None => return true,
    };
    let mut probe = Entry::new(ctx.resource_dn.clone());
    probe.add_ava(&attr, &value);
    let hit = entry_matches_filter(&probe, &item.filter.filter);
    if hit {
        ctx.targattr_filter_match = true;
    }
    hit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::aci::Aci;
    use crate::access::EvalContext;
    use crate::entry::test_support::{entry_from_avas, MapResolver};
    use std::sync::Arc;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).expect("test dn")
    }

    fn decode(text: &str, anchor: &str) -> Aci {
        Aci::decode(text, dn(anchor)).expect("test aci")
    }

    fn ctx_on<'a>(resolver: &'a MapResolver, resource: Entry) -> EvalContext<'a> {
        EvalContext::new(
            resolver,
            dn("uid=bob,ou=people,dc=example,dc=com"),
            Arc::new(resource),
            Right::READ,
        )
    }

    fn person(dn: &str) -> Entry {
        entry_from_avas(dn, &[("objectClass", "person"), ("cn", "someone")])
    }

    #[test]
    fn test_targets_scope_matrix() {
        let anchor = "dc=example,dc=com";
        let base = dn(anchor);
        let child = dn("ou=people,dc=example,dc=com");
        let grandchild = dn("uid=bob,ou=people,dc=example,dc=com");
        let outside = dn("dc=other,dc=net");

        let cases = [
            ("base", vec![(&base, true), (&child, false), (&grandchild, false)]),
            ("onelevel", vec![(&base, false), (&child, true), (&grandchild, false)]),
            ("subtree", vec![(&base, true), (&child, true), (&grandchild, true)]),
            ("subordinate", vec![(&base, false), (&child, true), (&grandchild, true)]),
        ];
        for (scope, expectations) in cases {
            let aci = decode(
                &format!(
                    r#"(targetscope = "{scope}")(version 3.0; acl "s"; allow (read) userdn="ldap:///anyone";)"#
                ),
                anchor,
            );
            for (request, expected) in expectations {
                assert_eq!(
                    is_target_applicable(&aci, request),
                    expected,
                    "scope {scope} request {request}"
                );
            }
            assert!(!is_target_applicable(&aci, &outside), "scope {scope}");
        }
    }

    #[test]
    fn test_targets_subtree_depth_independent() {
        let aci = decode(
            r#"(version 3.0; acl "s"; allow (read) userdn="ldap:///anyone";)"#,
            "dc=example,dc=com",
        );
        let deep = dn("cn=a,cn=b,cn=c,cn=d,ou=people,dc=example,dc=com");
        assert!(is_target_applicable(&aci, &deep));
    }

    #[test]
    fn test_targets_equality_target_overrides_anchor() {
        // The target clause replaces the anchor as the effective target dn.
        let aci = decode(
            concat!(
                r#"(target = "ldap:///ou=groups,dc=example,dc=com")"#,
                r#"(version 3.0; acl "s"; allow (read) userdn="ldap:///anyone";)"#
            ),
            "dc=example,dc=com",
        );
        assert!(is_target_applicable(&aci, &dn("cn=g,ou=groups,dc=example,dc=com")));
        assert!(!is_target_applicable(&aci, &dn("uid=bob,ou=people,dc=example,dc=com")));
    }

    #[test]
    fn test_targets_inequality_excludes_subtree() {
        // Scoped in by the anchor, but the != target carves out a subtree.
        let aci = decode(
            concat!(
                r#"(target != "ldap:///ou=secret,dc=example,dc=com")"#,
                r#"(version 3.0; acl "s"; allow (read) userdn="ldap:///anyone";)"#
            ),
            "dc=example,dc=com",
        );
        assert!(is_target_applicable(&aci, &dn("uid=bob,ou=people,dc=example,dc=com")));
        assert!(!is_target_applicable(&aci, &dn("cn=x,ou=secret,dc=example,dc=com")));
        assert!(!is_target_applicable(&aci, &dn("ou=secret,dc=example,dc=com")));
    }

    #[test]
    fn test_targets_pattern_match_and_inversion() {
        let aci = decode(
            concat!(
                r#"(target = "ldap:///uid=*,ou=people,dc=example,dc=com")"#,
                r#"(version 3.0; acl "s"; allow (read) userdn="ldap:///anyone";)"#
            ),
            "dc=example,dc=com",
        );
        assert!(is_target_applicable(&aci, &dn("uid=bob,ou=people,dc=example,dc=com")));
        assert!(!is_target_applicable(&aci, &dn("cn=g,ou=groups,dc=example,dc=com")));

        let inv = decode(
            concat!(
                r#"(target != "ldap:///uid=*,ou=people,dc=example,dc=com")"#,
                r#"(version 3.0; acl "s"; allow (read) userdn="ldap:///anyone";)"#
            ),
            "dc=example,dc=com",
        );
        assert!(!is_target_applicable(&inv, &dn("uid=bob,ou=people,dc=example,dc=com")));
        assert!(is_target_applicable(&inv, &dn("cn=g,ou=groups,dc=example,dc=com")));
    }

    #[test]
    fn test_targets_attr_selector_classes() {
        let res = MapResolver::new(vec![]);
        let aci = decode(
            concat!(
                r#"(targetattr = "cn || modifyTimestamp || *")"#,
                r#"(version 3.0; acl "s"; allow (read) userdn="ldap:///anyone";)"#
            ),
            "dc=example,dc=com",
        );
        let mut ctx = ctx_on(&res, person("uid=x,dc=example,dc=com"));

        ctx.current_attr = Some("cn".to_string());
        assert!(is_target_attr_applicable(&aci, &mut ctx));
        assert!(ctx.match_class.user_explicit);

        ctx.current_attr = Some("modifytimestamp".to_string());
        assert!(is_target_attr_applicable(&aci, &mut ctx));
        assert!(ctx.match_class.op_explicit);

        ctx.current_attr = Some("sn".to_string());
        assert!(is_target_attr_applicable(&aci, &mut ctx));
        assert!(ctx.match_class.user_wildcard);

        // The user wildcard does not reach operational attributes.
        ctx.current_attr = Some("creatorsname".to_string());
        assert!(!is_target_attr_applicable(&aci, &mut ctx));
        assert!(!ctx.match_class.op_wildcard);
    }

    #[test]
    fn test_targets_attr_operational_wildcard() {
        let res = MapResolver::new(vec![]);
        let aci = decode(
            concat!(
                r#"(targetattr = "+")"#,
                r#"(version 3.0; acl "s"; allow (read) userdn="ldap:///anyone";)"#
            ),
            "dc=example,dc=com",
        );
        let mut ctx = ctx_on(&res, person("uid=x,dc=example,dc=com"));
        ctx.current_attr = Some("creatorsname".to_string());
        assert!(is_target_attr_applicable(&aci, &mut ctx));
        assert!(ctx.match_class.op_wildcard);
        ctx.current_attr = Some("cn".to_string());
        assert!(!is_target_attr_applicable(&aci, &mut ctx));
    }

    #[test]
    fn test_targets_attr_skip_rights_shortcut() {
        let res = MapResolver::new(vec![]);
        // An add/delete only aci has no attribute dimension at all.
        let aci = decode(
            r#"(version 3.0; acl "s"; allow (add,delete) userdn="ldap:///anyone";)"#,
            "dc=example,dc=com",
        );
        let mut ctx = ctx_on(&res, person("uid=x,dc=example,dc=com"));
        ctx.rights = Right::ADD;
        ctx.current_attr = Some("cn".to_string());
        assert!(is_target_attr_applicable(&aci, &mut ctx));

        // But a read request does not ride the shortcut.
        ctx.rights = Right::READ;
        assert!(!is_target_attr_applicable(&aci, &mut ctx));
    }

    #[test]
    fn test_targets_attr_entry_test_flag() {
        let res = MapResolver::new(vec![]);
        let aci = decode(
            r#"(version 3.0; acl "s"; allow (read) userdn="ldap:///anyone";)"#,
            "dc=example,dc=com",
        );
        let mut ctx = ctx_on(&res, person("uid=x,dc=example,dc=com"));
        ctx.current_attr = Some("objectclass".to_string());
        assert!(!is_target_attr_applicable(&aci, &mut ctx));
        assert!(ctx.entry_test_rule_found);

        // Not on later attributes.
        let mut ctx = ctx_on(&res, person("uid=x,dc=example,dc=com"));
        ctx.is_first_attribute = false;
        ctx.current_attr = Some("objectclass".to_string());
        assert!(!is_target_attr_applicable(&aci, &mut ctx));
        assert!(!ctx.entry_test_rule_found);
    }

    #[test]
    fn test_targets_attr_write_without_attribute() {
        let res = MapResolver::new(vec![]);
        let aci = decode(
            concat!(
                r#"(targetattr = "cn")"#,
                r#"(version 3.0; acl "s"; allow (write) userdn="ldap:///anyone";)"#
            ),
            "dc=example,dc=com",
        );
        let mut ctx = ctx_on(&res, person("uid=x,dc=example,dc=com"));
        ctx.rights = Right::WRITE;
        ctx.current_attr = None;
        assert!(is_target_attr_applicable(&aci, &mut ctx));

        ctx.rights = Right::READ;
        assert!(!is_target_attr_applicable(&aci, &mut ctx));
    }

    #[test]
    fn test_targets_filter_inversion() {
        let res = MapResolver::new(vec![]);
        let aci = decode(
            concat!(
                r#"(targetfilter != "(objectClass=person)")"#,
                r#"(version 3.0; acl "s"; allow (read) userdn="ldap:///anyone";)"#
            ),
            "dc=example,dc=com",
        );
        let ctx = ctx_on(&res, person("uid=x,dc=example,dc=com"));
        assert!(!is_target_filter_applicable(&aci, &ctx));

        let device = entry_from_avas("cn=d,dc=example,dc=com", &[("objectClass", "device")]);
        let ctx = ctx_on(&res, device);
        assert!(is_target_filter_applicable(&aci, &ctx));
    }

    #[test]
    fn test_targets_targattrfilters_gating() {
        let res = MapResolver::new(vec![]);
        let aci = decode(
            concat!(
                r#"(targattrfilters = "add=telephoneNumber:(telephoneNumber=555*), del=telephoneNumber:(telephoneNumber=*)")"#,
                r#"(version 3.0; acl "s"; allow (write) userdn="ldap:///anyone";)"#
            ),
            "dc=example,dc=com",
        );
        let mut ctx = ctx_on(&res, person("uid=x,dc=example,dc=com"));

        // Adding a value that satisfies the add filter.
        ctx.rights = Right::WRITE | Right::WRITE_ADD;
        ctx.current_attr = Some("telephonenumber".to_string());
        ctx.current_value = Some("5551234".to_string());
        assert!(is_targattr_filters_applicable(&aci, &mut ctx));
        assert!(ctx.targattr_filter_match);

        // Adding a value the filter rejects.
        let mut ctx = ctx_on(&res, person("uid=x,dc=example,dc=com"));
        ctx.rights = Right::WRITE | Right::WRITE_ADD;
        ctx.current_attr = Some("telephonenumber".to_string());
        ctx.current_value = Some("9990000".to_string());
        assert!(!is_targattr_filters_applicable(&aci, &mut ctx));

        // Deleting any value is permitted by the del list.
        let mut ctx = ctx_on(&res, person("uid=x,dc=example,dc=com"));
        ctx.rights = Right::WRITE | Right::WRITE_DELETE;
        ctx.current_attr = Some("telephonenumber".to_string());
        ctx.current_value = Some("9990000".to_string());
        assert!(is_targattr_filters_applicable(&aci, &mut ctx));

        // Attributes outside the clause are unconstrained.
        let mut ctx = ctx_on(&res, person("uid=x,dc=example,dc=com"));
        ctx.rights = Right::WRITE | Right::WRITE_ADD;
        ctx.current_attr = Some("cn".to_string());
        ctx.current_value = Some("anything".to_string());
        assert!(is_targattr_filters_applicable(&aci, &mut ctx));
    }

    #[test]
    fn test_targets_control_extop_opt_in() {
        let aci = decode(
            concat!(
                r#"(targetcontrol = "1.2.3.4 || 5.6.7.8")"#,
                r#"(version 3.0; acl "s"; allow (read) userdn="ldap:///anyone";)"#
            ),
            "dc=example,dc=com",
        );
        assert!(is_target_control_applicable(&aci, Some("5.6.7.8")));
        assert!(!is_target_control_applicable(&aci, Some("9.9.9.9")));
        assert!(!is_ext_op_applicable(&aci, Some("5.6.7.8")));

        let plain = decode(
            r#"(version 3.0; acl "s"; allow (read) userdn="ldap:///anyone";)"#,
            "dc=example,dc=com",
        );
        assert!(!is_target_control_applicable(&plain, Some("1.2.3.4")));
    }
}
