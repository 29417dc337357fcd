//! Access control enforcement.
//!
//! This is a pretty important and security sensitive part of the code - it
//! decides, for every directory operation, whether the bound identity may do
//! what it is asking to do. The parts are:
//!
//! - decoding aci attribute values into policies ([`aci`], [`parse`])
//! - deciding whether a policy reaches a request at all ([`targets`])
//! - deciding whether it applies to this requester ([`bindrule`])
//! - the dn indexed policy cache ([`cache`])
//! - the decision engine here, combining everything under deny-overrides.
//!
//! The engine is transactional in the same way the rest of a server is: the
//! cache owner hands out read transactions to operation threads and a write
//! transaction to whatever is mutating acis, and a commit atomically
//! publishes the next generation to new readers.

pub mod aci;
pub mod bindrule;
pub mod cache;
pub mod parse;
pub mod targets;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dn::Dn;
use crate::entry::{is_dn_syntax_attr, DirectoryResolver, Entry, ATTR_ACI};
use crate::error::{AciDecodeError, OperationError};

use self::aci::{AccessType, Aci, Right};
use self::bindrule::{AuthMethod, EvalResult};
use self::cache::{AciCache, AciCacheReadTxn, AciCacheTransaction, AciCacheWriteTxn};
use self::targets::{
    is_ext_op_applicable, is_targattr_filters_applicable, is_target_applicable,
    is_target_attr_applicable, is_target_control_applicable, is_target_filter_applicable,
};

/// The verdict for one decision.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Denied,
}

/// Why the verdict came out the way it did, for diagnostics and effective
/// rights reporting.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecisionReason {
    NoAllowPolicies,
    EvaluatedDenyPolicy,
    EvaluatedAllowPolicy,
    NoMatchingAllowPolicy,
    #[default]
    NoReason,
}

/// Alternate root account DNs and the canonical root DN each stands for.
/// Consulted by literal userdn comparison so an administrator bound through
/// an alternate identity still matches rules naming the canonical one.
#[derive(Debug, Clone, Default)]
pub struct RootDnMap {
    alternates: BTreeMap<Dn, Dn>,
}

impl RootDnMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_alternate(&mut self, alternate: Dn, canonical: Dn) {
        self.alternates.insert(alternate, canonical);
    }

    pub fn canonical<'x>(&'x self, dn: &'x Dn) -> &'x Dn {
        self.alternates.get(dn).unwrap_or(dn)
    }
}

/// Which class of targetattr rule matched during evaluation. Consumed by
/// effective rights summarisation in the operation layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetAttrMatchClass {
    pub user_explicit: bool,
    pub user_wildcard: bool,
    pub op_explicit: bool,
    pub op_wildcard: bool,
}

/// Everything one decision needs to know about the request. A context is
/// owned by exactly one operation thread for the duration of the request -
/// the engine mutates it in place, including the scoped identity swap the
/// proxy pre-check performs.
pub struct EvalContext<'a> {
    pub resolver: &'a dyn DirectoryResolver,
    /// The effective authorization identity.
    pub client_dn: Dn,
    pub client_entry: Option<Arc<Entry>>,
    pub anonymous: bool,
    pub auth_method: AuthMethod,
    pub ssf: u32,
    pub resource_dn: Dn,
    pub resource_entry: Arc<Entry>,
    pub rights: Right,
    /// True when the operation carries proxied authorization - the bound
    /// identity is acting as `client_dn` and must itself hold the proxy
    /// right.
    pub proxied_authorization: bool,
    pub original_authz_dn: Option<Dn>,
    pub original_authz_entry: Option<Arc<Entry>>,
    pub current_attr: Option<String>,
    pub current_value: Option<String>,
    pub control_oid: Option<String>,
    pub ext_op_oid: Option<String>,
    /// Get effective rights evaluation relaxes the empty allow set short
    /// circuit so the reason codes stay meaningful.
    pub ger_eval: bool,
    pub match_class: TargetAttrMatchClass,
    pub targattr_filter_match: bool,
    pub reason: DecisionReason,
    pub deciding_aci: Option<String>,
    pub(crate) proxy_checked: bool,
    pub(crate) proxy_denied: bool,
    pub(crate) is_first_attribute: bool,
    pub(crate) entry_test_rule_found: bool,
    pub(crate) entry_test_active: bool,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        resolver: &'a dyn DirectoryResolver,
        client_dn: Dn,
        resource_entry: Arc<Entry>,
        rights: Right,
    ) -> Self {
        let anonymous = client_dn.is_null();
        EvalContext {
            resolver,
            client_entry: None,
            anonymous,
            auth_method: if anonymous {
                AuthMethod::None
            } else {
                AuthMethod::Simple
            },
            ssf: 0,
            resource_dn: resource_entry.dn().clone(),
            resource_entry,
            client_dn,
            rights,
            proxied_authorization: false,
            original_authz_dn: None,
            original_authz_entry: None,
            current_attr: None,
            current_value: None,
            control_oid: None,
            ext_op_oid: None,
            ger_eval: false,
            match_class: TargetAttrMatchClass::default(),
            targattr_filter_match: false,
            reason: DecisionReason::NoReason,
            deciding_aci: None,
            proxy_checked: false,
            proxy_denied: false,
            is_first_attribute: true,
            entry_test_rule_found: false,
            entry_test_active: false,
        }
    }

    fn begin_proxy_check(&mut self) -> ProxySaved {
        let saved = ProxySaved {
            rights: self.rights,
            client_dn: self.client_dn.clone(),
            client_entry: self.client_entry.take(),
            anonymous: self.anonymous,
        };
        // The proxy right is checked against the identity that actually
        // bound, not the identity it is acting as.
        if let Some(d) = &self.original_authz_dn {
            self.client_dn = d.clone();
        }
        self.client_entry = self.original_authz_entry.clone();
        self.anonymous = self.client_dn.is_null();
        self.rights = Right::PROXY;
        saved
    }

    fn end_proxy_check(&mut self, saved: ProxySaved) {
        self.rights = saved.rights;
        self.client_dn = saved.client_dn;
        self.client_entry = saved.client_entry;
        self.anonymous = saved.anonymous;
    }
}

struct ProxySaved {
    rights: Right,
    client_dn: Dn,
    client_entry: Option<Arc<Entry>>,
    anonymous: bool,
}

/// Validate a candidate aci attribute value before the operation layer
/// accepts a write carrying it. Nothing is cached.
pub fn verify_syntax(text: &str, anchor: &Dn) -> Result<(), AciDecodeError> {
    Aci::decode(text, anchor.clone()).map(|_| ())
}

// =========================================================================
// Decision engine
// =========================================================================

/// Can this ACI reach this request at all? Control and extended operation
/// checks replace the attribute/filter dimensions with the opt-in oid
/// selectors; everything still honours the dn scoping predicate.
fn aci_applicable(a: &Aci, ctx: &mut EvalContext<'_>) -> bool {
    if !is_target_applicable(a, &ctx.resource_dn) {
        return false;
    }
    if ctx.rights.contains(Right::CONTROL) {
        return is_target_control_applicable(a, ctx.control_oid.as_deref());
    }
    if ctx.rights.contains(Right::EXT_OP) {
        return is_ext_op_applicable(a, ctx.ext_op_oid.as_deref());
    }
    is_target_filter_applicable(a, ctx)
        && is_targattr_filters_applicable(a, ctx)
        && is_target_attr_applicable(a, ctx)
}

fn pair_rights_applicable(pair_rights: Right, requested: Right) -> bool {
    if requested.intersects(Right::CONTROL | Right::EXT_OP) {
        // The targeting clause is the gate for these; the aci participates
        // with whichever permission pairs it has.
        return true;
    }
    pair_rights.intersects(requested & !Right::SKIP_PROXY)
}

pub trait AccessControlsTransaction {
    fn acis(&self) -> &dyn AciCacheTransaction;
    fn root_dns(&self) -> &RootDnMap;

    /// The external decision entry point. With an attribute under test this
    /// is the single attribute procedure; without one it is the entry wide
    /// procedure including the entry test second pass.
    fn decide(&self, ctx: &mut EvalContext<'_>) -> Result<AccessDecision, OperationError> {
        if ctx.current_attr.is_some() {
            self.access_allowed(ctx)
        } else {
            self.access_allowed_entry(ctx)
        }
    }

    /// One decision for the rights and attribute currently in the context.
    fn access_allowed(
        &self,
        ctx: &mut EvalContext<'_>,
    ) -> Result<AccessDecision, OperationError> {
        // Right normalisation. The modify value split implies the generic
        // write right, and a write of a dn-syntax value naming the
        // requester is a selfwrite.
        if ctx.rights.intersects(Right::WRITE_ADD | Right::WRITE_DELETE) {
            ctx.rights |= Right::WRITE;
        }
        if ctx.rights.contains(Right::WRITE) {
            if let (Some(attr), Some(value)) = (&ctx.current_attr, &ctx.current_value) {
                if is_dn_syntax_attr(attr) {
                    match Dn::parse(value) {
                        Ok(vdn) if vdn == ctx.client_dn => ctx.rights |= Right::SELFWRITE,
                        Ok(_) => {}
                        Err(e) => {
                            // Best effort only - evaluation continues
                            // without the selfwrite bit.
                            warn!(attr = %attr, err = ?e, "unparseable dn value during selfwrite detection");
                        }
                    }
                }
            }
        }

        // Proxy pre-check, at most once per entry. The acting identity must
        // hold the proxy right on the resource before the proxied identity
        // is evaluated at all.
        if ctx.proxied_authorization
            && !ctx.proxy_checked
            && !ctx.rights.intersects(Right::PROXY | Right::SKIP_PROXY)
        {
            ctx.proxy_checked = true;
            let saved = ctx.begin_proxy_check();
            let verdict = self.access_allowed(ctx);
            ctx.end_proxy_check(saved);
            match verdict? {
                AccessDecision::Denied => {
                    debug!(
                        resource = %ctx.resource_dn,
                        "proxy pre-check denied - denying proxied operation"
                    );
                    // The whole request dies here, not just the attribute
                    // currently under test.
                    ctx.proxy_denied = true;
                    ctx.reason = DecisionReason::EvaluatedDenyPolicy;
                    return Ok(AccessDecision::Denied);
                }
                AccessDecision::Allowed => {}
            }
        }

        // Candidate retrieval and applicability partition.
        let candidates = self.acis().candidates(&ctx.resource_dn);
        let mut deny_list: Vec<(Arc<Aci>, usize)> = Vec::new();
        let mut allow_list: Vec<(Arc<Aci>, usize)> = Vec::new();
        for a in candidates {
            if !aci_applicable(&a, ctx) {
                trace!(aci = %a.name, resource = %ctx.resource_dn, "aci not applicable");
                continue;
            }
            for (idx, pair) in a.pairs.iter().enumerate() {
                if !pair_rights_applicable(pair.rights, ctx.rights) {
                    continue;
                }
                match pair.access_type {
                    AccessType::Deny => deny_list.push((a.clone(), idx)),
                    AccessType::Allow => allow_list.push((a.clone(), idx)),
                }
            }
        }

        // Deny overrides: any deny pair whose bind rule holds wins outright,
        // and an evaluation failure anywhere is a denial, never a grant.
        for (a, idx) in &deny_list {
            let pair = &a.pairs[*idx];
            match pair.bind_rule.evaluate(ctx, self.root_dns()) {
                EvalResult::Fail => {
                    error!(aci = %a.name, "bind rule evaluation failed - denying");
                    ctx.reason = DecisionReason::NoReason;
                    ctx.deciding_aci = None;
                    return Ok(AccessDecision::Denied);
                }
                EvalResult::True => {
                    debug!(aci = %a.name, resource = %ctx.resource_dn, "deny pair evaluated true");
                    ctx.reason = DecisionReason::EvaluatedDenyPolicy;
                    ctx.deciding_aci = Some(a.name.clone());
                    return Ok(AccessDecision::Denied);
                }
                EvalResult::False | EvalResult::Undefined => {}
            }
        }

        if allow_list.is_empty() && !ctx.ger_eval {
            ctx.reason = DecisionReason::NoAllowPolicies;
            ctx.deciding_aci = None;
            return Ok(AccessDecision::Denied);
        }

        for (a, idx) in &allow_list {
            let pair = &a.pairs[*idx];
            match pair.bind_rule.evaluate(ctx, self.root_dns()) {
                EvalResult::Fail => {
                    error!(aci = %a.name, "bind rule evaluation failed - denying");
                    ctx.reason = DecisionReason::NoReason;
                    ctx.deciding_aci = None;
                    return Ok(AccessDecision::Denied);
                }
                EvalResult::True => {
                    debug!(aci = %a.name, resource = %ctx.resource_dn, "allow pair evaluated true");
                    ctx.reason = DecisionReason::EvaluatedAllowPolicy;
                    ctx.deciding_aci = Some(a.name.clone());
                    return Ok(AccessDecision::Allowed);
                }
                EvalResult::False | EvalResult::Undefined => {}
            }
        }

        ctx.reason = DecisionReason::NoMatchingAllowPolicy;
        ctx.deciding_aci = None;
        Ok(AccessDecision::Denied)
    }

    /// Entry wide access: walk the attribute types (objectClass first, then
    /// user, then operational) until one grants access. When an entry test
    /// rule was seen, the verdict is confirmed with the attribute cleared so
    /// a grant is not merely attribute-coincidental. On that second pass an
    /// explicit deny is final, but the mere absence of an applicable allow
    /// leaves an attribute-won grant standing - an implicit grant, preserved
    /// deliberately.
    fn access_allowed_entry(
        &self,
        ctx: &mut EvalContext<'_>,
    ) -> Result<AccessDecision, OperationError> {
        let entry = ctx.resource_entry.clone();
        ctx.is_first_attribute = true;
        ctx.entry_test_rule_found = false;

        let mut granted = false;
        for attr in entry.attribute_types_entry_order() {
            ctx.current_attr = Some(attr.to_string());
            ctx.current_value = None;
            if self.access_allowed(ctx)? == AccessDecision::Allowed {
                granted = true;
                break;
            }
            if ctx.proxy_denied {
                ctx.current_attr = None;
                return Ok(AccessDecision::Denied);
            }
            ctx.is_first_attribute = false;
        }

        if ctx.entry_test_rule_found {
            let saved_reason = ctx.reason;
            let saved_deciding = ctx.deciding_aci.clone();
            ctx.current_attr = None;
            ctx.current_value = None;
            ctx.entry_test_active = true;
            let second = self.access_allowed(ctx);
            ctx.entry_test_active = false;
            let second = second?;
            if granted {
                if second == AccessDecision::Denied {
                    if ctx.reason == DecisionReason::EvaluatedDenyPolicy {
                        return Ok(AccessDecision::Denied);
                    }
                    // Implicit grant: no explicit allow reached the entry
                    // level test, but nothing denied it either. The first
                    // pass diagnostics stand.
                    ctx.reason = saved_reason;
                    ctx.deciding_aci = saved_deciding;
                }
                return Ok(AccessDecision::Allowed);
            }
            return Ok(second);
        }

        ctx.current_attr = None;
        if granted {
            Ok(AccessDecision::Allowed)
        } else {
            if ctx.reason == DecisionReason::NoReason {
                ctx.reason = DecisionReason::NoAllowPolicies;
            }
            Ok(AccessDecision::Denied)
        }
    }

    /// Reduce an entry to the attributes the requester may see, by running
    /// the per attribute decision over every type present. Evaluation
    /// faults leave the attribute out - fail closed.
    fn filter_entry(&self, ctx: &mut EvalContext<'_>) -> Entry {
        let entry = ctx.resource_entry.clone();
        ctx.is_first_attribute = false;
        let mut allowed: BTreeSet<String> = BTreeSet::new();
        for attr in entry.attribute_types_entry_order() {
            ctx.current_attr = Some(attr.to_string());
            ctx.current_value = None;
            match self.access_allowed(ctx) {
                Ok(AccessDecision::Allowed) => {
                    allowed.insert(attr.to_string());
                }
                Ok(AccessDecision::Denied) => {}
                Err(e) => {
                    error!(attr = %attr, err = ?e, "attribute access check failed - hiding attribute");
                }
            }
            if ctx.proxy_denied {
                allowed.clear();
                break;
            }
        }
        ctx.current_attr = None;
        entry.reduce(&allowed)
    }
}

// =========================================================================
// Engine and transactions
// =========================================================================

pub struct AccessControls {
    cache: AciCache,
    root_dns: RootDnMap,
}

impl AccessControls {
    pub fn new(root_dns: RootDnMap) -> Self {
        AccessControls {
            cache: AciCache::new(),
            root_dns,
        }
    }

    pub fn read(&self) -> AccessControlsReadTransaction<'_> {
        AccessControlsReadTransaction {
            acis: self.cache.read(),
            root_dns: &self.root_dns,
        }
    }

    pub fn write(&self) -> AccessControlsWriteTransaction<'_> {
        AccessControlsWriteTransaction {
            acis: self.cache.write(),
            root_dns: &self.root_dns,
        }
    }
}

pub struct AccessControlsReadTransaction<'a> {
    acis: AciCacheReadTxn<'a>,
    root_dns: &'a RootDnMap,
}

impl AccessControlsTransaction for AccessControlsReadTransaction<'_> {
    fn acis(&self) -> &dyn AciCacheTransaction {
        &self.acis
    }

    fn root_dns(&self) -> &RootDnMap {
        self.root_dns
    }
}

pub struct AccessControlsWriteTransaction<'a> {
    acis: AciCacheWriteTxn<'a>,
    root_dns: &'a RootDnMap,
}

impl AccessControlsTransaction for AccessControlsWriteTransaction<'_> {
    fn acis(&self) -> &dyn AciCacheTransaction {
        &self.acis
    }

    fn root_dns(&self) -> &RootDnMap {
        self.root_dns
    }
}

impl AccessControlsWriteTransaction<'_> {
    /// Decode and index every aci value the entry carries. Malformed values
    /// are skipped individually and reported; the batch never fails.
    #[instrument(level = "debug", skip_all)]
    pub fn process_entry_add(&mut self, entry: &Entry) -> Vec<AciDecodeError> {
        let mut diags = Vec::new();
        let Some(values) = entry.get_ava(ATTR_ACI) else {
            return diags;
        };
        let mut decoded = Vec::with_capacity(values.len());
        for v in values {
            match Aci::decode(v, entry.dn().clone()) {
                Ok(a) => decoded.push(Arc::new(a)),
                Err(e) => {
                    warn!(anchor = %entry.dn(), err = %e, "skipping malformed aci value");
                    diags.push(e);
                }
            }
        }
        self.acis.insert(entry.dn().clone(), decoded);
        diags
    }

    #[instrument(level = "debug", skip_all)]
    pub fn process_entry_delete(&mut self, dn: &Dn) {
        self.acis.remove(dn);
    }

    /// Modify replaces whatever was indexed for the entry with its current
    /// aci values.
    #[instrument(level = "debug", skip_all)]
    pub fn process_entry_modify(&mut self, entry: &Entry) -> Vec<AciDecodeError> {
        self.acis.remove(entry.dn());
        self.process_entry_add(entry)
    }

    #[instrument(level = "debug", skip_all)]
    pub fn process_entry_rename(&mut self, old_dn: &Dn, new_dn: &Dn) {
        self.acis.rename(old_dn, new_dn);
    }

    #[instrument(level = "debug", skip_all)]
    pub fn process_backend_detach(&mut self, suffix: &Dn) {
        self.acis.remove_subtree(suffix);
    }

    /// Startup load of the configuration held global policies, anchored at
    /// the null dn.
    #[instrument(level = "debug", skip_all)]
    pub fn load_global_acis(&mut self, values: &[&str]) -> Vec<AciDecodeError> {
        let mut diags = Vec::new();
        let mut decoded = Vec::with_capacity(values.len());
        for v in values {
            match Aci::decode(v, Dn::null()) {
                Ok(a) => decoded.push(Arc::new(a)),
                Err(e) => {
                    warn!(err = %e, "skipping malformed global aci");
                    diags.push(e);
                }
            }
        }
        self.acis.insert(Dn::null(), decoded);
        diags
    }

    pub fn commit(self) {
        self.acis.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::test_support::{entry_from_avas, FailResolver, MapResolver};

    fn dn(s: &str) -> Dn {
        Dn::parse(s).expect("test dn")
    }

    fn bob_entry() -> Entry {
        entry_from_avas(
            "uid=bob,ou=people,dc=example,dc=com",
            &[
                ("objectClass", "person"),
                ("uid", "bob"),
                ("cn", "Bob Fields"),
                ("sn", "Fields"),
                ("departmentNumber", "42"),
            ],
        )
    }

    fn alice_entry() -> Entry {
        entry_from_avas(
            "uid=alice,ou=people,dc=example,dc=com",
            &[
                ("objectClass", "person"),
                ("uid", "alice"),
                ("cn", "Alice Sample"),
            ],
        )
    }

    fn resolver() -> MapResolver {
        MapResolver::new(vec![
            bob_entry(),
            alice_entry(),
            entry_from_avas(
                "cn=admins,dc=example,dc=com",
                &[
                    ("objectClass", "groupOfNames"),
                    ("cn", "admins"),
                    ("member", "uid=alice,ou=people,dc=example,dc=com"),
                ],
            ),
        ])
    }

    /// Build an engine with the given (anchor, aci text) policies loaded and
    /// committed.
    fn setup(policies: &[(&str, &str)]) -> AccessControls {
        let engine = AccessControls::new(RootDnMap::new());
        {
            let mut w = engine.write();
            for (anchor, text) in policies {
                let mut e = Entry::new(dn(anchor));
                e.add_ava(ATTR_ACI, text);
                let diags = w.process_entry_add(&e);
                assert!(diags.is_empty(), "test aci failed to decode: {diags:?}");
            }
            w.commit();
        }
        engine
    }

    fn ctx_for<'a>(
        resolver: &'a dyn crate::entry::DirectoryResolver,
        client: &str,
        resource: Entry,
        rights: Right,
    ) -> EvalContext<'a> {
        EvalContext::new(resolver, dn(client), Arc::new(resource), rights)
    }

    #[test]
    fn test_access_deny_write_anyone() {
        // End to end scenario: a deny(write) anchored at the suffix denies
        // a write to any entry below it, for any identity.
        let engine = setup(&[(
            "dc=example,dc=com",
            r#"(version 3.0; acl "t1"; deny (write) userdn="ldap:///anyone";)"#,
        )]);
        let res = resolver();
        let target = entry_from_avas("cn=x,dc=example,dc=com", &[("objectClass", "device"), ("cn", "x")]);
        let mut ctx = ctx_for(&res, "uid=bob,ou=people,dc=example,dc=com", target, Right::WRITE);

        let r = engine.read();
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Denied);
        assert_eq!(ctx.reason, DecisionReason::EvaluatedDenyPolicy);
        assert_eq!(ctx.deciding_aci.as_deref(), Some("t1"));
    }

    #[test]
    fn test_access_self_read() {
        // End to end scenario: self access to one's own entry.
        let engine = setup(&[(
            "uid=bob,ou=people,dc=example,dc=com",
            r#"(version 3.0; acl "t2"; allow (read,search,compare) userdn="ldap:///self";)"#,
        )]);
        let res = resolver();
        let r = engine.read();

        let mut ctx = ctx_for(
            &res,
            "uid=bob,ou=people,dc=example,dc=com",
            bob_entry(),
            Right::READ,
        );
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Allowed);
        assert_eq!(ctx.reason, DecisionReason::EvaluatedAllowPolicy);
        assert_eq!(ctx.deciding_aci.as_deref(), Some("t2"));

        let mut ctx = ctx_for(
            &res,
            "uid=alice,ou=people,dc=example,dc=com",
            bob_entry(),
            Right::READ,
        );
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Denied);
        assert_eq!(ctx.reason, DecisionReason::NoMatchingAllowPolicy);
    }

    #[test]
    fn test_access_onelevel_scope() {
        // End to end scenario: onelevel matches immediate children only -
        // not the target entry, not grandchildren.
        let engine = setup(&[(
            "dc=example,dc=com",
            concat!(
                r#"(target = "ldap:///dc=example,dc=com")(targetscope = "onelevel")"#,
                r#"(targetattr = "*")"#,
                r#"(version 3.0; acl "t3"; allow (read,search) userdn="ldap:///anyone";)"#
            ),
        )]);
        let res = resolver();
        let r = engine.read();
        let client = "uid=bob,ou=people,dc=example,dc=com";

        let child = entry_from_avas(
            "ou=people,dc=example,dc=com",
            &[("objectClass", "organizationalUnit"), ("ou", "people")],
        );
        let mut ctx = ctx_for(&res, client, child, Right::READ);
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Allowed);

        let base = entry_from_avas(
            "dc=example,dc=com",
            &[("objectClass", "domain"), ("dc", "example")],
        );
        let mut ctx = ctx_for(&res, client, base, Right::READ);
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Denied);

        let mut ctx = ctx_for(&res, client, bob_entry(), Right::READ);
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Denied);
    }

    #[test]
    fn test_access_deny_overrides() {
        // Both a deny and an allow match and both bind rules hold - the
        // deny always wins, wherever it sits in the list.
        let engine = setup(&[(
            "dc=example,dc=com",
            concat!(
                r#"(targetattr = "*")(version 3.0; acl "both"; "#,
                r#"allow (read) userdn="ldap:///all"; "#,
                r#"deny (read) userdn="ldap:///uid=bob,ou=people,dc=example,dc=com";)"#
            ),
        )]);
        let res = resolver();
        let r = engine.read();

        let mut ctx = ctx_for(
            &res,
            "uid=bob,ou=people,dc=example,dc=com",
            alice_entry(),
            Right::READ,
        );
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Denied);
        assert_eq!(ctx.reason, DecisionReason::EvaluatedDenyPolicy);

        // An identity outside the deny rule is allowed through.
        let mut ctx = ctx_for(
            &res,
            "uid=alice,ou=people,dc=example,dc=com",
            bob_entry(),
            Right::READ,
        );
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Allowed);
    }

    #[test]
    fn test_access_groupdn_rule() {
        let engine = setup(&[(
            "dc=example,dc=com",
            concat!(
                r#"(targetattr = "*")(version 3.0; acl "admins"; "#,
                r#"allow (read,write) groupdn="ldap:///cn=admins,dc=example,dc=com";)"#
            ),
        )]);
        let res = resolver();
        let r = engine.read();

        let mut ctx = ctx_for(
            &res,
            "uid=alice,ou=people,dc=example,dc=com",
            bob_entry(),
            Right::READ,
        );
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Allowed);

        let mut ctx = ctx_for(
            &res,
            "uid=bob,ou=people,dc=example,dc=com",
            alice_entry(),
            Right::READ,
        );
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Denied);
    }

    #[test]
    fn test_access_proxy_pre_check() {
        let engine = setup(&[
            (
                "dc=example,dc=com",
                concat!(
                    r#"(targetattr = "*")(version 3.0; acl "reads"; "#,
                    r#"allow (read,search) userdn="ldap:///all";)"#
                ),
            ),
            (
                "dc=example,dc=com",
                concat!(
                    r#"(version 3.0; acl "proxy ok"; "#,
                    r#"allow (proxy) userdn="ldap:///uid=alice,ou=people,dc=example,dc=com";)"#
                ),
            ),
        ]);
        let res = resolver();
        let r = engine.read();

        // alice acts as bob: alice holds the proxy right, so the read
        // proceeds and is evaluated as bob.
        let mut ctx = ctx_for(
            &res,
            "uid=bob,ou=people,dc=example,dc=com",
            bob_entry(),
            Right::READ,
        );
        ctx.proxied_authorization = true;
        ctx.original_authz_dn = Some(dn("uid=alice,ou=people,dc=example,dc=com"));
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Allowed);
        assert!(ctx.proxy_checked);
        // Identity and rights were restored after the nested check.
        assert_eq!(ctx.client_dn, dn("uid=bob,ou=people,dc=example,dc=com"));
        assert!(ctx.rights.contains(Right::READ));
    }

    #[test]
    fn test_access_proxy_denied_without_grant() {
        let engine = setup(&[(
            "dc=example,dc=com",
            concat!(
                r#"(targetattr = "*")(version 3.0; acl "reads"; "#,
                r#"allow (read,search) userdn="ldap:///all";)"#
            ),
        )]);
        let res = resolver();
        let r = engine.read();

        let mut ctx = ctx_for(
            &res,
            "uid=bob,ou=people,dc=example,dc=com",
            bob_entry(),
            Right::READ,
        );
        ctx.proxied_authorization = true;
        ctx.original_authz_dn = Some(dn("uid=alice,ou=people,dc=example,dc=com"));
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Denied);
    }

    #[test]
    fn test_access_proxy_skip_flag() {
        // The skip flag suppresses the pre-check entirely.
        let engine = setup(&[(
            "dc=example,dc=com",
            concat!(
                r#"(targetattr = "*")(version 3.0; acl "reads"; "#,
                r#"allow (read,search) userdn="ldap:///all";)"#
            ),
        )]);
        let res = resolver();
        let r = engine.read();

        let mut ctx = ctx_for(
            &res,
            "uid=bob,ou=people,dc=example,dc=com",
            bob_entry(),
            Right::READ | Right::SKIP_PROXY,
        );
        ctx.proxied_authorization = true;
        ctx.original_authz_dn = Some(dn("uid=alice,ou=people,dc=example,dc=com"));
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Allowed);
        assert!(!ctx.proxy_checked);
    }

    #[test]
    fn test_access_fail_closed_on_resolver_error() {
        // A systemic resolver failure during bind rule evaluation must deny,
        // never grant.
        let engine = setup(&[(
            "dc=example,dc=com",
            concat!(
                r#"(targetattr = "*")(version 3.0; acl "urls"; "#,
                r#"allow (read) userdn="ldap:///ou=people,dc=example,dc=com??sub?(uid=bob)";)"#
            ),
        )]);
        let res = FailResolver;
        let r = engine.read();

        let mut ctx = ctx_for(
            &res,
            "uid=bob,ou=people,dc=example,dc=com",
            bob_entry(),
            Right::READ,
        );
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Denied);
    }

    #[test]
    fn test_access_selfwrite_detection() {
        let engine = setup(&[(
            "dc=example,dc=com",
            concat!(
                r#"(targetattr = "member")(version 3.0; acl "join"; "#,
                r#"allow (selfwrite) userdn="ldap:///all";)"#
            ),
        )]);
        let res = resolver();
        let r = engine.read();
        let group = entry_from_avas(
            "cn=club,dc=example,dc=com",
            &[("objectClass", "groupOfNames"), ("cn", "club")],
        );

        // Writing one's own dn into member is a selfwrite and is allowed.
        let mut ctx = ctx_for(
            &res,
            "uid=bob,ou=people,dc=example,dc=com",
            group.clone(),
            Right::WRITE,
        );
        ctx.current_attr = Some("member".to_string());
        ctx.current_value = Some("uid=bob,ou=people,dc=example,dc=com".to_string());
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Allowed);
        assert!(ctx.rights.contains(Right::SELFWRITE));

        // Writing someone else's dn is a plain write, which this aci does
        // not grant.
        let mut ctx = ctx_for(
            &res,
            "uid=bob,ou=people,dc=example,dc=com",
            group,
            Right::WRITE,
        );
        ctx.current_attr = Some("member".to_string());
        ctx.current_value = Some("uid=alice,ou=people,dc=example,dc=com".to_string());
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Denied);
    }

    #[test]
    fn test_access_filter_entry_reduction() {
        let engine = setup(&[(
            "dc=example,dc=com",
            concat!(
                r#"(targetattr = "cn || uid")(version 3.0; acl "partial"; "#,
                r#"allow (read,search) userdn="ldap:///all";)"#
            ),
        )]);
        let res = resolver();
        let r = engine.read();

        let mut ctx = ctx_for(
            &res,
            "uid=alice,ou=people,dc=example,dc=com",
            bob_entry(),
            Right::READ,
        );
        let reduced = r.filter_entry(&mut ctx);
        assert!(reduced.attribute_pres("cn"));
        assert!(reduced.attribute_pres("uid"));
        assert!(!reduced.attribute_pres("sn"));
        assert!(!reduced.attribute_pres("objectclass"));
    }

    #[test]
    fn test_access_targetfilter() {
        let engine = setup(&[(
            "dc=example,dc=com",
            concat!(
                r#"(targetattr = "*")(targetfilter = "(departmentNumber=42)")"#,
                r#"(version 3.0; acl "dept"; allow (read) userdn="ldap:///all";)"#
            ),
        )]);
        let res = resolver();
        let r = engine.read();
        let client = "uid=alice,ou=people,dc=example,dc=com";

        // bob's entry carries departmentNumber 42, alice's does not.
        let mut ctx = ctx_for(&res, client, bob_entry(), Right::READ);
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Allowed);

        let mut ctx = ctx_for(&res, client, alice_entry(), Right::READ);
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Denied);
    }

    #[test]
    fn test_access_targattrfilters_write_gating() {
        // Value level gating: only phone numbers in the 555 prefix may be
        // added, anything may be deleted.
        let engine = setup(&[(
            "dc=example,dc=com",
            concat!(
                r#"(targattrfilters = "add=telephoneNumber:(telephoneNumber=555*), del=telephoneNumber:(telephoneNumber=*)")"#,
                r#"(version 3.0; acl "phones"; allow (write) userdn="ldap:///all";)"#
            ),
        )]);
        let res = resolver();
        let r = engine.read();

        let mut ctx = ctx_for(
            &res,
            "uid=alice,ou=people,dc=example,dc=com",
            bob_entry(),
            Right::WRITE_ADD,
        );
        ctx.current_attr = Some("telephonenumber".to_string());
        ctx.current_value = Some("5551234".to_string());
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Allowed);

        let mut ctx = ctx_for(
            &res,
            "uid=alice,ou=people,dc=example,dc=com",
            bob_entry(),
            Right::WRITE_ADD,
        );
        ctx.current_attr = Some("telephonenumber".to_string());
        ctx.current_value = Some("9990000".to_string());
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Denied);

        let mut ctx = ctx_for(
            &res,
            "uid=alice,ou=people,dc=example,dc=com",
            bob_entry(),
            Right::WRITE_DELETE,
        );
        ctx.current_attr = Some("telephonenumber".to_string());
        ctx.current_value = Some("9990000".to_string());
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Allowed);
    }

    #[test]
    fn test_access_ger_reason_codes() {
        // With no allow policies at all, normal evaluation reports
        // NoAllowPolicies but a get effective rights evaluation runs the
        // (empty) allow list and reports NoMatchingAllowPolicy.
        let engine = setup(&[]);
        let res = resolver();
        let r = engine.read();

        let mut ctx = ctx_for(
            &res,
            "uid=bob,ou=people,dc=example,dc=com",
            bob_entry(),
            Right::READ,
        );
        ctx.current_attr = Some("cn".to_string());
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Denied);
        assert_eq!(ctx.reason, DecisionReason::NoAllowPolicies);

        let mut ctx = ctx_for(
            &res,
            "uid=bob,ou=people,dc=example,dc=com",
            bob_entry(),
            Right::READ,
        );
        ctx.current_attr = Some("cn".to_string());
        ctx.ger_eval = true;
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Denied);
        assert_eq!(ctx.reason, DecisionReason::NoMatchingAllowPolicy);
    }

    #[test]
    fn test_access_cache_maintenance_hooks() {
        let engine = setup(&[]);
        let res = resolver();

        let mut holder = Entry::new(dn("dc=example,dc=com"));
        holder.add_ava(
            ATTR_ACI,
            r#"(targetattr = "*")(version 3.0; acl "open"; allow (read) userdn="ldap:///all";)"#,
        );
        let mut w = engine.write();
        assert!(w.process_entry_add(&holder).is_empty());
        w.commit();

        let r = engine.read();
        let mut ctx = ctx_for(
            &res,
            "uid=bob,ou=people,dc=example,dc=com",
            alice_entry(),
            Right::READ,
        );
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Allowed);
        drop(r);

        // Deleting the holding entry withdraws its policies.
        let mut w = engine.write();
        w.process_entry_delete(&dn("dc=example,dc=com"));
        w.commit();
        let r = engine.read();
        let mut ctx = ctx_for(
            &res,
            "uid=bob,ou=people,dc=example,dc=com",
            alice_entry(),
            Right::READ,
        );
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Denied);
    }

    #[test]
    fn test_access_malformed_aci_collected_not_fatal() {
        let engine = AccessControls::new(RootDnMap::new());
        let mut holder = Entry::new(dn("dc=example,dc=com"));
        holder.add_ava(ATTR_ACI, "(version 9.9; acl \"bad\"; )");
        holder.add_ava(
            ATTR_ACI,
            r#"(targetattr = "*")(version 3.0; acl "good"; allow (read) userdn="ldap:///all";)"#,
        );
        let mut w = engine.write();
        let diags = w.process_entry_add(&holder);
        assert_eq!(diags.len(), 1);
        assert!(matches!(diags[0], AciDecodeError::UnsupportedVersion(_)));
        w.commit();

        // The well formed sibling still landed.
        let res = resolver();
        let r = engine.read();
        let mut ctx = ctx_for(
            &res,
            "uid=bob,ou=people,dc=example,dc=com",
            alice_entry(),
            Right::READ,
        );
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Allowed);
    }

    #[test]
    fn test_access_global_acis() {
        let engine = AccessControls::new(RootDnMap::new());
        let mut w = engine.write();
        let diags = w.load_global_acis(&[concat!(
            r#"(targetattr = "*")(version 3.0; acl "server wide"; "#,
            r#"allow (read,search) userdn="ldap:///all";)"#
        )]);
        assert!(diags.is_empty());
        w.commit();

        let res = resolver();
        let r = engine.read();
        let mut ctx = ctx_for(
            &res,
            "uid=alice,ou=people,dc=example,dc=com",
            bob_entry(),
            Right::READ,
        );
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Allowed);
        assert_eq!(ctx.deciding_aci.as_deref(), Some("server wide"));
    }

    #[test]
    fn test_access_root_dn_equivalence() {
        let mut roots = RootDnMap::new();
        roots.add_alternate(
            dn("cn=admin,cn=alternates,cn=config"),
            dn("cn=directory manager"),
        );
        let engine = AccessControls::new(roots);
        {
            let mut w = engine.write();
            let mut holder = Entry::new(dn("dc=example,dc=com"));
            holder.add_ava(
                ATTR_ACI,
                concat!(
                    r#"(targetattr = "*")(version 3.0; acl "dm only"; "#,
                    r#"allow (read,write) userdn="ldap:///cn=directory manager";)"#
                ),
            );
            assert!(w.process_entry_add(&holder).is_empty());
            w.commit();
        }

        let res = resolver();
        let r = engine.read();
        let mut ctx = ctx_for(
            &res,
            "cn=admin,cn=alternates,cn=config",
            bob_entry(),
            Right::READ,
        );
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Allowed);
    }

    #[test]
    fn test_verify_syntax_surface() {
        let anchor = dn("dc=example,dc=com");
        assert!(verify_syntax(
            r#"(version 3.0; acl "ok"; allow (read) userdn="ldap:///anyone";)"#,
            &anchor
        )
        .is_ok());
        assert!(verify_syntax("(version 3.0; acl broken", &anchor).is_err());
    }

    #[test]
    fn test_access_targetcontrol_opt_in() {
        let engine = setup(&[
            (
                "dc=example,dc=com",
                concat!(
                    r#"(targetcontrol = "1.2.840.113556.1.4.473")"#,
                    r#"(version 3.0; acl "sss"; allow (read) userdn="ldap:///all";)"#
                ),
            ),
            (
                "dc=example,dc=com",
                concat!(
                    r#"(targetattr = "*")"#,
                    r#"(version 3.0; acl "plain"; allow (read) userdn="ldap:///all";)"#
                ),
            ),
        ]);
        let res = resolver();
        let r = engine.read();

        // The listed control is reachable; an unlisted one finds no opt-in
        // aci and is denied.
        let mut ctx = ctx_for(
            &res,
            "uid=bob,ou=people,dc=example,dc=com",
            alice_entry(),
            Right::CONTROL,
        );
        ctx.control_oid = Some("1.2.840.113556.1.4.473".to_string());
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Allowed);

        let mut ctx = ctx_for(
            &res,
            "uid=bob,ou=people,dc=example,dc=com",
            alice_entry(),
            Right::CONTROL,
        );
        ctx.control_oid = Some("2.16.840.1.113730.3.4.18".to_string());
        assert_eq!(r.decide(&mut ctx).expect("decide"), AccessDecision::Denied);
    }
}
