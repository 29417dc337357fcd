//! A DSEE-compatible access control engine for an LDAP directory server.
//! This implements the aci attribute grammar, target and bind rule
//! evaluation, and the deny-overrides decision procedure that gates every
//! read and write the server performs, together with the dn indexed policy
//! cache the decision engine retrieves candidates from.

#![recursion_limit = "512"]
#![warn(unused_extern_crates)]
// Enable some groups of clippy lints.
#![deny(clippy::suspicious)]
#![deny(clippy::perf)]
// Specific lints to enforce.
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]
#![deny(clippy::manual_let_else)]
#![allow(clippy::unreachable)]

#[macro_use]
extern crate tracing;
#[macro_use]
extern crate lazy_static;

pub mod access;
pub mod dn;
pub mod entry;
pub mod error;
pub mod filter;

/// A prelude of imports that should be imported by all other consuming
/// modules to help make imports cleaner.
pub mod prelude {
    pub use crate::access::aci::{AccessType, Aci, PermBindPair, Right};
    pub use crate::access::bindrule::{AuthMethod, BindRuleExpr, EvalResult};
    pub use crate::access::cache::{AciCache, AciCacheTransaction};
    pub use crate::access::{
        verify_syntax, AccessControls, AccessControlsReadTransaction, AccessControlsTransaction,
        AccessControlsWriteTransaction, AccessDecision, DecisionReason, EvalContext, RootDnMap,
        TargetAttrMatchClass,
    };
    pub use crate::dn::{Dn, DnPattern};
    pub use crate::entry::{DirectoryResolver, Entry, ATTR_ACI};
    pub use crate::error::{AciDecodeError, OperationError};
    pub use crate::filter::{entry_matches_filter, parse_ldap_filter_str};
}
