//! The decoded ACI policy model.
//!
//! An [`Aci`] is the immutable result of decoding one aci attribute value:
//! the version/name header, the target specification, and one or more
//! (permission, bind rule) pairs. Once built it is shared read-only through
//! the cache as `Arc<Aci>`; nothing here has behaviour beyond structural
//! access and canonical re-serialisation.

use std::fmt;

use crate::dn::Dn;

use super::bindrule::BindRuleExpr;
use super::targets::AciTargets;

/// The one grammar version this engine accepts.
pub const ACI_VERSION: &str = "3.0";

bitflags::bitflags! {
    /// Access rights, as a mask. The lower block is the grammar rights that
    /// appear in a permission clause. The upper block is request-side state
    /// set by the operation layer and never parsed from text: the modify
    /// split of write into add/delete of values, control and extended
    /// operation access, and the proxy pre-check suppression flag.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Right: u16 {
        const READ =         0b0000_0000_0000_0001;
        const WRITE =        0b0000_0000_0000_0010;
        const ADD =          0b0000_0000_0000_0100;
        const DELETE =       0b0000_0000_0000_1000;
        const SEARCH =       0b0000_0000_0001_0000;
        const COMPARE =      0b0000_0000_0010_0000;
        const SELFWRITE =    0b0000_0000_0100_0000;
        const PROXY =        0b0000_0000_1000_0000;
        const IMPORT =       0b0000_0001_0000_0000;
        const EXPORT =       0b0000_0010_0000_0000;
        const WRITE_ADD =    0b0000_0100_0000_0000;
        const WRITE_DELETE = 0b0000_1000_0000_0000;
        const CONTROL =      0b0001_0000_0000_0000;
        const EXT_OP =       0b0010_0000_0000_0000;
        const SKIP_PROXY =   0b0100_0000_0000_0000;
    }
}

impl Right {
    /// The expansion of the grammar right `all`. Proxy is deliberately not
    /// part of it.
    pub fn all_rights() -> Right {
        Right::READ
            | Right::WRITE
            | Right::ADD
            | Right::DELETE
            | Right::SEARCH
            | Right::COMPARE
            | Right::SELFWRITE
            | Right::IMPORT
            | Right::EXPORT
    }

    /// Rights that make sense without any attribute in hand. Used by the
    /// targetattr presence-mismatch shortcut.
    pub fn skip_attr_rights() -> Right {
        Right::ADD | Right::DELETE | Right::PROXY
    }

    pub(crate) fn parse_token(tok: &str) -> Option<Right> {
        match tok.to_lowercase().as_str() {
            "read" => Some(Right::READ),
            "write" => Some(Right::WRITE),
            "add" => Some(Right::ADD),
            "delete" => Some(Right::DELETE),
            "search" => Some(Right::SEARCH),
            "compare" => Some(Right::COMPARE),
            "selfwrite" => Some(Right::SELFWRITE),
            "proxy" => Some(Right::PROXY),
            "import" => Some(Right::IMPORT),
            "export" => Some(Right::EXPORT),
            "all" => Some(Right::all_rights()),
            _ => None,
        }
    }
}

impl fmt::Display for Right {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(Right, &str)] = &[
            (Right::READ, "read"),
            (Right::WRITE, "write"),
            (Right::ADD, "add"),
            (Right::DELETE, "delete"),
            (Right::SEARCH, "search"),
            (Right::COMPARE, "compare"),
            (Right::SELFWRITE, "selfwrite"),
            (Right::PROXY, "proxy"),
            (Right::IMPORT, "import"),
            (Right::EXPORT, "export"),
        ];
        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(*bit) {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Allow,
    Deny,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessType::Allow => write!(f, "allow"),
            AccessType::Deny => write!(f, "deny"),
        }
    }
}

/// Equality / inequality comparison in target clauses and dn-valued bind
/// rule keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqOp {
    Eq,
    Ne,
}

impl fmt::Display for EqOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EqOp::Eq => write!(f, "="),
            EqOp::Ne => write!(f, "!="),
        }
    }
}

/// Full comparison set for bind rule keywords with ordered values (ssf).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Ge,
    Gt,
    Le,
    Lt,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Ge => ">=",
            CmpOp::Gt => ">",
            CmpOp::Le => "<=",
            CmpOp::Lt => "<",
        };
        write!(f, "{s}")
    }
}

/// One `allow (...) rule;` or `deny (...) rule;` group from an ACI body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermBindPair {
    pub access_type: AccessType,
    pub rights: Right,
    pub bind_rule: BindRuleExpr,
}

/// A decoded access control instruction.
#[derive(Debug, Clone)]
pub struct Aci {
    pub version: String,
    pub name: String,
    /// Offset into the source text where the header match ended and pair
    /// parsing began. Diagnostic only.
    pub source_offset: usize,
    /// DN of the entry whose aci attribute held this value. The null DN for
    /// global policies.
    pub anchor: Dn,
    pub pairs: Vec<PermBindPair>,
    pub targets: AciTargets,
}

impl PartialEq for Aci {
    fn eq(&self, other: &Self) -> bool {
        // Structural identity. The source offset is a property of the
        // concrete text a policy was decoded from, not of the policy.
        self.version == other.version
            && self.name == other.name
            && self.anchor == other.anchor
            && self.pairs == other.pairs
            && self.targets == other.targets
    }
}

impl Eq for Aci {}

impl fmt::Display for Aci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.targets)?;
        write!(f, "(version {}; acl \"{}\";", self.version, self.name)?;
        for pair in &self.pairs {
            write!(
                f,
                " {} ({}) {};",
                pair.access_type, pair.rights, pair.bind_rule
            )?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::Right;

    #[test]
    fn test_right_tokens() {
        assert_eq!(Right::parse_token("read"), Some(Right::READ));
        assert_eq!(Right::parse_token("SelfWrite"), Some(Right::SELFWRITE));
        assert_eq!(Right::parse_token("all"), Some(Right::all_rights()));
        assert_eq!(Right::parse_token("write_add"), None);
        assert_eq!(Right::parse_token("bogus"), None);
    }

    #[test]
    fn test_right_display_order() {
        let r = Right::SEARCH | Right::READ | Right::COMPARE;
        assert_eq!(r.to_string(), "read,search,compare");
    }

    #[test]
    fn test_all_excludes_proxy() {
        assert!(!Right::all_rights().contains(Right::PROXY));
        assert!(!Right::all_rights().contains(Right::CONTROL));
    }
}
