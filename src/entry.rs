//! Directory entry values as the access engine sees them.
//!
//! An entry here is the resolved view handed over by the operation layer: a
//! DN plus an attribute multimap. Attribute names are normalised to lower
//! case on insert so presence and equality checks are plain map operations.
//!
//! The engine needs to know two schema facts about attribute types without
//! owning a schema: whether a type is operational (for the `+` selector and
//! entry iteration order) and whether its syntax is DN-valued (for selfwrite
//! detection). Both are driven by fixed classification sets here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::dn::Dn;
use crate::error::OperationError;

pub const ATTR_ACI: &str = "aci";
pub const ATTR_OBJECTCLASS: &str = "objectclass";

lazy_static! {
    static ref OPERATIONAL_ATTRS: BTreeSet<&'static str> = {
        let mut s = BTreeSet::new();
        s.insert(ATTR_ACI);
        s.insert("createtimestamp");
        s.insert("creatorsname");
        s.insert("entrydn");
        s.insert("entryuuid");
        s.insert("hassubordinates");
        s.insert("modifiersname");
        s.insert("modifytimestamp");
        s.insert("numsubordinates");
        s.insert("pwdchangedtime");
        s.insert("subschemasubentry");
        s
    };
    static ref DN_SYNTAX_ATTRS: BTreeSet<&'static str> = {
        let mut s = BTreeSet::new();
        s.insert("manager");
        s.insert("member");
        s.insert("owner");
        s.insert("roleoccupant");
        s.insert("secretary");
        s.insert("seealso");
        s.insert("uniquemember");
        s
    };
}

pub fn is_operational_attr(attr: &str) -> bool {
    OPERATIONAL_ATTRS.contains(attr)
}

pub fn is_dn_syntax_attr(attr: &str) -> bool {
    DN_SYNTAX_ATTRS.contains(attr)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    dn: Dn,
    attrs: BTreeMap<String, Vec<String>>,
}

impl Entry {
    pub fn new(dn: Dn) -> Self {
        Entry {
            dn,
            attrs: BTreeMap::new(),
        }
    }

    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    pub fn add_ava(&mut self, attr: &str, value: &str) {
        self.attrs
            .entry(attr.to_lowercase())
            .or_default()
            .push(value.to_string());
    }

    pub fn get_ava(&self, attr: &str) -> Option<&[String]> {
        self.attrs.get(&attr.to_lowercase()).map(|v| v.as_slice())
    }

    pub fn get_ava_single(&self, attr: &str) -> Option<&str> {
        self.get_ava(attr).and_then(|vs| match vs {
            [v] => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn attribute_pres(&self, attr: &str) -> bool {
        self.attrs.contains_key(&attr.to_lowercase())
    }

    /// Case-insensitive attribute value equality test.
    pub fn attribute_equality(&self, attr: &str, value: &str) -> bool {
        self.get_ava(attr)
            .map(|vs| vs.iter().any(|v| v.eq_ignore_ascii_case(value)))
            .unwrap_or(false)
    }

    pub fn attribute_types(&self) -> impl Iterator<Item = &str> {
        self.attrs.keys().map(|k| k.as_str())
    }

    /// Attribute types in entry evaluation order: objectClass first, then
    /// user attributes, then operational attributes.
    pub fn attribute_types_entry_order(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(self.attrs.len());
        if self.attrs.contains_key(ATTR_OBJECTCLASS) {
            out.push(ATTR_OBJECTCLASS);
        }
        out.extend(
            self.attrs
                .keys()
                .map(|k| k.as_str())
                .filter(|a| *a != ATTR_OBJECTCLASS && !is_operational_attr(a)),
        );
        out.extend(
            self.attrs
                .keys()
                .map(|k| k.as_str())
                .filter(|a| *a != ATTR_OBJECTCLASS && is_operational_attr(a)),
        );
        out
    }

    /// A copy reduced to the permitted attribute types. Used to build the
    /// client visible view of an entry after per-attribute access checks.
    pub fn reduce(&self, allowed: &BTreeSet<String>) -> Entry {
        Entry {
            dn: self.dn.clone(),
            attrs: self
                .attrs
                .iter()
                .filter(|(k, _)| allowed.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// Directory lookups the engine needs during evaluation - resolving the
/// requester entry for URL style bind rules and group entries for groupdn.
///
/// `Ok(None)` is an ordinary no-such-entry and degrades to a non-match for
/// the predicate that asked. `Err` signals a systemic failure (backend down,
/// lock timeout) and aborts the whole decision, fail closed.
pub trait DirectoryResolver {
    fn resolve(&self, dn: &Dn) -> Result<Option<Arc<Entry>>, OperationError>;
}
