//! The DN indexed ACI cache.
//!
//! Decoded policies are keyed by the DN of the entry that holds them, with
//! the null DN reserved for the server wide global set. Retrieval walks the
//! DIT ancestry so one lookup returns every policy that could scope a
//! request, and the whole structure is a copy on write B+tree: any number of
//! readers see a stable snapshot while a single writer prepares the next
//! generation and commits it atomically.

use std::sync::Arc;

use concread::bptree::{BptreeMap, BptreeMapReadTxn, BptreeMapWriteTxn};

use crate::dn::Dn;

use super::aci::Aci;
use super::targets::is_target_applicable;

pub struct AciCache {
    tree: BptreeMap<Dn, Vec<Arc<Aci>>>,
}

pub struct AciCacheReadTxn<'a> {
    tree: BptreeMapReadTxn<'a, Dn, Vec<Arc<Aci>>>,
}

pub struct AciCacheWriteTxn<'a> {
    tree: BptreeMapWriteTxn<'a, Dn, Vec<Arc<Aci>>>,
}

impl Default for AciCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AciCache {
    pub fn new() -> Self {
        AciCache {
            tree: BptreeMap::new(),
        }
    }

    pub fn read(&self) -> AciCacheReadTxn<'_> {
        AciCacheReadTxn {
            tree: self.tree.read(),
        }
    }

    pub fn write(&self) -> AciCacheWriteTxn<'_> {
        AciCacheWriteTxn {
            tree: self.tree.write(),
        }
    }
}

/// Candidate retrieval, shared by read and write transactions so a writer
/// observes its own uncommitted changes.
pub trait AciCacheTransaction {
    fn lookup(&self, dn: &Dn) -> Option<&Vec<Arc<Aci>>>;

    /// Every policy anchored at `dn` or an ancestor, in per-DN insertion
    /// order, plus the global policies - where a global policy carries its
    /// own target, it is only returned when that target reaches the
    /// original `dn` being asked about.
    fn candidates(&self, dn: &Dn) -> Vec<Arc<Aci>> {
        let mut out = Vec::new();
        let mut cursor = Some(dn.clone());
        while let Some(d) = cursor {
            if d.is_null() {
                break;
            }
            if let Some(list) = self.lookup(&d) {
                out.extend(list.iter().cloned());
            }
            cursor = d.parent();
        }
        if let Some(globals) = self.lookup(&Dn::null()) {
            for g in globals {
                let applicable = match &g.targets.target {
                    Some(_) => is_target_applicable(g, dn),
                    None => true,
                };
                if applicable {
                    out.push(g.clone());
                }
            }
        }
        out
    }
}

impl AciCacheTransaction for AciCacheReadTxn<'_> {
    fn lookup(&self, dn: &Dn) -> Option<&Vec<Arc<Aci>>> {
        self.tree.get(dn)
    }
}

impl AciCacheTransaction for AciCacheWriteTxn<'_> {
    fn lookup(&self, dn: &Dn) -> Option<&Vec<Arc<Aci>>> {
        self.tree.get(dn)
    }
}

impl AciCacheWriteTxn<'_> {
    /// Append policies at `dn`, preserving anything already stored there.
    pub fn insert(&mut self, dn: Dn, acis: Vec<Arc<Aci>>) {
        if acis.is_empty() {
            return;
        }
        let merged = match self.tree.get(&dn) {
            Some(existing) => {
                let mut m = existing.clone();
                m.extend(acis);
                m
            }
            None => acis,
        };
        self.tree.insert(dn, merged);
    }

    pub fn remove(&mut self, dn: &Dn) {
        self.tree.remove(dn);
    }

    /// Remove every key at or under `dn`. Used when a backend holding that
    /// subtree is taken offline.
    pub fn remove_subtree(&mut self, dn: &Dn) {
        let doomed: Vec<Dn> = self
            .tree
            .iter()
            .filter(|(k, _)| k.is_descendant_or_self(dn))
            .map(|(k, _)| k.clone())
            .collect();
        for k in doomed {
            self.tree.remove(&k);
        }
    }

    /// Re-key every entry under `old_dn` below `new_dn`, re-decoding each
    /// policy against its new anchor. A policy that no longer decodes is
    /// dropped with a warning rather than failing the rename.
    pub fn rename(&mut self, old_dn: &Dn, new_dn: &Dn) {
        let moved: Vec<(Dn, Vec<Arc<Aci>>)> = self
            .tree
            .iter()
            .filter(|(k, _)| k.is_descendant_or_self(old_dn))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, list) in moved {
            self.tree.remove(&key);
            let new_key = match key.rebase(old_dn, new_dn) {
                Some(k) => k,
                None => continue,
            };
            let mut rekeyed = Vec::with_capacity(list.len());
            for aci in list {
                let new_anchor = aci
                    .anchor
                    .rebase(old_dn, new_dn)
                    .unwrap_or_else(|| new_key.clone());
                match Aci::decode(&aci.to_string(), new_anchor) {
                    Ok(n) => rekeyed.push(Arc::new(n)),
                    Err(e) => {
                        warn!(
                            aci = %aci.name,
                            err = %e,
                            "dropping aci that failed re-decode during rename"
                        );
                    }
                }
            }
            self.insert(new_key, rekeyed);
        }
    }

    pub fn clear(&mut self) {
        self.tree.clear();
    }

    pub fn commit(self) {
        self.tree.commit();
    }
}
