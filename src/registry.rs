//! Case-insensitive string-keyed registries.
//!
//! Command tables, CTCP type tables, and the per-network conversation set
//! all share this shape: a map whose keys compare under a caller-chosen
//! [`Casemapping`]. The mapping is carried per instance rather than through
//! any global state, so two registries on the same network can disagree
//! (command names are always ASCII; conversation names follow the server).

use std::collections::HashMap;

use crate::casemap::Casemapping;

/// A string-keyed associative store with pluggable canonicalization.
///
/// Keys are folded on insert and on lookup; the original spelling of the
/// key is retained alongside the value for display purposes.
#[derive(Clone, Debug)]
pub struct Registry<T> {
    casemap: Casemapping,
    map: HashMap<String, (String, T)>,
}

impl<T> Registry<T> {
    /// Create an empty registry using the given case mapping.
    pub fn new(casemap: Casemapping) -> Self {
        Registry {
            casemap,
            map: HashMap::new(),
        }
    }

    /// The case mapping currently in force.
    pub fn casemapping(&self) -> Casemapping {
        self.casemap
    }

    /// Insert a value, replacing and returning any previous entry for an
    /// equivalent key.
    pub fn insert(&mut self, key: &str, value: T) -> Option<T> {
        self.map
            .insert(self.casemap.fold(key), (key.to_string(), value))
            .map(|(_, v)| v)
    }

    /// Look up a value by key.
    pub fn get(&self, key: &str) -> Option<&T> {
        self.map.get(&self.casemap.fold(key)).map(|(_, v)| v)
    }

    /// Look up a value mutably by key.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        self.map.get_mut(&self.casemap.fold(key)).map(|(_, v)| v)
    }

    /// Remove an entry, returning its value if present.
    pub fn remove(&mut self, key: &str) -> Option<T> {
        self.map.remove(&self.casemap.fold(key)).map(|(_, v)| v)
    }

    /// Whether an equivalent key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(&self.casemap.fold(key))
    }

    /// Re-key an entry, preserving its value. Returns false if the old key
    /// was absent or the new key is already taken by a different entry.
    pub fn rename(&mut self, old: &str, new: &str) -> bool {
        let old_folded = self.casemap.fold(old);
        let new_folded = self.casemap.fold(new);
        if old_folded != new_folded && self.map.contains_key(&new_folded) {
            return false;
        }
        match self.map.remove(&old_folded) {
            Some((_, v)) => {
                self.map.insert(new_folded, (new.to_string(), v));
                true
            }
            None => false,
        }
    }

    /// Swap in a new case mapping, re-folding every key.
    ///
    /// If two existing keys collide under the new mapping, the survivor is
    /// unspecified; the server declares its mapping before any names are
    /// tracked, so this is a startup-order concern only.
    pub fn set_casemapping(&mut self, casemap: Casemapping) {
        if casemap == self.casemap {
            return;
        }
        self.casemap = casemap;
        let old = std::mem::take(&mut self.map);
        for (_, (name, value)) in old {
            self.map.insert(casemap.fold(&name), (name, value));
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate over `(original_key, value)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.map.values().map(|(name, v)| (name.as_str(), v))
    }

    /// Iterate mutably over values.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.map.values_mut().map(|(_, v)| v)
    }

    /// Drain all entries, yielding `(original_key, value)` pairs.
    pub fn drain(&mut self) -> impl Iterator<Item = (String, T)> + '_ {
        self.map.drain().map(|(_, (name, v))| (name, v))
    }
}
