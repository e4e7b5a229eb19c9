//! Ordered parameter maps.

use std::collections::BTreeMap;

use crate::param::Param;

/// Ordered mapping from dotted parameter name to tensor, as in a PyTorch `state_dict`.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    entries: BTreeMap<String, Param>,
}

impl StateDict {
    /// Creates an empty state dict.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entry, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, param: Param) -> Option<Param> {
        self.entries.insert(name.into(), param)
    }

    /// Looks up an entry.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Param> {
        self.entries.get(name)
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Param> {
        self.entries.get_mut(name)
    }

    /// Removes an entry.
    pub fn remove(&mut self, name: &str) -> Option<Param> {
        self.entries.remove(name)
    }

    /// Returns `true` if `name` is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Param)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Total element count over all entries.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.entries.values().map(Param::numel).sum()
    }
}

impl FromIterator<(String, Param)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (String, Param)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for StateDict {
    type Item = (String, Param);
    type IntoIter = std::collections::btree_map::IntoIter<String, Param>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
