//! Disjoint-set forest over concept identifiers

use std::collections::{BTreeMap, BTreeSet};

use crate::domain::ConceptId;

#[derive(Debug, Clone, Default)]
pub struct UnionFind {
    parent: BTreeMap<ConceptId, ConceptId>,
    rank: BTreeMap<ConceptId, u32>,
}

impl UnionFind {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root of the set containing `id`, inserting it as a singleton if unseen
    pub fn find(&mut self, id: &ConceptId) -> ConceptId {
        let mut root = id.clone();
        loop {
            match self.parent.get(&root) {
                Some(parent) if parent != &root => root = parent.clone(),
                Some(_) => break,
                None => {
                    self.parent.insert(root.clone(), root.clone());
                    break;
                }
            }
        }

        // path compression
        let mut current = id.clone();
        while current != root {
            let next = self.parent.insert(current, root.clone());
            match next {
                Some(next) => current = next,
                None => break,
            }
        }
        root
    }

    /// Merge the sets of `a` and `b`; returns `false` if already joined
    pub fn union(&mut self, a: &ConceptId, b: &ConceptId) -> bool {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return false;
        }

        let rank_a = self.rank.get(&root_a).copied().unwrap_or(0);
        let rank_b = self.rank.get(&root_b).copied().unwrap_or(0);
        if rank_a < rank_b {
            self.parent.insert(root_a, root_b);
        } else {
            if rank_a == rank_b {
                self.rank.insert(root_a.clone(), rank_a + 1);
            }
            self.parent.insert(root_b, root_a);
        }
        true
    }

    /// Every set with more than one member
    pub fn groups(&mut self) -> Vec<BTreeSet<ConceptId>> {
        let ids: Vec<ConceptId> = self.parent.keys().cloned().collect();
        let mut by_root: BTreeMap<ConceptId, BTreeSet<ConceptId>> = BTreeMap::new();
        for id in ids {
            let root = self.find(&id);
            by_root.entry(root).or_default().insert(id);
        }
        by_root.into_values().filter(|g| g.len() > 1).collect()
    }
}
