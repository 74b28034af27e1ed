//! Compute cache (C9): per-tree map from subtree identity (the
//! label-sorted leaf set under a node, via [`Tree::subtree_key`]) to its
//! last-computed inside vectors, so an NNI move that only disturbs a
//! local region doesn't force recomputation of the whole tree.
//!
//! Purely a performance layer: §4.8 is explicit that correctness of the
//! inside/outside recursions must not depend on it, so every entry here
//! is just a memo of a value [`crate::likelihood::inside::run_inside`]
//! would have recomputed anyway.

use crate::logprob::LogProb;
use crate::tree::Tree;
use std::collections::HashMap;

#[derive(Clone, Debug)]
struct Entry {
    l0: Vec<LogProb>,
    l1: Vec<LogProb>,
}

/// Owned by the NNI driver across a single topology-search iteration;
/// discarded whenever a topology change invalidates more than it's worth
/// patching up (§5's "owned by the EM driver across a single NNI
/// iteration" resource policy).
#[derive(Default)]
pub struct ComputeCache {
    entries: HashMap<String, Entry>,
}

impl ComputeCache {
    pub fn new() -> ComputeCache {
        ComputeCache::default()
    }

    /// Snapshots every node's current L0/L1 under its subtree key.
    pub fn fill(&mut self, tree: &Tree) {
        self.entries.clear();
        for v in 0..tree.num_nodes() {
            let key = tree.subtree_key(v);
            let anno = &tree.node(v).anno;
            self.entries.insert(
                key,
                Entry {
                    l0: anno.l0.clone(),
                    l1: anno.l1.clone(),
                },
            );
        }
    }

    /// Restores cached L0/L1 onto every node of `tree` whose subtree key
    /// is still present (i.e. whose leaf composition is unchanged since
    /// the last [`ComputeCache::fill`]). Returns the number of nodes hit.
    pub fn apply(&self, tree: &mut Tree) -> usize {
        let mut hits = 0;
        for v in 0..tree.num_nodes() {
            let key = tree.subtree_key(v);
            if let Some(entry) = self.entries.get(&key) {
                let anno = &mut tree.node_mut(v).anno;
                if anno.l0.len() == entry.l0.len() {
                    anno.l0 = entry.l0.clone();
                    anno.l1 = entry.l1.clone();
                    hits += 1;
                }
            }
        }
        hits
    }

    pub fn invalidate(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alpha::az_partition;
    use crate::likelihood::inside::run_inside;
    use crate::model::{CharMatrix, CharState, Params, PriorQ};

    fn quartet() -> (Tree, CharMatrix) {
        let tree = Tree::from_newick("((a:1,c:1):1,(b:1,d:1):1):0;").unwrap();
        let rows = vec![
            ("a".to_string(), vec![CharState::Edited(1)]),
            ("c".to_string(), vec![CharState::Edited(1)]),
            ("b".to_string(), vec![CharState::Edited(2)]),
            ("d".to_string(), vec![CharState::Edited(2)]),
        ];
        (tree, CharMatrix::new(rows).unwrap())
    }

    #[test]
    fn fill_then_apply_restores_untouched_subtrees() {
        let (mut tree, data) = quartet();
        tree.ensure_annotations(1);
        let postorder = tree.postorder();
        let rows = az_partition(
            &postorder,
            &|v| tree.is_leaf(v),
            &|v| tree.children(v),
            1,
            |v, site| data.get(tree.label(v), site),
        );
        for (v, row) in rows.into_iter().enumerate() {
            if !row.is_empty() {
                tree.node_mut(v).anno.alpha = row;
            }
        }
        let prior = PriorQ::uniform(&data);
        let params = Params::new(0.1, 0.05);
        run_inside(&mut tree, &data, &prior, params);

        let mut cache = ComputeCache::new();
        cache.fill(&tree);
        assert_eq!(cache.len(), tree.num_nodes());

        // wipe and restore: a fresh tree with the same topology/labels
        // should hit every subtree key.
        let mut tree2 = Tree::from_newick("((a:1,c:1):1,(b:1,d:1):1):0;").unwrap();
        tree2.ensure_annotations(1);
        let hits = cache.apply(&mut tree2);
        assert_eq!(hits, tree.num_nodes());
    }
}
