//! The per-site alpha-partition (C2): tags every node with the state its
//! subtree has "settled into" at one character site.
//!
//! `pta/mod.rs` represents a PTA's states and symbols as opaque, comparable
//! `Q`/`T` type parameters; here the three cases the DP
//! distinguishes -- silenced, masked, or committed to a concrete edited
//! state -- are a closed, three-way tagged enum rather than the original
//! Python's `'z'`/`'?'`/int sentinels (see the design notes on replacing
//! string sentinels with a variant to eliminate comparison bugs).

use crate::model::CharState;
use std::collections::HashSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Alpha {
    /// A z-branch: this site has already mixed into more than one target
    /// state somewhere beneath this node.
    Silent,
    /// Missing/unresolved: every observation beneath this node at this site
    /// is either missing or the node itself has no informative descendant.
    Masked,
    /// Committed to a single mutated state.
    Edited(i32),
}

impl Alpha {
    fn from_leaf(obs: CharState) -> Alpha {
        match obs {
            CharState::Unedited => Alpha::Silent,
            CharState::Missing => Alpha::Masked,
            CharState::Edited(s) => Alpha::Edited(s),
        }
    }
}

/// Computes `node.alpha[site]` for every node, postorder, per §4.1/§3.
///
/// `leaf_obs(node_index, site)` supplies the observed character state at a
/// leaf; it is never called for internal nodes.
pub fn az_partition<F>(
    postorder: &[usize],
    is_leaf: &dyn Fn(usize) -> bool,
    children: &dyn Fn(usize) -> &[usize],
    num_sites: usize,
    mut leaf_obs: F,
) -> Vec<Vec<Alpha>>
where
    F: FnMut(usize, usize) -> CharState,
{
    let n = postorder.len();
    let max_index = postorder.iter().copied().max().map_or(0, |m| m + 1);
    let mut alpha: Vec<Vec<Alpha>> = vec![Vec::new(); max_index.max(n)];

    for &v in postorder {
        let mut row = Vec::with_capacity(num_sites);
        if is_leaf(v) {
            for site in 0..num_sites {
                row.push(Alpha::from_leaf(leaf_obs(v, site)));
            }
        } else {
            let kids = children(v);
            for site in 0..num_sites {
                let s: HashSet<Alpha> =
                    kids.iter().map(|&c| alpha[c][site]).collect();
                let has_z = s.contains(&Alpha::Silent);
                let r: Vec<Alpha> = s
                    .iter()
                    .copied()
                    .filter(|a| !matches!(a, Alpha::Silent | Alpha::Masked))
                    .collect();
                let tag = if has_z || r.len() > 1 {
                    Alpha::Silent
                } else if r.len() == 1 {
                    r[0]
                } else {
                    Alpha::Masked
                };
                row.push(tag);
            }
        }
        alpha[v] = row;
    }
    alpha
}

#[cfg(test)]
mod tests {
    use super::*;

    // tiny 3-node tree: root -> [leaf0, leaf1]
    fn fixture(obs: Vec<(CharState, CharState)>) -> Vec<Vec<Alpha>> {
        let num_sites = obs.len();
        let postorder = vec![0usize, 1, 2]; // leaf0, leaf1, root
        let children_of = |v: usize| -> &[usize] {
            static C: [usize; 2] = [0, 1];
            if v == 2 {
                &C
            } else {
                &[]
            }
        };
        let is_leaf = |v: usize| v != 2;
        az_partition(&postorder, &is_leaf, &children_of, num_sites, |node, site| {
            if node == 0 {
                obs[site].0
            } else {
                obs[site].1
            }
        })
    }

    #[test]
    fn both_unedited_is_silent_at_root() {
        let alpha = fixture(vec![(CharState::Unedited, CharState::Unedited)]);
        assert_eq!(alpha[2][0], Alpha::Silent);
    }

    #[test]
    fn agreeing_edits_propagate_up() {
        let alpha = fixture(vec![(CharState::Edited(3), CharState::Edited(3))]);
        assert_eq!(alpha[2][0], Alpha::Edited(3));
    }

    #[test]
    fn disagreeing_edits_are_silent() {
        let alpha = fixture(vec![(CharState::Edited(3), CharState::Edited(4))]);
        assert_eq!(alpha[2][0], Alpha::Silent);
    }

    #[test]
    fn all_missing_is_masked() {
        let alpha = fixture(vec![(CharState::Missing, CharState::Missing)]);
        assert_eq!(alpha[2][0], Alpha::Masked);
    }

    #[test]
    fn one_missing_one_edited_commits_to_the_edit() {
        let alpha = fixture(vec![(CharState::Missing, CharState::Edited(1))]);
        assert_eq!(alpha[2][0], Alpha::Edited(1));
    }
}
