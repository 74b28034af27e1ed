//! The dynamic-programming likelihood engine: α-partition (C2) plus the
//! inside (C3), outside (C4), and posterior/sufficient-statistics (C5)
//! recursions, wired together the way `EM_solver.py::Estep` sequences
//! them.

pub mod inside;
pub mod outside;
pub mod posterior;

use crate::alpha::az_partition;
use crate::logprob::LogProb;
use crate::model::{CharMatrix, Params, PriorQ};
use crate::tree::Tree;

/// Re-runs the α-partition (C2). Must happen once per topology before any
/// E-step, and again after every accepted NNI move.
pub fn compute_alpha(tree: &mut Tree, data: &CharMatrix) {
    let postorder = tree.postorder();
    let rows = az_partition(
        &postorder,
        &|v| tree.is_leaf(v),
        &|v| tree.children(v),
        data.num_sites,
        |v, site| data.get(tree.label(v), site),
    );
    for (v, row) in rows.into_iter().enumerate() {
        if !row.is_empty() {
            tree.node_mut(v).anno.alpha = row;
        }
    }
}

/// Cheap check of the current log-likelihood: just the inside pass,
/// mirroring `EM_solver.py::lineage_llh`. Used by the EM driver both
/// before the loop starts and after each M-step.
pub fn lineage_llh(tree: &mut Tree, data: &CharMatrix, prior: &PriorQ, params: Params) -> f64 {
    inside::run_inside(tree, data, prior, params);
    let root = tree.root();
    tree.node(root)
        .anno
        .l0
        .iter()
        .map(|lp| lp.log_value())
        .sum()
}

/// Full E-step: inside, outside, posterior. Leaves every node's
/// `post0`/`post1`/`S0..S4` populated for the M-step, and returns the
/// resulting total log-likelihood.
pub fn run_estep(tree: &mut Tree, data: &CharMatrix, prior: &PriorQ, params: Params) -> f64 {
    inside::run_inside(tree, data, prior, params);
    outside::run_outside(tree, prior, params, data.num_sites);
    posterior::run_posterior(tree, data, params);
    let root = tree.root();
    tree.node(root)
        .anno
        .l0
        .iter()
        .map(|lp: &LogProb| lp.log_value())
        .sum()
}

/// Log-likelihood under the no-edit degenerate case (§8 scenario 6):
/// every site unedited at every leaf collapses the whole engine to a
/// closed form, useful as a sanity check independent of the DP.
pub fn no_edit_closed_form(tree: &Tree, num_leaves: usize, params: Params) -> f64 {
    let total_edge_length: f64 = (0..tree.num_nodes()).map(|v| tree.edge_length(v)).sum();
    -(1.0 + params.nu) * total_edge_length + num_leaves as f64 * (1.0 - params.phi).ln()
}
