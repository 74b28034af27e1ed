//! Posteriors and sufficient statistics (C5): per-node per-site
//! `post0`/`post1` and the S0..S4 statistics the M-step's convex program
//! consumes.
//!
//! Grounded in `EM_solver.py::Estep_posterior`; the closed forms for S0..S4
//! are reproduced exactly rather than re-derived, matching the note in
//! `EM_solver.py` that implementations must use them verbatim.

use crate::alpha::Alpha;
use crate::logprob::LogProb;
use crate::model::{CharMatrix, CharState, Params};
use crate::tree::Tree;

pub fn run_posterior(tree: &mut Tree, data: &CharMatrix, params: Params) {
    let num_sites = data.num_sites;
    let root = tree.root();
    let full: Vec<LogProb> = tree.node(root).anno.l0.clone();

    for v in tree.preorder() {
        let is_leaf = tree.is_leaf(v);
        let is_root = tree.is_root(v);
        let label = tree.label(v).to_string();
        let parent = tree.parent(v);
        let ell = tree.edge_length(v);
        let children: Vec<usize> = tree.children(v).to_vec();

        let mut post0 = vec![LogProb::MIN; num_sites];
        let mut post1 = vec![LogProb::MIN; num_sites];
        let mut s0 = vec![0.0; num_sites];
        let mut s1 = vec![0.0; num_sites];
        let mut s2 = vec![0.0; num_sites];
        let mut s3 = vec![0.0; num_sites];
        let mut s4 = vec![0.0; num_sites];

        for site in 0..num_sites {
            let alpha = tree.node(v).anno.alpha[site];
            let is_masked = matches!(alpha, Alpha::Masked);

            let v_in0: LogProb = if is_leaf {
                match data.get(&label, site) {
                    CharState::Unedited => LogProb::from_linear(1.0 - params.phi),
                    CharState::Missing => {
                        if params.phi > 0.0 {
                            LogProb::from_linear(params.phi)
                        } else {
                            LogProb::MIN
                        }
                    }
                    CharState::Edited(_) => LogProb::MIN,
                }
            } else {
                children
                    .iter()
                    .fold(LogProb::ZERO, |acc, &c| acc * tree.node(c).anno.l0[site])
            };

            let out0 = tree.node(v).anno.out0[site];
            let out1 = tree.node(v).anno.out1[site];
            post0[site] = v_in0 * out0 - full[site];
            post1[site] = if is_masked { out1 - full[site] } else { LogProb::MIN };

            let l0v = tree.node(v).anno.l0[site];
            if matches!(alpha, Alpha::Silent) {
                s0[site] = 1.0;
            } else if is_root {
                let s0v = (v_in0 * LogProb::from_log((params.nu + 1.0) * (-ell)) - l0v).exp();
                let s2v = if !is_masked {
                    0.0
                } else {
                    (1.0 - (-params.nu * ell).exp()) / l0v.exp()
                };
                s0[site] = s0v;
                s2[site] = s2v;
                s1[site] = 1.0 - s0v - s2v;
            } else {
                let u = parent.unwrap();
                let u_post0 = tree.node(u).anno.post0[site];
                let s0v = (u_post0 * v_in0 * LogProb::from_log((params.nu + 1.0) * (-ell)) - l0v).exp();
                let (s2v, s4v) = if !is_masked {
                    (0.0, 0.0)
                } else {
                    let l1v = tree.node(v).anno.l1[site];
                    let u_post1 = tree.node(u).anno.post1[site];
                    let s2v = (u_post0 - l0v).exp() * (1.0 - (-params.nu * ell).exp());
                    let s4v = (1.0 - u_post0.exp() - u_post1.exp()) * (1.0 - (-params.nu * ell).exp())
                        / l1v.exp();
                    (s2v, s4v)
                };
                let s1v = u_post0.exp() - s0v - s2v;
                let s3v = 1.0 - s0v - s1v - post1[site].exp();
                s0[site] = s0v;
                s1[site] = s1v;
                s2[site] = s2v;
                s3[site] = s3v;
                s4[site] = s4v;
            }
        }

        let node = tree.node_mut(v);
        node.anno.post0 = post0;
        node.anno.post1 = post1;
        node.anno.s0 = s0;
        node.anno.s1 = s1;
        node.anno.s2 = s2;
        node.anno.s3 = s3;
        node.anno.s4 = s4;
    }
}

#[cfg(test)]
mod tests {
    use super::super::{compute_alpha, inside::run_inside, outside::run_outside};
    use super::*;
    use crate::model::PriorQ;

    #[test]
    fn post0_at_root_matches_log_likelihood() {
        let mut tree = Tree::from_newick("(a:1.0,b:1.0):1.0;").unwrap();
        let rows = vec![
            ("a".to_string(), vec![CharState::Edited(1)]),
            ("b".to_string(), vec![CharState::Edited(1)]),
        ];
        let data = CharMatrix::new(rows).unwrap();
        tree.ensure_annotations(1);
        compute_alpha(&mut tree, &data);
        let prior = PriorQ::uniform(&data);
        let params = Params::new(0.1, 0.01);
        run_inside(&mut tree, &data, &prior, params);
        run_outside(&mut tree, &prior, params, 1);
        run_posterior(&mut tree, &data, params);
        let root = tree.root();
        // post0 at the root is v_in0 + out0 - full; out0 at root has no
        // evidence term so this should collapse to a value close to 0
        // in log-space (certainty the root is unmutated given the data).
        assert!(tree.node(root).anno.post0[0].log_value() <= 1e-6);
    }
}
