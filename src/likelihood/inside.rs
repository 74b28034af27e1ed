//! Inside recursion (C3): postorder DP computing, per node and site,
//! log P(data below | node = 0) and log P(data below | node = -1).
//!
//! Grounded in `EM_solver.py::Estep_in_llh`; every `if factor > 0 else
//! min_llh` guard in the source becomes a call to [`LogProb::from_linear`],
//! which already substitutes [`crate::logprob::LogProb::MIN`] for a
//! non-positive factor.

use crate::alpha::Alpha;
use crate::logprob::{log_sum_exp, LogProb};
use crate::model::{CharMatrix, CharState, Params, PriorQ};
use crate::tree::Tree;

pub fn run_inside(tree: &mut Tree, data: &CharMatrix, prior: &PriorQ, params: Params) {
    let num_sites = data.num_sites;
    for v in tree.postorder() {
        let ell = tree.edge_length(v);
        let p = (-ell).exp();
        let is_leaf = tree.is_leaf(v);
        let label = tree.label(v).to_string();
        let children: Vec<usize> = tree.children(v).to_vec();

        let mut l0 = vec![LogProb::MIN; num_sites];
        let mut l1 = vec![LogProb::MIN; num_sites];

        for site in 0..num_sites {
            let alpha = tree.node(v).anno.alpha[site];
            let q = match alpha {
                Alpha::Edited(s) => prior.prob(site, s),
                _ => 1.0,
            };

            if is_leaf {
                let obs = data.get(&label, site);
                match alpha {
                    Alpha::Masked => {
                        let x = if matches!(obs, CharState::Missing) {
                            1.0 - (1.0 - params.phi) * p.powf(params.nu)
                        } else {
                            1.0 - p.powf(params.nu)
                        };
                        let lp = LogProb::from_linear(x);
                        l0[site] = lp;
                        l1[site] = lp;
                    }
                    Alpha::Silent => {
                        l0[site] = LogProb::from_log((params.nu + 1.0) * (-ell))
                            * LogProb::from_linear(1.0 - params.phi);
                        l1[site] = LogProb::MIN;
                    }
                    Alpha::Edited(_) => {
                        l0[site] = LogProb::from_log(params.nu * (-ell))
                            * LogProb::from_linear(1.0 - p)
                            * LogProb::from_linear(q)
                            * LogProb::from_linear(1.0 - params.phi);
                        l1[site] = LogProb::from_log(params.nu * (-ell))
                            * LogProb::from_linear(1.0 - params.phi);
                    }
                }
            } else {
                let (sum0, sum1) = children.iter().fold(
                    (LogProb::ZERO, LogProb::ZERO),
                    |(s0, s1), &c| {
                        let anno = &tree.node(c).anno;
                        (s0 * anno.l0[site], s1 * anno.l1[site])
                    },
                );

                let term_z = sum0 * LogProb::from_log((params.nu + 1.0) * (-ell));
                let term_alpha = if !matches!(alpha, Alpha::Silent) {
                    sum1 * LogProb::from_log(params.nu * (-ell))
                        * LogProb::from_linear(1.0 - p)
                        * LogProb::from_linear(q)
                } else {
                    LogProb::MIN
                };
                let term_masked = if matches!(alpha, Alpha::Masked) {
                    LogProb::from_linear(1.0 - p.powf(params.nu))
                } else {
                    LogProb::MIN
                };
                l0[site] = log_sum_exp(&[term_z, term_alpha, term_masked]);

                l1[site] = if matches!(alpha, Alpha::Silent) {
                    LogProb::MIN
                } else if !matches!(alpha, Alpha::Masked) || params.nu == 0.0 || p == 1.0 {
                    sum1 * LogProb::from_log(params.nu * (-ell))
                } else {
                    log_sum_exp(&[
                        sum1 * LogProb::from_log(params.nu * (-ell)),
                        LogProb::from_linear(1.0 - p.powf(params.nu)),
                    ])
                };
            }
        }

        let node = tree.node_mut(v);
        node.anno.l0 = l0;
        node.anno.l1 = l1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alpha::az_partition;

    fn two_leaf_tree() -> Tree {
        Tree::from_newick("(a:1.0,b:1.0):1.0;").unwrap()
    }

    fn partition(tree: &mut Tree, data: &CharMatrix) {
        let postorder = tree.postorder();
        let alpha = az_partition(
            &postorder,
            &|v| tree.is_leaf(v),
            &|v| tree.children(v),
            data.num_sites,
            |v, site| data.get(tree.label(v), site),
        );
        for (v, row) in alpha.into_iter().enumerate() {
            if !row.is_empty() {
                tree.node_mut(v).anno.alpha = row;
            }
        }
    }

    #[test]
    fn root_llh_is_finite_for_matching_edits() {
        let mut tree = two_leaf_tree();
        let rows = vec![
            ("a".to_string(), vec![CharState::Edited(1)]),
            ("b".to_string(), vec![CharState::Edited(1)]),
        ];
        let data = CharMatrix::new(rows).unwrap();
        tree.ensure_annotations(1);
        partition(&mut tree, &data);
        let prior = PriorQ::uniform(&data);
        let params = Params::new(0.1, 0.01);
        run_inside(&mut tree, &data, &prior, params);
        let root = tree.root();
        assert!(tree.node(root).anno.l0[0].log_value().is_finite());
    }

    #[test]
    fn disagreeing_edits_make_root_alpha_silent_and_l1_min() {
        let mut tree = two_leaf_tree();
        let rows = vec![
            ("a".to_string(), vec![CharState::Edited(1)]),
            ("b".to_string(), vec![CharState::Edited(2)]),
        ];
        let data = CharMatrix::new(rows).unwrap();
        tree.ensure_annotations(1);
        partition(&mut tree, &data);
        let root = tree.root();
        assert_eq!(tree.node(root).anno.alpha[0], Alpha::Silent);
        let prior = PriorQ::uniform(&data);
        let params = Params::new(0.1, 0.01);
        run_inside(&mut tree, &data, &prior, params);
        assert!(tree.node(root).anno.l1[0].is_min());
    }
}
