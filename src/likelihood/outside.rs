//! Outside recursion (C4): preorder DP computing, per node and site,
//! log P(data outside subtree, node = 0) and (…, node = -1), using the
//! auxiliary A/X/out_alpha quantities.
//!
//! Grounded in `EM_solver.py::Estep_out_llh` and `__out_alpha_up__`. The
//! "walk up to a z-boundary, then fill back down" scheme for `out_alpha`
//! is reproduced almost line-for-line, since it is the one place this
//! component departs from a plain per-node recursion: the quantity is
//! defined only within one α-clade and is populated lazily.

use crate::alpha::Alpha;
use crate::logprob::{log_sum_exp, LogProb};
use crate::model::{Params, PriorQ};
use crate::tree::Tree;

pub fn run_outside(tree: &mut Tree, prior: &PriorQ, params: Params, num_sites: usize) {
    let preorder = tree.preorder();

    for &v in &preorder {
        if tree.is_root(v) {
            let ell = tree.edge_length(v);
            let a_aux = vec![LogProb::ZERO; num_sites];
            let mut x_aux = vec![LogProb::MIN; num_sites];
            let mut out0 = vec![LogProb::MIN; num_sites];
            let mut out1 = vec![LogProb::MIN; num_sites];
            for site in 0..num_sites {
                x_aux[site] = if params.nu * ell > 0.0 {
                    LogProb::from_log(-params.nu * ell) * LogProb::from_linear(1.0 - (-ell).exp())
                } else {
                    LogProb::MIN
                };
                out0[site] = LogProb::from_log(-(1.0 + params.nu) * ell);
                out1[site] = if params.nu * ell > 0.0 {
                    LogProb::from_linear(1.0 - (-ell * params.nu).exp())
                } else {
                    LogProb::MIN
                };
            }
            let node = tree.node_mut(v);
            node.anno.a_aux = a_aux;
            node.anno.x_aux = x_aux;
            node.anno.out0 = out0;
            node.anno.out1 = out1;
            continue;
        }

        let u = tree.parent(v).unwrap();
        let w = tree.sibling(v).unwrap();
        let ell = tree.edge_length(v);

        let mut a_aux = vec![LogProb::MIN; num_sites];
        let mut x_aux = vec![LogProb::MIN; num_sites];
        let mut out0 = vec![LogProb::MIN; num_sites];
        let mut out1 = vec![LogProb::MIN; num_sites];

        for site in 0..num_sites {
            let u_out0 = tree.node(u).anno.out0[site];
            let w_l0 = tree.node(w).anno.l0[site];
            let w_l1 = tree.node(w).anno.l1[site];
            let w_alpha = tree.node(w).anno.alpha[site];

            let a = u_out0 * w_l0;
            a_aux[site] = a;
            out0[site] = a * LogProb::from_log(-(1.0 + params.nu) * ell);
            let mut x = if ell > 0.0 {
                a * LogProb::from_log(-params.nu * ell) * LogProb::from_linear(1.0 - (-ell).exp())
            } else {
                LogProb::MIN
            };

            let o1 = match w_alpha {
                Alpha::Silent => {
                    if params.nu * ell > 0.0 {
                        a * LogProb::from_linear(1.0 - (-params.nu * ell).exp())
                    } else {
                        LogProb::MIN
                    }
                }
                Alpha::Masked => {
                    let u_x = tree.node(u).anno.x_aux[site];
                    x = log_sum_exp(&[x, u_x * w_l1 * LogProb::from_log(-params.nu * ell)]);
                    let p = if params.nu * ell > 0.0 {
                        1.0 - (-ell * params.nu).exp()
                    } else {
                        0.0
                    };
                    if params.nu == 0.0 {
                        tree.node(u).anno.out1[site]
                    } else {
                        let pl = LogProb::from_linear(p);
                        let u_out1 = tree.node(u).anno.out1[site];
                        log_sum_exp(&[pl * a, pl * u_x * w_l1, u_out1])
                    }
                }
                Alpha::Edited(alpha0) => {
                    ensure_out_alpha(tree, prior, params, site, alpha0, u);
                    let u_oa = *tree.node(u).anno.out_alpha[site].get(&alpha0).unwrap();
                    let q = prior.prob(site, alpha0);
                    let b = u_oa * LogProb::from_log(params.nu * (-ell)) * w_l1;
                    let c = if ell > 0.0 && q > 0.0 {
                        a * LogProb::from_log(-params.nu * ell)
                            * LogProb::from_linear(1.0 - (-ell).exp())
                            * LogProb::from_linear(q)
                    } else {
                        LogProb::MIN
                    };
                    let oa = log_sum_exp(&[b, c]);
                    tree.node_mut(v).anno.out_alpha[site].insert(alpha0, oa);
                    x = log_sum_exp(&[x, b]);
                    if params.nu * ell > 0.0 {
                        LogProb::from_linear(1.0 - (-params.nu * ell).exp())
                            * log_sum_exp(&[a, w_l1 * u_oa])
                    } else {
                        LogProb::MIN
                    }
                }
            };

            x_aux[site] = x;
            out1[site] = o1;
        }

        let node = tree.node_mut(v);
        node.anno.a_aux = a_aux;
        node.anno.x_aux = x_aux;
        node.anno.out0 = out0;
        node.anno.out1 = out1;
    }
}

/// Walks up from `start` (the node whose `out_alpha[site][alpha0]` is
/// requested) to the nearest z-boundary or the root, then fills every
/// node on that path on the way back down. Mirrors
/// `EM_solver.py::__out_alpha_up__`.
fn ensure_out_alpha(
    tree: &mut Tree,
    prior: &PriorQ,
    params: Params,
    site: usize,
    alpha0: i32,
    start: usize,
) {
    if tree.node(start).anno.out_alpha[site].contains_key(&alpha0) {
        return;
    }
    let mut path = Vec::new();
    let mut v = start;
    loop {
        if tree.is_root(v) {
            let ell = tree.edge_length(v);
            let q = prior.prob(site, alpha0);
            let val = if ell > 0.0 && q > 0.0 {
                LogProb::from_log(-params.nu * ell)
                    * LogProb::from_linear(1.0 - (-ell).exp())
                    * LogProb::from_linear(q)
            } else {
                LogProb::MIN
            };
            tree.node_mut(v).anno.out_alpha[site].insert(alpha0, val);
            break;
        }
        let parent = tree.parent(v).unwrap();
        let w = tree.sibling(v).unwrap();
        let w_alpha = tree.node(w).anno.alpha[site];
        let is_boundary = !matches!(w_alpha, Alpha::Masked) && w_alpha != Alpha::Edited(alpha0);
        if is_boundary {
            let ell = tree.edge_length(v);
            let a = tree.node(v).anno.a_aux[site];
            let q = prior.prob(site, alpha0);
            let val = if ell > 0.0 && q > 0.0 {
                a * LogProb::from_log(-params.nu * ell)
                    * LogProb::from_linear(1.0 - (-ell).exp())
                    * LogProb::from_linear(q)
            } else {
                LogProb::MIN
            };
            tree.node_mut(v).anno.out_alpha[site].insert(alpha0, val);
            break;
        }
        path.push(v);
        v = parent;
    }

    while let Some(v) = path.pop() {
        let u = tree.parent(v).unwrap();
        let w = tree.sibling(v).unwrap();
        let ell = tree.edge_length(v);
        let u_val = *tree.node(u).anno.out_alpha[site].get(&alpha0).unwrap();
        let w_l1 = tree.node(w).anno.l1[site];
        let b = u_val * LogProb::from_log(params.nu * (-ell)) * w_l1;
        let a = tree.node(v).anno.a_aux[site];
        let q = prior.prob(site, alpha0);
        let c = if ell > 0.0 && q > 0.0 {
            a * LogProb::from_log(-params.nu * ell)
                * LogProb::from_linear(1.0 - (-ell).exp())
                * LogProb::from_linear(q)
        } else {
            LogProb::MIN
        };
        let val = log_sum_exp(&[b, c]);
        tree.node_mut(v).anno.out_alpha[site].insert(alpha0, val);
    }
}
