//! EM driver (C7): alternates E-step and M-step until the log-likelihood
//! converges, with multi-start over random initial points.
//!
//! Grounded in `EM_solver.py::EM_optimization`/`optimize_one` for the
//! convergence loop, and in `pta/experiments.rs`'s pattern of seeding an
//! `StdRng` from an explicit seed before sampling a fresh
//! starting point, generalized here from transition-probability sampling
//! to ν/φ/branch-length initialization.

use crate::error::{LamlError, Result};
use crate::likelihood;
use crate::model::{CharMatrix, Params, PriorQ};
use crate::mstep;
use crate::tree::{Tree, DMAX, DMIN};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

pub const DEFAULT_MAX_ITER: usize = 1000;
pub const DEFAULT_CONV_EPS: f64 = 1e-3;

#[derive(Clone, Copy, Debug)]
pub struct EmOptions {
    pub max_iter: usize,
    pub conv_eps: f64,
    pub fit_phi: bool,
    pub fit_nu: bool,
    pub ultrametric: bool,
}

impl Default for EmOptions {
    fn default() -> Self {
        EmOptions {
            max_iter: DEFAULT_MAX_ITER,
            conv_eps: DEFAULT_CONV_EPS,
            fit_phi: true,
            fit_nu: true,
            ultrametric: false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EmResult {
    pub neg_log_likelihood: f64,
    pub params: Params,
    pub iterations: usize,
    pub converged: bool,
}

/// Runs EM to convergence starting from the tree's current branch
/// lengths and `params`, mutating the tree's edge lengths in place.
/// α-partition is recomputed once up front; callers that mutate topology
/// (the NNI driver) must call [`likelihood::compute_alpha`] again
/// themselves before the next run.
pub fn run_em(
    tree: &mut Tree,
    data: &CharMatrix,
    prior: &PriorQ,
    mut params: Params,
    opts: EmOptions,
) -> Result<EmResult> {
    tree.ensure_annotations(data.num_sites);
    likelihood::compute_alpha(tree, data);

    let constraint = if opts.ultrametric {
        let (edges, _) = mstep::collect_edge_stats(tree, data.num_sites);
        Some(mstep::ultrametric_constraint(tree, &edges))
    } else {
        None
    };

    let mut prev_llh = likelihood::lineage_llh(tree, data, prior, params);
    debug!(llh = prev_llh, nu = params.nu, phi = params.phi, "EM initial state");

    let mut iter = 1;
    let mut converged = false;
    while iter <= opts.max_iter {
        likelihood::run_estep(tree, data, prior, params);
        params = mstep::mstep(tree, data, params, opts.fit_phi, opts.fit_nu, constraint.as_ref())?;
        let curr_llh = likelihood::lineage_llh(tree, data, prior, params);

        if prev_llh != 0.0 && ((curr_llh - prev_llh) / prev_llh).abs() < opts.conv_eps {
            converged = true;
            prev_llh = curr_llh;
            break;
        }
        prev_llh = curr_llh;
        iter += 1;
    }

    if !converged {
        warn!(max_iter = opts.max_iter, "EM did not converge");
    }

    Ok(EmResult {
        neg_log_likelihood: -prev_llh,
        params,
        iterations: iter.min(opts.max_iter),
        converged,
    })
}

/// Draws a fresh random starting point: branch lengths uniform in
/// `[DMIN, 1.0]` (never `DMAX`, matching `ML_solver.ini_brlen`'s use of a
/// short initial guess so the optimizer has somewhere to climb from), and
/// ν/φ each uniform over their bounded ranges unless fixed.
pub fn random_initial_point(
    tree: &mut Tree,
    rng: &mut StdRng,
    fixed_phi: Option<f64>,
    fixed_nu: Option<f64>,
) -> Params {
    for v in 0..tree.num_nodes() {
        if !tree.is_marked(v) {
            let d: f64 = rng.gen_range(DMIN..1.0_f64.min(DMAX));
            tree.set_edge_length(v, d);
        }
    }
    let nu = fixed_nu.unwrap_or_else(|| rng.gen_range(0.0..2.0_f64.min(Params::NU_MAX)));
    let phi = fixed_phi.unwrap_or_else(|| rng.gen_range(0.0..0.5_f64.min(Params::PHI_MAX)));
    Params::new(nu, phi)
}

/// Multi-start EM (§4.6): tries `initials` random seeds, keeps the best
/// scoring result, retries the whole batch up to `max_trials` times if
/// every seed fails.
pub fn run_em_multistart(
    tree_template: &Tree,
    data: &CharMatrix,
    prior: &PriorQ,
    opts: EmOptions,
    initials: usize,
    seeds: &[u64],
    fixed_phi: Option<f64>,
    fixed_nu: Option<f64>,
    max_trials: usize,
) -> Result<(Tree, EmResult)> {
    for _trial in 0..max_trials.max(1) {
        let mut best: Option<(Tree, EmResult)> = None;
        for i in 0..initials {
            let seed = seeds.get(i).copied().unwrap_or(i as u64);
            let mut rng = StdRng::seed_from_u64(seed);
            let mut tree = tree_template.clone();
            let params = random_initial_point(&mut tree, &mut rng, fixed_phi, fixed_nu);
            let em_opts = EmOptions {
                fit_phi: fixed_phi.is_none() && opts.fit_phi,
                fit_nu: fixed_nu.is_none() && opts.fit_nu,
                ..opts
            };
            match run_em(&mut tree, data, prior, params, em_opts) {
                Ok(result) => {
                    let better = best
                        .as_ref()
                        .map(|(_, b)| result.neg_log_likelihood < b.neg_log_likelihood)
                        .unwrap_or(true);
                    if better {
                        best = Some((tree, result));
                    }
                }
                Err(e) => {
                    warn!(seed, error = %e, "EM trial failed");
                }
            }
        }
        if let Some(found) = best {
            return Ok(found);
        }
    }
    Err(LamlError::AllTrialsFailed { trials: max_trials })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CharState;

    #[test]
    fn em_improves_or_holds_likelihood_on_no_edit_data() {
        let mut tree = Tree::from_newick("((a:1.0,b:1.0):1.0,(c:1.0,d:1.0):1.0):0.0;").unwrap();
        let rows = vec![
            ("a".to_string(), vec![CharState::Unedited; 2]),
            ("b".to_string(), vec![CharState::Unedited; 2]),
            ("c".to_string(), vec![CharState::Unedited; 2]),
            ("d".to_string(), vec![CharState::Unedited; 2]),
        ];
        let data = CharMatrix::new(rows).unwrap();
        let prior = PriorQ::uniform(&data);
        let params = Params::new(0.2, 0.1);
        let opts = EmOptions { max_iter: 5, ..EmOptions::default() };
        let result = run_em(&mut tree, &data, &prior, params, opts).unwrap();
        assert!(result.neg_log_likelihood.is_finite());
    }
}
