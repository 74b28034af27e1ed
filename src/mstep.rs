//! Convex optimization of branch lengths, ν, and φ (C6).
//!
//! The per-edge terms of the M-step objective never couple across edges
//! except through the optional ultrametric constraint, so the
//! unconstrained case is solved edge-by-edge via bisection on the
//! derivative of a concave 1-D function rather than a general-purpose QP.
//! `pfa.rs` leans on `nalgebra` for its transition-matrix linear algebra;
//! this module reuses it for the ultrametric projection step
//! (`DMatrix::pseudo_inverse`), matching the design notes' suggestion of a
//! custom projected-Newton/projected-gradient solver over the separable
//! form.

use crate::error::{LamlError, Result};
use crate::model::{CharMatrix, CharState, Params};
use crate::tree::{Tree, DMAX, DMIN};
use nalgebra::DMatrix;
use std::collections::HashMap;

const EPS_NU: f64 = 1e-5;
const EPS_S: f64 = 1e-6;

#[derive(Clone, Copy, Debug)]
pub struct EdgeStats {
    pub s0: f64,
    pub s1: f64,
    pub s2: f64,
    pub s3: f64,
    pub s4: f64,
}

/// Sums each unmarked edge's per-site S0..S4 and renormalizes so the five
/// statistics sum to `num_sites` (uniform mass per edge), per §4.5.
pub fn collect_edge_stats(tree: &Tree, num_sites: usize) -> (Vec<usize>, Vec<EdgeStats>) {
    let mut edges = Vec::new();
    let mut stats = Vec::new();
    for v in tree.postorder() {
        if tree.is_marked(v) {
            continue;
        }
        let anno = &tree.node(v).anno;
        let mut s = [
            anno.s0.iter().sum::<f64>(),
            anno.s1.iter().sum::<f64>(),
            anno.s2.iter().sum::<f64>(),
            anno.s3.iter().sum::<f64>(),
            anno.s4.iter().sum::<f64>(),
        ];
        for x in &mut s {
            *x = x.max(EPS_S);
        }
        let total: f64 = s.iter().sum();
        for x in &mut s {
            *x = *x / total * num_sites as f64;
        }
        edges.push(v);
        stats.push(EdgeStats {
            s0: s[0],
            s1: s[1],
            s2: s[2],
            s3: s[3],
            s4: s[4],
        });
    }
    (edges, stats)
}

/// Closed-form update of φ from leaf posteriors, per §4.5 step 1.
pub fn update_phi(tree: &Tree, data: &CharMatrix) -> f64 {
    let mut r_sum = 0.0;
    let mut r_tilde_sum = 0.0;
    for v in tree.leaves() {
        let label = tree.label(v).to_string();
        let anno = &tree.node(v).anno;
        let mut r = 0usize;
        let mut r_tilde = 0.0;
        for site in 0..data.num_sites {
            if !matches!(data.get(&label, site), CharState::Missing) {
                r += 1;
            } else {
                r_tilde += 1.0 - anno.post1[site].exp();
            }
        }
        r_sum += r as f64;
        r_tilde_sum += r_tilde;
    }
    let mut phi = if r_sum + r_tilde_sum > 0.0 {
        r_tilde_sum / (r_sum + r_tilde_sum)
    } else {
        0.0
    };
    let k = data.num_sites as f64;
    let n = data.num_cells() as f64;
    if k * n > 0.0 && phi.abs() < 1.0 / (k * n) {
        phi = 0.0;
    }
    phi.clamp(0.0, Params::PHI_MAX)
}

fn edge_objective_derivative(nu: f64, s: &EdgeStats, d: f64) -> f64 {
    let mut g = -(nu + 1.0) * s.s0;
    let e_d = (-d).exp();
    g += s.s1 * (e_d / (1.0 - e_d) - nu);
    if nu > EPS_NU && s.s2 > 0.0 {
        let e_nd = (-nu * d).exp();
        g += s.s2 * nu * e_nd / (1.0 - e_nd);
    }
    g -= nu * s.s3;
    if nu > EPS_NU && s.s4 > 0.0 {
        let e_nd = (-nu * d).exp();
        g += s.s4 * nu * e_nd / (1.0 - e_nd);
    }
    g
}

fn nu_objective_derivative(d: &[f64], stats: &[EdgeStats], nu: f64) -> f64 {
    let mut g = 0.0;
    for (di, s) in d.iter().zip(stats) {
        g += -s.s0 * di - s.s1 * di - s.s3 * di;
        if s.s2 > 0.0 {
            let e_nd = (-nu * di).exp();
            g += s.s2 * di * e_nd / (1.0 - e_nd);
        }
        if s.s4 > 0.0 {
            let e_nd = (-nu * di).exp();
            g += s.s4 * di * e_nd / (1.0 - e_nd);
        }
    }
    g
}

/// Finds the root of a monotonically decreasing function `f` over
/// `[lo, hi]` by bisection, clamping to the boundary when `f` doesn't
/// change sign across the interval (the maximizer sits at that boundary).
fn bisect_root(lo: f64, hi: f64, f: impl Fn(f64) -> f64, iters: usize) -> f64 {
    let flo = f(lo);
    let fhi = f(hi);
    if flo <= 0.0 {
        return lo;
    }
    if fhi >= 0.0 {
        return hi;
    }
    let (mut a, mut b) = (lo, hi);
    for _ in 0..iters {
        let mid = 0.5 * (a + b);
        if f(mid) > 0.0 {
            a = mid;
        } else {
            b = mid;
        }
    }
    0.5 * (a + b)
}

/// Unconstrained branch-length optimization: every edge decouples, so
/// each is solved independently.
pub fn optimize_branch_lengths(nu: f64, stats: &[EdgeStats]) -> Vec<f64> {
    stats
        .iter()
        .map(|s| bisect_root(DMIN, DMAX, |d| edge_objective_derivative(nu, s, d), 80))
        .collect()
}

/// Projected-gradient ascent over the separable objective subject to
/// `constraint @ d == 0` (the ultrametric case), clamping into
/// `[DMIN, DMAX]` every step.
pub fn optimize_branch_lengths_ultrametric(
    nu: f64,
    stats: &[EdgeStats],
    constraint: &DMatrix<f64>,
    init: &[f64],
) -> Vec<f64> {
    let n = stats.len();
    let mut d: Vec<f64> = init.to_vec();
    let step = 5e-3;
    let constraint_t = constraint.transpose();
    let mmt = constraint * &constraint_t;
    let mmt_pinv = mmt.pseudo_inverse(1e-10).ok();

    for _ in 0..800 {
        let grad: Vec<f64> = stats
            .iter()
            .zip(&d)
            .map(|(s, &di)| edge_objective_derivative(nu, s, di))
            .collect();
        for i in 0..n {
            d[i] += step * grad[i];
        }
        if constraint.nrows() > 0 {
            if let Some(ref pinv) = mmt_pinv {
                let dv = DMatrix::from_column_slice(n, 1, &d);
                let mv = constraint * &dv;
                let correction = &constraint_t * pinv * &mv;
                for i in 0..n {
                    d[i] -= correction[i];
                }
            }
        }
        for x in &mut d {
            *x = x.clamp(DMIN, DMAX);
        }
    }
    d
}

/// One-dimensional optimization of ν given fixed branch lengths.
pub fn optimize_nu(d: &[f64], stats: &[EdgeStats]) -> f64 {
    bisect_root(
        Params::NU_MIN,
        Params::NU_MAX,
        |nu| nu_objective_derivative(d, stats, nu),
        80,
    )
}

/// Builds the ultrametric constraint matrix `M` such that `M @ d == 0`
/// enforces equal root-to-leaf distances, following
/// `EM_solver.py::ultrametric_constr`'s recursive accumulation of
/// per-child path-length vectors. Edges introduced by polytomy
/// resolution (`mark`-ed, not part of `edges`) are treated as
/// contributing zero to the path length for constraint-building
/// purposes -- they are always short (ε-length) and not optimized here.
pub fn ultrametric_constraint(tree: &Tree, edges: &[usize]) -> DMatrix<f64> {
    let n = edges.len();
    let index_of: HashMap<usize, usize> = edges.iter().enumerate().map(|(i, &v)| (v, i)).collect();
    let mut rows: Vec<Vec<f64>> = Vec::new();
    let mut constraint: HashMap<usize, Vec<f64>> = HashMap::new();

    for v in tree.postorder() {
        let mut c = vec![0.0; n];
        if !tree.is_leaf(v) {
            let kids = tree.children(v);
            let c1 = constraint.get(&kids[0]).cloned().unwrap_or_else(|| vec![0.0; n]);
            let c2 = constraint.get(&kids[1]).cloned().unwrap_or_else(|| vec![0.0; n]);
            let diff: Vec<f64> = c1.iter().zip(&c2).map(|(a, b)| a - b).collect();
            if diff.iter().any(|x| x.abs() > 1e-12) {
                rows.push(diff);
            }
            c = c1;
        }
        if let Some(&i) = index_of.get(&v) {
            c[i] += 1.0;
        }
        constraint.insert(v, c);
    }

    if rows.is_empty() {
        return DMatrix::from_row_slice(0, n, &[]);
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    DMatrix::from_row_slice(rows.len(), n, &flat)
}

/// Runs the full M-step in the order §4.5 specifies: φ, then branch
/// lengths given ν, then ν given the new branch lengths.
pub fn mstep(
    tree: &mut Tree,
    data: &CharMatrix,
    mut params: Params,
    fit_phi: bool,
    fit_nu: bool,
    ultrametric: Option<&DMatrix<f64>>,
) -> Result<Params> {
    let phi_star = if fit_phi {
        update_phi(tree, data)
    } else {
        params.phi
    };

    let (edges, stats) = collect_edge_stats(tree, data.num_sites);
    if edges.is_empty() {
        return Err(LamlError::Optimization("no unmarked edges to optimize".into()));
    }
    let init: Vec<f64> = edges.iter().map(|&v| tree.edge_length(v)).collect();

    let d_star = match ultrametric {
        Some(m) => optimize_branch_lengths_ultrametric(params.nu, &stats, m, &init),
        None => optimize_branch_lengths(params.nu, &stats),
    };
    if d_star.iter().any(|d| !d.is_finite()) {
        return Err(LamlError::Optimization("branch-length optimization produced a non-finite value".into()));
    }

    let nu_star = if fit_nu {
        optimize_nu(&d_star, &stats)
    } else {
        params.nu
    };

    for (&v, &d) in edges.iter().zip(&d_star) {
        tree.set_edge_length(v, d);
    }
    params.phi = phi_star;
    params.nu = nu_star;
    Ok(Params::new(params.nu, params.phi))
}
