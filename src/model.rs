//! Data model shared by every component: character observations, the
//! per-site mutation prior, and the two scalar global parameters.

use crate::error::{LamlError, Result};
use std::collections::HashMap;

/// One cell's observation at one site. `-1`, `-`, `?`  and non-numeric
/// tokens are all folded into `Missing` at load time per §6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CharState {
    Unedited,
    Edited(i32),
    Missing,
}

impl CharState {
    pub fn from_token(tok: &str) -> CharState {
        CharState::from_token_with_mask(tok, None)
    }

    /// As [`CharState::from_token`], but also treats `masked_symbol` (the
    /// CLI's `--masked-symbol`, when given) as a missing-observation
    /// token alongside `-`, `?`, and `-1`.
    pub fn from_token_with_mask(tok: &str, masked_symbol: Option<&str>) -> CharState {
        if tok == "-" || tok == "?" || tok == "-1" || masked_symbol.is_some_and(|m| tok == m) {
            return CharState::Missing;
        }
        match tok.trim().parse::<i32>() {
            Ok(0) => CharState::Unedited,
            Ok(s) if s > 0 => CharState::Edited(s),
            _ => CharState::Missing,
        }
    }
}

/// Ordered cell-name -> per-site observation vectors. Length `K` is
/// uniform across cells (enforced at load time, an input-shape error if
/// violated).
#[derive(Clone, Debug, Default)]
pub struct CharMatrix {
    pub cell_order: Vec<String>,
    rows: HashMap<String, Vec<CharState>>,
    pub num_sites: usize,
}

impl CharMatrix {
    pub fn new(rows: Vec<(String, Vec<CharState>)>) -> Result<CharMatrix> {
        if rows.is_empty() {
            return Err(LamlError::CharMatrix("character matrix is empty".into()));
        }
        let num_sites = rows[0].1.len();
        for (name, obs) in &rows {
            if obs.len() != num_sites {
                return Err(LamlError::CharMatrix(format!(
                    "cell {name} has {} sites, expected {num_sites}",
                    obs.len()
                )));
            }
        }
        let cell_order = rows.iter().map(|(n, _)| n.clone()).collect();
        let rows = rows.into_iter().collect();
        Ok(CharMatrix {
            cell_order,
            rows,
            num_sites,
        })
    }

    pub fn get(&self, cell: &str, site: usize) -> CharState {
        self.rows
            .get(cell)
            .map(|v| v[site])
            .unwrap_or(CharState::Missing)
    }

    pub fn contains_cell(&self, cell: &str) -> bool {
        self.rows.contains_key(cell)
    }

    pub fn num_cells(&self) -> usize {
        self.cell_order.len()
    }

    /// Every mutated state actually observed at `site`, used to fill in a
    /// uniform prior over missing alphabet entries (§6).
    pub fn observed_states(&self, site: usize) -> Vec<i32> {
        let mut states: Vec<i32> = self
            .cell_order
            .iter()
            .filter_map(|c| match self.get(c, site) {
                CharState::Edited(s) => Some(s),
                _ => None,
            })
            .collect();
        states.sort_unstable();
        states.dedup();
        states
    }
}

/// Site-indexed mutation prior Q[k][state] -> probability. `Q[k][0]` is
/// always 0; every row is renormalized to sum to 1 on load.
#[derive(Clone, Debug)]
pub struct PriorQ {
    rows: Vec<HashMap<i32, f64>>,
}

impl PriorQ {
    pub fn new(mut rows: Vec<HashMap<i32, f64>>) -> PriorQ {
        for row in &mut rows {
            row.remove(&0);
            let total: f64 = row.values().sum();
            if total > 0.0 {
                for p in row.values_mut() {
                    *p /= total;
                }
            }
        }
        PriorQ { rows }
    }

    pub fn uniform(data: &CharMatrix) -> PriorQ {
        let mut rows = Vec::with_capacity(data.num_sites);
        for site in 0..data.num_sites {
            let states = data.observed_states(site);
            let mut row = HashMap::new();
            if !states.is_empty() {
                let p = 1.0 / states.len() as f64;
                for s in states {
                    row.insert(s, p);
                }
            }
            rows.push(row);
        }
        PriorQ::new(rows)
    }

    /// Fills in sites the file left unspecified with a uniform prior over
    /// that site's observed mutated states, per §6.
    pub fn fill_missing(&mut self, data: &CharMatrix) {
        while self.rows.len() < data.num_sites {
            self.rows.push(HashMap::new());
        }
        for site in 0..data.num_sites {
            if self.rows[site].is_empty() {
                let states = data.observed_states(site);
                if !states.is_empty() {
                    let p = 1.0 / states.len() as f64;
                    for s in states {
                        self.rows[site].insert(s, p);
                    }
                }
            }
        }
    }

    pub fn prob(&self, site: usize, state: i32) -> f64 {
        if state == 0 {
            return 0.0;
        }
        self.rows
            .get(site)
            .and_then(|r| r.get(&state))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn num_sites(&self) -> usize {
        self.rows.len()
    }

    /// Invariant check used by tests and by loaders: every row sums to 1
    /// (or 0, for a site with no observed mutations) and Q[k][0] == 0.
    pub fn is_normalized(&self, tol: f64) -> bool {
        self.rows.iter().all(|r| {
            !r.contains_key(&0) && {
                let s: f64 = r.values().sum();
                s == 0.0 || (s - 1.0).abs() < tol
            }
        })
    }
}

/// Global silencing rate nu and dropout rate phi, bounded per §3.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Params {
    pub nu: f64,
    pub phi: f64,
}

impl Params {
    pub const NU_MIN: f64 = 1e-10;
    pub const NU_MAX: f64 = 10.0;
    pub const PHI_MIN: f64 = 1e-10;
    pub const PHI_MAX: f64 = 0.99;

    pub fn new(nu: f64, phi: f64) -> Params {
        Params {
            nu: nu.clamp(Self::NU_MIN, Self::NU_MAX),
            phi: phi.clamp(Self::PHI_MIN, Self::PHI_MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prior_normalizes_on_load() {
        let mut row = HashMap::new();
        row.insert(0, 0.5); // must be dropped
        row.insert(1, 1.0);
        row.insert(2, 3.0);
        let q = PriorQ::new(vec![row]);
        assert!(q.is_normalized(1e-9));
        assert_eq!(q.prob(0, 0), 0.0);
        assert!((q.prob(0, 1) + q.prob(0, 2) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn char_matrix_rejects_ragged_rows() {
        let rows = vec![
            ("a".to_string(), vec![CharState::Unedited; 3]),
            ("b".to_string(), vec![CharState::Unedited; 2]),
        ];
        assert!(CharMatrix::new(rows).is_err());
    }

    #[test]
    fn token_parsing_folds_missing_variants() {
        assert_eq!(CharState::from_token("-"), CharState::Missing);
        assert_eq!(CharState::from_token("?"), CharState::Missing);
        assert_eq!(CharState::from_token("-1"), CharState::Missing);
        assert_eq!(CharState::from_token("-2"), CharState::Missing);
        assert_eq!(CharState::from_token("nope"), CharState::Missing);
        assert_eq!(CharState::from_token("0"), CharState::Unedited);
        assert_eq!(CharState::from_token("5"), CharState::Edited(5));
    }
}
