//! Prior-Q loaders: pickle, CSV, and the `uniform` keyword (§6). Whatever
//! the source format leaves unspecified for a site is filled in from the
//! character matrix with a uniform prior over that site's observed
//! mutated states, then every row is renormalized -- `PriorQ::new` and
//! `PriorQ::fill_missing` do the actual normalization (Q normalization is
//! a load-time invariant, not a per-use check).

use crate::error::{LamlError, Result};
use crate::model::{CharMatrix, PriorQ};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub enum PriorSource<'a> {
    Uniform,
    Path(&'a Path),
}

pub fn load_prior(source: PriorSource, data: &CharMatrix) -> Result<PriorQ> {
    let mut q = match source {
        PriorSource::Uniform => PriorQ::uniform(data),
        PriorSource::Path(path) => match path.extension().and_then(|e| e.to_str()) {
            Some("csv") => load_csv(path)?,
            _ => load_pickle(path)?,
        },
    };
    q.fill_missing(data);
    Ok(q)
}

fn load_pickle(path: &Path) -> Result<PriorQ> {
    let bytes = fs::read(path).map_err(|e| LamlError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: HashMap<i64, HashMap<i64, f64>> =
        serde_pickle::from_slice(&bytes, Default::default()).map_err(|e| LamlError::Pickle {
            path: path.display().to_string(),
            source: e,
        })?;
    rows_from_sparse_map(raw)
}

/// CSV rows of the form `siteName,state,prob`, with an optional header.
/// `siteName` is assigned a dense index in order of first appearance
/// (falling back to a numeric parse when the name already looks like an
/// index).
fn load_csv(path: &Path) -> Result<PriorQ> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| LamlError::Csv {
            path: path.display().to_string(),
            source: e,
        })?;

    let mut site_order: Vec<String> = Vec::new();
    let mut site_index: HashMap<String, usize> = HashMap::new();
    let mut rows: Vec<HashMap<i32, f64>> = Vec::new();

    for result in reader.records() {
        let record = result.map_err(|e| LamlError::Csv {
            path: path.display().to_string(),
            source: e,
        })?;
        if record.len() < 3 {
            continue;
        }
        let site_name = record[0].to_string();
        let state: i32 = match record[1].trim().parse() {
            Ok(s) => s,
            Err(_) => continue, // header row
        };
        let prob: f64 = match record[2].trim().parse() {
            Ok(p) => p,
            Err(_) => continue,
        };
        let idx = *site_index.entry(site_name.clone()).or_insert_with(|| {
            site_order.push(site_name.clone());
            rows.push(HashMap::new());
            site_order.len() - 1
        });
        rows[idx].insert(state, prob);
    }
    Ok(PriorQ::new(rows))
}

fn rows_from_sparse_map(raw: HashMap<i64, HashMap<i64, f64>>) -> Result<PriorQ> {
    let max_site = raw.keys().copied().max().unwrap_or(-1);
    let mut rows = vec![HashMap::new(); (max_site + 1).max(0) as usize];
    for (site, states) in raw {
        if site < 0 {
            continue;
        }
        let row: HashMap<i32, f64> = states
            .into_iter()
            .map(|(s, p)| (s as i32, p))
            .collect();
        rows[site as usize] = row;
    }
    Ok(PriorQ::new(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CharState;
    use std::io::Write;

    fn matrix_with_sites(n: usize) -> CharMatrix {
        let rows = vec![(
            "a".to_string(),
            vec![CharState::Edited(1); n],
        )];
        CharMatrix::new(rows).unwrap()
    }

    #[test]
    fn csv_prior_normalizes_and_fills_gaps() {
        let dir = std::env::temp_dir();
        let path = dir.join("laml_test_prior.csv");
        {
            let mut f = fs::File::create(&path).unwrap();
            writeln!(f, "0,1,2.0").unwrap();
            writeln!(f, "0,2,2.0").unwrap();
        }
        let data = matrix_with_sites(2);
        let q = load_prior(PriorSource::Path(&path), &data).unwrap();
        assert!((q.prob(0, 1) - 0.5).abs() < 1e-9);
        assert!((q.prob(0, 2) - 0.5).abs() < 1e-9);
        // site 1 had no entry in the file: filled uniformly from the data
        assert!(q.prob(1, 1) > 0.0);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn uniform_prior_spreads_over_observed_states() {
        let rows = vec![
            ("a".to_string(), vec![CharState::Edited(1)]),
            ("b".to_string(), vec![CharState::Edited(2)]),
        ];
        let data = CharMatrix::new(rows).unwrap();
        let q = PriorQ::uniform(&data);
        assert!((q.prob(0, 1) - 0.5).abs() < 1e-9);
        assert!((q.prob(0, 2) - 0.5).abs() < 1e-9);
    }
}
