//! Character-matrix loaders: delimited text and the cassette-oriented JSON
//! form described in §6. Both funnel into the same [`CharState`] tagging
//! so the rest of the pipeline never sees raw tokens.

use crate::error::{LamlError, Result};
use crate::model::{CharMatrix, CharState};
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub fn split_delimiter(line: &str, delimiter: char) -> Vec<String> {
    if delimiter.is_whitespace() {
        line.split_whitespace().map(|s| s.to_string()).collect()
    } else {
        line.split(delimiter).map(|s| s.to_string()).collect()
    }
}

/// Parses the tab/comma/whitespace-delimited text form: a header row
/// (`cell_name` or `cell`, then one column per site) followed by one row
/// per cell. `masked_symbol`, when given, is an extra token (besides `-`,
/// `?`, `-1`) treated as a missing observation.
pub fn parse_text_charmatrix(contents: &str, delimiter: char, masked_symbol: Option<&str>) -> Result<CharMatrix> {
    let mut lines = contents.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| LamlError::CharMatrix("empty character matrix file".into()))?;
    let header_cols = split_delimiter(header, delimiter);
    let skip_first = header_cols
        .first()
        .map(|c| c == "cell_name" || c.to_lowercase().starts_with("cell"))
        .unwrap_or(false);
    let start = if skip_first { 1 } else { 0 };

    let mut rows = Vec::new();
    for line in lines {
        let cols = split_delimiter(line, delimiter);
        if cols.is_empty() {
            continue;
        }
        let name = cols[0].clone();
        let obs: Vec<CharState> = cols[1..]
            .iter()
            .map(|t| CharState::from_token_with_mask(t, masked_symbol))
            .collect();
        if start == 1 && header_cols.len() - 1 != obs.len() {
            return Err(LamlError::CharMatrix(format!(
                "cell {name} has {} sites but header declares {}",
                obs.len(),
                header_cols.len() - 1
            )));
        }
        rows.push((name, obs));
    }
    CharMatrix::new(rows)
}

#[derive(Deserialize)]
struct CellJson {
    cell_name: String,
    cassettes: Vec<CassetteJson>,
}

#[derive(Deserialize)]
struct CassetteJson {
    cassette_idx: usize,
    cassette_state: Vec<i64>,
}

/// Parses the JSON form. Only single-character cassettes are supported
/// (§1 Non-goals); a `cassette_state` longer than one entry is an
/// input-shape error.
pub fn parse_json_charmatrix(contents: &str) -> Result<CharMatrix> {
    let cells: Vec<CellJson> = serde_json::from_str(contents)
        .map_err(|e| LamlError::Json {
            path: "<charmatrix>".into(),
            source: e,
        })?;

    let num_sites = cells
        .iter()
        .flat_map(|c| c.cassettes.iter().map(|cs| cs.cassette_idx + 1))
        .max()
        .unwrap_or(0);

    let mut rows = Vec::with_capacity(cells.len());
    for cell in cells {
        let mut obs = vec![CharState::Missing; num_sites];
        for cassette in cell.cassettes {
            if cassette.cassette_state.len() > 1 {
                return Err(LamlError::CharMatrix(format!(
                    "cell {}: cassette {} has {} states, only single-character cassettes are supported",
                    cell.cell_name,
                    cassette.cassette_idx,
                    cassette.cassette_state.len()
                )));
            }
            let state = match cassette.cassette_state.first() {
                None => CharState::Missing,
                Some(&0) => CharState::Unedited,
                Some(&s) if s > 0 => CharState::Edited(s as i32),
                Some(_) => CharState::Missing,
            };
            obs[cassette.cassette_idx] = state;
        }
        rows.push((cell.cell_name, obs));
    }
    CharMatrix::new(rows)
}

pub fn load_charmatrix(path: &Path, delimiter: char, masked_symbol: Option<&str>) -> Result<CharMatrix> {
    let contents = fs::read_to_string(path).map_err(|e| LamlError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        parse_json_charmatrix(&contents)
    } else {
        parse_text_charmatrix(&contents, delimiter, masked_symbol)
    }
}
