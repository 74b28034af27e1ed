pub mod charmatrix;
pub mod prior;

use crate::error::{LamlError, Result};
use crate::model::Params;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

/// Writes the four summary lines described in §6. Never overwrites a
/// previous successful result with a partial one: the caller is expected
/// to have the full string ready before this is called.
pub fn write_result(
    path: &Path,
    newick: &str,
    neg_llh: f64,
    params: Params,
) -> Result<()> {
    let mut out = String::new();
    out.push_str(&format!("Newick tree: {newick}\n"));
    out.push_str(&format!("Optimal negative-llh: {neg_llh}\n"));
    out.push_str(&format!("Optimal dropout rate: {}\n", params.phi));
    out.push_str(&format!("Optimal silencing rate: {}\n", params.nu));
    std::fs::write(path, out).map_err(|e| LamlError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

/// Append-mode NNI checkpoint logger (§6, opt-in).
pub struct CheckpointLog {
    path: std::path::PathBuf,
    start: Instant,
}

impl CheckpointLog {
    pub fn new(path: impl AsRef<Path>) -> CheckpointLog {
        CheckpointLog {
            path: path.as_ref().to_path_buf(),
            start: Instant::now(),
        }
    }

    pub fn record(&self, iteration: usize, newick: &str, neg_llh: f64, params: Params) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LamlError::Io {
                path: self.path.display().to_string(),
                source: e,
            })?;
        writeln!(
            f,
            "iter={iteration}\ttree={newick}\tneg_llh={neg_llh}\tnu={}\tphi={}\telapsed_s={:.3}",
            params.nu,
            params.phi,
            self.start.elapsed().as_secs_f64()
        )
        .map_err(|e| LamlError::Io {
            path: self.path.display().to_string(),
            source: e,
        })
    }
}
