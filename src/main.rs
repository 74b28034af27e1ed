use clap::{Parser, ValueEnum};
use laml::em::{self, EmOptions};
use laml::error::Result;
use laml::io::{self, prior::PriorSource};
use laml::likelihood;
use laml::model::Params;
use laml::nni::{self, NniOptions};
use laml::tree::Tree;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Solver {
    Em,
    Generic,
}

/// Maximum-likelihood phylogenetic tree inference from single-cell
/// lineage-tracing character matrices.
#[derive(Parser)]
#[command(name = "laml", about, version)]
struct Args {
    /// Newick starting topology
    #[arg(long)]
    topology: PathBuf,

    /// Character matrix (text or .json)
    #[arg(long)]
    characters: PathBuf,

    /// Per-site mutation prior: a path (.csv/.pkl) or "uniform"
    #[arg(long, default_value = "uniform")]
    prior: String,

    /// Field delimiter for text character matrices
    #[arg(long, default_value = "\t")]
    delimiter: String,

    /// Token treated as a missing observation, besides `-`, `?`, `-1`
    #[arg(long)]
    masked_symbol: Option<String>,

    #[arg(long, value_enum, default_value_t = Solver::Em)]
    solver: Solver,

    /// Run the NNI topology search after the initial EM fit
    #[arg(long, default_value_t = false)]
    topology_search: bool,

    /// Constrain branch lengths so every leaf is equidistant from the root
    #[arg(long, default_value_t = false)]
    ultrametric: bool,

    /// Fix ν at 0 instead of optimizing it
    #[arg(long, default_value_t = false)]
    no_silence: bool,

    /// Fix φ at 0 instead of optimizing it
    #[arg(long, default_value_t = false)]
    no_dropout: bool,

    /// Only compute the likelihood of the given topology/params, skipping optimization
    #[arg(long, default_value_t = false)]
    likelihood: bool,

    /// Dropout rate used by --likelihood
    #[arg(long, default_value_t = 0.1)]
    phi: f64,

    /// Silencing rate used by --likelihood
    #[arg(long, default_value_t = 0.01)]
    nu: f64,

    /// Number of random restarts for the initial EM fit
    #[arg(long, default_value_t = 20)]
    n_initials: usize,

    /// Comma-separated RNG seeds, one per restart (falls back to 0..n_initials)
    #[arg(long)]
    randseeds: Option<String>,

    /// Number of independent NNI search replicates
    #[arg(long, default_value_t = 5)]
    nreps: usize,

    /// Run NNI replicates across a rayon thread pool
    #[arg(long, default_value_t = false)]
    parallel: bool,

    /// Restrict NNI moves to edges introduced by polytomy resolution
    #[arg(long, default_value_t = false)]
    resolve_search_only: bool,

    /// Re-optimize only nearby branch lengths after each accepted NNI move
    #[arg(long, default_value_t = false)]
    local_brlen_opt: bool,

    /// Where to write the per-NNI-iteration checkpoint log
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Output file for the final newick tree and fitted parameters
    #[arg(long, default_value = "laml_output.txt")]
    output: PathBuf,
}

fn parse_seeds(randseeds: &Option<String>, n_initials: usize) -> Vec<u64> {
    match randseeds {
        Some(s) => s.split(',').filter_map(|x| x.trim().parse().ok()).collect(),
        None => (0..n_initials as u64).collect(),
    }
}

fn run(args: Args) -> Result<()> {
    let newick = std::fs::read_to_string(&args.topology).map_err(|e| laml::LamlError::Io {
        path: args.topology.display().to_string(),
        source: e,
    })?;
    let mut tree = if args.likelihood {
        Tree::from_newick_with_lengths(newick.trim())?
    } else {
        Tree::from_newick(newick.trim())?
    };

    let delimiter = args.delimiter.chars().next().unwrap_or('\t');
    let data = io::charmatrix::load_charmatrix(&args.characters, delimiter, args.masked_symbol.as_deref())?;

    let prior_source = if args.prior == "uniform" {
        PriorSource::Uniform
    } else {
        PriorSource::Path(std::path::Path::new(&args.prior))
    };
    let prior = io::prior::load_prior(prior_source, &data)?;

    if matches!(args.solver, Solver::Generic) {
        tracing::warn!("solver=generic requested; falling back to the bundled EM/NNI solver");
    }

    let fixed_phi = if args.no_dropout { Some(0.0) } else { None };
    let fixed_nu = if args.no_silence { Some(0.0) } else { None };
    let seeds = parse_seeds(&args.randseeds, args.n_initials.max(1));

    let em_opts = EmOptions {
        fit_phi: fixed_phi.is_none(),
        fit_nu: fixed_nu.is_none(),
        ultrametric: args.ultrametric,
        ..EmOptions::default()
    };

    tree.ensure_annotations(data.num_sites);
    let resolved_any = tree.resolve_polytomies(1e-3);
    if resolved_any {
        tracing::info!("resolved polytomies before optimization");
    }
    likelihood::compute_alpha(&mut tree, &data);

    if args.likelihood {
        let params = Params::new(args.nu, args.phi);
        let nll = -likelihood::lineage_llh(&mut tree, &data, &prior, params);
        io::write_result(&args.output, &tree.to_newick(), nll, params)?;
        println!("Newick tree: {}", tree.to_newick());
        println!("Optimal negative-llh: {nll}");
        println!("Optimal dropout rate: {}", params.phi);
        println!("Optimal silencing rate: {}", params.nu);
        return Ok(());
    }

    let (final_tree, final_params, final_nll) = if args.topology_search {
        let nni_opts = NniOptions {
            em_opts,
            em_initials: args.n_initials.max(1),
            em_seeds: seeds.clone(),
            resolve_search_only: args.resolve_search_only,
            local_brlen_opt: args.local_brlen_opt,
            ..NniOptions::default()
        };

        let init_params = Params::new(fixed_nu.unwrap_or(0.1), fixed_phi.unwrap_or(0.1));
        let checkpoint = args.checkpoint.as_ref().map(io::CheckpointLog::new);
        let report = if args.parallel {
            nni::search_multireplicate_parallel(
                &tree, &data, &prior, init_params, &nni_opts, args.nreps, &seeds, checkpoint.as_ref(),
            )?
        } else {
            nni::search_multireplicate(
                &tree, &data, &prior, init_params, &nni_opts, args.nreps, &seeds, checkpoint.as_ref(),
            )?
        };
        (report.tree, report.params, report.neg_log_likelihood)
    } else {
        let (best_tree, result) = em::run_em_multistart(
            &tree, &data, &prior, em_opts, args.n_initials.max(1), &seeds, fixed_phi, fixed_nu, 1,
        )?;
        (best_tree, result.params, result.neg_log_likelihood)
    };

    io::write_result(&args.output, &final_tree.to_newick(), final_nll, final_params)?;
    println!("Newick tree: {}", final_tree.to_newick());
    println!("Optimal negative-llh: {final_nll}");
    println!("Optimal dropout rate: {}", final_params.phi);
    println!("Optimal silencing rate: {}", final_params.nu);

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "laml failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
