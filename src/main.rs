// ========================================================================================
//
//                        voxelwise: the encoding driver
//
// ========================================================================================
//
// Loads per-run stimulus and response matrices with their timing metadata, aligns
// them into a lagged design, fits cross-validated ridge models and writes one score
// per response column.

use clap::{Args, CommandFactory, Parser, Subcommand};
use ndarray::Array2;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use voxelwise::clean::clean_signal;
use voxelwise::config::EncodingConfig;
use voxelwise::cv::{FitOutcome, fit_cv};
use voxelwise::estimator::{Blockwise, Estimator};
use voxelwise::io::{read_matrix, read_sidecar, read_task_metadata, write_scores};
use voxelwise::{CvOptions, align};

#[derive(Parser)]
#[command(
    name = "voxelwise",
    version,
    about = "Voxelwise encoding models for stimulus-driven fMRI responses."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Align stimulus runs to response runs and fit cross-validated ridge models
    Fit(FitArgs),
}

#[derive(Args)]
struct FitArgs {
    /// Stimulus matrix per run (TSV, optionally gzipped); repeat in run order
    #[arg(long = "stimulus", required = true)]
    stimuli: Vec<PathBuf>,

    /// JSON sidecar per stimulus run with SamplingFrequency and StartTime
    #[arg(long = "sidecar", required = true)]
    sidecars: Vec<PathBuf>,

    /// Response matrix per run (TSV, optionally gzipped); repeat in run order
    #[arg(long = "response", required = true)]
    responses: Vec<PathBuf>,

    /// Task JSON with RepetitionTime
    #[arg(long, conflicts_with = "tr")]
    task_metadata: Option<PathBuf>,

    /// Response sampling period in seconds
    #[arg(long)]
    tr: Option<f64>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seconds of stimulus history per row (overrides the config)
    #[arg(long)]
    lag_time: Option<f64>,

    /// Seconds of recent stimulus removed from each row (overrides the config)
    #[arg(long)]
    offset_stim: Option<f64>,

    /// Number of outer folds (overrides the config)
    #[arg(long)]
    n_splits: Option<usize>,

    /// Candidate ridge penalties, comma separated (overrides the config)
    #[arg(long, value_delimiter = ',')]
    alphas: Option<Vec<f64>>,

    /// Fit once on all rows and report in-sample scores
    #[arg(long)]
    no_validate: bool,

    /// Skip detrending and z-scoring of the responses
    #[arg(long)]
    no_clean: bool,

    /// Output score table
    #[arg(long, default_value = "scores.tsv")]
    output: PathBuf,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Fit(args)) => run_fit(args),
        None => Cli::command().print_help().map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_fit(args: FitArgs) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    if args.stimuli.len() != args.sidecars.len() || args.stimuli.len() != args.responses.len() {
        return Err(format!(
            "got {} stimulus files, {} sidecars and {} response files; each run needs one of each",
            args.stimuli.len(),
            args.sidecars.len(),
            args.responses.len()
        )
        .into());
    }

    let mut config = match &args.config {
        Some(path) => EncodingConfig::load(path)?,
        None => EncodingConfig::default(),
    };
    if let Some(lag_time) = args.lag_time {
        config.alignment.lag_time = lag_time;
    }
    if let Some(offset_stim) = args.offset_stim {
        config.alignment.offset_stim = offset_stim;
    }
    if let Some(n_splits) = args.n_splits {
        config.fitting.n_splits = n_splits;
        config.fitting.adaptive_splits = false;
    }
    if let Some(alphas) = args.alphas {
        config.fitting.alphas = alphas;
    }
    if args.no_validate {
        config.fitting.validate = false;
    }

    let tr = match (args.tr, &args.task_metadata) {
        (Some(tr), _) => tr,
        (None, Some(path)) => read_task_metadata(path)?.repetition_time,
        (None, None) => return Err("either --tr or --task-metadata is required".into()),
    };

    let sidecars = args
        .sidecars
        .iter()
        .map(read_sidecar)
        .collect::<Result<Vec<_>, _>>()?;
    let stim_tr = sidecars[0].stim_tr();
    if let Some((run, sidecar)) = sidecars
        .iter()
        .enumerate()
        .find(|(_, sidecar)| sidecar.sampling_frequency != sidecars[0].sampling_frequency)
    {
        return Err(format!(
            "run {run} is sampled at {} Hz but run 0 at {} Hz",
            sidecar.sampling_frequency, sidecars[0].sampling_frequency
        )
        .into());
    }
    let start_times = sidecars.iter().map(|sidecar| sidecar.start_time).collect();

    let stimuli = args
        .stimuli
        .iter()
        .map(read_matrix)
        .collect::<Result<Vec<_>, _>>()?;
    let responses = args
        .responses
        .iter()
        .map(|path| {
            read_matrix(path).map(|response| {
                if args.no_clean {
                    response
                } else {
                    clean_signal(response.view(), true, true)
                }
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    log::info!(
        "Loaded {} runs: TR {tr} s, stimulus period {stim_tr} s",
        stimuli.len()
    );

    let options = config.alignment.to_options(tr, stim_tr, Some(start_times));
    let aligned = align(stimuli, responses, &options)?;
    log::info!(
        "Aligned design: {} rows x {} features, {} targets ({} warnings)",
        aligned.x.nrows(),
        aligned.x.ncols(),
        aligned.y.ncols(),
        aligned.warnings.len()
    );
    let (x, y) = aligned.into_parts();

    let estimator = config.fitting.estimator()?;
    let cv_options = config.fitting.cv_options();
    match config.fitting.target_blocks {
        Some(n_blocks) => {
            let mut blockwise = Blockwise::new(estimator, n_blocks)?;
            if !config.fitting.parallel {
                blockwise = blockwise.sequential();
            }
            fit_and_write(&x, &y, &blockwise, &cv_options, &args.output)?
        }
        None => fit_and_write(&x, &y, &estimator, &cv_options, &args.output)?,
    }

    log::info!(
        "Wrote scores to {} in {:.2?}",
        args.output.display(),
        start.elapsed()
    );
    Ok(())
}

fn fit_and_write<E: Estimator>(
    x: &Array2<f64>,
    y: &Array2<f64>,
    estimator: &E,
    options: &CvOptions,
    output: &Path,
) -> Result<(), Box<dyn Error>> {
    match fit_cv(x.view(), y.view(), estimator, options)? {
        FitOutcome::CrossValidated(result) => write_scores(
            output,
            Some(result.fold_scores.view()),
            result.pooled_scores.view(),
        )?,
        FitOutcome::Full(full) => write_scores(output, None, full.scores.view())?,
    }
    Ok(())
}
