use std::path::{Path, PathBuf};

use candle_core::Device;
use clap::Parser;

use gradtune_core::{
    generate_default_shapes, generate_model_shapes, load_shape_file, BenchmarkExecutor,
    CandidateCatalog, DecodeFamilyPolicy, DtypeKind, ModelConfig, ResultStore, RunSummary,
    SearchController, ShapeRegistry, ShapeSourceOptions,
};

mod logging;

#[derive(Parser)]
#[command(
    name = "gemm-tuner",
    about = "Searches for the fastest GEMM kernel configuration per problem shape"
)]
struct Cli {
    /// Location of the model directory (config.json is read for shapes)
    #[arg(long, env = "GTUNE_MODEL", default_value = "")]
    model_dir: String,

    /// Output file for tuned GEMM solutions
    #[arg(long, env = "GTUNE_TUNED", default_value = "tuned.csv")]
    tuned_file: PathBuf,

    /// CSV of GEMM shapes to tune for, mutually exclusive with --model-dir
    #[arg(long, env = "GTUNE_INPUT")]
    input_file: Option<PathBuf>,

    /// Tensor parallelism to be used
    #[arg(long, env = "GTUNE_TP", default_value_t = 1)]
    tp: usize,

    /// Input dtype: f32, f16, bf16, fp8. Overrides the input file's dtype
    /// column, or supplies one when no input file is given
    #[arg(long)]
    indtype: Option<String>,

    /// Output dtype override; defaults to the input dtype for each shape
    #[arg(long)]
    outdtype: Option<String>,

    /// Force the dense BLAS family on decode shapes (N == 1)
    #[arg(long)]
    dense_decode: bool,

    /// Batch size to tune for
    #[arg(long, env = "GTUNE_BATCH_SIZE", default_value_t = 1)]
    batch_size: usize,

    /// N sizes to tune for, e.g. 1,128,2048
    #[arg(
        long,
        env = "GTUNE_NSETS",
        value_delimiter = ',',
        default_values_t = gradtune_core::DEFAULT_NSETS
    )]
    nsets: Vec<usize>,

    /// Tune for both bias and non-bias cases, regardless of what was used
    /// to collect the shapes
    #[arg(long)]
    all_bias: bool,

    /// Unknown dtype strings warn and default to f16 instead of failing
    #[arg(long)]
    lenient_dtype: bool,

    /// Re-measure shapes already present in the tuned file
    #[arg(long)]
    retune: bool,

    /// Untimed warmup iterations per candidate
    #[arg(long, default_value_t = BenchmarkExecutor::DEFAULT_WARMUP_ITERS)]
    warmup_iters: usize,

    /// Timed iterations per candidate (minimum latency is kept)
    #[arg(long, default_value_t = BenchmarkExecutor::DEFAULT_TIMED_ITERS)]
    timed_iters: usize,

    /// Log level for the tuner (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let indtype = cli
        .indtype
        .as_deref()
        .map(DtypeKind::parse)
        .transpose()?;
    let outdtype = cli
        .outdtype
        .as_deref()
        .map(DtypeKind::parse)
        .transpose()?
        .or(indtype);
    let opts = ShapeSourceOptions {
        indtype,
        outdtype,
        all_bias: cli.all_bias,
        lenient_dtype: cli.lenient_dtype,
    };

    let mut registry = ShapeRegistry::new();
    if let Some(input_file) = &cli.input_file {
        tracing::info!(path = %input_file.display(), "loading input shapes");
        load_shape_file(input_file, &mut registry, &opts)?;
    } else if !cli.model_dir.is_empty() {
        let config = ModelConfig::load(Path::new(&cli.model_dir))?;
        generate_model_shapes(
            &config,
            &mut registry,
            cli.tp,
            cli.batch_size,
            &cli.nsets,
            &opts,
        )?;
    } else {
        generate_default_shapes(&mut registry, cli.batch_size, &cli.nsets, &opts)?;
    }
    tracing::info!(shapes = registry.len(), "shape registry built");

    let device = pick_device()?;
    let executor =
        BenchmarkExecutor::new(device).with_iters(cli.warmup_iters, cli.timed_iters);
    let mut controller = SearchController::new(CandidateCatalog::new(), executor)
        .retune_existing(cli.retune);
    if cli.dense_decode {
        controller = controller.with_policy(Box::new(DecodeFamilyPolicy::dense()));
    }

    let mut store = ResultStore::load(&cli.tuned_file)?;
    let summary = controller.run(&registry, &mut store, None)?;
    store.flush()?;

    report(&summary, &cli.tuned_file);
    Ok(())
}

fn pick_device() -> anyhow::Result<Device> {
    if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else {
        tracing::warn!("CUDA device not available, benchmarking on CPU");
        Ok(Device::Cpu)
    }
}

fn report(summary: &RunSummary, tuned_file: &Path) {
    for warning in &summary.warnings {
        tracing::warn!("{warning}");
    }
    eprintln!(
        "Tuned {} shape(s) ({} already tuned, {} exhausted) -> {}",
        summary.persisted,
        summary.skipped_existing,
        summary.exhausted.len(),
        tuned_file.display()
    );
    for shape in &summary.exhausted {
        eprintln!("  no successful candidate for {shape}");
    }
    if summary.cancelled {
        eprintln!("Run was cancelled; already-tuned shapes were kept.");
    }
}
