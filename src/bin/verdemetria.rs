use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use verdemetria::core::{AreaUnit, ChangeThresholds, OutOfRange, ResamplingMethod};
use verdemetria::io::format_area_table;
use verdemetria::pipeline::{
    run_change, run_ndvi, BandPair, ChangeInputs, ChangeRequest, NdviRequest, PipelineConfig,
};

/// NDVI computation and vegetation change detection
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute NDVI from red and near-infrared rasters
    Ndvi(NdviArgs),
    /// Classify NDVI change between two dates and measure its area
    Change(ChangeArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// NDVI denominator stabilizer
    #[arg(long, default_value_t = 1e-8)]
    epsilon: f64,

    /// Turn out-of-range NDVI pixels into no-data instead of clamping them
    #[arg(long)]
    invalidate_out_of_range: bool,

    /// GeoTIFF compression (LZW, DEFLATE, none)
    #[arg(long, default_value = "LZW")]
    compression: String,

    /// GeoJSON polygon to crop inputs to
    #[arg(long)]
    aoi: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct NdviArgs {
    /// Red band raster
    #[arg(long, short = 'r')]
    red: PathBuf,

    /// Near-infrared band raster
    #[arg(long, short = 'n')]
    nir: PathBuf,

    /// Band index inside the red raster
    #[arg(long, default_value_t = 1)]
    red_band: usize,

    /// Band index inside the NIR raster
    #[arg(long, default_value_t = 1)]
    nir_band: usize,

    /// Output NDVI GeoTIFF
    #[arg(long, short)]
    out: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct ChangeArgs {
    /// NDVI raster of the first date
    #[arg(long, conflicts_with_all = ["red1", "nir1", "red2", "nir2"])]
    ndvi1: Option<PathBuf>,

    /// NDVI raster of the second date
    #[arg(long)]
    ndvi2: Option<PathBuf>,

    /// Red band of the first date
    #[arg(long)]
    red1: Option<PathBuf>,

    /// NIR band of the first date
    #[arg(long)]
    nir1: Option<PathBuf>,

    /// Red band of the second date
    #[arg(long)]
    red2: Option<PathBuf>,

    /// NIR band of the second date
    #[arg(long)]
    nir2: Option<PathBuf>,

    /// Symmetric change threshold: gain if delta >= t, loss if delta <= -t
    #[arg(long)]
    threshold: Option<f64>,

    /// Gain threshold (overrides --threshold)
    #[arg(long)]
    gain: Option<f64>,

    /// Loss threshold, usually negative (overrides --threshold)
    #[arg(long, allow_hyphen_values = true)]
    loss: Option<f64>,

    /// Projected CRS for area measurement (e.g. EPSG:32618)
    #[arg(long)]
    metric_crs: String,

    /// Area unit (m2, ha, km2)
    #[arg(long, default_value = "ha")]
    unit: String,

    /// Resampling for NDVI grids that do not align (nearest, bilinear)
    #[arg(long, default_value = "bilinear")]
    resampling: String,

    /// Output change mask GeoTIFF
    #[arg(long)]
    mask_out: PathBuf,

    /// Output area summary CSV
    #[arg(long)]
    summary_out: PathBuf,

    /// Optional NDVI difference GeoTIFF
    #[arg(long)]
    diff_out: Option<PathBuf>,

    /// Optional NDVI GeoTIFFs for both dates (band inputs only)
    #[arg(long, num_args = 2, value_names = ["T1", "T2"])]
    ndvi_out: Option<Vec<PathBuf>>,

    #[command(flatten)]
    common: CommonArgs,
}

fn config_from(common: &CommonArgs) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.ndvi.epsilon = common.epsilon;
    if common.invalidate_out_of_range {
        config.ndvi.out_of_range = OutOfRange::Invalidate;
    }
    config.write.compression = match common.compression.to_lowercase().as_str() {
        "none" | "" => None,
        _ => Some(common.compression.to_uppercase()),
    };
    config
}

fn thresholds_from(args: &ChangeArgs) -> Result<ChangeThresholds> {
    let gain = args.gain.or(args.threshold);
    let loss = args.loss.or(args.threshold.map(|t| -t));
    match (gain, loss) {
        (Some(gain), Some(loss)) => Ok(ChangeThresholds { gain, loss }),
        _ => bail!("a change threshold is required: pass --threshold, or both --gain and --loss"),
    }
}

fn inputs_from(args: &ChangeArgs) -> Result<ChangeInputs> {
    match (&args.ndvi1, &args.ndvi2, &args.red1, &args.nir1, &args.red2, &args.nir2) {
        (Some(t1), Some(t2), None, None, None, None) => Ok(ChangeInputs::Ndvi {
            t1: t1.clone(),
            t2: t2.clone(),
        }),
        (None, None, Some(red1), Some(nir1), Some(red2), Some(nir2)) => Ok(ChangeInputs::Bands {
            t1: BandPair::new(red1, nir1),
            t2: BandPair::new(red2, nir2),
        }),
        _ => bail!("pass either --ndvi1 and --ndvi2, or all of --red1 --nir1 --red2 --nir2"),
    }
}

fn ndvi(args: NdviArgs) -> Result<()> {
    let config = config_from(&args.common);
    let request = NdviRequest {
        bands: BandPair {
            red: args.red,
            nir: args.nir,
            red_band: args.red_band,
            nir_band: args.nir_band,
        },
        output: args.out,
        aoi: args.common.aoi,
    };

    let report = run_ndvi(&request, &config).context("NDVI run failed")?;

    println!("NDVI written to {}", report.output.display());
    println!("  size:           {} x {}", report.rows, report.cols);
    println!("  valid pixels:   {}", report.valid_pixels);
    println!("  out of range:   {}", report.out_of_range_pixels);
    println!(
        "  mean / std:     {:.4} / {:.4}",
        report.metrics.mean, report.metrics.std_dev
    );
    println!("  min / max:      {:.4} / {:.4}", report.metrics.min, report.metrics.max);
    println!(
        "  bare / sparse / moderate / dense: {} / {} / {} / {}",
        report.metrics.bare_pixels,
        report.metrics.sparse_pixels,
        report.metrics.moderate_pixels,
        report.metrics.dense_pixels
    );
    Ok(())
}

fn change(args: ChangeArgs) -> Result<()> {
    let mut config = config_from(&args.common);
    config.area_unit = args.unit.parse::<AreaUnit>()?;
    config.alignment.resampling = args.resampling.parse::<ResamplingMethod>()?;

    let ndvi_outputs = match &args.ndvi_out {
        Some(paths) if paths.len() == 2 => Some((paths[0].clone(), paths[1].clone())),
        Some(_) => bail!("--ndvi-out takes exactly two paths"),
        None => None,
    };

    let request = ChangeRequest {
        inputs: inputs_from(&args)?,
        thresholds: thresholds_from(&args)?,
        target_crs: args.metric_crs.clone(),
        mask_output: args.mask_out.clone(),
        summary_output: args.summary_out.clone(),
        difference_output: args.diff_out.clone(),
        ndvi_outputs,
        aoi: args.common.aoi.clone(),
    };

    let report = run_change(&request, &config).context("Change run failed")?;

    if report.resampled {
        println!("Second date was resampled onto the first date's grid");
    }
    print!("{}", format_area_table(&report.summary));
    for output in &report.outputs {
        println!("wrote {}", output.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Ndvi(args) => ndvi(args),
        Command::Change(args) => change(args),
    }
}
