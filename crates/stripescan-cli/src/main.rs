//! stripescan CLI — drive the structured-light pipeline stage by stage.
//!
//! Every subcommand reads its inputs from files and writes its outputs back
//! to files (PFM for single-band maps, FLO for two-band maps), so a scan can
//! be processed incrementally and restarted at any stage boundary.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

use stripescan::io::{self, Checkpoint};
use stripescan::matching::compute_disparities;
use stripescan::merge::{clip_disparities, mask_disparities, merge_disparity_maps, merge_with_stats};
use stripescan::crosscheck::cross_check_pair;
use stripescan::reproject::reproject;
use stripescan::{
    Axis, CodeTable, Grid, MatchConfig, RefineConfig, RefineMode, ReprojectConfig, SearchWindow,
};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "stripescan")]
#[command(
    about = "Decode structured-light stripe images into code maps, match them into disparity maps, and recover projection matrices"
)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[allow(clippy::large_enum_variant)]
enum Commands {
    /// Decode a sequence of thresholded stripe images into a code map.
    Decode(CliDecodeArgs),

    /// Filter, hole-fill and sub-pixel refine a decoded code map.
    Refine(CliRefineArgs),

    /// Match two (u, v) code maps into a reciprocal disparity-map pair.
    Disparities(CliDisparitiesArgs),

    /// Cross-check a reciprocal disparity-map pair.
    Crosscheck(CliCrosscheckArgs),

    /// Run the disparity filter stage on one map.
    Filter(CliFilterArgs),

    /// Merge several disparity maps of the same view.
    Merge(CliMergeArgs),

    /// Merge disparity maps with per-pixel statistics.
    MergeStats(CliMergeStatsArgs),

    /// Clip merged disparities to a range, updating the statistics maps.
    Clip(CliClipArgs),

    /// Invalidate disparities outside a byte mask.
    Mask(CliMaskArgs),

    /// Recover a projection matrix and reproject disparities.
    Reproject(CliReprojectArgs),

    /// Join two single-band PFM files into one FLO file.
    MergeFlo {
        #[arg(long)]
        u: PathBuf,
        #[arg(long)]
        v: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },

    /// Split a FLO file into two single-band PFM files.
    SplitFlo {
        #[arg(long)]
        flo: PathBuf,
        #[arg(long)]
        u: PathBuf,
        #[arg(long)]
        v: PathBuf,
    },
}

#[derive(Debug, Clone, Args)]
struct CliDecodeArgs {
    /// Thresholded pattern images, most significant bit first.
    /// Pixels: 255 = stripe on, 0 = off, 128 = undecided.
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Binary code table file (count + two u32 LE arrays).
    #[arg(long, conflicts_with = "gray_bits")]
    table: Option<PathBuf>,

    /// Use a plain Gray code with this many bits instead of a table file.
    #[arg(long)]
    gray_bits: Option<u32>,

    /// Stripe direction: 0 = vertical stripes (u codes), 1 = horizontal (v).
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=1))]
    direction: u8,

    /// Directory for the decoded checkpoint file.
    #[arg(long)]
    outdir: PathBuf,

    /// Optional PNG visualization of the decoded code map.
    #[arg(long)]
    preview: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct CliRefineArgs {
    /// Directory holding the decoded checkpoint and receiving the outputs.
    #[arg(long)]
    outdir: PathBuf,

    /// Stripe direction of the input map (0 or 1).
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=1))]
    direction: u8,

    /// Stripe gradient angle in radians.
    #[arg(long)]
    angle: f64,

    /// Input code map. Defaults to the decoded checkpoint in --outdir.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Foreground mask image; masked pixels are erased after refinement.
    #[arg(long)]
    mask: Option<PathBuf>,

    /// Refinement configuration (JSON). Flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Refinement algorithm.
    #[arg(long, value_enum)]
    mode: Option<CliRefineMode>,

    /// Averaging window half-width.
    #[arg(long)]
    radius: Option<usize>,

    /// Value-gradient bound of the pass along the stripe gradient.
    #[arg(long)]
    max_gradient: Option<f32>,

    /// Bound of the perpendicular pass.
    #[arg(long)]
    max_gradient_perp: Option<f32>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliRefineMode {
    Directional,
    AngleAligned,
    Planar,
}

impl CliRefineMode {
    fn to_core(self) -> RefineMode {
        match self {
            Self::Directional => RefineMode::DirectionalAverage,
            Self::AngleAligned => RefineMode::AngleAligned,
            Self::Planar => RefineMode::PlanarFit,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct CliDisparitiesArgs {
    /// Two-band (u, v) code map of the first view (FLO).
    #[arg(long)]
    code0: PathBuf,

    /// Two-band (u, v) code map of the second view (FLO).
    #[arg(long)]
    code1: PathBuf,

    /// Position index of the first view (used in output file names).
    #[arg(long)]
    pos0: usize,

    /// Position index of the second view.
    #[arg(long)]
    pos1: usize,

    /// Output directory for the disp{p0}{p1}{u,v}.pfm files.
    #[arg(long)]
    outdir: PathBuf,

    /// Matcher configuration (JSON). Flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum accepted code distance.
    #[arg(long)]
    max_diff: Option<f32>,

    /// Number of distinct code values.
    #[arg(long)]
    num_codes: Option<usize>,

    /// Search window of the second view relative to the first
    /// (all four bounds or none).
    #[arg(long)]
    dx_min: Option<i32>,
    #[arg(long)]
    dx_max: Option<i32>,
    #[arg(long)]
    dy_min: Option<i32>,
    #[arg(long)]
    dy_max: Option<i32>,
}

#[derive(Debug, Clone, Args)]
struct CliCrosscheckArgs {
    /// Forward disparity map (FLO).
    #[arg(long)]
    forward: PathBuf,

    /// Backward disparity map (FLO).
    #[arg(long)]
    backward: PathBuf,

    /// Checked forward map output (FLO).
    #[arg(long)]
    out_forward: PathBuf,

    /// Checked backward map output (FLO).
    #[arg(long)]
    out_backward: PathBuf,

    /// Euclidean consistency threshold.
    #[arg(long, default_value = "0.5")]
    thresh: f32,

    /// Check x disparities only.
    #[arg(long)]
    x_only: bool,

    /// Keep half-occluded pixels.
    #[arg(long)]
    half_occlusion: bool,
}

#[derive(Debug, Clone, Args)]
struct CliFilterArgs {
    /// Input disparity map (FLO).
    #[arg(long)]
    input: PathBuf,

    /// Filtered output (FLO).
    #[arg(long)]
    output: PathBuf,

    /// Hole-fill residual output (PFM).
    #[arg(long)]
    residual: Option<PathBuf>,

    /// Filter configuration (JSON); defaults apply otherwise.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct CliMergeArgs {
    /// Input disparity maps (FLO).
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Merged output (FLO).
    #[arg(long)]
    output: PathBuf,

    /// Samples that must agree before a plain mean is used.
    #[arg(long, default_value = "2")]
    min_group: usize,

    /// Agreement bound between samples.
    #[arg(long, default_value = "1.0")]
    max_diff: f32,
}

#[derive(Debug, Clone, Args)]
struct CliMergeStatsArgs {
    /// Reference disparity map (FLO).
    #[arg(long)]
    reference: PathBuf,

    /// Disparity maps of other viewpoints (FLO).
    #[arg(long)]
    views: Vec<PathBuf>,

    /// Disparity maps of other illumination directions (FLO).
    #[arg(long)]
    illums: Vec<PathBuf>,

    /// Agreement bound between samples.
    #[arg(long, default_value = "1.0")]
    max_diff: f32,

    /// Merged disparity output (FLO).
    #[arg(long)]
    out_disp: PathBuf,

    /// Per-pixel standard deviation output (PFM).
    #[arg(long)]
    out_sd: PathBuf,

    /// Per-pixel sample count output (byte image).
    #[arg(long)]
    out_n: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct CliClipArgs {
    #[arg(long)]
    disp: PathBuf,
    #[arg(long)]
    sd: PathBuf,
    #[arg(long)]
    n: PathBuf,

    /// Disparity range to keep.
    #[arg(long)]
    dmin: f32,
    #[arg(long)]
    dmax: f32,

    #[arg(long)]
    out_disp: PathBuf,
    #[arg(long)]
    out_sd: PathBuf,
    #[arg(long)]
    out_n: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct CliMaskArgs {
    /// Input disparity map (FLO).
    #[arg(long)]
    disp: PathBuf,

    /// Byte mask; zero pixels are invalidated.
    #[arg(long)]
    mask: PathBuf,

    /// Masked output (FLO).
    #[arg(long)]
    output: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct CliReprojectArgs {
    /// Disparity map of the view (FLO, x disparity in band 0).
    #[arg(long)]
    disp: PathBuf,

    /// (u, v) code map of the view (FLO).
    #[arg(long)]
    code: PathBuf,

    /// Projection matrix output (text, 12 numbers).
    #[arg(long)]
    mat: PathBuf,

    /// Comparison log output.
    #[arg(long)]
    log: PathBuf,

    /// Reprojected disparity output (FLO).
    #[arg(long)]
    output: PathBuf,

    /// Signed error image output (PFM).
    #[arg(long)]
    err: Option<PathBuf>,

    /// Reprojection configuration (JSON); the standard robust schedule
    /// applies otherwise.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> CliResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Decode(args) => run_decode(&args),
        Commands::Refine(args) => run_refine(&args),
        Commands::Disparities(args) => run_disparities(&args),
        Commands::Crosscheck(args) => run_crosscheck(&args),
        Commands::Filter(args) => run_filter_cmd(&args),
        Commands::Merge(args) => run_merge(&args),
        Commands::MergeStats(args) => run_merge_stats(&args),
        Commands::Clip(args) => run_clip(&args),
        Commands::Mask(args) => run_mask(&args),
        Commands::Reproject(args) => run_reproject(&args),
        Commands::MergeFlo { u, v, out } => Ok(io::merge_to_flo(&u, &v, &out)?),
        Commands::SplitFlo { flo, u, v } => Ok(io::split_from_flo(&flo, &u, &v)?),
    }
}

fn load_config<T: serde::de::DeserializeOwned + Default>(path: Option<&Path>) -> CliResult<T> {
    match path {
        Some(p) => Ok(serde_json::from_reader(std::fs::File::open(p)?)?),
        None => Ok(T::default()),
    }
}

fn axis_of(direction: u8) -> Axis {
    if direction == 0 {
        Axis::X
    } else {
        Axis::Y
    }
}

// ── decode ─────────────────────────────────────────────────────────────

fn run_decode(args: &CliDecodeArgs) -> CliResult<()> {
    let table = match (&args.table, args.gray_bits) {
        (Some(path), None) => CodeTable::load(path)?,
        (None, Some(bits)) => CodeTable::gray(bits)?,
        _ => return Err("provide exactly one of --table and --gray-bits".into()),
    };

    let num_bits = args.images.len();
    let mut decoder = None;
    for (i, path) in args.images.iter().enumerate() {
        let img = io::read_mask(path)?;
        let dec = decoder.get_or_insert_with(|| {
            stripescan::decode::Decoder::new(img.width() as usize, img.height() as usize)
        });
        dec.accumulate_bit(&img, (num_bits - 1 - i) as u32)?;
    }
    let decoder = decoder.ok_or("no input images")?;
    let grid = decoder.decode(&table);

    let out = io::checkpoint_path(&args.outdir, args.direction as usize, Checkpoint::Initial);
    io::write_pfm(&out, &grid)?;
    log::info!("decoded {} bit planes to {}", num_bits, out.display());

    if let Some(preview) = &args.preview {
        stripescan::decode::code_map_to_rgb(&grid, table.num_codes()).save(preview)?;
    }
    Ok(())
}

// ── refine ─────────────────────────────────────────────────────────────

fn run_refine(args: &CliRefineArgs) -> CliResult<()> {
    let mut config: RefineConfig = load_config(args.config.as_deref())?;
    if let Some(mode) = args.mode {
        config.mode = mode.to_core();
    }
    if let Some(radius) = args.radius {
        config.radius = radius;
    }
    if let Some(g) = args.max_gradient {
        config.max_gradient_primary = g;
    }
    if let Some(g) = args.max_gradient_perp {
        config.max_gradient_secondary = g;
    }

    let input = args.input.clone().unwrap_or_else(|| {
        io::checkpoint_path(&args.outdir, args.direction as usize, Checkpoint::Initial)
    });
    let decoded = io::read_pfm(&input)?;
    let mask = args.mask.as_deref().map(io::read_mask).transpose()?;

    stripescan::refine::refine_pipeline(
        &args.outdir,
        axis_of(args.direction),
        &decoded,
        args.angle,
        mask.as_ref(),
        &config,
    )?;
    Ok(())
}

// ── disparities ────────────────────────────────────────────────────────

fn run_disparities(args: &CliDisparitiesArgs) -> CliResult<()> {
    let mut config: MatchConfig = load_config(args.config.as_deref())?;
    if let Some(max_diff) = args.max_diff {
        config.max_diff = max_diff;
    }
    if let Some(num_codes) = args.num_codes {
        config.num_codes = num_codes;
    }

    let window = match (args.dx_min, args.dx_max, args.dy_min, args.dy_max) {
        (Some(dx_min), Some(dx_max), Some(dy_min), Some(dy_max)) => Some(SearchWindow {
            dx_min,
            dx_max,
            dy_min,
            dy_max,
        }),
        (None, None, None, None) => None,
        _ => return Err("provide all four search-window bounds or none".into()),
    };

    let code0 = io::read_flo(&args.code0)?;
    let code1 = io::read_flo(&args.code1)?;
    let (d0, d1) = compute_disparities(&code0, &code1, window, &config)?;

    let (u0, v0) = d0.split_bands();
    let (u1, v1) = d1.split_bands();
    io::write_pfm(&io::disparity_path(&args.outdir, args.pos0, args.pos1, Axis::X), &u0)?;
    io::write_pfm(&io::disparity_path(&args.outdir, args.pos0, args.pos1, Axis::Y), &v0)?;
    io::write_pfm(&io::disparity_path(&args.outdir, args.pos1, args.pos0, Axis::X), &u1)?;
    io::write_pfm(&io::disparity_path(&args.outdir, args.pos1, args.pos0, Axis::Y), &v1)?;
    Ok(())
}

// ── crosscheck ─────────────────────────────────────────────────────────

fn run_crosscheck(args: &CliCrosscheckArgs) -> CliResult<()> {
    let d0 = io::read_flo(&args.forward)?;
    let d1 = io::read_flo(&args.backward)?;
    let (c0, c1) = cross_check_pair(&d0, &d1, args.thresh, args.x_only, args.half_occlusion);
    io::write_flo(&args.out_forward, &c0)?;
    io::write_flo(&args.out_backward, &c1)?;
    Ok(())
}

// ── filter ─────────────────────────────────────────────────────────────

fn run_filter_cmd(args: &CliFilterArgs) -> CliResult<()> {
    let config: stripescan::filters::FilterConfig = load_config(args.config.as_deref())?;
    let mut grid = io::read_flo(&args.input)?;
    let residual = stripescan::filters::run_filter(&mut grid, &config);
    io::write_flo(&args.output, &grid)?;
    if let (Some(path), Some(residual)) = (&args.residual, residual) {
        io::write_pfm(path, &residual)?;
    }
    Ok(())
}

// ── merge ──────────────────────────────────────────────────────────────

fn run_merge(args: &CliMergeArgs) -> CliResult<()> {
    let maps = args
        .inputs
        .iter()
        .map(|p| io::read_flo(p))
        .collect::<stripescan::Result<Vec<Grid>>>()?;
    let merged = merge_disparity_maps(&maps, args.min_group, args.max_diff)?;
    io::write_flo(&args.output, &merged)?;
    Ok(())
}

fn run_merge_stats(args: &CliMergeStatsArgs) -> CliResult<()> {
    let reference = io::read_flo(&args.reference)?;
    let views = args
        .views
        .iter()
        .map(|p| io::read_flo(p))
        .collect::<stripescan::Result<Vec<Grid>>>()?;
    let illums = args
        .illums
        .iter()
        .map(|p| io::read_flo(p))
        .collect::<stripescan::Result<Vec<Grid>>>()?;

    let (d, sd, n) = merge_with_stats(&reference, &views, &illums, args.max_diff)?;
    io::write_flo(&args.out_disp, &d)?;
    io::write_pfm(&args.out_sd, &sd)?;
    n.save(&args.out_n)?;
    Ok(())
}

fn run_clip(args: &CliClipArgs) -> CliResult<()> {
    let mut d = io::read_flo(&args.disp)?;
    let mut sd = io::read_pfm(&args.sd)?;
    let mut n = io::read_mask(&args.n)?;
    clip_disparities(&mut d, &mut sd, &mut n, args.dmin, args.dmax);
    io::write_flo(&args.out_disp, &d)?;
    io::write_pfm(&args.out_sd, &sd)?;
    n.save(&args.out_n)?;
    Ok(())
}

fn run_mask(args: &CliMaskArgs) -> CliResult<()> {
    let mut d = io::read_flo(&args.disp)?;
    let mask = io::read_mask(&args.mask)?;
    mask_disparities(&mut d, &mask)?;
    io::write_flo(&args.output, &d)?;
    Ok(())
}

// ── reproject ──────────────────────────────────────────────────────────

fn run_reproject(args: &CliReprojectArgs) -> CliResult<()> {
    let config: ReprojectConfig = load_config(args.config.as_deref())?;
    let disp = io::read_flo(&args.disp)?;
    let code = io::read_flo(&args.code)?;
    let (ndisp, _) = reproject(
        &disp,
        &code,
        &args.mat,
        &args.log,
        args.err.as_deref(),
        &config,
    )?;
    io::write_flo(&args.output, &ndisp)?;
    log::info!("reprojected disparities written to {}", args.output.display());
    Ok(())
}
