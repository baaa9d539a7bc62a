use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand, ValueEnum};
use sha2::Digest as _;

#[derive(Parser, Debug)]
#[command(name = "tilefract", version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render the field and write it as BMP or PNG.
    Render(RenderArgs),
    /// Print the tile grid, lane assignment and dispatch size without touching a device.
    Plan(SizingArgs),
}

#[derive(Args, Debug)]
struct SizingArgs {
    /// JSON config file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Tile edge (width, and height unless --tile-height is given).
    #[arg(long)]
    tile: Option<u32>,

    #[arg(long)]
    tile_height: Option<u32>,

    #[arg(long)]
    group_size: Option<u32>,

    #[arg(long, value_enum)]
    rounding: Option<RoundingChoice>,
}

#[derive(Args, Debug)]
struct RenderArgs {
    #[command(flatten)]
    sizing: SizingArgs,

    #[arg(long, value_enum)]
    mode: Option<ModeChoice>,

    /// Sub-batches per lane.
    #[arg(long)]
    iterations: Option<u32>,

    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long, value_enum)]
    kernel: Option<KernelChoice>,

    /// Enable device validation (write-ownership checks on cpu, driver validation on gpu).
    #[arg(long)]
    validation: bool,

    /// Fail unless the device gives each lane its own queue.
    #[arg(long)]
    require_independent_queues: bool,

    #[arg(long, value_enum, default_value_t = BackendChoice::Cpu)]
    backend: BackendChoice,

    #[arg(long)]
    device_index: Option<usize>,

    /// Output image (.bmp or .png).
    #[arg(long, default_value = "mandelbrot.bmp")]
    out: PathBuf,

    /// Also print the SHA-256 of the RGBA8 bytes.
    #[arg(long)]
    digest: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoundingChoice {
    Ceil,
    LegacyOverflow,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeChoice {
    Joint,
    Threaded,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KernelChoice {
    Mandelbrot,
    Gradient,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendChoice {
    Cpu,
    Gpu,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.cmd {
        Command::Render(args) => cmd_render(args),
        Command::Plan(args) => cmd_plan(args),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();
}

fn sized_config(args: &SizingArgs) -> anyhow::Result<tilefract::RenderConfig> {
    let mut cfg = match &args.config {
        Some(path) => tilefract::RenderConfig::from_json_file(path)?,
        None => tilefract::RenderConfig::default(),
    };
    if let Some(w) = args.width {
        cfg.canvas.width = w;
    }
    if let Some(h) = args.height {
        cfg.canvas.height = h;
    }
    if let Some(t) = args.tile {
        cfg.tile = tilefract::TileSize::square(t);
    }
    if let Some(th) = args.tile_height {
        cfg.tile.height = th;
    }
    if let Some(g) = args.group_size {
        cfg.group_size = g;
    }
    if let Some(r) = args.rounding {
        cfg.dispatch_rounding = match r {
            RoundingChoice::Ceil => tilefract::DispatchRounding::Ceil,
            RoundingChoice::LegacyOverflow => tilefract::DispatchRounding::LegacyOverflow,
        };
    }
    Ok(cfg)
}

fn cmd_render(args: RenderArgs) -> anyhow::Result<()> {
    let mut cfg = sized_config(&args.sizing)?;
    if let Some(m) = args.mode {
        cfg.submit.mode = match m {
            ModeChoice::Joint => tilefract::SubmitMode::Joint,
            ModeChoice::Threaded => tilefract::SubmitMode::Threaded,
        };
    }
    if let Some(n) = args.iterations {
        cfg.submit.iterations = n;
    }
    if let Some(ms) = args.timeout_ms {
        cfg.fence_timeout_ms = ms;
    }
    if let Some(k) = args.kernel {
        cfg.kernel = match k {
            KernelChoice::Mandelbrot => tilefract::KernelSpec::default(),
            KernelChoice::Gradient => tilefract::KernelSpec::Gradient,
        };
    }
    cfg.validation.enabled |= args.validation;
    cfg.require_independent_queues |= args.require_independent_queues;
    if let Some(i) = args.device_index {
        cfg.device_index = i;
    }
    cfg.validate()?;

    let kind = tilefract::parse_device_kind(match args.backend {
        BackendChoice::Cpu => "cpu",
        BackendChoice::Gpu => "gpu",
    })?;
    let sink: Arc<dyn tilefract::DiagnosticSink> = Arc::new(tilefract::TracingSink);
    let opts = tilefract::DeviceOptions::from_config(&cfg, Some(sink));
    let device = tilefract::create_device(kind, &opts).context("create device")?;

    let out = tilefract::render_to_file(device.as_ref(), &cfg, &args.out)
        .with_context(|| format!("render '{}'", args.out.display()))?;

    let report = &out.report;
    tracing::info!(
        device = %report.device.name,
        tiles = report.tiles,
        lane0 = report.lane_tiles[0],
        lane1 = report.lane_tiles[1],
        submissions = report.stats.submissions,
        findings = report.stats.validation_findings,
        "done"
    );
    println!("{}", args.out.display());
    if args.digest {
        println!("sha256 {}", sha256_hex(&out.image.data));
    }
    Ok(())
}

fn cmd_plan(args: SizingArgs) -> anyhow::Result<()> {
    let cfg = sized_config(&args)?;
    cfg.validate()?;
    let scheduler = tilefract::TileScheduler::new(cfg.canvas, cfg.tile)?;
    let schedule = scheduler.schedule();
    let grid = &schedule.grid;

    println!(
        "canvas {}  tile {}  grid {}x{} ({} tiles)",
        cfg.canvas,
        cfg.tile,
        grid.cols,
        grid.rows,
        grid.len()
    );
    for row in 0..grid.rows {
        let line: Vec<String> = (0..grid.cols)
            .map(|col| tilefract::assign_lane(row, col).index().to_string())
            .collect();
        println!("  {}", line.join(" "));
    }
    let [l0, l1] = schedule.lane_sizes();
    println!("lane0 {l0} tiles");
    println!("lane1 {l1} tiles");

    if let Some(tile) = grid.tiles.first() {
        let d = tilefract::dispatch_for_tile(tile, cfg.group_size, cfg.dispatch_rounding)?;
        println!(
            "dispatch {}x{}x{} groups of {g}x{g}",
            d.x,
            d.y,
            d.z,
            g = cfg.group_size
        );
    }
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = sha2::Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
