use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use framegrab_core::{capture_single, save_image, CaptureLoop, SavePolicy, StopSignal};
use framegrab_hw::negotiate::{current_pixel_format, negotiate, select_pixel_format};
use framegrab_hw::node::text_or_unknown;
use framegrab_hw::{AcquisitionSession, CaptureContext, DeviceInfo, Node, NodeMap};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
mod display;

use config::Config;

#[derive(Parser)]
#[command(name = "framegrab", about = "Camera capture and live preview")]
struct Cli {
    /// Device path, or `stub://[PixelFormat]` for the synthetic camera
    /// (default: $FRAMEGRAB_DEVICE, else the first V4L2 capture device)
    #[arg(short, long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List detected cameras
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show identity and node access of the first camera
    Info {
        #[arg(long)]
        json: bool,
    },
    /// Capture one frame and save it
    Single {
        #[command(flatten)]
        capture: CaptureArgs,
        /// Output image (default: single_frame.png)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Stream continuously with FPS overlay and periodic saving
    Stream {
        #[command(flatten)]
        capture: CaptureArgs,
        /// Save every Nth frame, 0 to disable (default: 10)
        #[arg(long)]
        save_every: Option<u64>,
        /// Directory for saved frames (default: captures)
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Stop after this many frames
        #[arg(long)]
        frames: Option<u64>,
        /// Do not open a preview window
        #[arg(long)]
        headless: bool,
    },
}

#[derive(Args)]
struct CaptureArgs {
    #[arg(long)]
    width: Option<i64>,
    #[arg(long)]
    height: Option<i64>,
    #[arg(long)]
    fps: Option<f64>,
    /// Per-frame fetch timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

impl CaptureArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(w) = self.width {
            config.width = w;
        }
        if let Some(h) = self.height {
            config.height = h;
        }
        if let Some(fps) = self.fps {
            config.fps = fps;
        }
        if let Some(ms) = self.timeout_ms {
            config.timeout_ms = ms;
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(device) = cli.device {
        config.device = Some(device);
    }

    let mut ctx = CaptureContext::init(config.system());

    match cli.command {
        Commands::List { json } => list(&mut ctx, json),
        Commands::Info { json } => info(&mut ctx, json),
        Commands::Single { capture, output } => {
            capture.apply(&mut config);
            if let Some(output) = output {
                config.single_output = output;
            }
            single(&mut ctx, &config)
        }
        Commands::Stream {
            capture,
            save_every,
            output_dir,
            frames,
            headless,
        } => {
            capture.apply(&mut config);
            if let Some(n) = save_every {
                config.save_every = n;
            }
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            stream(&mut ctx, &config, frames, headless)
        }
    }
}

fn list(ctx: &mut CaptureContext, json: bool) -> Result<()> {
    let cameras = ctx.cameras().context("failed to enumerate cameras")?;
    let infos = cameras.infos();

    if json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
        return Ok(());
    }
    if infos.is_empty() {
        println!("No cameras detected");
    }
    for (i, info) in infos.iter().enumerate() {
        let path = info.path.as_deref().unwrap_or("-");
        println!("{i}: {} {} ({}) {path}", info.vendor, info.model, info.serial);
    }
    Ok(())
}

#[derive(Serialize)]
struct NodeReport {
    name: &'static str,
    readable: bool,
    writable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

#[derive(Serialize)]
struct InfoReport {
    device: DeviceInfo,
    pixel_formats: Vec<String>,
    nodes: Vec<NodeReport>,
}

fn info(ctx: &mut CaptureContext, json: bool) -> Result<()> {
    let mut cameras = ctx.cameras().context("failed to enumerate cameras")?;
    let session = AcquisitionSession::open(&mut cameras).context("failed to open camera")?;

    let nodes = Node::ALL
        .iter()
        .map(|&node| {
            let access = session.access(node);
            NodeReport {
                name: node.name(),
                readable: access.readable,
                writable: access.writable,
                value: access
                    .readable
                    .then(|| session.read(node).ok())
                    .flatten()
                    .map(|v| v.to_string()),
            }
        })
        .collect();
    let report = InfoReport {
        device: session.info(),
        pixel_formats: session.entries(Node::PixelFormat).unwrap_or_default(),
        nodes,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Vendor:  {}", text_or_unknown(&session, Node::DeviceVendorName));
    println!("Model:   {}", text_or_unknown(&session, Node::DeviceModelName));
    println!("Serial:  {}", text_or_unknown(&session, Node::DeviceSerialNumber));
    if let Some(path) = &report.device.path {
        println!("Path:    {path}");
        let real = report.device.real_path.as_deref();
        println!("Real:    {}", real.unwrap_or("could not resolve link"));
    }
    println!("Formats: {}", report.pixel_formats.join(", "));
    println!();
    for node in &report.nodes {
        let access = match (node.readable, node.writable) {
            (true, true) => "RW",
            (true, false) => "RO",
            (false, true) => "WO",
            (false, false) => "--",
        };
        println!(
            "  {:<28} {access}  {}",
            node.name,
            node.value.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// Pixel format and capture parameters, before streaming starts.
fn configure(session: &mut AcquisitionSession<'_>, config: &Config) {
    let info = session.info();
    tracing::info!(
        vendor = %info.vendor,
        model = %info.model,
        serial = %info.serial,
        "configuring camera"
    );

    current_pixel_format(&*session);
    if select_pixel_format(&mut *session, &config.format_preferences()).is_some() {
        current_pixel_format(&*session);
    }
    negotiate(&mut *session, &config.request());
}

fn single(ctx: &mut CaptureContext, config: &Config) -> Result<()> {
    let mut cameras = ctx.cameras().context("failed to enumerate cameras")?;
    let mut session = AcquisitionSession::open(&mut cameras).context("failed to open camera")?;
    configure(&mut session, config);

    let Some(frame) = capture_single(&mut session, config.timeout())? else {
        println!("Frame arrived incomplete; nothing saved");
        return Ok(());
    };
    save_image(&frame, &config.single_output)?;
    println!(
        "Saved {}x{} frame to {}",
        frame.width(),
        frame.height(),
        config.single_output.display()
    );
    Ok(())
}

fn stream(
    ctx: &mut CaptureContext,
    config: &Config,
    frames: Option<u64>,
    headless: bool,
) -> Result<()> {
    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.stop())
        .context("failed to install Ctrl-C handler")?;

    let mut cameras = ctx.cameras().context("failed to enumerate cameras")?;
    let mut session = AcquisitionSession::open(&mut cameras).context("failed to open camera")?;
    configure(&mut session, config);

    let mut display = display::open(headless, &config.window_title)?;
    let capture = CaptureLoop::new(config.timeout())
        .with_save_policy(SavePolicy::new(config.save_every, &config.output_dir))
        .with_frame_limit(frames)
        .with_max_consecutive_timeouts(config.max_consecutive_timeouts)
        .with_stop_signal(stop);

    let summary = capture.run(&mut session, display.as_mut())?;
    println!(
        "{} frames in {:.1}s ({:.1} fps), {} incomplete, {} saved",
        summary.frames,
        summary.elapsed.as_secs_f64(),
        summary.fps,
        summary.incomplete,
        summary.saved.len()
    );
    Ok(())
}
