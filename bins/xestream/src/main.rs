use std::fs::File;
use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use tpx3_core::{RunContext, Timer};
use tpx3_detector::{ChipPosition, Detector, DetectorLayout, PixelMap};
use tpx3_spectra::{Aggregator, writer_from_uri};
use xestream_config::{AppConfig, PixelMapFormat};
use xestream_control::{ControlClient, TriggerSetup};
use xestream_engine::{Pipeline, PipelineConfig};

/// Handle a Timepix3 raw stream: reconstruct TDC periods and emit
/// time-resolved energy-point spectra.
#[derive(Parser, Debug)]
#[command(name = "xestream", version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "xestream.toml")]
    config: PathBuf,

    /// ASI server address, overrides the config
    #[arg(short, long)]
    server: Option<String>,

    /// Raw stream listen address, overrides the config
    #[arg(short = 'a', long)]
    listen: Option<String>,

    /// Binary pixel configuration file path, as seen by the server
    #[arg(short, long)]
    bpc_file: Option<String>,

    /// DACs file path, as seen by the server
    #[arg(short, long)]
    dacs_file: Option<String>,

    /// Number of preallocated data buffers per chip
    #[arg(short = 'n', long)]
    num_buffers: Option<usize>,

    /// Data buffer byte size, rounded up to a multiple of 8
    #[arg(short = 'N', long)]
    buf_size: Option<usize>,

    /// Spectra destination uri (file:<base> or tcp:<host>:<port>)
    #[arg(long)]
    destination: Option<String>,

    /// Skip the control plane: bind the listen address and wait for a raw
    /// stream connection
    #[arg(long)]
    no_control: bool,

    /// Log filter, overrides the config (e.g. debug, xestream=trace)
    #[arg(short, long)]
    log_level: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        AppConfig::load(cli.config.display().to_string())?
    } else {
        AppConfig::from_str("")?
    };
    if let Some(server) = &cli.server {
        config.server = server.clone();
    }
    if let Some(listen) = &cli.listen {
        config.listen = listen.clone();
    }
    if let Some(num_buffers) = cli.num_buffers {
        config.num_buffers = num_buffers;
    }
    if let Some(buf_size) = cli.buf_size {
        config.buffer_size = buf_size;
    }
    if let Some(destination) = &cli.destination {
        config.destination = destination.clone();
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let (stream, layout) = if cli.no_control {
        info!(listen = %config.listen, "control plane skipped, waiting for raw stream");
        let listener = TcpListener::bind(&config.listen)?;
        let (stream, sender) = listener.accept()?;
        info!(%sender, "raw stream connected");
        (stream, DetectorLayout::row(config.num_chips))
    } else {
        connect_detector(&config, &cli)?
    };

    let detector = Arc::new(build_detector(&config, layout)?);
    info!(
        num_chips = detector.num_chips(),
        npoints = detector.energy_points.npoints(),
        troi_start = detector.troi_start,
        troi_step = detector.troi_step,
        troi_n = detector.troi_n,
        "detector configured"
    );

    let ctx = Arc::new(RunContext::new());
    let aggregator = Aggregator::new(&detector, config.effective_num_slots());
    let destination = config.destination_uri();
    let writer = writer_from_uri(&destination, &detector)?;
    info!(%destination, "spectra destination ready");
    let writer_handle = aggregator.spawn_writer(writer, Arc::clone(&ctx));

    let pipeline = Pipeline::new(
        PipelineConfig {
            buffer_size: config.effective_buffer_size(),
            num_buffers: config.num_buffers,
            initial_period: config.initial_period,
            threshold: config.threshold,
            max_period_queues: config.max_period_queues,
        },
        Arc::clone(&detector),
        Arc::clone(&aggregator),
        Arc::clone(&ctx),
    );

    let clock = Timer::start();
    let stats = pipeline.run(stream);
    let elapsed = clock.elapsed();

    aggregator.finish();
    writer_handle.join();

    info!(
        hits = stats.hits,
        tdcs = stats.tdcs,
        skipped = stats.skipped_hits,
        elapsed_s = elapsed,
        rate = stats.hit_rate(elapsed),
        "acquisition finished"
    );
    info!(
        read_work_s = stats.read_time,
        read_spin_s = stats.read_spin_time,
        analyse_work_s = stats.analyse_time,
        analyse_spin_s = stats.analyse_spin_time,
        "thread time accounting"
    );

    if let Some(message) = ctx.last_error() {
        error!(%message, "acquisition failed");
        return Err(message.into());
    }
    Ok(())
}

/// Full control-plane startup: configure the detector, point its raw output
/// at our listener, start the measurement and accept the connection.
fn connect_detector(
    config: &AppConfig,
    cli: &Cli,
) -> Result<(TcpStream, DetectorLayout), Box<dyn std::error::Error>> {
    info!(server = %config.server, "connecting to ASI server");
    let client = ControlClient::connect(&config.server)?;
    let version = client.software_version()?;
    info!(%version, "server software");

    match (&cli.bpc_file, &cli.dacs_file) {
        (Some(bpc), Some(dacs)) => client.load_detector_files(bpc, dacs)?,
        (None, None) => info!("no bpc/dacs files given, keeping server-side configuration"),
        _ => return Err("either give both --bpc-file and --dacs-file or neither".into()),
    }

    client.configure_triggers(TriggerSetup::default())?;
    let num_chips = client.number_of_chips()?;
    let layout = match client.detector_layout() {
        Ok(layout) => DetectorLayout {
            width: layout.width,
            height: layout.height,
            chips: layout
                .chips
                .iter()
                .map(|c| ChipPosition { x: c.x, y: c.y })
                .collect(),
        },
        Err(err) => {
            debug!(%err, "no usable chip layout from the server, assuming a row");
            DetectorLayout::row(num_chips)
        }
    };

    info!(listen = %config.listen, "listening for the raw stream");
    let listener = TcpListener::bind(&config.listen)?;
    client.set_raw_destination(&config.listen)?;
    client.start_measurement()?;

    let (stream, sender) = listener.accept()?;
    info!(%sender, "raw stream connected");
    Ok((stream, layout))
}

fn build_detector(
    config: &AppConfig,
    layout: DetectorLayout,
) -> Result<Detector, Box<dyn std::error::Error>> {
    let num_chips = layout.num_chips();
    let mut detector = Detector::new(layout);
    detector.toa_mode = config.toa_mode;
    detector.set_time_roi(config.tr_start, config.tr_step, config.tr_n);
    detector.energy_points = match config.pixel_map_format {
        PixelMapFormat::Auto => PixelMap::load(&config.pixel_map, num_chips)?,
        PixelMapFormat::Json => {
            let text = std::fs::read_to_string(&config.pixel_map)?;
            PixelMap::from_json_str(&text, num_chips)?
        }
        PixelMapFormat::Text => {
            let file = File::open(&config.pixel_map)?;
            PixelMap::from_text(BufReader::new(file), num_chips)?
        }
    };
    Ok(detector)
}
