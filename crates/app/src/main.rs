use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand, ValueEnum};
use rtscope_core::{
    ExportSink, JsonLinesSink, Result, Scope, ScopeConfig, ScopeError, ScopeProducer, WireSink,
};
use tracing_subscriber::EnvFilter;

fn main() -> rtscope_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::DefaultConfig { output } => write_default_config(output.as_deref()),
    }
}

fn run(args: RunArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => ScopeConfig::from_json_file(path)?,
        None => ScopeConfig::default(),
    };
    tracing::info!(
        config = ?args.config,
        signal = ?args.signal,
        duration_ms = args.duration_ms,
        "starting capture"
    );

    let mut scope = Scope::setup(config.clone())?;
    if config.slider_count > 0 {
        scope.set_slider(0, 0.0, 2.0, 0.01, 1.0, "gain")?;
    }

    let sink = open_sink(args.format, args.output.as_deref())?;
    let (producer, mut controller) = scope.start(sink)?;

    let running = Arc::new(AtomicBool::new(true));
    let generator = SignalGenerator::new(args.signal, args.frequency, args.amplitude, &config);
    let rt_thread = thread::Builder::new().name("scope-producer".into()).spawn({
        let running = Arc::clone(&running);
        let block_size = args.block_size.max(1);
        let sample_rate = config.sample_rate;
        move || run_producer(producer, generator, block_size, sample_rate, &running)
    })?;

    let started = Instant::now();
    let duration = Duration::from_millis(args.duration_ms);
    let force_every = args.force_every_ms.map(Duration::from_millis);
    let mut last_force = Instant::now();
    while started.elapsed() < duration {
        thread::sleep(Duration::from_millis(5));
        if let Some(every) = force_every {
            if last_force.elapsed() >= every {
                last_force = Instant::now();
                let accepted = controller.trigger();
                tracing::debug!(accepted, "forced trigger");
            }
        }
        if config.slider_count > 0 {
            let sweep = (started.elapsed().as_secs_f32() * 0.5).fract() * 2.0;
            controller.write_slider(0, sweep)?;
        }
    }

    if args.spectral_at_end {
        controller.apply(rtscope_core::Setting::PlotMode(rtscope_core::PlotMode::Spectral))?;
        thread::sleep(Duration::from_millis(100));
    }

    let stats = controller.stats();
    let mut sink = controller.stop()?;
    running.store(false, Ordering::Release);
    rt_thread
        .join()
        .map_err(|_| ScopeError::msg("producer thread panicked"))?;
    sink.flush()?;

    tracing::info!(
        ticks = stats.ticks,
        triggers = stats.triggers,
        delivered = stats.delivered,
        dropped = stats.dropped,
        failures = stats.export_failures,
        "capture finished"
    );
    Ok(())
}

/// Simulated real-time loop: logs one block per period at the sample rate.
fn run_producer(
    mut producer: ScopeProducer,
    mut generator: SignalGenerator,
    block_size: usize,
    sample_rate: f32,
    running: &AtomicBool,
) {
    let period = Duration::from_secs_f64(block_size as f64 / sample_rate as f64);
    let mut frame = vec![0.0; generator.channels()];
    let mut next = Instant::now();
    let mut gain = 1.0;
    while running.load(Ordering::Acquire) {
        if generator.has_gain_slider && producer.slider_changed(0) {
            gain = producer.slider_value(0);
        }
        for _ in 0..block_size {
            generator.next_frame(&mut frame, gain);
            producer.log(&frame);
        }
        next += period;
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }
}

fn write_default_config(output: Option<&Path>) -> Result<()> {
    let json = ScopeConfig::default().to_json_pretty()?;
    match output {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{json}"),
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

/// Opens the export target chosen on the command line.
fn open_sink(format: OutputFormat, path: Option<&Path>) -> Result<Box<dyn ExportSink + Send>> {
    let writer: Box<dyn Write + Send> = match path {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout()),
    };
    let writer = BufWriter::new(writer);
    Ok(match format {
        OutputFormat::Json => Box::new(JsonLinesSink::new(writer)),
        OutputFormat::Wire => Box::new(WireSink::new(writer)),
    })
}

/// Test signal fed to the producer, one phase-shifted copy per channel.
struct SignalGenerator {
    kind: SignalKind,
    channels: usize,
    amplitude: f32,
    phase: f32,
    increment: f32,
    has_gain_slider: bool,
}

impl SignalGenerator {
    fn new(kind: SignalKind, frequency: f32, amplitude: f32, config: &ScopeConfig) -> Self {
        Self {
            kind,
            channels: config.channels,
            amplitude,
            phase: 0.0,
            increment: frequency / config.sample_rate,
            has_gain_slider: config.slider_count > 0,
        }
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn next_frame(&mut self, frame: &mut [f32], gain: f32) {
        for (channel, value) in frame.iter_mut().enumerate() {
            let phase = (self.phase + channel as f32 / self.channels as f32).fract();
            let raw = match self.kind {
                SignalKind::Sine => (std::f32::consts::TAU * phase).sin(),
                SignalKind::Square => {
                    if phase < 0.5 {
                        1.0
                    } else {
                        -1.0
                    }
                }
                SignalKind::Silence => 0.0,
            };
            *value = raw * self.amplitude * gain;
        }
        self.phase = (self.phase + self.increment).fract();
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Real-time triggered scope capture", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive the scope from a simulated real-time thread and export snapshots.
    Run(RunArgs),
    /// Print or write the default configuration as JSON.
    DefaultConfig {
        /// File to write instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// JSON configuration file; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// How long to capture for.
    #[arg(long, default_value_t = 1000)]
    duration_ms: u64,
    #[arg(long, value_enum, default_value_t = SignalKind::Sine)]
    signal: SignalKind,
    /// Test signal frequency in Hz.
    #[arg(long, default_value_t = 440.0)]
    frequency: f32,
    #[arg(long, default_value_t = 0.8)]
    amplitude: f32,
    /// Frames logged per simulated processing period.
    #[arg(long, default_value_t = 64)]
    block_size: usize,
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
    /// Output file; stdout when omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Force a trigger at this interval (useful with the custom trigger mode).
    #[arg(long)]
    force_every_ms: Option<u64>,
    /// Switch to the spectral plot mode just before stopping.
    #[arg(long)]
    spectral_at_end: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SignalKind {
    Sine,
    Square,
    Silence,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    /// One JSON object per line.
    Json,
    /// Binary header plus little-endian f32 payload.
    Wire,
}
