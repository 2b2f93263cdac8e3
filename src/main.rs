use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use midi_latency::config::SystemConfig;
use midi_latency::input::MidiInputTrial;
use midi_latency::link::ClockLink;
use midi_latency::output::MidiOutputTrial;
use midi_latency::runner::{drive, TrialEngine};
use midi_latency::session::SessionReport;
use midi_latency::sim::{SimParams, SimProbe};
use midi_latency::sink::LogCrateSink;
use midi_latency::traits::LogSink;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum DirectionArg {
    /// Probe emits notes, host measures arrival
    Input,
    /// Host emits notes, probe reports detection
    Output,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, value_enum, default_value_t = DirectionArg::Input)]
    direction: DirectionArg,

    /// Overrides the configured repetition count
    #[arg(short, long)]
    repetitions: Option<usize>,

    /// JSON config file; missing fields keep their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the session report as JSON
    #[arg(long)]
    report: Option<PathBuf>,

    #[arg(long, default_value_t = 2.0)]
    midi_latency_ms: f64,

    #[arg(long, default_value_t = 0.5)]
    app_latency_ms: f64,

    #[arg(long, default_value_t = 3.0)]
    probe_latency_ms: f64,

    #[arg(long, default_value_t = 0.0)]
    drift_ppm: f64,

    #[arg(long, default_value_t = 400)]
    rtt_us: i64,

    #[arg(long, default_value_t = 0)]
    rtt_jitter_us: i64,

    /// Simulated probe goes quiet after this many notes
    #[arg(long)]
    silent_after: Option<usize>,

    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Virtual time added per idle loop iteration
    #[arg(long, default_value_t = 100)]
    tick_us: i64,

    /// Request SCHED_FIFO for the measuring process
    #[arg(long, default_value_t = false)]
    realtime: bool,
}

fn ms_to_us(ms: f64) -> i64 {
    (ms * 1000.0).round() as i64
}

fn enable_realtime_priority() {
    #[cfg(unix)]
    {
        unsafe {
            let param = libc::sched_param { sched_priority: 50 };
            if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) == 0 {
                info!("Realtime priority (SCHED_FIFO, 50) enabled.");
            } else {
                let err = std::io::Error::last_os_error();
                warn!("Failed to set realtime priority: {}. Timestamps may be noisier.", err);
            }
        }
    }
    #[cfg(not(unix))]
    {
        warn!("Realtime priority is only supported on unix targets.");
    }
}

fn run_engine<E: TrialEngine>(
    engine: &mut E,
    sim: &SimProbe,
    running: &AtomicBool,
    tick_us: i64,
) -> Option<SessionReport> {
    let report = std::rc::Rc::new(std::cell::RefCell::new(None));
    let slot = report.clone();
    engine.set_on_result(Box::new(move |r| *slot.borrow_mut() = Some(r.clone())));

    engine.run();
    drive(engine, running, || sim.advance(tick_us));

    let result = report.borrow_mut().take();
    result
}

fn main() -> Result<()> {
    env_logger::builder()
        .format_timestamp(None)
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SystemConfig::load(path)?,
        None => SystemConfig::default(),
    };
    if let Some(n) = args.repetitions {
        config.input.repetitions = n;
        config.output.repetitions = n;
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Ending session...");
        r.store(false, Ordering::SeqCst);
    })?;

    if args.realtime {
        enable_realtime_priority();
    }

    let sim = SimProbe::new(SimParams {
        midi_in_latency_us: ms_to_us(args.midi_latency_ms),
        app_latency_us: ms_to_us(args.app_latency_ms),
        probe_detect_latency_us: ms_to_us(args.probe_latency_ms),
        drift_ppm: args.drift_ppm,
        rtt_us: args.rtt_us,
        rtt_jitter_us: args.rtt_jitter_us,
        silent_after: args.silent_after,
        seed: args.seed,
    });

    let sink: Arc<dyn LogSink> = Arc::new(LogCrateSink);
    let link = ClockLink::new(sim.transport(), sim.clock(), config.link.clone(), sink.clone());

    info!("Starting {:?} latency test against simulated probe", args.direction);
    let report = match args.direction {
        DirectionArg::Input => {
            let mut engine = MidiInputTrial::new(link, sim.midi_port(), config.input.clone(), sink);
            run_engine(&mut engine, &sim, &running, args.tick_us.max(1))
        }
        DirectionArg::Output => {
            let mut engine = MidiOutputTrial::new(link, sim.midi_port(), config.output.clone(), sink);
            run_engine(&mut engine, &sim, &running, args.tick_us.max(1))
        }
    };

    let report = match report {
        Some(report) => report,
        None => {
            warn!("Session ended without a report");
            return Ok(());
        }
    };

    info!(
        "Session {} {:?}: {}/{} repetitions",
        report.session_id, report.outcome, report.repetitions_done, report.repetitions_requested
    );
    for line in report.summary_lines() {
        info!("{}", line);
    }

    if let Some(path) = &args.report {
        report.write_json(path)?;
        info!("Report written to {}", path.display());
    }

    Ok(())
}
