//! powerhogd - energy and carbon telemetry daemon.
//!
//! Runs `powermetrics`, stores one derived sample per record in SQLite,
//! uploads the raw samples to the remote collector, and rolls old detail rows
//! up into daily totals.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Releases unused memory back to the operating system.
/// Called after each rollup, which is the only memory-heavy operation.
#[cfg(not(target_env = "msvc"))]
fn release_memory_to_os() {
    // SAFETY: mallctl with a valid NUL-terminated name and no in/out buffers.
    // arena.0.purge tells jemalloc to return unused pages to the OS.
    unsafe {
        tikv_jemalloc_sys::mallctl(
            c"arena.0.purge".as_ptr().cast(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        );
    }
}

#[cfg(target_env = "msvc")]
fn release_memory_to_os() {}

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use powerhog_core::collector::source::POWERMETRICS;
use powerhog_core::collector::{
    ChunkSource, Deriver, FileSource, Pipeline, ProcessSource, run_collection,
};
use powerhog_core::config::Settings;
use powerhog_core::runtime::{ExitStatus, Shutdown, ShutdownReason, Stats, Tick};
use powerhog_core::storage::{self, CURRENT_VERSION, Snapshot, Store, ensure_schema};
use powerhog_core::supervisor::{run_freshness_loop, run_presence_loop};
use powerhog_core::upload::watchdog::{Watchdog, WatchdogConfig};
use powerhog_core::upload::{HttpTransport, Uploader};
use powerhog_core::util::{ProcessTable, SystemProcessTable, is_superuser};

const DEFAULT_DB: &str = "/Library/Application Support/berlin.green-coding.hog/db.db";

/// Energy and carbon telemetry daemon.
#[derive(Parser, Debug)]
#[command(name = "powerhogd", about = "Energy and carbon telemetry daemon", version)]
struct Args {
    /// powermetrics sampling interval in milliseconds.
    #[arg(short, long)]
    interval: Option<u64>,

    /// Seconds between upload attempts when there is nothing to send.
    #[arg(short, long)]
    upload_delta: Option<u64>,

    /// SQLite database path.
    #[arg(long, default_value = DEFAULT_DB)]
    db: PathBuf,

    /// Read recorded powermetrics output from a file instead of running powermetrics.
    #[arg(short, long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// Settings file (default: ~/.hog_settings.toml if present).
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Electricity Maps API token for grid carbon intensity.
    #[arg(long, env = "POWERHOG_ELECTRICITYMAPS_TOKEN", hide_env_values = true)]
    electricitymaps_token: Option<String>,

    /// Increase verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (errors only).
    #[arg(short, long)]
    quiet: bool,

    /// Print the dashboard URL for this machine and exit.
    #[arg(short, long)]
    website: bool,

    /// Development mode: 1s sampling, 5s uploads, local collector.
    #[arg(short, long)]
    debug: bool,

    /// Keep all data local.
    #[arg(long)]
    no_upload: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["powerhogd", "powerhog_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Resolves settings: defaults < settings file < flags.
fn resolve_settings(args: &Args) -> Result<Settings, String> {
    let mut settings = if args.debug {
        Settings::development()
    } else {
        let path = args.config.clone().or_else(Settings::discover);
        match path {
            Some(path) => {
                info!(path = %path.display(), "loading settings file");
                Settings::load(&path).map_err(|e| e.to_string())?
            }
            None => Settings::default(),
        }
    };

    if let Some(interval) = args.interval {
        settings.powermetrics = interval;
    }
    if let Some(delta) = args.upload_delta {
        settings.upload_delta = delta;
    }
    if let Some(token) = &args.electricitymaps_token {
        settings.electricitymaps_token = Some(token.clone());
    }
    if args.no_upload {
        settings.upload_data = false;
    }

    settings.validate().map_err(|e| e.to_string())?;
    Ok(settings)
}

/// One-line summary of a stored sample for debug logging.
fn describe_snapshot(snapshot: &Snapshot) -> String {
    let mut parts = vec![
        format!("{} mJ combined", snapshot.combined_energy_mj),
        format!("{} mJ cpu", snapshot.cpu_energy_mj),
        format!("{} mJ gpu", snapshot.gpu_energy_mj),
        format!("impact {}", snapshot.energy_impact),
    ];
    if let Some(top) = snapshot.top_processes.first() {
        parts.push(format!("top {}", top.name));
    }
    if let Some(co2) = snapshot.co2eq_g {
        parts.push(format!("{co2:.4} gCO2eq"));
    }
    parts.join(", ")
}

fn fail(status: ExitStatus, message: &str) -> ! {
    error!("{message}");
    eprintln!("powerhogd: {message}");
    process::exit(status.code());
}

fn prepare_database(path: &Path) -> Result<(), String> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("cannot create {}: {e}", dir.display()))?;
    }
    let from = ensure_schema(path, CURRENT_VERSION).map_err(|e| e.to_string())?;
    if from != CURRENT_VERSION {
        info!(from, to = CURRENT_VERSION, "database schema migrated");
    }

    // the desktop app reads the database as a regular user
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)) {
            warn!(error = %e, "cannot make the database world-writable");
        }
    }
    Ok(())
}

/// Logs counters and effective settings on the diagnostic signal.
#[cfg(unix)]
fn spawn_diagnostics(stats: Arc<Stats>, settings: Settings) {
    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
    const DIAGNOSTIC_SIGNAL: i32 = libc::SIGINFO;
    #[cfg(not(any(target_os = "macos", target_os = "freebsd")))]
    const DIAGNOSTIC_SIGNAL: i32 = libc::SIGUSR1;

    let mut shown = settings;
    if shown.electricitymaps_token.is_some() {
        shown.electricitymaps_token = Some("<redacted>".into());
    }

    let mut signals = match signal_hook::iterator::Signals::new([DIAGNOSTIC_SIGNAL]) {
        Ok(signals) => signals,
        Err(e) => {
            warn!(error = %e, "cannot install diagnostic signal handler");
            return;
        }
    };
    let spawned = thread::Builder::new()
        .name("diagnostics".into())
        .spawn(move || {
            for _ in signals.forever() {
                let counters = stats.snapshot();
                info!(?counters, "counters");
                info!(settings = ?shown, "effective settings");
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "cannot start diagnostics thread");
    }
}

#[cfg(not(unix))]
fn spawn_diagnostics(_stats: Arc<Stats>, _settings: Settings) {}

fn spawn_worker(name: &str, f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    match thread::Builder::new().name(name.to_string()).spawn(f) {
        Ok(handle) => handle,
        Err(e) => fail(ExitStatus::Fatal, &format!("cannot start {name} worker: {e}")),
    }
}

fn open_store(path: &Path) -> Store {
    match Store::open(path) {
        Ok(store) => store,
        Err(e) => fail(ExitStatus::Fatal, &format!("cannot open database: {e}")),
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let settings = match resolve_settings(&args) {
        Ok(settings) => settings,
        Err(e) => fail(ExitStatus::Fatal, &e),
    };

    info!("powerhogd {} starting", powerhog_core::VERSION);
    info!(
        interval_ms = settings.powermetrics,
        upload_delta_s = settings.upload_delta,
        upload = settings.upload_data,
        db = %args.db.display(),
        "configuration"
    );

    let live = args.file.is_none();
    if live && !is_superuser() {
        fail(ExitStatus::MissingPrivilege, "powerhogd needs to run as root");
    }

    if !args.website {
        let mut table = SystemProcessTable::new();
        table.refresh();
        let others = table.other_instances(env!("CARGO_PKG_NAME"));
        if others > 0 {
            fail(
                ExitStatus::DuplicateInstance,
                &format!("another powerhogd instance is already running ({others} found)"),
            );
        }
    }

    if let Err(e) = prepare_database(&args.db) {
        fail(ExitStatus::Fatal, &e);
    }

    let machine_uuid = {
        let mut store = open_store(&args.db);
        match store.append_settings_if_changed(&settings) {
            Ok(stored) => {
                if stored.appended {
                    info!("recorded new settings");
                }
                stored.machine_uuid
            }
            Err(e) => fail(ExitStatus::Fatal, &format!("cannot store settings: {e}")),
        }
    };
    info!(%machine_uuid, "machine id");

    if args.website {
        println!("Please visit this url for detailed analytics:");
        println!("{}", settings.dashboard_url(&machine_uuid));
        return;
    }

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            if shutdown.request_interrupt() > 1 {
                eprintln!("powerhogd: second stop request, exiting immediately");
                process::exit(ExitStatus::ForcedQuit.code());
            }
            info!("received stop signal, shutting down");
        }) {
            warn!("Failed to set Ctrl-C handler: {}", e);
        }
    }

    let stats = Arc::new(Stats::new());
    spawn_diagnostics(stats.clone(), settings.clone());

    let tick = Tick::new();
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    workers.push(spawn_worker("tick", {
        let (tick, shutdown) = (tick.clone(), shutdown.clone());
        move || tick.run(&shutdown)
    }));

    workers.push(spawn_worker("rollup", {
        let store = open_store(&args.db);
        let (tick, shutdown, stats) = (tick.clone(), shutdown.clone(), stats.clone());
        let retention = settings.retention();
        move || {
            storage::run_rollup_loop(store, retention, &tick, &shutdown, &stats, release_memory_to_os)
        }
    }));

    if settings.upload_data {
        let transport = match HttpTransport::new() {
            Ok(transport) => transport,
            Err(e) => fail(ExitStatus::Fatal, &format!("cannot build HTTP client: {e}")),
        };
        let watchdog = match Watchdog::spawn(shutdown.clone(), WatchdogConfig::default(), || {
            eprintln!("powerhogd: upload deadlocked, exiting");
            process::exit(ExitStatus::UploadDeadlock.code());
        }) {
            Ok(watchdog) => watchdog,
            Err(e) => fail(ExitStatus::Fatal, &format!("cannot start upload watchdog: {e}")),
        };
        let uploader = Uploader::new(
            open_store(&args.db),
            Box::new(transport),
            &settings,
            machine_uuid.clone(),
            stats.clone(),
        );
        let mut uploader = match uploader {
            Ok(uploader) => uploader.with_watchdog(watchdog),
            Err(e) => fail(ExitStatus::Fatal, &format!("cannot start uploader: {e}")),
        };
        let shutdown = shutdown.clone();
        workers.push(spawn_worker("upload", move || uploader.run(&shutdown)));
    } else {
        info!("uploads disabled, data stays local");
    }

    let period = settings.liveness_period();
    if live {
        workers.push(spawn_worker("freshness", {
            let store = open_store(&args.db);
            let (tick, shutdown) = (tick.clone(), shutdown.clone());
            move || run_freshness_loop(store, &tick, period, &shutdown)
        }));
        workers.push(spawn_worker("presence", {
            let shutdown = shutdown.clone();
            move || {
                run_presence_loop(
                    Box::new(SystemProcessTable::new()),
                    POWERMETRICS,
                    period,
                    &shutdown,
                )
            }
        }));
    }

    let mut source: Box<dyn ChunkSource> = match &args.file {
        Some(path) => match FileSource::open(path) {
            Ok(source) => Box::new(source),
            Err(e) => fail(ExitStatus::Fatal, &format!("cannot read {}: {e}", path.display())),
        },
        None => match ProcessSource::spawn(settings.collection_interval()) {
            Ok(source) => {
                info!(pid = source.pid(), "powermetrics started");
                Box::new(source)
            }
            Err(e) => fail(ExitStatus::Fatal, &e.to_string()),
        },
    };

    let mut pipeline = Pipeline::new(
        Deriver::from_settings(&settings),
        open_store(&args.db),
        stats.clone(),
    );
    let result = run_collection(source.as_mut(), &mut pipeline, &shutdown, |snapshot| {
        debug!("sample: {}", describe_snapshot(snapshot));
    });
    // stops the powermetrics child
    drop(source);

    let status = match result {
        Ok(stored) => {
            info!(stored, "collection finished");
            shutdown.reason().map_or(ExitStatus::Normal, ShutdownReason::exit_status)
        }
        Err(e) => {
            let status = e.exit_status();
            let message = e.to_string();
            error!("{message}");
            eprintln!("powerhogd: {message}");
            shutdown.cancel(ShutdownReason::Fatal(message));
            status
        }
    };

    info!("Shutting down...");
    for worker in workers {
        if worker.join().is_err() {
            error!("worker panicked");
        }
    }

    let counters = stats.snapshot();
    info!(
        samples = counters.snapshots,
        combined_mj = counters.combined_energy_mj,
        uploaded = counters.uploaded_rows,
        "Shutdown complete"
    );
    process::exit(status.code());
}

#[cfg(test)]
mod tests {
    use super::*;
    use powerhog_core::storage::{ProcessSample, ProcessorReport};

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["powerhogd"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn describe_snapshot_lists_energy_and_top_process() {
        let snapshot = Snapshot {
            timestamp: 0,
            elapsed_ns: 1_000_000_000,
            processor: ProcessorReport::Arm {
                combined_power: 1500.0,
                cpu_energy: 1000.0,
                gpu_energy: 10.0,
                ane_energy: 0.0,
            },
            combined_energy_mj: 1500,
            cpu_energy_mj: 1000,
            gpu_energy_mj: 10,
            ane_energy_mj: 0,
            energy_impact: 42.0,
            top_processes: vec![ProcessSample {
                name: "WindowServer".into(),
                ..Default::default()
            }],
            hw_model: String::new(),
            thermal_pressure: String::new(),
            os_version: String::new(),
            grid_intensity: None,
            co2eq_g: None,
        };

        let desc = describe_snapshot(&snapshot);
        assert!(desc.contains("1500 mJ combined"));
        assert!(desc.contains("impact 42"));
        assert!(desc.contains("top WindowServer"));
        assert!(!desc.contains("gCO2eq"));
    }

    #[test]
    fn flags_override_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "powermetrics = 2000\nupload_delta = 60\n").unwrap();

        let args = args(&[
            "--config",
            path.to_str().unwrap(),
            "--interval",
            "3000",
            "--no-upload",
        ]);
        let settings = resolve_settings(&args).unwrap();
        assert_eq!(settings.powermetrics, 3000);
        assert_eq!(settings.upload_delta, 60);
        assert!(!settings.upload_data);
    }

    #[test]
    fn debug_mode_uses_development_settings() {
        let settings = resolve_settings(&args(&["--debug"])).unwrap();
        assert_eq!(settings.powermetrics, 1000);
        assert_eq!(settings.upload_delta, 5);
    }

    #[test]
    fn zero_interval_flag_is_rejected() {
        assert!(resolve_settings(&args(&["--debug", "--interval", "0"])).is_err());
    }
}
