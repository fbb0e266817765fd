//! treadmill-io - Treadmill serial bus daemon
//!
//! ```text
//! console TX ──▶ GPIO console_read ─┐
//!                                   ├─ proxy ──▶ GPIO motor_write ──▶ motor RX
//!             emulation engine ─────┘
//! motor TX ───▶ GPIO motor_read ──▶ readback
//!                     │
//!                     ▼
//!          /tmp/treadmill_io.sock (newline-delimited JSON)
//! ```
//!
//! Runs as root against libpigpio, or with `--simulate` against an in-memory
//! port whose motor line echoes back into the motor reader.

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use treadmill_io::config::AppConfig;
use treadmill_io::gpio::{GpioPort, MockGpioPort, PinMode};
use treadmill_io::{Controller, Error, Result};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const MAIN_LOOP_TICK: Duration = Duration::from_millis(200);
const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "treadmill-io")]
#[command(about = "Serial MITM daemon between a treadmill console and its motor controller")]
#[command(version)]
struct Args {
    /// GPIO configuration file (JSON, or TOML when it ends in .toml)
    #[arg(short, long, default_value = "gpio.json")]
    config: PathBuf,

    /// Override the IPC socket path
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Run against an in-memory GPIO port instead of pigpio
    #[arg(long)]
    simulate: bool,

    /// Log filter, overrides the config file's logging.level
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(args) {
        // Logger may not be up yet when the config is bad
        eprintln!("treadmill-io: {}", e);
        log::error!("Fatal: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = AppConfig::from_file(&args.config)?;
    if let Some(socket) = args.socket {
        config.ipc.socket_path = socket;
    }

    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    log::info!("treadmill-io v{} starting...", VERSION);
    log::info!("Using config: {}", args.config.display());

    if !args.simulate {
        // SAFETY: geteuid has no preconditions
        if unsafe { libc::geteuid() } != 0 {
            return Err(Error::InsufficientPrivilege(
                "must run as root for GPIO access (or pass --simulate)".to_string(),
            ));
        }
    }

    // Client disconnects must surface as EPIPE, not kill the process
    // SAFETY: installing SIG_IGN for SIGPIPE is async-signal-safe
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let port = open_port(&config, args.simulate)?;
    port.initialise()?;

    let result = serve(Arc::clone(&port), config.clone());

    let motor_write = config.gpio.motor_write;
    if let Err(e) = port
        .write(motor_write, false)
        .and_then(|()| port.set_mode(motor_write, PinMode::Input))
    {
        log::warn!("Failed to release GPIO {}: {}", motor_write, e);
    }
    port.terminate();

    log::info!("treadmill-io stopped");
    result
}

fn open_port(config: &AppConfig, simulate: bool) -> Result<Arc<dyn GpioPort>> {
    if simulate {
        log::info!(
            "Simulation mode: GPIO {} loops back into GPIO {}",
            config.gpio.motor_write,
            config.gpio.motor_read
        );
        let mock = MockGpioPort::new();
        mock.loopback(config.gpio.motor_write, config.gpio.motor_read);
        return Ok(Arc::new(mock));
    }
    hardware_port()
}

#[cfg(feature = "pigpio")]
fn hardware_port() -> Result<Arc<dyn GpioPort>> {
    Ok(Arc::new(treadmill_io::gpio::PigpioPort::new()))
}

#[cfg(not(feature = "pigpio"))]
fn hardware_port() -> Result<Arc<dyn GpioPort>> {
    Err(Error::NotSupported(
        "built without the pigpio feature; rebuild with --features pigpio or pass --simulate"
            .to_string(),
    ))
}

fn serve(port: Arc<dyn GpioPort>, config: AppConfig) -> Result<()> {
    // Idle LOW before anything can transmit
    let motor_write = config.gpio.motor_write;
    port.set_mode(motor_write, PinMode::Output)?;
    port.write(motor_write, false)?;

    let mut controller = Controller::new(port, config)?;
    controller.start()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handler(Arc::clone(&shutdown))?;

    log::info!(
        "treadmill-io running on {}. Press Ctrl-C to stop.",
        controller.socket_path().display()
    );

    let mut last_stats = Instant::now();
    while !shutdown.load(Ordering::Relaxed) && controller.is_running() {
        thread::sleep(MAIN_LOOP_TICK);

        if last_stats.elapsed() >= STATS_INTERVAL {
            controller.log_statistics();
            last_stats = Instant::now();
        }
    }

    log::info!("Shutting down...");
    controller.stop();
    controller.log_statistics();
    Ok(())
}

fn setup_signal_handler(shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                log::info!("Received signal {:?}, initiating shutdown...", sig);
                shutdown.store(true, Ordering::Relaxed);
            }
        })?;
    Ok(())
}
