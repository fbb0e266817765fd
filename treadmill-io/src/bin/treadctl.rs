//! treadctl - command-line client for the treadmill-io daemon
//!
//! ```bash
//! treadctl status
//! treadctl emulate on
//! treadctl drive --speed 3.5 --incline 4     # holds until Ctrl-C
//! treadctl listen --source console --changes
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use treadmill_io::config::DEFAULT_SOCKET_PATH;
use treadmill_io::ipc::client::{HEARTBEAT_INTERVAL, is_timeout};
use treadmill_io::ipc::{Event, KvEvent, Source, TreadmillClient};
use treadmill_io::{Error, Result};

/// How long `status` waits for the daemon's reply
const STATUS_TIMEOUT: Duration = Duration::from_secs(2);
/// Read timeout used to notice Ctrl-C between events
const WAKE_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "treadctl")]
#[command(about = "Control and monitor the treadmill-io daemon")]
struct Args {
    /// Daemon socket
    #[arg(short, long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the daemon's current status
    Status,
    /// Forward console traffic to the motor
    Proxy { state: Toggle },
    /// Drive the motor from the daemon's own command cycle
    Emulate { state: Toggle },
    /// Stop the daemon
    Quit,
    /// Hold a speed and incline, sending heartbeats until Ctrl-C
    Drive {
        /// Speed in mph
        #[arg(long)]
        speed: f64,
        /// Incline in percent
        #[arg(long)]
        incline: Option<i32>,
    },
    /// Print bus traffic as it arrives
    Listen {
        /// Only show a key when its value changes
        #[arg(short, long)]
        changes: bool,
        /// Only show each distinct key/value pair once
        #[arg(short, long, conflicts_with = "changes")]
        unique: bool,
        /// Only show one bus
        #[arg(long, value_enum)]
        source: Option<SourceArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn enabled(self) -> bool {
        matches!(self, Toggle::On)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceArg {
    Console,
    Motor,
    Emulate,
}

impl From<SourceArg> for Source {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Console => Source::Console,
            SourceArg::Motor => Source::Motor,
            SourceArg::Emulate => Source::Emulate,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("treadctl: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut client = TreadmillClient::connect(&args.socket).map_err(|e| {
        Error::Other(format!("cannot connect to {}: {}", args.socket.display(), e))
    })?;

    match args.command {
        Command::Status => status(&mut client),
        Command::Proxy { state } => client.set_proxy(state.enabled()),
        Command::Emulate { state } => client.set_emulate(state.enabled()),
        Command::Quit => client.quit(),
        Command::Drive { speed, incline } => drive(&mut client, speed, incline),
        Command::Listen {
            changes,
            unique,
            source,
        } => {
            let filter = if changes {
                KvFilter::Changes(HashMap::new())
            } else if unique {
                KvFilter::Unique(HashSet::new())
            } else {
                KvFilter::All
            };
            listen(&mut client, filter, source.map(Source::from))
        }
    }
}

fn status(client: &mut TreadmillClient) -> Result<()> {
    client.set_read_timeout(Some(STATUS_TIMEOUT))?;
    client.request_status()?;

    let deadline = Instant::now() + STATUS_TIMEOUT;
    while Instant::now() < deadline {
        match client.next_event()? {
            Some(Event::Status(status)) => {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }
            Some(_) => continue,
            None => break,
        }
    }
    Err(Error::Other("no status from daemon".to_string()))
}

fn drive(client: &mut TreadmillClient, speed: f64, incline: Option<i32>) -> Result<()> {
    let stop = shutdown_flag()?;

    client.set_speed(speed)?;
    if let Some(incline) = incline {
        client.set_incline(incline)?;
    }
    client.start_heartbeat(HEARTBEAT_INTERVAL)?;
    client.set_read_timeout(Some(WAKE_INTERVAL))?;
    println!("Driving at {:.1} mph, Ctrl-C to stop", speed);

    let result = follow(client, &stop, |event| {
        if let Event::Status(status) = event {
            println!(
                "emulate={} speed={:.1} incline={} bus_speed={}",
                status.emulate,
                f64::from(status.emu_speed) / 10.0,
                status.emu_incline.percent(),
                status
                    .bus_speed
                    .map_or("-".to_string(), |s| format!("{:.1}", f64::from(s) / 10.0)),
            );
        }
    });

    client.stop_heartbeat();
    client.set_emulate(false)?;
    result
}

fn listen(client: &mut TreadmillClient, mut filter: KvFilter, source: Option<Source>) -> Result<()> {
    let stop = shutdown_flag()?;
    client.set_read_timeout(Some(WAKE_INTERVAL))?;

    let mut shown = 0u64;
    let result = follow(client, &stop, |event| {
        let Event::Kv(kv) = event else {
            return;
        };
        if source.is_some_and(|s| s != kv.source) || !filter.admit(&kv) {
            return;
        }
        shown += 1;
        println!("{}", format_kv(&kv));
    });
    println!("\n{} entries shown", shown);
    result
}

/// Feed events to `on_event` until Ctrl-C or the daemon goes away
fn follow<F>(client: &mut TreadmillClient, stop: &AtomicBool, mut on_event: F) -> Result<()>
where
    F: FnMut(Event),
{
    while !stop.load(Ordering::Relaxed) {
        match client.next_event() {
            Ok(Some(event)) => on_event(event),
            Ok(None) => return Err(Error::Other("daemon closed the connection".to_string())),
            Err(e) if is_timeout(&e) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn shutdown_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let set = Arc::clone(&flag);
    thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            if signals.forever().next().is_some() {
                set.store(true, Ordering::Relaxed);
            }
        })?;
    Ok(flag)
}

fn format_kv(kv: &KvEvent) -> String {
    if kv.value.is_empty() {
        format!("{:10.3}  {:<8} {}", kv.ts, kv.source.as_str(), kv.key)
    } else {
        format!("{:10.3}  {:<8} {:<12} = {}", kv.ts, kv.source.as_str(), kv.key, kv.value)
    }
}

/// Which KV events `listen` prints
enum KvFilter {
    All,
    /// Last value per (source, key)
    Changes(HashMap<(Source, String), String>),
    Unique(HashSet<(Source, String, String)>),
}

impl KvFilter {
    fn admit(&mut self, kv: &KvEvent) -> bool {
        match self {
            KvFilter::All => true,
            KvFilter::Changes(last) => {
                let slot = (kv.source, kv.key.clone());
                if last.get(&slot) == Some(&kv.value) {
                    return false;
                }
                last.insert(slot, kv.value.clone());
                true
            }
            KvFilter::Unique(seen) => seen.insert((kv.source, kv.key.clone(), kv.value.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(source: Source, key: &str, value: &str) -> KvEvent {
        KvEvent {
            ts: 0.0,
            source,
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_changes_filter() {
        let mut filter = KvFilter::Changes(HashMap::new());
        assert!(filter.admit(&kv(Source::Console, "hmph", "78")));
        assert!(!filter.admit(&kv(Source::Console, "hmph", "78")));
        assert!(filter.admit(&kv(Source::Motor, "hmph", "78")));
        assert!(filter.admit(&kv(Source::Console, "hmph", "96")));
        assert!(filter.admit(&kv(Source::Console, "hmph", "78")));
    }

    #[test]
    fn test_unique_filter() {
        let mut filter = KvFilter::Unique(HashSet::new());
        assert!(filter.admit(&kv(Source::Console, "inc", "0")));
        assert!(filter.admit(&kv(Source::Console, "inc", "2")));
        assert!(!filter.admit(&kv(Source::Console, "inc", "0")));
    }

    #[test]
    fn test_format_kv() {
        assert_eq!(
            format_kv(&kv(Source::Console, "hmph", "78")),
            "     0.000  console  hmph         = 78"
        );
        assert_eq!(format_kv(&kv(Source::Emulate, "amps", "")), "     0.000  emulate  amps");
    }

    #[test]
    fn test_cli_parses() {
        let args = Args::try_parse_from(["treadctl", "drive", "--speed", "3.5", "--incline", "4"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Drive {
                incline: Some(4),
                ..
            }
        ));
        let args = Args::try_parse_from(["treadctl", "proxy", "off"]).unwrap();
        assert!(matches!(args.command, Command::Proxy { state: Toggle::Off }));
        assert!(Args::try_parse_from(["treadctl", "listen", "--changes", "--unique"]).is_err());
    }
}
