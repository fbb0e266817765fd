//! Daemon controller: wires the buses, the mode machine and the IPC socket
//!
//! # Threads
//!
//! | Thread | Loop | Idle behaviour |
//! |--------|------|----------------|
//! | `console-reader` | poll console pin, forward raw bytes when proxying, publish KV | 5ms sleep |
//! | `motor-reader` | poll motor pin, decode `hmph`/`inc` readback, publish KV | 5ms sleep |
//! | `ipc-server` | service socket, dispatch commands, heartbeat watchdog | ≤20ms `poll(2)` |
//! | `emulation` | owned by [`EmulationEngine`], only while emulating | |
//!
//! # Safety watchdog
//!
//! Two independent layers return the motor to the console while emulating:
//!
//! 1. The last IPC client disconnects
//! 2. No command (every command counts as a heartbeat) for longer than the
//!    heartbeat timeout
//!
//! Both zero the targets and force proxy through
//! [`ModeStateMachine::watchdog_reset_to_proxy`], then publish status. The
//! emulation thread notices the mode change and exits on its own.

use crate::config::AppConfig;
use crate::core::{EventRing, ModeStateMachine, SideEffect};
use crate::emulation::{EmulationEngine, EngineCallback, EngineEvent, EngineTiming};
use crate::error::{Error, Result};
use crate::gpio::GpioPort;
use crate::ipc::server::POLL_TIMEOUT;
use crate::ipc::{BusReadings, EventPublisher, IpcCommand, IpcServer, Source};
use crate::protocol::KvPair;
use crate::protocol::kv::{decode_hex, decode_speed_hex};
use crate::serial::{SerialReader, SerialWriter};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Reader back-off after an empty poll
const READER_IDLE: Duration = Duration::from_millis(5);

/// State reachable from every daemon thread
struct Shared {
    mode: Arc<ModeStateMachine>,
    writer: Arc<SerialWriter>,
    engine: EmulationEngine,
    publisher: EventPublisher,
    bus: Arc<BusReadings>,
    running: Arc<AtomicBool>,
    last_command: Mutex<Instant>,
    heartbeat_timeout: Duration,
    /// Serializes engine start/stop between the console and IPC threads
    effects: Mutex<()>,
}

impl Shared {
    fn running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Run a transition's side effect, re-checked against the current mode
    fn execute(&self, effect: SideEffect) {
        let _guard = self.effects.lock();
        match effect {
            SideEffect::None => {}
            SideEffect::StartEmulate => {
                if self.mode.is_emulating()
                    && let Err(e) = self.engine.start()
                {
                    log::error!("TreadmillIO: Failed to start emulation: {}", e);
                }
            }
            SideEffect::StopEmulate => {
                if !self.mode.is_emulating() {
                    self.engine.stop();
                }
            }
        }
    }

    fn on_console_raw(&self, raw: &[u8]) {
        self.mode.add_console_bytes(raw.len());
        if self.mode.is_proxy()
            && !self.mode.is_emulating()
            && let Err(e) = self.writer.write_bytes(raw)
        {
            log::warn!("TreadmillIO: Proxy write failed: {}", e);
        }
    }

    fn on_console_kv(&self, kv: &KvPair, last_hmph: &mut String, last_inc: &mut String) {
        let (key, value) = (kv.key(), kv.value());
        self.publisher.kv(Source::Console, key, value);

        let last = match key {
            "hmph" => last_hmph,
            "inc" => last_inc,
            _ => return,
        };
        let transition = self.mode.auto_proxy_on_console_change(key, last, value);
        last.clear();
        last.push_str(value);

        if transition.changed {
            self.execute(transition.effect);
            self.publisher.status();
        }
    }

    fn on_motor_kv(&self, kv: &KvPair) {
        let (key, value) = (kv.key(), kv.value());
        match key {
            "hmph" => match decode_speed_hex(value) {
                Ok(tenths) => self.bus.set_speed(tenths),
                Err(e) => log::debug!("TreadmillIO: Motor hmph unreadable: {}", e),
            },
            "inc" => match decode_hex(value).map(i32::try_from) {
                Ok(Ok(half_pct)) => self.bus.set_incline(half_pct),
                _ => log::debug!("TreadmillIO: Motor inc unreadable: {:?}", value),
            },
            _ => {}
        }
        self.publisher.kv(Source::Motor, key, value);
    }

    fn handle_command(&self, cmd: IpcCommand) {
        *self.last_command.lock() = Instant::now();
        log::debug!("TreadmillIO: Command {:?}", cmd);

        let transition = match cmd {
            IpcCommand::Proxy(enabled) => self.mode.request_proxy(enabled),
            IpcCommand::Emulate(enabled) => self.mode.request_emulate(enabled),
            IpcCommand::Speed(mph) => self.mode.set_speed_mph(mph),
            IpcCommand::Incline(percent) => self.mode.set_incline(percent.saturating_mul(2)),
            IpcCommand::Status => {
                self.publisher.status();
                return;
            }
            IpcCommand::Heartbeat | IpcCommand::Unknown => return,
            IpcCommand::Quit => {
                log::info!("TreadmillIO: Quit requested over IPC");
                self.running.store(false, Ordering::Relaxed);
                return;
            }
        };

        self.execute(transition.effect);
        self.publisher.status();
    }

    fn on_client_disconnect(&self, remaining: usize) {
        if remaining == 0 && self.mode.is_emulating() {
            log::warn!("TreadmillIO: All IPC clients gone while emulating, returning to proxy");
            self.watchdog_reset();
        }
    }

    fn check_heartbeat(&self) {
        if !self.mode.is_emulating() {
            return;
        }
        let silence = self.last_command.lock().elapsed();
        if silence > self.heartbeat_timeout {
            log::warn!(
                "TreadmillIO: No command for {:.1}s while emulating, returning to proxy",
                silence.as_secs_f32()
            );
            self.watchdog_reset();
        }
    }

    fn watchdog_reset(&self) {
        self.mode.watchdog_reset_to_proxy();
        self.publisher.status();
    }
}

/// Owns every daemon component and its threads
pub struct Controller {
    port: Arc<dyn GpioPort>,
    config: AppConfig,
    ring: Arc<EventRing>,
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    started: Instant,
}

impl Controller {
    pub fn new(port: Arc<dyn GpioPort>, config: AppConfig) -> Result<Self> {
        let mode = Arc::new(ModeStateMachine::new());
        let ring = Arc::new(EventRing::new());
        let bus = Arc::new(BusReadings::default());
        let publisher = EventPublisher::new(Arc::clone(&ring), Arc::clone(&mode), Arc::clone(&bus));
        let writer = Arc::new(SerialWriter::new(Arc::clone(&port), config.gpio.motor_write)?);

        let timing = EngineTiming {
            emulate_timeout: config.safety.emulate_timeout(),
            ..EngineTiming::default()
        };
        let events = publisher.clone();
        let on_event: EngineCallback = Arc::new(move |event: EngineEvent<'_>| match event {
            EngineEvent::Kv { key, value } => events.kv(Source::Emulate, key, value),
            EngineEvent::SafetyTimeout => events.status(),
        });
        let engine = EmulationEngine::new(Arc::clone(&writer), Arc::clone(&mode), timing, on_event);

        let shared = Arc::new(Shared {
            mode,
            writer,
            engine,
            publisher,
            bus,
            running: Arc::new(AtomicBool::new(false)),
            last_command: Mutex::new(Instant::now()),
            heartbeat_timeout: config.safety.heartbeat_timeout(),
            effects: Mutex::new(()),
        });

        Ok(Self {
            port,
            config,
            ring,
            shared,
            threads: Vec::new(),
            started: Instant::now(),
        })
    }

    /// Open both readers, bind the socket and spawn the worker threads
    pub fn start(&mut self) -> Result<()> {
        if !self.threads.is_empty() {
            return Err(Error::Other("controller already started".to_string()));
        }
        let gpio = self.config.gpio;

        let mut console = SerialReader::new(Arc::clone(&self.port), gpio.console_read);
        console.open()?;
        let mut motor = SerialReader::new(Arc::clone(&self.port), gpio.motor_read);
        motor.open()?;
        let server = IpcServer::bind(&self.config.ipc.socket_path, Arc::clone(&self.ring))?;

        self.shared.publisher.status();
        *self.shared.last_command.lock() = Instant::now();
        self.shared.running.store(true, Ordering::Relaxed);

        let console_shared = Arc::clone(&self.shared);
        let motor_shared = Arc::clone(&self.shared);
        let ipc_shared = Arc::clone(&self.shared);
        let spawned = self
            .spawn("console-reader", move || console_loop(&console_shared, console))
            .and_then(|()| self.spawn("motor-reader", move || motor_loop(&motor_shared, motor)))
            .and_then(|()| self.spawn("ipc-server", move || ipc_loop(&ipc_shared, server)));

        if let Err(e) = spawned {
            self.stop();
            return Err(e);
        }

        log::info!(
            "TreadmillIO: Running (console GPIO {}, motor write GPIO {}, motor read GPIO {})",
            gpio.console_read,
            gpio.motor_write,
            gpio.motor_read
        );
        Ok(())
    }

    fn spawn<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(f)
            .map_err(|e| Error::Other(format!("Failed to spawn {} thread: {}", name, e)))?;
        self.threads.push(handle);
        Ok(())
    }

    /// Stop emulation and join console, motor and IPC threads in that order
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        self.shared.engine.stop();

        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                log::error!("TreadmillIO: {} thread panicked", name);
            }
        }
    }

    /// False once stopped or after an IPC `quit`
    pub fn is_running(&self) -> bool {
        self.shared.running()
    }

    /// Apply a command as if it arrived over the socket
    pub fn handle_command(&self, cmd: IpcCommand) {
        self.shared.handle_command(cmd);
    }

    pub fn mode(&self) -> &Arc<ModeStateMachine> {
        &self.shared.mode
    }

    pub fn ring(&self) -> &Arc<EventRing> {
        &self.ring
    }

    pub fn bus(&self) -> &Arc<BusReadings> {
        &self.shared.bus
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.ipc.socket_path
    }

    pub fn log_statistics(&self) {
        let snap = self.shared.mode.snapshot();
        log::info!(
            "TreadmillIO: up {}s, mode {:?}, speed {} tenths, incline {} half-%, console {} B, motor {} B, events {}",
            self.started.elapsed().as_secs(),
            snap.mode,
            snap.speed_tenths,
            snap.incline,
            snap.console_bytes,
            snap.motor_bytes,
            self.ring.total()
        );
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn console_loop(shared: &Shared, mut reader: SerialReader) {
    log::debug!("TreadmillIO: Console reader on GPIO {}", reader.pin());
    let mut last_hmph = String::new();
    let mut last_inc = String::new();

    while shared.running() {
        let polled = reader.poll(
            |raw| shared.on_console_raw(raw),
            |kv| shared.on_console_kv(kv, &mut last_hmph, &mut last_inc),
        );
        idle_or_continue(polled, "console");
    }
}

fn motor_loop(shared: &Shared, mut reader: SerialReader) {
    log::debug!("TreadmillIO: Motor reader on GPIO {}", reader.pin());
    while shared.running() {
        let polled = reader.poll(
            |raw| shared.mode.add_motor_bytes(raw.len()),
            |kv| shared.on_motor_kv(kv),
        );
        idle_or_continue(polled, "motor");
    }
}

fn idle_or_continue(polled: Result<usize>, bus: &str) {
    match polled {
        Ok(0) => thread::sleep(READER_IDLE),
        Ok(_) => {}
        Err(e) => {
            log::warn!("TreadmillIO: {} read failed: {}", bus, e);
            thread::sleep(READER_IDLE);
        }
    }
}

fn ipc_loop(shared: &Shared, mut server: IpcServer) {
    while shared.running() {
        if let Err(e) = server.poll(
            POLL_TIMEOUT,
            |cmd| shared.handle_command(cmd),
            |remaining| shared.on_client_disconnect(remaining),
        ) {
            log::warn!("TreadmillIO: IPC poll failed: {}", e);
            thread::sleep(POLL_TIMEOUT);
        }
        shared.check_heartbeat();
    }
}
