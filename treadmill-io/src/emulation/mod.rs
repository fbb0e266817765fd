//! Emulation engine: replaces the console on the motor bus
//!
//! While the mode machine is `Emulating`, a dedicated thread writes the
//! console's 14-frame cycle (see [`cycle`]) with the current target speed
//! and incline.
//!
//! # Lifecycle
//!
//! - [`EmulationEngine::start`] joins any previous thread, then spawns a new one
//! - [`EmulationEngine::stop`] clears the run flag and joins
//! - The thread also exits on its own as soon as `is_emulating()` turns false,
//!   which is how the watchdog ends emulation without joining from another
//!   thread's callback
//! - Dropping the engine stops it
//!
//! # Safety ceiling
//!
//! After `emulate_timeout` of continuous running, any nonzero target is reset
//! to zero at the start of each cycle and [`EngineEvent::SafetyTimeout`] is
//! reported so a status event goes out.

pub mod cycle;

use crate::core::ModeStateMachine;
use crate::error::{Error, Result};
use crate::serial::SerialWriter;
use cycle::BURSTS;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Notification from the engine thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent<'a> {
    /// A frame was written to the motor
    Kv { key: &'a str, value: &'a str },
    /// Targets were zeroed by the continuous-emulation ceiling
    SafetyTimeout,
}

/// Callback invoked on the engine thread
pub type EngineCallback = Arc<dyn Fn(EngineEvent<'_>) + Send + Sync>;

/// Engine timing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTiming {
    /// Pause after each burst
    pub burst_gap: Duration,
    /// Continuous emulation ceiling
    pub emulate_timeout: Duration,
}

impl Default for EngineTiming {
    fn default() -> Self {
        Self {
            burst_gap: Duration::from_millis(100),
            emulate_timeout: Duration::from_secs(3 * 60 * 60),
        }
    }
}

pub struct EmulationEngine {
    writer: Arc<SerialWriter>,
    mode: Arc<ModeStateMachine>,
    timing: EngineTiming,
    on_event: EngineCallback,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EmulationEngine {
    pub fn new(
        writer: Arc<SerialWriter>,
        mode: Arc<ModeStateMachine>,
        timing: EngineTiming,
        on_event: EngineCallback,
    ) -> Self {
        Self {
            writer,
            mode,
            timing,
            on_event,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the cycle thread, replacing any previous one
    pub fn start(&self) -> Result<()> {
        self.stop();

        self.running.store(true, Ordering::Release);
        let worker = CycleWorker {
            writer: Arc::clone(&self.writer),
            mode: Arc::clone(&self.mode),
            timing: self.timing,
            on_event: Arc::clone(&self.on_event),
            running: Arc::clone(&self.running),
        };

        let handle = thread::Builder::new()
            .name("emulation".to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                Error::Other(format!("Failed to spawn emulation thread: {}", e))
            })?;

        *self.handle.lock() = Some(handle);
        log::info!("Emulation started");
        Ok(())
    }

    /// Clear the run flag and wait for the thread to exit
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Emulation thread panicked");
            }
            log::info!("Emulation stopped");
        }
    }

    /// True while the cycle thread is live
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for EmulationEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved onto the engine thread
struct CycleWorker {
    writer: Arc<SerialWriter>,
    mode: Arc<ModeStateMachine>,
    timing: EngineTiming,
    on_event: EngineCallback,
    running: Arc<AtomicBool>,
}

impl CycleWorker {
    fn live(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.mode.is_emulating()
    }

    fn run(self) {
        let started = Instant::now();

        'cycle: while self.live() {
            if started.elapsed() >= self.timing.emulate_timeout {
                let snap = self.mode.snapshot();
                if snap.speed_tenths != 0 || snap.incline != 0 {
                    self.mode.safety_timeout_reset();
                    log::warn!(
                        "Emulation ran for {:?}, speed and incline reset to 0",
                        self.timing.emulate_timeout
                    );
                    (self.on_event)(EngineEvent::SafetyTimeout);
                }
            }

            let snap = self.mode.snapshot();
            for burst in BURSTS {
                for entry in burst {
                    if !self.live() {
                        break 'cycle;
                    }
                    let value = entry.value_for(&snap);
                    if let Err(e) = self.writer.write_kv(entry.key, &value) {
                        log::warn!("Emulation write of {} failed: {}", entry.key, e);
                    }
                    (self.on_event)(EngineEvent::Kv {
                        key: entry.key,
                        value: &value,
                    });
                }
                thread::sleep(self.timing.burst_gap);
            }
        }

        self.running.store(false, Ordering::Release);
        log::debug!("Emulation thread exiting");
    }
}
