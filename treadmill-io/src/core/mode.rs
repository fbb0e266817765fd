//! Proxy/emulate mode state machine
//!
//! Single authority on which side drives the motor bus:
//!
//! ```text
//!                request_proxy(true)
//!        ┌────────────────────────────────────┐
//!        ▼                                    │
//! ┌─────────────┐ request_proxy(false) ┌──────┴──────┐
//! │   Proxy     │─────────────────────▶│    Idle     │
//! │ (console →  │                      │             │
//! │   motor)    │◀──┐                  └──────┬──────┘
//! └──────┬──────┘   │ auto-proxy /            │ request_emulate(true)
//!        │          │ watchdog                │ set_speed / set_incline
//!        │          │                  ┌──────▼──────┐
//!        └──────────┴─────────────────▶│  Emulating  │
//!          request_emulate(true)       │ (synthetic) │
//!                                      └─────────────┘
//! ```
//!
//! One `Mode` value makes proxy and emulate mutually exclusive. Entering
//! `Emulating` always zeroes speed and incline first.
//!
//! Mutating calls return a [`Transition`] whose [`SideEffect`] the caller
//! executes after the call returns, so no engine start/stop ever runs under
//! the state lock.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

/// 12.0 mph
pub const MAX_SPEED_TENTHS: i32 = 120;
/// 99% in half-percent units
pub const MAX_INCLINE: i32 = 198;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Neither proxying nor emulating
    Idle,
    /// Console commands forwarded to the motor
    Proxy,
    /// Synthesized cycle sent to the motor
    Emulating,
}

/// Work the caller must perform after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SideEffect {
    #[default]
    None,
    StartEmulate,
    StopEmulate,
}

/// Outcome of a mode request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transition {
    /// Mode or target value actually changed
    pub changed: bool,
    pub effect: SideEffect,
}

impl Transition {
    fn unchanged() -> Self {
        Self::default()
    }

    fn start() -> Self {
        Self {
            changed: true,
            effect: SideEffect::StartEmulate,
        }
    }

    fn stop() -> Self {
        Self {
            changed: true,
            effect: SideEffect::StopEmulate,
        }
    }
}

/// Consistent copy of the machine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSnapshot {
    pub mode: Mode,
    pub proxy_enabled: bool,
    pub emulate_enabled: bool,
    /// mph × 10
    pub speed_tenths: i32,
    /// mph × 100 (wire unit)
    pub speed_raw: i32,
    /// Half-percent units
    pub incline: i32,
    pub console_bytes: u64,
    pub motor_bytes: u64,
}

struct ModeInner {
    mode: Mode,
    speed_tenths: i32,
    incline: i32,
}

/// Mutex-guarded mode state with atomic mirrors for hot-path reads
pub struct ModeStateMachine {
    inner: Mutex<ModeInner>,
    proxy_enabled: AtomicBool,
    emulate_enabled: AtomicBool,
    speed_tenths: AtomicI32,
    incline: AtomicI32,
    console_bytes: AtomicU64,
    motor_bytes: AtomicU64,
}

impl ModeStateMachine {
    /// Start in `Proxy` with zero targets
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ModeInner {
                mode: Mode::Proxy,
                speed_tenths: 0,
                incline: 0,
            }),
            proxy_enabled: AtomicBool::new(true),
            emulate_enabled: AtomicBool::new(false),
            speed_tenths: AtomicI32::new(0),
            incline: AtomicI32::new(0),
            console_bytes: AtomicU64::new(0),
            motor_bytes: AtomicU64::new(0),
        }
    }

    /// Copy mirrors out while the lock is held
    fn publish(&self, inner: &ModeInner) {
        self.proxy_enabled
            .store(inner.mode == Mode::Proxy, Ordering::Release);
        self.emulate_enabled
            .store(inner.mode == Mode::Emulating, Ordering::Release);
        self.speed_tenths
            .store(inner.speed_tenths, Ordering::Release);
        self.incline.store(inner.incline, Ordering::Release);
    }

    fn enter_emulate(&self, inner: &mut ModeInner) {
        inner.speed_tenths = 0;
        inner.incline = 0;
        inner.mode = Mode::Emulating;
        self.publish(inner);
    }

    pub fn request_proxy(&self, enabled: bool) -> Transition {
        let mut inner = self.inner.lock();
        let previous = inner.mode;

        if enabled {
            inner.mode = Mode::Proxy;
        } else if previous == Mode::Proxy {
            inner.mode = Mode::Idle;
        }
        self.publish(&inner);

        match (previous, inner.mode) {
            (Mode::Emulating, Mode::Proxy) => Transition::stop(),
            (from, to) => Transition {
                changed: from != to,
                effect: SideEffect::None,
            },
        }
    }

    pub fn request_emulate(&self, enabled: bool) -> Transition {
        let mut inner = self.inner.lock();

        match (enabled, inner.mode) {
            (true, Mode::Emulating) | (false, Mode::Idle | Mode::Proxy) => Transition::unchanged(),
            (true, _) => {
                self.enter_emulate(&mut inner);
                Transition::start()
            }
            (false, Mode::Emulating) => {
                inner.mode = Mode::Idle;
                self.publish(&inner);
                Transition::stop()
            }
        }
    }

    /// Set target speed, entering emulate first when needed
    pub fn set_speed(&self, tenths: i32) -> Transition {
        let tenths = tenths.clamp(0, MAX_SPEED_TENTHS);
        let mut inner = self.inner.lock();

        let mut transition = Transition::unchanged();
        if inner.mode != Mode::Emulating {
            self.enter_emulate(&mut inner);
            transition = Transition::start();
        }
        transition.changed |= inner.speed_tenths != tenths;
        inner.speed_tenths = tenths;
        self.publish(&inner);
        transition
    }

    /// Set target speed from mph as received over IPC
    pub fn set_speed_mph(&self, mph: f64) -> Transition {
        // Saturating cast, then clamped by set_speed
        let tenths = (mph * 10.0 + 0.5) as i32;
        self.set_speed(tenths)
    }

    /// Set target incline in half-percent units, entering emulate first when needed
    pub fn set_incline(&self, half_pct: i32) -> Transition {
        let half_pct = half_pct.clamp(0, MAX_INCLINE);
        let mut inner = self.inner.lock();

        let mut transition = Transition::unchanged();
        if inner.mode != Mode::Emulating {
            self.enter_emulate(&mut inner);
            transition = Transition::start();
        }
        transition.changed |= inner.incline != half_pct;
        inner.incline = half_pct;
        self.publish(&inner);
        transition
    }

    /// Fall back to proxy when someone presses console buttons mid-emulation
    ///
    /// Only `hmph`/`inc` count, and only when a previous value exists and
    /// differs from the new one.
    pub fn auto_proxy_on_console_change(&self, key: &str, old: &str, new: &str) -> Transition {
        if old.is_empty() || old == new || !matches!(key, "hmph" | "inc") {
            return Transition::unchanged();
        }

        let mut inner = self.inner.lock();
        if inner.mode != Mode::Emulating {
            return Transition::unchanged();
        }
        inner.mode = Mode::Proxy;
        self.publish(&inner);
        log::info!("Console override on {} ({} -> {}), switching to proxy", key, old, new);
        Transition::stop()
    }

    /// Zero speed and incline, mode unchanged
    pub fn safety_timeout_reset(&self) {
        let mut inner = self.inner.lock();
        inner.speed_tenths = 0;
        inner.incline = 0;
        self.publish(&inner);
    }

    /// Zero targets and force `Proxy` without asking for an engine stop
    ///
    /// The engine thread sees `is_emulating() == false` and exits by itself.
    pub fn watchdog_reset_to_proxy(&self) -> Transition {
        let mut inner = self.inner.lock();
        let changed = inner.mode != Mode::Proxy || inner.speed_tenths != 0 || inner.incline != 0;
        inner.speed_tenths = 0;
        inner.incline = 0;
        inner.mode = Mode::Proxy;
        self.publish(&inner);
        Transition {
            changed,
            effect: SideEffect::None,
        }
    }

    #[inline]
    pub fn add_console_bytes(&self, n: usize) {
        self.console_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_motor_bytes(&self, n: usize) {
        self.motor_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ModeSnapshot {
        let inner = self.inner.lock();
        ModeSnapshot {
            mode: inner.mode,
            proxy_enabled: inner.mode == Mode::Proxy,
            emulate_enabled: inner.mode == Mode::Emulating,
            speed_tenths: inner.speed_tenths,
            speed_raw: inner.speed_tenths * 10,
            incline: inner.incline,
            console_bytes: self.console_bytes.load(Ordering::Relaxed),
            motor_bytes: self.motor_bytes.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn is_proxy(&self) -> bool {
        self.proxy_enabled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_emulating(&self) -> bool {
        self.emulate_enabled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn speed_tenths(&self) -> i32 {
        self.speed_tenths.load(Ordering::Acquire)
    }

    #[inline]
    pub fn incline(&self) -> i32 {
        self.incline.load(Ordering::Acquire)
    }

    #[inline]
    pub fn console_bytes(&self) -> u64 {
        self.console_bytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn motor_bytes(&self) -> u64 {
        self.motor_bytes.load(Ordering::Relaxed)
    }
}

impl Default for ModeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
