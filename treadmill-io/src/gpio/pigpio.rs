//! libpigpio backend
//!
//! Thin wrappers over the pigpio C API. Every call maps a negative status to
//! [`Error::Gpio`]. pigpio's own signal handlers are disabled so the daemon's
//! signal thread sees SIGINT/SIGTERM.

use super::{GpioPort, PinMode, Pulse, WaveMode};
use crate::error::{Error, Result};
use libc::{c_int, c_uint, c_void, size_t};

const PI_INPUT: c_uint = 0;
const PI_OUTPUT: c_uint = 1;
const PI_WAVE_MODE_ONE_SHOT: c_uint = 0;
/// `gpioCfgSetInternals` bit that skips pigpio's signal handlers
const PI_CFG_NOSIGHANDLER: u32 = 1 << 10;

#[link(name = "pigpio")]
unsafe extern "C" {
    fn gpioCfgGetInternals() -> u32;
    fn gpioCfgSetInternals(cfg: u32) -> c_int;
    fn gpioInitialise() -> c_int;
    fn gpioTerminate();
    fn gpioSetMode(gpio: c_uint, mode: c_uint) -> c_int;
    fn gpioWrite(gpio: c_uint, level: c_uint) -> c_int;
    fn gpioSerialReadOpen(user_gpio: c_uint, baud: c_uint, data_bits: c_uint) -> c_int;
    fn gpioSerialReadInvert(user_gpio: c_uint, invert: c_uint) -> c_int;
    fn gpioSerialRead(user_gpio: c_uint, buf: *mut c_void, buf_size: size_t) -> c_int;
    fn gpioSerialReadClose(user_gpio: c_uint) -> c_int;
    fn gpioWaveTxBusy() -> c_int;
    fn gpioWaveClear() -> c_int;
    fn gpioWaveAddGeneric(num_pulses: c_uint, pulses: *mut Pulse) -> c_int;
    fn gpioWaveCreate() -> c_int;
    fn gpioWaveTxSend(wave_id: c_uint, wave_mode: c_uint) -> c_int;
    fn gpioWaveDelete(wave_id: c_uint) -> c_int;
}

/// Hardware GPIO through libpigpio (requires root)
#[derive(Debug, Default)]
pub struct PigpioPort;

impl PigpioPort {
    pub fn new() -> Self {
        Self
    }
}

fn check(op: &'static str, code: c_int) -> Result<()> {
    Error::check_gpio(op, code).map(|_| ())
}

impl GpioPort for PigpioPort {
    fn initialise(&self) -> Result<()> {
        // SAFETY: configuration calls are valid before gpioInitialise
        unsafe {
            let cfg = gpioCfgGetInternals();
            check("gpioCfgSetInternals", gpioCfgSetInternals(cfg | PI_CFG_NOSIGHANDLER))?;
            check("gpioInitialise", gpioInitialise())
        }
    }

    fn terminate(&self) {
        // SAFETY: no arguments; safe to call after a failed initialise
        unsafe { gpioTerminate() }
    }

    fn set_mode(&self, pin: u32, mode: PinMode) -> Result<()> {
        let mode = match mode {
            PinMode::Input => PI_INPUT,
            PinMode::Output => PI_OUTPUT,
        };
        // SAFETY: plain integer arguments, validated by the library
        check("gpioSetMode", unsafe { gpioSetMode(pin, mode) })
    }

    fn write(&self, pin: u32, level: bool) -> Result<()> {
        // SAFETY: plain integer arguments
        check("gpioWrite", unsafe { gpioWrite(pin, c_uint::from(level)) })
    }

    fn serial_read_open(&self, pin: u32, baud: u32, data_bits: u32) -> Result<()> {
        // SAFETY: plain integer arguments
        check("gpioSerialReadOpen", unsafe {
            gpioSerialReadOpen(pin, baud, data_bits)
        })
    }

    fn serial_read_invert(&self, pin: u32, invert: bool) -> Result<()> {
        // SAFETY: plain integer arguments
        check("gpioSerialReadInvert", unsafe {
            gpioSerialReadInvert(pin, c_uint::from(invert))
        })
    }

    fn serial_read(&self, pin: u32, buf: &mut [u8]) -> Result<usize> {
        // SAFETY: pigpio writes at most buf.len() bytes into buf
        let n = unsafe { gpioSerialRead(pin, buf.as_mut_ptr().cast(), buf.len()) };
        Error::check_gpio("gpioSerialRead", n).map(|n| n as usize)
    }

    fn serial_read_close(&self, pin: u32) -> Result<()> {
        // SAFETY: plain integer argument
        check("gpioSerialReadClose", unsafe { gpioSerialReadClose(pin) })
    }

    fn wave_tx_busy(&self) -> bool {
        // SAFETY: no arguments
        unsafe { gpioWaveTxBusy() == 1 }
    }

    fn wave_clear(&self) -> Result<()> {
        // SAFETY: no arguments
        check("gpioWaveClear", unsafe { gpioWaveClear() })
    }

    fn wave_add_generic(&self, pulses: &[Pulse]) -> Result<usize> {
        // SAFETY: Pulse is repr(C) and matches gpioPulse_t; pigpio only
        // reads the array despite the non-const pointer in its signature
        let n = unsafe { gpioWaveAddGeneric(pulses.len() as c_uint, pulses.as_ptr().cast_mut()) };
        Error::check_gpio("gpioWaveAddGeneric", n).map(|n| n as usize)
    }

    fn wave_create(&self) -> Result<u32> {
        // SAFETY: no arguments
        let id = unsafe { gpioWaveCreate() };
        Error::check_gpio("gpioWaveCreate", id).map(|id| id as u32)
    }

    fn wave_tx_send(&self, wave_id: u32, mode: WaveMode) -> Result<()> {
        let mode = match mode {
            WaveMode::OneShot => PI_WAVE_MODE_ONE_SHOT,
        };
        // SAFETY: plain integer arguments
        check("gpioWaveTxSend", unsafe { gpioWaveTxSend(wave_id, mode) })
    }

    fn wave_delete(&self, wave_id: u32) -> Result<()> {
        // SAFETY: plain integer argument
        check("gpioWaveDelete", unsafe { gpioWaveDelete(wave_id) })
    }
}
