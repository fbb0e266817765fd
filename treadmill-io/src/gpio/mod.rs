//! GPIO access layer
//!
//! The daemon only needs a narrow slice of pigpio: pin modes and levels,
//! bit-banged serial receive, and DMA waveforms for transmit. [`GpioPort`]
//! captures exactly that slice so the serial code can run against
//! [`MockGpioPort`] in tests and `--simulate` mode.

mod mock;
#[cfg(feature = "pigpio")]
mod pigpio;

pub use mock::{MockGpioPort, PinState};
#[cfg(feature = "pigpio")]
pub use pigpio::PigpioPort;

use crate::error::Result;

/// Highest pin a waveform mask can address (pigpio bank 1)
pub const MAX_WAVE_GPIO: u32 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveMode {
    OneShot,
}

/// One waveform step, layout-compatible with pigpio's `gpioPulse_t`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pulse {
    /// Pins driven HIGH at the start of the step
    pub gpio_on: u32,
    /// Pins driven LOW at the start of the step
    pub gpio_off: u32,
    /// Step length in microseconds
    pub us_delay: u32,
}

/// Hardware GPIO operations used by the serial reader and writer
pub trait GpioPort: Send + Sync {
    /// Bring up the GPIO library
    fn initialise(&self) -> Result<()>;

    /// Release the GPIO library
    fn terminate(&self);

    fn set_mode(&self, pin: u32, mode: PinMode) -> Result<()>;

    fn write(&self, pin: u32, level: bool) -> Result<()>;

    /// Start bit-banged serial receive on `pin`
    fn serial_read_open(&self, pin: u32, baud: u32, data_bits: u32) -> Result<()>;

    fn serial_read_invert(&self, pin: u32, invert: bool) -> Result<()>;

    /// Copy buffered receive bytes into `buf`, returns count (0 when idle)
    fn serial_read(&self, pin: u32, buf: &mut [u8]) -> Result<usize>;

    fn serial_read_close(&self, pin: u32) -> Result<()>;

    /// True while a waveform is transmitting
    fn wave_tx_busy(&self) -> bool;

    fn wave_clear(&self) -> Result<()>;

    /// Append pulses to the waveform under construction
    fn wave_add_generic(&self, pulses: &[Pulse]) -> Result<usize>;

    /// Turn the pending pulses into a waveform, returns its id
    fn wave_create(&self) -> Result<u32>;

    fn wave_tx_send(&self, wave_id: u32, mode: WaveMode) -> Result<()>;

    fn wave_delete(&self, wave_id: u32) -> Result<()>;
}
