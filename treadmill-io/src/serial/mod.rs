//! Bit-banged serial I/O on GPIO pins
//!
//! The bus is RS-485 with inverted polarity at 9600 8N1. Receive uses
//! pigpio's software UART with inversion enabled; transmit builds a DMA
//! waveform of 10 pulses per byte.

mod reader;
mod writer;

pub use reader::SerialReader;
pub use writer::{SerialWriter, encode_pulses};

/// Bus baud rate
pub const BAUD: u32 = 9600;

/// One bit period in microseconds (~104)
pub const BIT_US: u32 = 1_000_000 / BAUD;

/// Data bits per frame
pub const DATA_BITS: u32 = 8;
