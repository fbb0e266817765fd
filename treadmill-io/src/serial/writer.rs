//! Inverted RS-485 transmit via DMA waveforms
//!
//! Each byte becomes 10 pulses of one bit period:
//!
//! ```text
//! idle LOW ─┐     ┌── data bits, LSB first ──┐     ┌─ idle LOW
//!           │start│  1 → LOW   0 → HIGH      │stop │
//!           └HIGH─┘                          └LOW──┘
//! ```
//!
//! Writes are serialized by an internal lock and block until the previous
//! waveform finished and the new one has been sent, so frames from the
//! proxy path and the emulation engine never interleave on the wire.

use super::BIT_US;
use crate::error::{Error, Result};
use crate::gpio::{GpioPort, MAX_WAVE_GPIO, Pulse, WaveMode};
use crate::protocol::kv;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Poll interval while the waveform engine is busy
const BUSY_POLL: Duration = Duration::from_millis(1);

/// Append the pulse train for `data` on `pin` to `out`
pub fn encode_pulses(pin: u32, data: &[u8], out: &mut Vec<Pulse>) {
    let mask = 1u32 << pin;
    let high = Pulse {
        gpio_on: mask,
        gpio_off: 0,
        us_delay: BIT_US,
    };
    let low = Pulse {
        gpio_on: 0,
        gpio_off: mask,
        us_delay: BIT_US,
    };

    out.reserve(data.len() * 10);
    for &byte in data {
        out.push(high);
        for bit in 0..8 {
            out.push(if (byte >> bit) & 1 == 1 { low } else { high });
        }
        out.push(low);
    }
}

/// Waveform writer bound to one output pin
pub struct SerialWriter {
    port: Arc<dyn GpioPort>,
    pin: u32,
    /// Reused pulse buffer; the lock also serializes transmissions
    pulses: Mutex<Vec<Pulse>>,
}

impl SerialWriter {
    pub fn new(port: Arc<dyn GpioPort>, pin: u32) -> Result<Self> {
        if pin > MAX_WAVE_GPIO {
            return Err(Error::InvalidParameter(format!(
                "GPIO {} cannot carry waveforms (max {})",
                pin, MAX_WAVE_GPIO
            )));
        }
        Ok(Self {
            port,
            pin,
            pulses: Mutex::new(Vec::with_capacity(512 * 10)),
        })
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    /// Transmit `data`, returning once the waveform has gone out
    pub fn write_bytes(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut pulses = self.pulses.lock();
        pulses.clear();
        encode_pulses(self.pin, data, &mut pulses);

        self.wait_idle();
        self.port.wave_clear()?;
        self.port.wave_add_generic(&pulses)?;
        let wave_id = self.port.wave_create()?;

        let sent = self.port.wave_tx_send(wave_id, WaveMode::OneShot);
        if sent.is_ok() {
            self.wait_idle();
        }
        let deleted = self.port.wave_delete(wave_id);

        log::trace!("GPIO {}: sent {} bytes", self.pin, data.len());
        sent.and(deleted)
    }

    /// Transmit one `[key:value]` frame
    pub fn write_kv(&self, key: &str, value: &str) -> Result<()> {
        self.write_bytes(&kv::build(key, value))
    }

    fn wait_idle(&self) {
        while self.port.wave_tx_busy() {
            thread::sleep(BUSY_POLL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::MockGpioPort;

    #[test]
    fn test_pulse_layout() {
        let mut pulses = Vec::new();
        // 0x5B = 0b0101_1011
        encode_pulses(4, &[0x5B], &mut pulses);
        assert_eq!(pulses.len(), 10);

        let mask = 1 << 4;
        assert!(pulses.iter().all(|p| p.us_delay == 104));
        // Start bit HIGH
        assert_eq!((pulses[0].gpio_on, pulses[0].gpio_off), (mask, 0));
        // Data LSB first: 1,1,0,1,1,0,1,0 with 1 -> LOW
        let expected_low = [true, true, false, true, true, false, true, false];
        for (i, low) in expected_low.iter().enumerate() {
            let p = pulses[1 + i];
            if *low {
                assert_eq!((p.gpio_on, p.gpio_off), (0, mask), "bit {}", i);
            } else {
                assert_eq!((p.gpio_on, p.gpio_off), (mask, 0), "bit {}", i);
            }
        }
        // Stop bit LOW
        assert_eq!((pulses[9].gpio_on, pulses[9].gpio_off), (0, mask));
    }

    #[test]
    fn test_write_decodes_back() {
        let mock = MockGpioPort::new();
        let writer = SerialWriter::new(Arc::new(mock.clone()), 22).unwrap();

        writer.write_kv("hmph", "78").unwrap();
        writer.write_kv("amps", "").unwrap();

        assert_eq!(mock.written(22), b"[hmph:78]\xFF[amps]\xFF");
        assert_eq!(writer.pin(), 22);
    }

    #[test]
    fn test_empty_write_is_noop() {
        let mock = MockGpioPort::new();
        let writer = SerialWriter::new(Arc::new(mock.clone()), 22).unwrap();
        writer.write_bytes(&[]).unwrap();
        assert!(mock.written(22).is_empty());
    }

    #[test]
    fn test_rejects_high_bank_pin() {
        let mock = MockGpioPort::new();
        assert!(SerialWriter::new(Arc::new(mock), 40).is_err());
    }

    #[test]
    fn test_concurrent_writes_do_not_interleave() {
        let mock = MockGpioPort::new();
        let writer = Arc::new(SerialWriter::new(Arc::new(mock.clone()), 22).unwrap());

        let handles: Vec<_> = ["[aaaa]", "[bbbb]"]
            .into_iter()
            .map(|frame| {
                let writer = Arc::clone(&writer);
                thread::spawn(move || {
                    for _ in 0..50 {
                        writer.write_bytes(frame.as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let written = mock.written_string(22);
        assert_eq!(written.len(), 600);
        for chunk in written.as_bytes().chunks(6) {
            assert!(chunk == b"[aaaa]" || chunk == b"[bbbb]");
        }
    }
}
