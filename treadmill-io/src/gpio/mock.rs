//! In-memory GPIO port for tests and simulation

use super::{GpioPort, PinMode, Pulse, WaveMode};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Bits per serial frame: start + 8 data + stop
const PULSES_PER_BYTE: usize = 10;

/// Recorded state of one pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PinState {
    pub mode: Option<PinMode>,
    pub level: bool,
    pub serial_open: bool,
    pub serial_baud: u32,
    pub serial_inverted: bool,
}

#[derive(Default)]
struct MockInner {
    pins: HashMap<u32, PinState>,
    /// Per-pin receive queues, one chunk per `serial_read`
    reads: HashMap<u32, VecDeque<Vec<u8>>>,
    pending_pulses: Vec<Pulse>,
    next_wave_id: u32,
    /// Bytes decoded from sent waveforms, by pin
    written: HashMap<u32, Vec<u8>>,
    /// Waveforms sent on a pin are echoed into another pin's receive queue
    loopback: HashMap<u32, u32>,
}

/// Mock GPIO port
///
/// Cloning shares state, so a test can keep a handle while the daemon owns
/// another.
#[derive(Clone, Default)]
pub struct MockGpioPort {
    inner: Arc<Mutex<MockInner>>,
}

impl MockGpioPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes to be returned by one `serial_read(pin, ..)` call
    pub fn inject_read(&self, pin: u32, data: &[u8]) {
        let mut inner = self.inner.lock();
        inner.reads.entry(pin).or_default().push_back(data.to_vec());
    }

    /// Echo everything transmitted on `from` into the receive queue of `to`
    pub fn loopback(&self, from: u32, to: u32) {
        self.inner.lock().loopback.insert(from, to);
    }

    /// All bytes transmitted on `pin`
    pub fn written(&self, pin: u32) -> Vec<u8> {
        let inner = self.inner.lock();
        inner.written.get(&pin).cloned().unwrap_or_default()
    }

    /// Transmitted bytes on `pin` as lossy text
    pub fn written_string(&self, pin: u32) -> String {
        String::from_utf8_lossy(&self.written(pin)).into_owned()
    }

    pub fn pin_state(&self, pin: u32) -> PinState {
        let inner = self.inner.lock();
        inner.pins.get(&pin).copied().unwrap_or_default()
    }

    /// Decode inverted-polarity pulses back into bytes
    ///
    /// A data step that drives the pin LOW is a `1` bit.
    fn decode_pulses(pulses: &[Pulse]) -> (Option<u32>, Vec<u8>) {
        let pin = pulses
            .iter()
            .map(|p| p.gpio_on | p.gpio_off)
            .find(|mask| *mask != 0)
            .map(|mask| mask.trailing_zeros());

        let bytes = pulses
            .chunks_exact(PULSES_PER_BYTE)
            .map(|frame| {
                frame[1..9]
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.gpio_off != 0)
                    .fold(0u8, |byte, (bit, _)| byte | (1u8 << bit))
            })
            .collect();

        (pin, bytes)
    }
}

impl GpioPort for MockGpioPort {
    fn initialise(&self) -> Result<()> {
        Ok(())
    }

    fn terminate(&self) {}

    fn set_mode(&self, pin: u32, mode: PinMode) -> Result<()> {
        self.inner.lock().pins.entry(pin).or_default().mode = Some(mode);
        Ok(())
    }

    fn write(&self, pin: u32, level: bool) -> Result<()> {
        self.inner.lock().pins.entry(pin).or_default().level = level;
        Ok(())
    }

    fn serial_read_open(&self, pin: u32, baud: u32, _data_bits: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.pins.entry(pin).or_default();
        if state.serial_open {
            // pigpio reports PI_GPIO_IN_USE
            return Err(Error::Gpio {
                op: "serial_read_open",
                code: -50,
            });
        }
        state.serial_open = true;
        state.serial_baud = baud;
        Ok(())
    }

    fn serial_read_invert(&self, pin: u32, invert: bool) -> Result<()> {
        self.inner.lock().pins.entry(pin).or_default().serial_inverted = invert;
        Ok(())
    }

    fn serial_read(&self, pin: u32, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let Some(chunk) = inner.reads.get_mut(&pin).and_then(VecDeque::pop_front) else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn serial_read_close(&self, pin: u32) -> Result<()> {
        self.inner.lock().pins.entry(pin).or_default().serial_open = false;
        Ok(())
    }

    fn wave_tx_busy(&self) -> bool {
        false
    }

    fn wave_clear(&self) -> Result<()> {
        self.inner.lock().pending_pulses.clear();
        Ok(())
    }

    fn wave_add_generic(&self, pulses: &[Pulse]) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.pending_pulses.extend_from_slice(pulses);
        Ok(inner.pending_pulses.len())
    }

    fn wave_create(&self) -> Result<u32> {
        let mut inner = self.inner.lock();
        let id = inner.next_wave_id;
        inner.next_wave_id += 1;
        Ok(id)
    }

    fn wave_tx_send(&self, _wave_id: u32, _mode: WaveMode) -> Result<()> {
        let mut inner = self.inner.lock();
        let pulses = std::mem::take(&mut inner.pending_pulses);
        let (Some(pin), bytes) = Self::decode_pulses(&pulses) else {
            return Ok(());
        };

        let target = inner.loopback.get(&pin).copied();
        if let Some(target) = target {
            inner.reads.entry(target).or_default().push_back(bytes.clone());
        }
        inner.written.entry(pin).or_default().extend_from_slice(&bytes);
        Ok(())
    }

    fn wave_delete(&self, _wave_id: u32) -> Result<()> {
        Ok(())
    }
}
