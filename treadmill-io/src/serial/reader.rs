//! Serial receive with KV framing
//!
//! Each poll hands raw bytes out first (the proxy path forwards them with
//! minimal latency), then appends them to a fixed accumulation buffer and
//! parses complete frames. A frame split across two reads stays in the
//! buffer until its closing bracket arrives.

use super::{BAUD, DATA_BITS};
use crate::error::Result;
use crate::gpio::GpioPort;
use crate::protocol::{KvPair, parse_frames};
use std::sync::Arc;

/// Largest single read from the software UART
const READ_CHUNK: usize = 512;

/// Accumulation buffer size
pub const PARSE_BUF_SIZE: usize = 4096;

/// Polling reader bound to one GPIO pin
pub struct SerialReader {
    port: Arc<dyn GpioPort>,
    pin: u32,
    parse_buf: [u8; PARSE_BUF_SIZE],
    parse_len: usize,
    is_open: bool,
}

impl SerialReader {
    pub fn new(port: Arc<dyn GpioPort>, pin: u32) -> Self {
        Self {
            port,
            pin,
            parse_buf: [0u8; PARSE_BUF_SIZE],
            parse_len: 0,
            is_open: false,
        }
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    /// Start receiving at 9600 baud, inverted polarity
    pub fn open(&mut self) -> Result<()> {
        self.port.serial_read_open(self.pin, BAUD, DATA_BITS)?;
        self.is_open = true;
        self.port.serial_read_invert(self.pin, true)?;
        log::debug!("Serial reader open on GPIO {}", self.pin);
        Ok(())
    }

    pub fn close(&mut self) {
        if !self.is_open {
            return;
        }
        self.is_open = false;
        self.parse_len = 0;
        if let Err(e) = self.port.serial_read_close(self.pin) {
            log::warn!("Closing serial reader on GPIO {} failed: {}", self.pin, e);
        }
    }

    /// Read once, deliver raw bytes then parsed pairs
    ///
    /// Returns the number of raw bytes read; 0 means the line was idle.
    pub fn poll<R, K>(&mut self, mut on_raw: R, on_kv: K) -> Result<usize>
    where
        R: FnMut(&[u8]),
        K: FnMut(&KvPair),
    {
        let mut raw = [0u8; READ_CHUNK];
        let count = self.port.serial_read(self.pin, &mut raw)?;
        if count == 0 {
            return Ok(0);
        }
        let raw = &raw[..count];

        on_raw(raw);

        if self.parse_len + count > PARSE_BUF_SIZE {
            // Only an unterminated frame can fill the buffer
            log::warn!(
                "GPIO {}: discarding {} bytes of unframed data",
                self.pin,
                self.parse_len
            );
            self.parse_len = 0;
        }
        self.parse_buf[self.parse_len..self.parse_len + count].copy_from_slice(raw);
        self.parse_len += count;

        let consumed = parse_frames(&self.parse_buf[..self.parse_len], on_kv);
        self.parse_buf.copy_within(consumed..self.parse_len, 0);
        self.parse_len -= consumed;

        Ok(count)
    }

    /// Bytes waiting for a closing bracket
    pub fn buffered(&self) -> usize {
        self.parse_len
    }
}

impl Drop for SerialReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::MockGpioPort;

    fn reader(mock: &MockGpioPort, pin: u32) -> SerialReader {
        let mut reader = SerialReader::new(Arc::new(mock.clone()), pin);
        reader.open().unwrap();
        reader
    }

    fn poll_pairs(reader: &mut SerialReader) -> (usize, Vec<u8>, Vec<(String, String)>) {
        let mut raw = Vec::new();
        let mut pairs = Vec::new();
        let n = reader
            .poll(
                |bytes| raw.extend_from_slice(bytes),
                |kv| pairs.push((kv.key().to_string(), kv.value().to_string())),
            )
            .unwrap();
        (n, raw, pairs)
    }

    #[test]
    fn test_open_configures_inverted_uart() {
        let mock = MockGpioPort::new();
        let _reader = reader(&mock, 27);
        let state = mock.pin_state(27);
        assert!(state.serial_open);
        assert!(state.serial_inverted);
        assert_eq!(state.serial_baud, 9600);
    }

    #[test]
    fn test_idle_poll() {
        let mock = MockGpioPort::new();
        let mut reader = reader(&mock, 27);
        let (n, raw, pairs) = poll_pairs(&mut reader);
        assert_eq!(n, 0);
        assert!(raw.is_empty());
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_raw_then_pairs() {
        let mock = MockGpioPort::new();
        let mut reader = reader(&mock, 27);
        mock.inject_read(27, b"[inc:5]\xFF[hmph:78]\xFF");

        let (n, raw, pairs) = poll_pairs(&mut reader);
        assert_eq!(n, 18);
        assert_eq!(raw, b"[inc:5]\xFF[hmph:78]\xFF");
        assert_eq!(
            pairs,
            vec![("inc".into(), "5".into()), ("hmph".into(), "78".into())]
        );
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_frame_split_across_polls() {
        let mock = MockGpioPort::new();
        let mut reader = reader(&mock, 27);
        mock.inject_read(27, b"[hm");
        mock.inject_read(27, b"ph:96]\xFF");

        let (_, _, pairs) = poll_pairs(&mut reader);
        assert!(pairs.is_empty());
        assert_eq!(reader.buffered(), 3);

        let (_, _, pairs) = poll_pairs(&mut reader);
        assert_eq!(pairs, vec![("hmph".into(), "96".into())]);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_unterminated_garbage_is_discarded() {
        let mock = MockGpioPort::new();
        let mut reader = reader(&mock, 27);
        mock.inject_read(27, b"[");
        let filler = [b'x'; READ_CHUNK];
        for _ in 0..(PARSE_BUF_SIZE / READ_CHUNK) {
            mock.inject_read(27, &filler);
        }
        mock.inject_read(27, b"[ok:1]");

        let mut seen = Vec::new();
        loop {
            let (n, _, pairs) = poll_pairs(&mut reader);
            seen.extend(pairs);
            if n == 0 {
                break;
            }
        }
        assert_eq!(seen, vec![("ok".into(), "1".into())]);
    }

    #[test]
    fn test_close_releases_pin() {
        let mock = MockGpioPort::new();
        let mut reader = reader(&mock, 17);
        reader.close();
        assert!(!mock.pin_state(17).serial_open);

        // Reopen succeeds once closed
        reader.open().unwrap();
        drop(reader);
        assert!(!mock.pin_state(17).serial_open);
    }
}
