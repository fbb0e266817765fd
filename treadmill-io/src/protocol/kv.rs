//! KV frame parser and builder
//!
//! The console and motor controller talk a plain-text protocol at 9600 baud:
//!
//! ```text
//! ┌───┬──────────┬───┬────────────┬───┬──────┐
//! │ [ │ key      │ : │ value      │ ] │ 0xFF │
//! └───┴──────────┴───┴────────────┴───┴──────┘
//! ```
//!
//! - Frames are separated by `0xFF` (or `0x00`) filler bytes
//! - A frame without `:` is a bare key with an empty value
//! - Content must be printable ASCII (0x20-0x7E); other frames are dropped
//! - Speed (`hmph`) is mph × 100 in uppercase hex, incline is half-percent hex
//!
//! Parsing never allocates: pairs are handed out as [`KvPair`] values with
//! inline storage.

use crate::error::{Error, Result};

/// Field storage size (63 usable characters)
pub const KV_FIELD_SIZE: usize = 64;

/// Frame start byte
const FRAME_OPEN: u8 = b'[';
/// Frame end byte
const FRAME_CLOSE: u8 = b']';
/// Filler written after every frame
pub const FRAME_FILLER: u8 = 0xFF;

/// Longest accepted hex field
const MAX_HEX_LEN: usize = 10;

/// Zero-allocation key/value record
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct KvPair {
    key: [u8; KV_FIELD_SIZE],
    key_len: u8,
    value: [u8; KV_FIELD_SIZE],
    value_len: u8,
}

impl KvPair {
    /// Build a pair from string fields, `None` if either exceeds 63 bytes
    pub fn new(key: &str, value: &str) -> Option<Self> {
        Self::from_bytes(key.as_bytes(), value.as_bytes())
    }

    fn from_bytes(key: &[u8], value: &[u8]) -> Option<Self> {
        if key.len() >= KV_FIELD_SIZE || value.len() >= KV_FIELD_SIZE {
            return None;
        }
        let mut pair = Self {
            key: [0u8; KV_FIELD_SIZE],
            key_len: key.len() as u8,
            value: [0u8; KV_FIELD_SIZE],
            value_len: value.len() as u8,
        };
        pair.key[..key.len()].copy_from_slice(key);
        pair.value[..value.len()].copy_from_slice(value);
        Some(pair)
    }

    #[inline]
    pub fn key(&self) -> &str {
        // Content was validated as printable ASCII
        std::str::from_utf8(&self.key[..self.key_len as usize]).unwrap_or_default()
    }

    #[inline]
    pub fn value(&self) -> &str {
        std::str::from_utf8(&self.value[..self.value_len as usize]).unwrap_or_default()
    }
}

impl std::fmt::Debug for KvPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvPair")
            .field("key", &self.key())
            .field("value", &self.value())
            .finish()
    }
}

/// Scan `buf` for frames, calling `on_pair` for each valid one
///
/// Returns the number of bytes consumed. An unterminated trailing frame is
/// left unconsumed so the caller can retry once more bytes arrive.
pub fn parse_frames<F>(buf: &[u8], mut on_pair: F) -> usize
where
    F: FnMut(&KvPair),
{
    let mut i = 0;

    while i < buf.len() {
        if buf[i] != FRAME_OPEN {
            // Filler (0xFF/0x00) or stray byte outside a frame
            i += 1;
            continue;
        }

        let Some(close) = buf[i + 1..].iter().position(|&b| b == FRAME_CLOSE) else {
            break;
        };
        let end = i + 1 + close;
        let content = &buf[i + 1..end];

        let printable = content.iter().all(|&b| (0x20..=0x7E).contains(&b));
        if printable && !content.is_empty() && content.len() < KV_FIELD_SIZE {
            let pair = match content.iter().position(|&b| b == b':') {
                Some(colon) => KvPair::from_bytes(&content[..colon], &content[colon + 1..]),
                None => KvPair::from_bytes(content, &[]),
            };
            if let Some(pair) = pair {
                on_pair(&pair);
            }
        } else {
            log::trace!("Dropped malformed frame ({} bytes)", content.len());
        }

        i = end + 1;
    }

    i
}

/// Parse every complete frame in `buf`
///
/// Returns the pairs and the number of bytes consumed.
pub fn parse(buf: &[u8]) -> (Vec<KvPair>, usize) {
    let mut pairs = Vec::new();
    let consumed = parse_frames(buf, |pair| pairs.push(*pair));
    (pairs, consumed)
}

/// Build a wire frame: `[key:value]` or `[key]`, followed by `0xFF`
pub fn build(key: &str, value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + value.len() + 4);
    out.push(FRAME_OPEN);
    out.extend_from_slice(key.as_bytes());
    if !value.is_empty() {
        out.push(b':');
        out.extend_from_slice(value.as_bytes());
    }
    out.push(FRAME_CLOSE);
    out.push(FRAME_FILLER);
    out
}

/// Decode a raw hex field (upper or lower case)
pub fn decode_hex(hex: &str) -> Result<u64> {
    if hex.is_empty() || hex.len() > MAX_HEX_LEN || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidHex(hex.to_string()));
    }
    u64::from_str_radix(hex, 16).map_err(|_| Error::InvalidHex(hex.to_string()))
}

/// Encode speed in tenths of mph as the `hmph` field (mph × 100, hex)
///
/// `12` (1.2 mph) encodes as `"78"`, `120` (12.0 mph) as `"4B0"`.
pub fn encode_speed_hex(tenths_mph: i32) -> String {
    format!("{:X}", tenths_mph.max(0) * 10)
}

/// Decode an `hmph` field into tenths of mph, rounding half up
pub fn decode_speed_hex(hex: &str) -> Result<i32> {
    let hundredths = decode_hex(hex)?;
    Ok(i32::try_from((hundredths + 5) / 10).unwrap_or(i32::MAX))
}

/// Encode whole-percent incline as half-percent hex
pub fn encode_incline_hex(percent: i32) -> String {
    format!("{:X}", percent.max(0) * 2)
}

/// Decode half-percent hex into whole percent, rounding half up
pub fn decode_incline_hex(hex: &str) -> Result<i32> {
    let half_pct = decode_hex(hex)?;
    Ok(i32::try_from((half_pct + 1) / 2).unwrap_or(i32::MAX))
}

/// Format half-percent units as decimal percent text (`5` → `"2.5"`)
pub fn format_half_percent(half_pct: i32) -> String {
    let half_pct = half_pct.max(0);
    if half_pct % 2 == 0 {
        format!("{}", half_pct / 2)
    } else {
        format!("{}.5", half_pct / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys_values(buf: &[u8]) -> (Vec<(String, String)>, usize) {
        let (pairs, consumed) = parse(buf);
        let owned = pairs
            .iter()
            .map(|p| (p.key().to_string(), p.value().to_string()))
            .collect();
        (owned, consumed)
    }

    #[test]
    fn test_parse_key_value() {
        let (pairs, consumed) = keys_values(b"[hmph:78]\xFF");
        assert_eq!(pairs, vec![("hmph".into(), "78".into())]);
        assert_eq!(consumed, 10);
    }

    #[test]
    fn test_parse_bare_key() {
        let (pairs, _) = keys_values(b"[amps]\xFF");
        assert_eq!(pairs, vec![("amps".into(), String::new())]);
    }

    #[test]
    fn test_parse_multiple_with_filler() {
        let (pairs, consumed) = keys_values(b"\x00\xFF[inc:5]\xFF\xFF[hmph:78]\xFF\x00");
        assert_eq!(
            pairs,
            vec![("inc".into(), "5".into()), ("hmph".into(), "78".into())]
        );
        assert_eq!(consumed, 22);
    }

    #[test]
    fn test_value_splits_at_first_colon() {
        let (pairs, _) = keys_values(b"[ver:1:2]\xFF");
        assert_eq!(pairs, vec![("ver".into(), "1:2".into())]);
    }

    #[test]
    fn test_incomplete_frame_not_consumed() {
        let buf = b"[a:1]\xFF[hmph:7";
        let (pairs, consumed) = keys_values(buf);
        assert_eq!(pairs.len(), 1);
        assert_eq!(consumed, 6);
        assert_eq!(&buf[consumed..], b"[hmph:7");
    }

    #[test]
    fn test_split_frame_recovers_on_next_read() {
        let mut acc = b"[hmph:".to_vec();
        let (pairs, consumed) = keys_values(&acc);
        assert!(pairs.is_empty());
        acc.drain(..consumed);

        acc.extend_from_slice(b"96]\xFF");
        let (pairs, consumed) = keys_values(&acc);
        assert_eq!(pairs, vec![("hmph".into(), "96".into())]);
        assert_eq!(consumed, acc.len());
    }

    #[test]
    fn test_rejects_non_printable_but_consumes() {
        let (pairs, consumed) = keys_values(b"[hm\x01ph:78]\xFF[b:2]");
        assert_eq!(pairs, vec![("b".into(), "2".into())]);
        assert_eq!(consumed, 16);
    }

    #[test]
    fn test_rejects_empty_and_oversized_frames() {
        let long = format!("[{}]", "k".repeat(KV_FIELD_SIZE));
        let mut buf = b"[]".to_vec();
        buf.extend_from_slice(long.as_bytes());
        buf.extend_from_slice(b"[ok]");

        let (pairs, consumed) = keys_values(&buf);
        assert_eq!(pairs, vec![("ok".into(), String::new())]);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_garbage_between_frames() {
        let (pairs, _) = keys_values(b"xx[a:1]junk\xFF[b:2]\xFF");
        assert_eq!(
            pairs,
            vec![("a".into(), "1".into()), ("b".into(), "2".into())]
        );
    }

    #[test]
    fn test_empty_input() {
        let (pairs, consumed) = keys_values(b"");
        assert!(pairs.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn test_build() {
        assert_eq!(build("inc", "5"), b"[inc:5]\xFF".to_vec());
        assert_eq!(build("amps", ""), b"[amps]\xFF".to_vec());
    }

    #[test]
    fn test_build_parse_round_trip() {
        for (key, value) in [("hmph", "4B0"), ("inc", "7.5"), ("loop", "5550"), ("belt", "")] {
            let (pairs, consumed) = parse(&build(key, value));
            assert_eq!(pairs.len(), 1);
            assert_eq!(pairs[0].key(), key);
            assert_eq!(pairs[0].value(), value);
            assert_eq!(consumed, key.len() + value.len() + 3 + usize::from(!value.is_empty()));
        }
    }

    #[test]
    fn test_speed_hex() {
        assert_eq!(encode_speed_hex(12), "78");
        assert_eq!(encode_speed_hex(120), "4B0");
        assert_eq!(encode_speed_hex(0), "0");
        assert_eq!(decode_speed_hex("78").unwrap(), 12);
        assert_eq!(decode_speed_hex("4b0").unwrap(), 120);
        // 0x7D = 125 hundredths rounds up to 13 tenths
        assert_eq!(decode_speed_hex("7D").unwrap(), 13);
    }

    #[test]
    fn test_speed_hex_rejects_bad_input() {
        assert!(decode_speed_hex("").is_err());
        assert!(decode_speed_hex("XYZ").is_err());
        assert!(decode_speed_hex("+78").is_err());
        assert!(decode_speed_hex("12345678901").is_err());
    }

    #[test]
    fn test_hex_round_trips() {
        for tenths in 0..=120 {
            assert_eq!(decode_speed_hex(&encode_speed_hex(tenths)).unwrap(), tenths);
        }
        for percent in 0..=198 {
            assert_eq!(decode_incline_hex(&encode_incline_hex(percent)).unwrap(), percent);
        }
    }

    #[test]
    fn test_incline_hex() {
        assert_eq!(encode_incline_hex(5), "A");
        assert_eq!(decode_incline_hex("A").unwrap(), 5);
        // 3 half-percent rounds up to 2%
        assert_eq!(decode_incline_hex("3").unwrap(), 2);
        assert!(decode_incline_hex("").is_err());
    }

    #[test]
    fn test_format_half_percent() {
        assert_eq!(format_half_percent(0), "0");
        assert_eq!(format_half_percent(10), "5");
        assert_eq!(format_half_percent(5), "2.5");
        assert_eq!(format_half_percent(198), "99");
    }
}
