//! The console's 14-frame command cycle
//!
//! Captured from a real console: the frames go out in five bursts with a
//! ~100 ms gap after each.
//!
//! | Burst | Frames                     |
//! |-------|----------------------------|
//! | 0     | `inc`, `hmph`              |
//! | 1     | `amps`, `err`, `belt`      |
//! | 2     | `vbus`, `lift`, `lfts`, `lftg` |
//! | 3     | `part`, `ver`, `type`      |
//! | 4     | `diag`, `loop`             |

use crate::core::ModeSnapshot;
use crate::protocol::kv::{encode_speed_hex, format_half_percent};
use std::borrow::Cow;

/// Where a frame's value comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleValue {
    /// Target incline as decimal percent
    Incline,
    /// Target speed as `hmph` hex
    Speed,
    /// Constant placeholder
    Fixed(&'static str),
    /// Bare `[key]` request
    Bare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleEntry {
    pub key: &'static str,
    pub value: CycleValue,
}

impl CycleEntry {
    const fn new(key: &'static str, value: CycleValue) -> Self {
        Self { key, value }
    }

    /// Frame value for the given state
    pub fn value_for(&self, snap: &ModeSnapshot) -> Cow<'static, str> {
        match self.value {
            CycleValue::Incline => Cow::Owned(format_half_percent(snap.incline)),
            CycleValue::Speed => Cow::Owned(encode_speed_hex(snap.speed_tenths)),
            CycleValue::Fixed(value) => Cow::Borrowed(value),
            CycleValue::Bare => Cow::Borrowed(""),
        }
    }
}

pub const KV_CYCLE: [CycleEntry; 14] = [
    CycleEntry::new("inc", CycleValue::Incline),
    CycleEntry::new("hmph", CycleValue::Speed),
    CycleEntry::new("amps", CycleValue::Bare),
    CycleEntry::new("err", CycleValue::Bare),
    CycleEntry::new("belt", CycleValue::Bare),
    CycleEntry::new("vbus", CycleValue::Bare),
    CycleEntry::new("lift", CycleValue::Bare),
    CycleEntry::new("lfts", CycleValue::Bare),
    CycleEntry::new("lftg", CycleValue::Bare),
    CycleEntry::new("part", CycleValue::Fixed("6")),
    CycleEntry::new("ver", CycleValue::Bare),
    CycleEntry::new("type", CycleValue::Bare),
    CycleEntry::new("diag", CycleValue::Fixed("0")),
    CycleEntry::new("loop", CycleValue::Fixed("5550")),
];

/// Frames per burst, in send order
pub const BURSTS: [&[CycleEntry]; 5] = [
    &[KV_CYCLE[0], KV_CYCLE[1]],
    &[KV_CYCLE[2], KV_CYCLE[3], KV_CYCLE[4]],
    &[KV_CYCLE[5], KV_CYCLE[6], KV_CYCLE[7], KV_CYCLE[8]],
    &[KV_CYCLE[9], KV_CYCLE[10], KV_CYCLE[11]],
    &[KV_CYCLE[12], KV_CYCLE[13]],
];
