//! Event construction and publication into the ring

use super::messages::{Event, KvEvent, Source, StatusEvent};
use crate::core::{EventRing, ModeStateMachine};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Instant;

/// Readings not yet reported by the motor
const UNKNOWN: i32 = i32::MIN;

/// Last `hmph`/`inc` values reported by the motor controller
#[derive(Debug)]
pub struct BusReadings {
    speed_tenths: AtomicI32,
    incline: AtomicI32,
}

impl Default for BusReadings {
    fn default() -> Self {
        Self {
            speed_tenths: AtomicI32::new(UNKNOWN),
            incline: AtomicI32::new(UNKNOWN),
        }
    }
}

impl BusReadings {
    pub fn set_speed(&self, tenths: i32) {
        self.speed_tenths.store(tenths, Ordering::Relaxed);
    }

    /// Half-percent units
    pub fn set_incline(&self, half_pct: i32) {
        self.incline.store(half_pct, Ordering::Relaxed);
    }

    pub fn speed(&self) -> Option<i32> {
        known(self.speed_tenths.load(Ordering::Relaxed))
    }

    pub fn incline(&self) -> Option<i32> {
        known(self.incline.load(Ordering::Relaxed))
    }
}

fn known(v: i32) -> Option<i32> {
    (v != UNKNOWN).then_some(v)
}

/// Serializes events and pushes them into the shared ring
///
/// Cheap to clone; every clone writes to the same ring.
#[derive(Clone)]
pub struct EventPublisher {
    ring: Arc<EventRing>,
    mode: Arc<ModeStateMachine>,
    bus: Arc<BusReadings>,
    started: Instant,
}

impl EventPublisher {
    pub fn new(ring: Arc<EventRing>, mode: Arc<ModeStateMachine>, bus: Arc<BusReadings>) -> Self {
        Self {
            ring,
            mode,
            bus,
            started: Instant::now(),
        }
    }

    pub fn ring(&self) -> &Arc<EventRing> {
        &self.ring
    }

    pub fn kv(&self, source: Source, key: &str, value: &str) {
        self.publish(&Event::Kv(KvEvent {
            ts: self.started.elapsed().as_secs_f64(),
            source,
            key: key.to_string(),
            value: value.to_string(),
        }));
    }

    pub fn status_event(&self) -> StatusEvent {
        StatusEvent::new(&self.mode.snapshot(), self.bus.speed(), self.bus.incline())
    }

    pub fn status(&self) {
        self.publish(&Event::Status(self.status_event()));
    }

    fn publish(&self, event: &Event) {
        match event.to_line() {
            Ok(line) => self.ring.push(&line),
            Err(e) => log::warn!("Dropping unserializable event {:?}: {}", event, e),
        }
    }
}
