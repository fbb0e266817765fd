//! Shared daemon state.
//!
//! - [`mode::ModeStateMachine`]: proxy/emulate authority and byte counters
//! - [`ring_buffer::EventRing`]: outbound event log drained by IPC clients

pub mod mode;
pub mod ring_buffer;

pub use mode::{MAX_INCLINE, MAX_SPEED_TENTHS, Mode, ModeSnapshot, ModeStateMachine, SideEffect, Transition};
pub use ring_buffer::EventRing;
