//! treadmill-io - Serial bus MITM daemon for a treadmill console and motor controller
//!
//! The console and the motor controller talk over an inverted 9600-baud line
//! using `[key:value]` frames. This crate sits in the middle on three GPIO
//! pins and either forwards console traffic untouched (proxy) or replaces it
//! with its own command cycle (emulate), exposing both buses to local clients
//! over a Unix socket.
//!
//! ## Features
//!
//! - `pigpio`: link against libpigpio for real hardware; without it only the
//!   in-memory [`gpio::MockGpioPort`] is available

pub mod config;
pub mod controller;
pub mod core;
pub mod emulation;
pub mod error;
pub mod gpio;
pub mod ipc;
pub mod protocol;
pub mod serial;

// Re-export commonly used types
pub use config::AppConfig;
pub use controller::Controller;
pub use error::{Error, Result};
