//! Local control socket
//!
//! | Module | Role |
//! |--------|------|
//! | [`messages`] | JSON command parsing and event encoding |
//! | [`publisher`] | Builds events and pushes them into the ring |
//! | [`server`] | Poll-driven Unix socket server, per-client ring cursors |
//! | [`client`] | Blocking client with a heartbeat thread |

pub mod client;
pub mod messages;
pub mod publisher;
pub mod server;

pub use client::TreadmillClient;
pub use messages::{Event, HalfPercent, IpcCommand, KvEvent, Source, StatusEvent};
pub use publisher::{BusReadings, EventPublisher};
pub use server::{IpcServer, MAX_CLIENTS};
