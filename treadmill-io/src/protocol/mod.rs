//! Treadmill bus wire protocol

pub mod kv;

pub use kv::{KvPair, build, parse, parse_frames};
