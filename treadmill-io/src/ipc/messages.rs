//! Newline-delimited JSON messages exchanged over the IPC socket
//!
//! # Commands (client → daemon)
//!
//! | `cmd` | Fields | Meaning |
//! |-------|--------|---------|
//! | `speed` | `value`: number, mph | Set emulated speed (enters emulate) |
//! | `incline` | `value`: number, percent | Set emulated incline (enters emulate) |
//! | `emulate` | `enabled`: bool | Enter/leave emulate |
//! | `proxy` | `enabled`: bool | Enter/leave proxy |
//! | `status` | | Request a status event |
//! | `heartbeat` | | Keep the watchdog fed |
//! | `quit` | | Shut the daemon down |
//!
//! # Events (daemon → client)
//!
//! ```text
//! {"type":"kv","ts":1.23,"source":"console","key":"hmph","value":"78"}
//! {"type":"status","proxy":true,"emulate":false,"emu_speed":0,"emu_incline":0,...}
//! {"type":"error","msg":"too many clients"}
//! ```

use crate::core::ModeSnapshot;
use crate::error::Result;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};

/// Longest command line accepted, newline excluded
pub const MAX_COMMAND_LEN: usize = 1023;

/// Parsed client command
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IpcCommand {
    /// Target speed in mph
    Speed(f64),
    /// Target incline in whole percent
    Incline(i32),
    Emulate(bool),
    Proxy(bool),
    Status,
    Heartbeat,
    Quit,
    /// Malformed line or unrecognized `cmd`
    Unknown,
}

impl IpcCommand {
    /// Parse one line (without its newline)
    pub fn parse(line: &str) -> Self {
        if line.is_empty() || line.len() > MAX_COMMAND_LEN {
            return Self::Unknown;
        }
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line) else {
            return Self::Unknown;
        };
        let Some(cmd) = obj.get("cmd").and_then(Value::as_str) else {
            return Self::Unknown;
        };
        let enabled = || obj.get("enabled").and_then(Value::as_bool).unwrap_or(false);

        match cmd {
            "speed" => obj
                .get("value")
                .and_then(Value::as_f64)
                .map_or(Self::Unknown, Self::Speed),
            "incline" => match obj.get("value") {
                Some(v) if v.is_i64() || v.is_u64() => {
                    v.as_i64().map_or(Self::Unknown, |n| Self::Incline(saturate(n)))
                }
                Some(v) => v
                    .as_f64()
                    .map_or(Self::Unknown, |f| Self::Incline(f as i32)),
                None => Self::Unknown,
            },
            "emulate" => Self::Emulate(enabled()),
            "proxy" => Self::Proxy(enabled()),
            "status" => Self::Status,
            "heartbeat" => Self::Heartbeat,
            "quit" => Self::Quit,
            _ => Self::Unknown,
        }
    }

    /// Wire form, terminated by a newline
    pub fn to_line(&self) -> Option<String> {
        let value = match *self {
            Self::Speed(mph) => json!({"cmd": "speed", "value": mph}),
            Self::Incline(pct) => json!({"cmd": "incline", "value": pct}),
            Self::Emulate(enabled) => json!({"cmd": "emulate", "enabled": enabled}),
            Self::Proxy(enabled) => json!({"cmd": "proxy", "enabled": enabled}),
            Self::Status => json!({"cmd": "status"}),
            Self::Heartbeat => json!({"cmd": "heartbeat"}),
            Self::Quit => json!({"cmd": "quit"}),
            Self::Unknown => return None,
        };
        Some(format!("{}\n", value))
    }
}

fn saturate(n: i64) -> i32 {
    n.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Incline in half-percent units, shown to clients as percent
///
/// Serializes as an integer when whole (`5`) and as a float otherwise (`2.5`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HalfPercent(pub i32);

impl HalfPercent {
    pub fn percent(self) -> f64 {
        f64::from(self.0) / 2.0
    }
}

impl Serialize for HalfPercent {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if self.0 % 2 == 0 {
            serializer.serialize_i32(self.0 / 2)
        } else {
            serializer.serialize_f64(self.percent())
        }
    }
}

impl<'de> Deserialize<'de> for HalfPercent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let percent = f64::deserialize(deserializer)?;
        Ok(Self((percent * 2.0).round() as i32))
    }
}

/// Origin of a KV event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Console,
    Motor,
    Emulate,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::Motor => "motor",
            Self::Emulate => "emulate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvEvent {
    /// Seconds since daemon start
    pub ts: f64,
    pub source: Source,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub proxy: bool,
    pub emulate: bool,
    /// Emulated speed, tenths of mph
    pub emu_speed: i32,
    pub emu_incline: HalfPercent,
    /// Speed last reported by the motor, tenths of mph
    pub bus_speed: Option<i32>,
    pub bus_incline: Option<HalfPercent>,
    pub console_bytes: u64,
    pub motor_bytes: u64,
}

impl StatusEvent {
    pub fn new(snap: &ModeSnapshot, bus_speed: Option<i32>, bus_incline: Option<i32>) -> Self {
        Self {
            proxy: snap.proxy_enabled,
            emulate: snap.emulate_enabled,
            emu_speed: snap.speed_tenths,
            emu_incline: HalfPercent(snap.incline),
            bus_speed,
            bus_incline: bus_incline.map(HalfPercent),
            console_bytes: snap.console_bytes,
            motor_bytes: snap.motor_bytes,
        }
    }
}

/// Outbound event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Kv(KvEvent),
    Status(StatusEvent),
    Error { msg: String },
}

impl Event {
    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error { msg: msg.into() }
    }

    /// Single JSON line terminated by `\n`
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Mode;

    #[test]
    fn test_parse_commands() {
        assert_eq!(IpcCommand::parse(r#"{"cmd":"speed","value":1.2}"#), IpcCommand::Speed(1.2));
        assert_eq!(IpcCommand::parse(r#"{"cmd":"speed","value":3}"#), IpcCommand::Speed(3.0));
        assert_eq!(IpcCommand::parse(r#"{"cmd":"incline","value":5}"#), IpcCommand::Incline(5));
        assert_eq!(IpcCommand::parse(r#"{"cmd":"incline","value":7.9}"#), IpcCommand::Incline(7));
        assert_eq!(
            IpcCommand::parse(r#"{"cmd":"emulate","enabled":true}"#),
            IpcCommand::Emulate(true)
        );
        assert_eq!(IpcCommand::parse(r#"{"cmd":"proxy"}"#), IpcCommand::Proxy(false));
        assert_eq!(IpcCommand::parse(r#"{"cmd":"status"}"#), IpcCommand::Status);
        assert_eq!(IpcCommand::parse(r#"{"cmd":"heartbeat"}"#), IpcCommand::Heartbeat);
        assert_eq!(IpcCommand::parse(r#"{"cmd":"quit","extra":1}"#), IpcCommand::Quit);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for line in [
            "",
            "not json",
            "[1,2]",
            r#"{"value":1}"#,
            r#"{"cmd":5}"#,
            r#"{"cmd":"speed"}"#,
            r#"{"cmd":"speed","value":"fast"}"#,
            r#"{"cmd":"incline","value":null}"#,
            r#"{"cmd":"reboot"}"#,
        ] {
            assert_eq!(IpcCommand::parse(line), IpcCommand::Unknown, "{line}");
        }

        let long = format!(r#"{{"cmd":"status","pad":"{}"}}"#, "x".repeat(MAX_COMMAND_LEN));
        assert_eq!(IpcCommand::parse(&long), IpcCommand::Unknown);
    }

    #[test]
    fn test_command_line_parses_back() {
        let cmd = IpcCommand::Emulate(true);
        let line = cmd.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(IpcCommand::parse(line.trim_end()), cmd);
        assert!(IpcCommand::Unknown.to_line().is_none());
    }

    #[test]
    fn test_kv_event_shape() {
        let event = Event::Kv(KvEvent {
            ts: 1.5,
            source: Source::Console,
            key: "hmph".into(),
            value: "78".into(),
        });
        assert_eq!(
            event.to_line().unwrap(),
            "{\"type\":\"kv\",\"ts\":1.5,\"source\":\"console\",\"key\":\"hmph\",\"value\":\"78\"}\n"
        );
    }

    #[test]
    fn test_status_event_shape() {
        let snap = ModeSnapshot {
            mode: Mode::Emulating,
            proxy_enabled: false,
            emulate_enabled: true,
            speed_tenths: 50,
            speed_raw: 500,
            incline: 5,
            console_bytes: 12,
            motor_bytes: 34,
        };
        let line = Event::Status(StatusEvent::new(&snap, None, Some(8)))
            .to_line()
            .unwrap();
        assert_eq!(
            line,
            "{\"type\":\"status\",\"proxy\":false,\"emulate\":true,\"emu_speed\":50,\
             \"emu_incline\":2.5,\"bus_speed\":null,\"bus_incline\":4,\
             \"console_bytes\":12,\"motor_bytes\":34}\n"
        );

        let Event::Status(status) = Event::from_line(&line).unwrap() else {
            panic!("expected status");
        };
        assert_eq!(status.emu_incline, HalfPercent(5));
        assert_eq!(status.bus_incline, Some(HalfPercent(8)));
    }

    #[test]
    fn test_error_event_shape() {
        assert_eq!(
            Event::error("too many clients").to_line().unwrap(),
            "{\"type\":\"error\",\"msg\":\"too many clients\"}\n"
        );
    }
}
