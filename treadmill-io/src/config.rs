//! Configuration for the treadmill-io daemon
//!
//! The file is a JSON object (or TOML when the path ends in `.toml`) with one
//! section per GPIO role plus optional tuning sections:
//!
//! ```json
//! {
//!   "console_read": { "gpio": 27 },
//!   "motor_write":  { "gpio": 22 },
//!   "motor_read":   { "gpio": 17 },
//!   "ipc":     { "socket_path": "/tmp/treadmill_io.sock" },
//!   "safety":  { "heartbeat_timeout_ms": 4000, "emulate_timeout_secs": 10800 },
//!   "logging": { "level": "info" }
//! }
//! ```
//!
//! The pin sections are validated by hand so the operator gets a message that
//! names the offending field. Any header GPIO (0-53) is accepted for reading,
//! but `motor_write` carries DMA waveforms and must be 0-31. Unknown keys are
//! ignored.

use crate::error::{Error, Result};
use crate::gpio::MAX_WAVE_GPIO;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest accepted config file
pub const MAX_CONFIG_SIZE: usize = 4096;

/// Highest GPIO number on the Raspberry Pi header
pub const MAX_GPIO: i64 = 53;

/// Default IPC socket location
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/treadmill_io.sock";

/// Top-level application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppConfig {
    pub gpio: GpioConfig,
    pub ipc: IpcConfig,
    pub safety: SafetyConfig,
    pub logging: LoggingConfig,
}

/// GPIO pin assignments (BCM numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GpioConfig {
    /// Pin wired to the console TX line
    pub console_read: u32,
    /// Pin driving the motor controller RX line
    pub motor_write: u32,
    /// Pin wired to the motor controller TX line
    pub motor_read: u32,
}

/// IPC socket configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct IpcConfig {
    pub socket_path: PathBuf,
}

/// Safety watchdog timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Command silence after which emulation is abandoned
    pub heartbeat_timeout_ms: u64,
    /// Continuous emulation ceiling before speed and incline are zeroed
    pub emulate_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 4_000,
            emulate_timeout_secs: 3 * 60 * 60,
        }
    }
}

impl SafetyConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn emulate_timeout(&self) -> Duration {
        Duration::from_secs(self.emulate_timeout_secs)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Build a config around explicit pins with default tuning
    pub fn with_pins(gpio: GpioConfig) -> Self {
        Self {
            gpio,
            ipc: IpcConfig::default(),
            safety: SafetyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a JSON or TOML file
    ///
    /// # Example
    /// ```no_run
    /// use treadmill_io::config::AppConfig;
    ///
    /// let config = AppConfig::from_file("gpio.json")?;
    /// # Ok::<(), treadmill_io::Error>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot open {}: {}", path.display(), e)))?;

        let is_toml = path.extension().is_some_and(|ext| ext == "toml");
        if is_toml {
            Self::from_toml_str(&contents)
        } else {
            Self::from_json_str(&contents)
        }
    }

    /// Parse a JSON document
    pub fn from_json_str(contents: &str) -> Result<Self> {
        check_size(contents)?;
        let doc: Value = serde_json::from_str(contents)
            .map_err(|e| Error::Config(format!("invalid JSON: {}", e)))?;
        Self::from_value(&doc)
    }

    /// Parse a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        check_size(contents)?;
        let doc: Value = toml::from_str(contents)?;
        Self::from_value(&doc)
    }

    fn from_value(doc: &Value) -> Result<Self> {
        let Some(root) = doc.as_object() else {
            return Err(Error::Config("top level must be an object".to_string()));
        };

        let gpio = GpioConfig {
            console_read: pin(root, "console_read")?,
            motor_write: pin(root, "motor_write")?,
            motor_read: pin(root, "motor_read")?,
        };
        if gpio.motor_write > MAX_WAVE_GPIO {
            return Err(Error::Config(format!(
                "gpio {} cannot drive waveforms [0-{}] in \"motor_write\"",
                gpio.motor_write, MAX_WAVE_GPIO
            )));
        }

        Ok(Self {
            gpio,
            ipc: section(root, "ipc")?,
            safety: section(root, "safety")?,
            logging: section(root, "logging")?,
        })
    }
}

fn check_size(contents: &str) -> Result<()> {
    if contents.len() > MAX_CONFIG_SIZE {
        return Err(Error::Config("config exceeds maximum size".to_string()));
    }
    Ok(())
}

fn pin(root: &serde_json::Map<String, Value>, name: &str) -> Result<u32> {
    let Some(entry) = root.get(name).and_then(Value::as_object) else {
        return Err(Error::Config(format!(
            "missing or invalid \"{}\" section",
            name
        )));
    };
    let Some(gpio) = entry.get("gpio").and_then(Value::as_i64) else {
        return Err(Error::Config(format!(
            "missing or invalid \"gpio\" in \"{}\"",
            name
        )));
    };
    if !(0..=MAX_GPIO).contains(&gpio) {
        return Err(Error::Config(format!(
            "gpio {} out of range [0-{}] in \"{}\"",
            gpio, MAX_GPIO, name
        )));
    }
    Ok(gpio as u32)
}

fn section<T>(root: &serde_json::Map<String, Value>, name: &str) -> Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match root.get(name) {
        None => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| Error::Config(format!("invalid \"{}\" section: {}", name, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "console_read": {"gpio": 27},
        "motor_write": {"gpio": 22},
        "motor_read": {"gpio": 17}
    }"#;

    fn config_error(json: &str) -> String {
        match AppConfig::from_json_str(json) {
            Err(Error::Config(msg)) => msg,
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_config_uses_defaults() {
        let config = AppConfig::from_json_str(VALID).unwrap();
        assert_eq!(config.gpio.console_read, 27);
        assert_eq!(config.gpio.motor_write, 22);
        assert_eq!(config.gpio.motor_read, 17);
        assert_eq!(config.ipc.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.safety.heartbeat_timeout(), Duration::from_secs(4));
        assert_eq!(config.safety.emulate_timeout(), Duration::from_secs(10_800));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_optional_sections() {
        let json = r#"{
            "console_read": {"gpio": 53},
            "motor_write": {"gpio": 31},
            "motor_read": {"gpio": 5},
            "ipc": {"socket_path": "/run/tm.sock"},
            "safety": {"heartbeat_timeout_ms": 500},
            "logging": {"level": "debug"},
            "extra": true
        }"#;
        let config = AppConfig::from_json_str(json).unwrap();
        assert_eq!(config.ipc.socket_path, PathBuf::from("/run/tm.sock"));
        assert_eq!(config.safety.heartbeat_timeout_ms, 500);
        assert_eq!(config.safety.emulate_timeout_secs, 10_800);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_missing_section() {
        let msg = config_error(r#"{"console_read": {"gpio": 1}, "motor_write": {"gpio": 2}}"#);
        assert_eq!(msg, "missing or invalid \"motor_read\" section");
    }

    #[test]
    fn test_non_object_section() {
        let msg = config_error(
            r#"{"console_read": 27, "motor_write": {"gpio": 2}, "motor_read": {"gpio": 3}}"#,
        );
        assert_eq!(msg, "missing or invalid \"console_read\" section");
    }

    #[test]
    fn test_non_integer_gpio() {
        let msg = config_error(
            r#"{"console_read": {"gpio": "27"}, "motor_write": {"gpio": 2}, "motor_read": {"gpio": 3}}"#,
        );
        assert_eq!(msg, "missing or invalid \"gpio\" in \"console_read\"");
    }

    #[test]
    fn test_out_of_range_gpio() {
        let msg = config_error(
            r#"{"console_read": {"gpio": 1}, "motor_write": {"gpio": 54}, "motor_read": {"gpio": 3}}"#,
        );
        assert_eq!(msg, "gpio 54 out of range [0-53] in \"motor_write\"");

        let msg = config_error(
            r#"{"console_read": {"gpio": 1}, "motor_write": {"gpio": 2}, "motor_read": {"gpio": -1}}"#,
        );
        assert_eq!(msg, "gpio -1 out of range [0-53] in \"motor_read\"");
    }

    #[test]
    fn test_motor_write_limited_to_waveform_pins() {
        let msg = config_error(
            r#"{"console_read": {"gpio": 1}, "motor_write": {"gpio": 32}, "motor_read": {"gpio": 40}}"#,
        );
        assert_eq!(msg, "gpio 32 cannot drive waveforms [0-31] in \"motor_write\"");
    }

    #[test]
    fn test_invalid_json() {
        assert!(config_error("{not json").starts_with("invalid JSON"));
        assert_eq!(config_error("[1, 2]"), "top level must be an object");
    }

    #[test]
    fn test_oversized_config() {
        let padded = format!("{}{}", VALID, " ".repeat(MAX_CONFIG_SIZE));
        assert_eq!(config_error(&padded), "config exceeds maximum size");
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_content = r#"
[console_read]
gpio = 27

[motor_write]
gpio = 22

[motor_read]
gpio = 17

[safety]
heartbeat_timeout_ms = 2000
"#;
        let config = AppConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.gpio.motor_write, 22);
        assert_eq!(config.safety.heartbeat_timeout_ms, 2000);
    }
}
