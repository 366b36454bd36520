//! Server configuration backed by an explicit field registry.
//!
//! Every knob is declared once in [`registry`] with its name, kind,
//! default and validator. File load/save and the live `/set` console
//! command all go through the same registry, so a value that parses from
//! the settings file also parses from the console.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use log::{info, warn};
use shared::payload::ServerSettingsMsg;

use crate::error::{Result, ServerError};
use crate::registry::ActivityCounts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Int,
    Float,
    Bool,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Int(v) => write!(f, "{}", v),
            SettingValue::Float(v) => write!(f, "{}", v),
            SettingValue::Bool(v) => write!(f, "{}", v),
            SettingValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl SettingValue {
    fn parse(kind: SettingKind, raw: &str) -> std::result::Result<Self, String> {
        let raw = raw.trim();
        match kind {
            SettingKind::Int => raw
                .parse::<i64>()
                .map(SettingValue::Int)
                .map_err(|_| format!("`{}` is not an integer", raw)),
            SettingKind::Float => raw
                .parse::<f64>()
                .map(SettingValue::Float)
                .map_err(|_| format!("`{}` is not a number", raw)),
            SettingKind::Bool => match raw {
                "true" | "1" | "yes" => Ok(SettingValue::Bool(true)),
                "false" | "0" | "no" => Ok(SettingValue::Bool(false)),
                _ => Err(format!("`{}` is not a boolean", raw)),
            },
            SettingKind::Text => Ok(SettingValue::Text(raw.to_string())),
        }
    }
}

pub struct SettingField {
    pub name: &'static str,
    pub kind: SettingKind,
    pub default: fn() -> SettingValue,
    pub validator: fn(&SettingValue) -> std::result::Result<(), String>,
}

fn any(_: &SettingValue) -> std::result::Result<(), String> {
    Ok(())
}

fn positive_int(value: &SettingValue) -> std::result::Result<(), String> {
    match value {
        SettingValue::Int(v) if *v > 0 => Ok(()),
        _ => Err("must be a positive integer".into()),
    }
}

fn positive_float(value: &SettingValue) -> std::result::Result<(), String> {
    match value {
        SettingValue::Float(v) if *v > 0.0 => Ok(()),
        _ => Err("must be a positive number".into()),
    }
}

fn port(value: &SettingValue) -> std::result::Result<(), String> {
    match value {
        SettingValue::Int(v) if (1..=65535).contains(v) => Ok(()),
        _ => Err("must be a port number between 1 and 65535".into()),
    }
}

fn player_cap(value: &SettingValue) -> std::result::Result<(), String> {
    match value {
        SettingValue::Int(v) if (1..=255).contains(v) => Ok(()),
        _ => Err("must be between 1 and 255".into()),
    }
}

fn byte_range(value: &SettingValue) -> std::result::Result<(), String> {
    match value {
        SettingValue::Int(v) if (0..=255).contains(v) => Ok(()),
        _ => Err("must be between 0 and 255".into()),
    }
}

/// The one registry shared by file load/save and the `/set` command.
pub fn registry() -> &'static [SettingField] {
    static REGISTRY: &[SettingField] = &[
        SettingField {
            name: "max_players",
            kind: SettingKind::Int,
            default: || SettingValue::Int(32),
            validator: player_cap,
        },
        SettingField {
            name: "tcp_port",
            kind: SettingKind::Int,
            default: || SettingValue::Int(8800),
            validator: port,
        },
        SettingField {
            name: "udp_port",
            kind: SettingKind::Int,
            default: || SettingValue::Int(8801),
            validator: port,
        },
        SettingField {
            name: "update_interval_ms",
            kind: SettingKind::Int,
            default: || SettingValue::Int(500),
            validator: positive_int,
        },
        SettingField {
            name: "screenshot_interval_ms",
            kind: SettingKind::Int,
            default: || SettingValue::Int(3000),
            validator: positive_int,
        },
        SettingField {
            name: "screenshot_max_height",
            kind: SettingKind::Int,
            default: || SettingValue::Int(720),
            validator: positive_int,
        },
        SettingField {
            name: "inactive_object_quota",
            kind: SettingKind::Int,
            default: || SettingValue::Int(30),
            validator: byte_range,
        },
        SettingField {
            name: "tick_tolerance",
            kind: SettingKind::Float,
            default: || SettingValue::Float(10.0),
            validator: positive_float,
        },
        SettingField {
            name: "max_sync_correction",
            kind: SettingKind::Float,
            default: || SettingValue::Float(120.0),
            validator: positive_float,
        },
        SettingField {
            name: "max_lag_warnings",
            kind: SettingKind::Int,
            default: || SettingValue::Int(5),
            validator: positive_int,
        },
        SettingField {
            name: "in_flight_idle_secs",
            kind: SettingKind::Int,
            default: || SettingValue::Int(60),
            validator: positive_int,
        },
        SettingField {
            name: "in_game_idle_secs",
            kind: SettingKind::Int,
            default: || SettingValue::Int(180),
            validator: positive_int,
        },
        SettingField {
            name: "receive_timeout_secs",
            kind: SettingKind::Int,
            default: || SettingValue::Int(20),
            validator: positive_int,
        },
        SettingField {
            name: "handshake_timeout_secs",
            kind: SettingKind::Int,
            default: || SettingValue::Int(40),
            validator: positive_int,
        },
        SettingField {
            name: "enforce_whitelist",
            kind: SettingKind::Bool,
            default: || SettingValue::Bool(false),
            validator: any,
        },
        SettingField {
            name: "autosave_interval_secs",
            kind: SettingKind::Int,
            default: || SettingValue::Int(300),
            validator: positive_int,
        },
        SettingField {
            name: "motd",
            kind: SettingKind::Text,
            default: || SettingValue::Text("Welcome aboard".into()),
            validator: any,
        },
    ];
    REGISTRY
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    values: HashMap<&'static str, SettingValue>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let values = registry()
            .iter()
            .map(|field| (field.name, (field.default)()))
            .collect();
        Self { values }
    }
}

impl ServerSettings {
    /// Loads `key = value` lines, falling back to defaults for a missing
    /// file and skipping (with a warning) lines that fail validation.
    pub fn load(path: &Path) -> Self {
        let mut settings = Self::default();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(_) => {
                info!("settings file {} not found, using defaults", path.display());
                return settings;
            }
        };
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, raw)) = line.split_once('=') else {
                warn!("settings line {} has no `=`, skipping", lineno + 1);
                continue;
            };
            if let Err(reason) = settings.set(key.trim(), raw) {
                warn!("settings line {}: {}", lineno + 1, reason);
            }
        }
        settings
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out = String::from("# subspace server settings\n");
        for field in registry() {
            out.push_str(field.name);
            out.push_str(" = ");
            out.push_str(&self.values[field.name].to_string());
            out.push('\n');
        }
        std::fs::write(path, out).map_err(|e| ServerError::Storage(e.to_string()))
    }

    /// Parses and validates a raw value for a registered field. Shared by
    /// the settings file loader and the console `/set` command.
    pub fn set(&mut self, name: &str, raw: &str) -> std::result::Result<(), String> {
        let field = registry()
            .iter()
            .find(|field| field.name == name)
            .ok_or_else(|| format!("unknown setting `{}`", name))?;
        let value = SettingValue::parse(field.kind, raw)?;
        (field.validator)(&value).map_err(|reason| format!("{}: {}", name, reason))?;
        self.values.insert(field.name, value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&SettingValue> {
        self.values.get(name)
    }

    fn int(&self, name: &str) -> i64 {
        match self.values[name] {
            SettingValue::Int(v) => v,
            _ => unreachable!("registry kind mismatch for {}", name),
        }
    }

    fn float(&self, name: &str) -> f64 {
        match self.values[name] {
            SettingValue::Float(v) => v,
            _ => unreachable!("registry kind mismatch for {}", name),
        }
    }

    pub fn max_players(&self) -> usize {
        self.int("max_players") as usize
    }

    pub fn tcp_port(&self) -> u16 {
        self.int("tcp_port") as u16
    }

    pub fn udp_port(&self) -> u16 {
        self.int("udp_port") as u16
    }

    pub fn tick_tolerance(&self) -> f64 {
        self.float("tick_tolerance")
    }

    pub fn max_sync_correction(&self) -> f64 {
        self.float("max_sync_correction")
    }

    pub fn max_lag_warnings(&self) -> u32 {
        self.int("max_lag_warnings") as u32
    }

    pub fn in_flight_idle(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.int("in_flight_idle_secs") as u64)
    }

    pub fn in_game_idle(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.int("in_game_idle_secs") as u64)
    }

    pub fn receive_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.int("receive_timeout_secs") as u64)
    }

    pub fn handshake_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.int("handshake_timeout_secs") as u64)
    }

    pub fn autosave_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.int("autosave_interval_secs") as u64)
    }

    pub fn enforce_whitelist(&self) -> bool {
        matches!(self.values["enforce_whitelist"], SettingValue::Bool(true))
    }

    pub fn motd(&self) -> String {
        self.values["motd"].to_string()
    }

    /// Per-capita settings payload. Update cadence stretches and the
    /// inactive-object quota shrinks as more sessions participate, so the
    /// aggregate traffic stays roughly constant.
    pub fn settings_msg(&self, counts: &ActivityCounts) -> ServerSettingsMsg {
        let participants = counts.in_game.max(counts.in_flight).max(1) as i64;
        let quota = (self.int("inactive_object_quota") / participants).clamp(1, 255) as u8;
        ServerSettingsMsg {
            update_interval_ms: (self.int("update_interval_ms") * participants) as i32,
            screenshot_interval_ms: self.int("screenshot_interval_ms") as i32,
            screenshot_max_height: self.int("screenshot_max_height") as i32,
            inactive_object_quota: quota,
        }
    }
}
