//! Flat key/value configuration loader.
//!
//! The original `AuomsConfig` is a process-wide singleton over a simple
//! `key = value` file. We keep the flat key/value shape (several keys are
//! genuinely optional and queried ad hoc by components that don't all agree
//! on a shared schema) but drop the singleton: a [`Config`] is an owned
//! value threaded through constructors, and can be reloaded by building a new
//! one and swapping it under a single lock in the owning component.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {}", path.display(), source))]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("malformed config line {}: {:?}", line_no, line))]
    MalformedLine { line_no: usize, line: String },

    #[snafu(display("config key {} is not valid JSON: {}", key, source))]
    InvalidJson {
        key: String,
        source: serde_json::Error,
    },

    #[snafu(display("config key {} has invalid value {:?}: {}", key, value, reason))]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// An owned, in-memory view of a `key = value` configuration file.
///
/// Lines beginning with `#` and blank lines are ignored. Keys queried but
/// absent from the file fall back to the defaults documented in spec.md §6.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: HashMap<String, String>,
}

impl Config {
    pub fn empty() -> Self {
        Config {
            values: HashMap::new(),
        }
    }

    /// Loads a config file from disk.
    #[tracing::instrument(level = "debug")]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).context(ReadSnafu { path })?;
        Ok(Self::parse(&text))
    }

    /// Parses a config file already read into memory (e.g. by a caller that
    /// embeds defaults rather than reading from disk).
    pub fn parse(text: &str) -> Self {
        let mut values = HashMap::new();
        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => {
                    values.insert(key.trim().to_string(), value.trim().to_string());
                }
                None => {
                    tracing::warn!(line_no = idx + 1, line = raw_line, "ignoring malformed config line");
                }
            }
        }
        Config { values }
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.values.get(key).cloned().unwrap_or_else(|| default.to_string())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key).map(|s| s.as_str()) {
            Some("true") | Some("1") | Some("yes") => true,
            Some("false") | Some("0") | Some("no") => false,
            _ => default,
        }
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.values
            .get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default)
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.values
            .get(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(default)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.values
            .get(key)
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(default)
    }

    pub fn get_duration_ms(&self, key: &str, default_ms: u64) -> Duration {
        Duration::from_millis(self.get_u64(key, default_ms))
    }

    pub fn get_string_list(&self, key: &str) -> Vec<String> {
        match self.values.get(key) {
            Some(v) => v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
            None => Vec::new(),
        }
    }

    /// Parses a JSON-valued key (e.g. `event_priority_by_syscall`) into a
    /// typed structure. Returns `Ok(None)` when the key is absent.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(raw) => serde_json::from_str(raw)
                .context(InvalidJsonSnafu { key })
                .map(Some),
        }
    }

    pub fn data_dir(&self) -> String {
        self.get_string("data_dir", "/var/opt/microsoft/auoms")
    }

    pub fn queue_dir(&self) -> String {
        self.get_string("queue_dir", &format!("{}/queue", self.data_dir()))
    }

    /// Returns a copy of this config with `key` forced to `value`,
    /// overriding whatever the file held (or adding it if absent). Used by
    /// the CLI's `--data-dir` override.
    pub fn with_override(&self, key: &str, value: &str) -> Self {
        let mut values = self.values.clone();
        values.insert(key.to_string(), value.to_string());
        Config { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_lines_skipping_comments() {
        let cfg = Config::parse(
            "# comment\n\nqueue_num_priorities = 8\nqueue_max_file_data_size=1048576\n",
        );
        assert_eq!(cfg.get_u64("queue_num_priorities", 1), 8);
        assert_eq!(cfg.get_u64("queue_max_file_data_size", 0), 1_048_576);
    }

    #[test]
    fn typed_accessors_fall_back_to_defaults() {
        let cfg = Config::empty();
        assert_eq!(cfg.get_u64("queue_max_unsaved_files", 128), 128);
        assert!(!cfg.get_bool("enable_ack_mode", false));
        assert_eq!(cfg.data_dir(), "/var/opt/microsoft/auoms");
        assert_eq!(cfg.queue_dir(), "/var/opt/microsoft/auoms/queue");
    }

    #[test]
    fn json_keys_parse_into_typed_maps() {
        let cfg = Config::parse(r#"event_priority_by_syscall = {"execve": 1, "connect": 2}"#);
        let map: HashMap<String, u16> = cfg.get_json("event_priority_by_syscall").unwrap().unwrap();
        assert_eq!(map.get("execve"), Some(&1));
    }
}
