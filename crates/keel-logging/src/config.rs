//! Logging configuration, deserializable from the `[logging]` section of
//! the server config file

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where log lines go and how they are shaped
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level used when `RUST_LOG` is unset
    pub default_level: String,

    /// Per-target overrides, e.g. `keel_storage = "debug"`
    pub targets: BTreeMap<String, String>,

    pub console: ConsoleConfig,

    /// Rolling file output; off unless set
    pub file: Option<FileConfig>,

    pub jsonl: JsonlConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            targets: BTreeMap::new(),
            console: ConsoleConfig::default(),
            file: None,
            jsonl: JsonlConfig::default(),
        }
    }
}

impl LogConfig {
    /// Debug level, pretty colored console
    pub fn development() -> Self {
        Self {
            default_level: "debug".to_string(),
            console: ConsoleConfig {
                enabled: true,
                pretty: true,
                ansi: true,
            },
            ..Self::default()
        }
    }

    /// Info level, JSONL on the console and in daily files under `log_dir`
    pub fn production(log_dir: PathBuf) -> Self {
        Self {
            file: Some(FileConfig {
                directory: log_dir,
                ..FileConfig::default()
            }),
            jsonl: JsonlConfig {
                include_location: false,
                ..JsonlConfig::default()
            },
            ..Self::default()
        }
    }

    /// Warnings only, plain console
    pub fn testing() -> Self {
        Self {
            default_level: "warn".to_string(),
            console: ConsoleConfig {
                enabled: true,
                pretty: true,
                ansi: false,
            },
            ..Self::default()
        }
    }

    /// Override the level of one target
    pub fn with_target(mut self, target: impl Into<String>, level: impl Into<String>) -> Self {
        self.targets.insert(target.into(), level.into());
        self
    }

    /// `EnvFilter` directive string: the default level followed by each
    /// target override
    pub fn filter_directives(&self) -> String {
        let mut directives = vec![self.default_level.clone()];
        directives.extend(
            self.targets
                .iter()
                .map(|(target, level)| format!("{target}={level}")),
        );
        directives.join(",")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    /// Human-readable lines instead of JSONL
    pub pretty: bool,
    /// ANSI colors (pretty mode only)
    pub ansi: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pretty: false,
            ansi: false,
        }
    }
}

/// Rolling JSONL files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub directory: PathBuf,
    /// File names are `<prefix>.<date>.log`, or `<prefix>.log` when not rotating
    pub prefix: String,
    pub rotation: RotationStrategy,
    /// Old files kept; ignored with [`RotationStrategy::Never`]
    pub max_files: Option<usize>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            prefix: "keel".to_string(),
            rotation: RotationStrategy::Daily,
            max_files: Some(14),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    /// A single file that grows forever
    Never,
}

/// Shape of JSONL lines, shared by console and file output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlConfig {
    /// Event fields at the top level rather than under `fields`
    pub flatten_events: bool,
    /// Enclosing spans under `spans`
    pub include_spans: bool,
    /// Source file and line
    pub include_location: bool,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            flatten_events: true,
            include_spans: true,
            include_location: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.default_level, "info");
        assert!(config.console.enabled);
        assert!(!config.console.pretty);
        assert!(config.file.is_none());
        assert_eq!(config.filter_directives(), "info");
    }

    #[test]
    fn test_presets() {
        let dev = LogConfig::development();
        assert_eq!(dev.default_level, "debug");
        assert!(dev.console.pretty && dev.console.ansi);

        let prod = LogConfig::production(PathBuf::from("/var/log/keel"));
        let file = prod.file.unwrap();
        assert_eq!(file.directory, PathBuf::from("/var/log/keel"));
        assert_eq!(file.rotation, RotationStrategy::Daily);
        assert!(!prod.jsonl.include_location);
        assert!(!prod.console.pretty);

        let test = LogConfig::testing();
        assert_eq!(test.default_level, "warn");
        assert!(!test.console.ansi);
    }

    #[test]
    fn test_target_directives() {
        let config = LogConfig::default()
            .with_target("keel_storage", "debug")
            .with_target("tower_http", "warn");
        assert_eq!(
            config.filter_directives(),
            "info,keel_storage=debug,tower_http=warn"
        );
    }

    #[test]
    fn test_partial_deserialize() {
        let config: LogConfig = serde_json::from_str(
            r#"{
                "default_level": "debug",
                "targets": {"keel_ledger": "trace"},
                "file": {"directory": "/tmp/keel", "rotation": "hourly"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.default_level, "debug");
        assert_eq!(config.targets["keel_ledger"], "trace");
        let file = config.file.unwrap();
        assert_eq!(file.rotation, RotationStrategy::Hourly);
        assert_eq!(file.prefix, "keel");
        assert_eq!(file.max_files, Some(14));
    }
}
