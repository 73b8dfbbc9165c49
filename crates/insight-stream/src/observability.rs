use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "insight-stream.logs.jsonl";

/// Where log records go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogOutput {
    /// Compact lines on stderr; stdout is left to streamed content.
    Console,
    /// JSON lines appended to a file.
    JsonFile { dir: PathBuf, file_name: String },
}

/// Logging setup resolved from `INSIGHT_*` variables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogSettings {
    pub enabled: bool,
    /// `EnvFilter` directive, e.g. `warn,insight_stream=debug`.
    pub filter: String,
    pub output: LogOutput,
}

impl LogSettings {
    /// Reads the process environment.
    ///
    /// - `INSIGHT_OBSERVABILITY_ENABLED`: on/off switch, default on.
    /// - `INSIGHT_LOG_LEVEL`: filter directive; `RUST_LOG` is the fallback.
    /// - `INSIGHT_JSON_LOG_PATH`: JSONL file instead of the console.
    pub fn from_env(default_level: &str) -> Self {
        Self::from_lookup(default_level, |key| std::env::var(key).ok())
    }

    fn from_lookup(default_level: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup("INSIGHT_OBSERVABILITY_ENABLED")
            .and_then(|value| parse_bool_env(&value))
            .unwrap_or(true);
        let filter = ["INSIGHT_LOG_LEVEL", "RUST_LOG"]
            .into_iter()
            .filter_map(|key| lookup(key))
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty() && EnvFilter::try_new(value).is_ok())
            .unwrap_or_else(|| default_level.to_string());
        let output = match lookup("INSIGHT_JSON_LOG_PATH") {
            Some(path) if !path.trim().is_empty() => json_file_output(Path::new(path.trim())),
            _ => LogOutput::Console,
        };
        Self {
            enabled,
            filter,
            output,
        }
    }
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn json_file_output(path: &Path) -> LogOutput {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    LogOutput::JsonFile { dir, file_name }
}

/// Installs the global subscriber from `LogSettings::from_env`.
///
/// Only the first call in a process has any effect.
pub fn init_observability(default_level: &str) {
    INIT.get_or_init(|| install(LogSettings::from_env(default_level)));
}

fn install(settings: LogSettings) {
    if !settings.enabled {
        return;
    }
    let env_filter = EnvFilter::new(&settings.filter);

    match settings.output {
        LogOutput::JsonFile { dir, file_name } => {
            let _ = std::fs::create_dir_all(&dir);
            let writer = tracing_appender::rolling::never(dir, file_name);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(true)
                        .with_target(false)
                        .with_writer(writer),
                )
                .try_init();
        }
        LogOutput::Console => {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .try_init();
        }
    }
}
