use std::env;
use std::fmt;
use std::io::IsTerminal;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::EnvFilter;

/// The crates in this workspace that log with maximum verbosity.
const CRATE_NAMES: &[&str] = &[
    "relay",
    "relay_auth",
    "relay_common",
    "relay_config",
    "relay_server",
    "relay_statsd",
    "relay_system",
];

/// Controls the log format.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    #[default]
    Auto,

    /// Pretty printing with colors.
    Pretty,

    /// Simplified plain text output.
    Simplified,

    /// Dump out JSON lines.
    Json,
}

/// The logging level.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Do not log anything.
    Off,
    /// Log only errors.
    Error,
    /// Log warnings and errors.
    Warn,
    /// Log messages relevant to the average user.
    #[default]
    Info,
    /// Log messages relevant to debugging.
    Debug,
    /// Log full auxiliary information.
    Trace,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Off => "off",
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        };
        f.write_str(name)
    }
}

impl Level {
    fn level_filter(self) -> LevelFilter {
        match self {
            Level::Off => LevelFilter::OFF,
            Level::Error => LevelFilter::ERROR,
            Level::Warn => LevelFilter::WARN,
            Level::Info => LevelFilter::INFO,
            Level::Debug => LevelFilter::DEBUG,
            Level::Trace => LevelFilter::TRACE,
        }
    }
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// The log level for Relay.
    pub level: Level,

    /// Controls the log output format.
    ///
    /// Defaults to [`LogFormat::Auto`], which detects the best format based on the TTY.
    pub format: LogFormat,

    /// When set to `true`, backtraces are forced on.
    ///
    /// Otherwise, backtraces can be enabled by setting the `RUST_BACKTRACE` variable to `full`.
    pub enable_backtraces: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::default(),
            format: LogFormat::default(),
            enable_backtraces: false,
        }
    }
}

/// Builds the default filter directives for all of Relay's crates.
///
/// Third-party crates log at most at the configured level capped to INFO. The `RUST_LOG`
/// environment variable takes precedence over the defaults.
fn default_filter(level: Level) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let mut filter = EnvFilter::new("info");
    for name in CRATE_NAMES {
        filter = filter.add_directive(
            format!("{name}={}", level.level_filter())
                .parse()
                .unwrap_or_else(|_| LevelFilter::INFO.into()),
        );
    }
    filter
}

/// Initializes the logging system.
pub fn init(config: &LogConfig) {
    if config.enable_backtraces {
        env::set_var("RUST_BACKTRACE", "full");
    }

    let filter = default_filter(config.level);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match (config.format, std::io::stderr().is_terminal()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => {
            subscriber.pretty().init();
        }
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            subscriber.compact().with_ansi(false).init();
        }
        (LogFormat::Json, _) => {
            subscriber
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .init();
        }
    }
}

/// Initializes logging for tests.
///
/// Safe to call multiple times; only the first initialization takes effect.
pub fn init_test() {
    let filter = EnvFilter::new("trace");
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init()
        .ok();
}
