//! Process-wide logging configuration
//!
//! Logging is configured once per process by building a [`LogConfiguration`],
//! typically from the environment, and applying it. Each enabled output is a
//! `tracing-subscriber` layer beneath a shared filter.

use std::{
    env, io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable enabling or disabling console output
pub const LOG_CONSOLE_VAR: &str = "INITIATOR_LOG_CONSOLE";
/// Environment variable naming the file to log to
pub const LOG_FILE_VAR: &str = "INITIATOR_LOG_FILE";
/// Environment variable holding the filter directives
pub const LOG_FILTER_VAR: &str = "INITIATOR_LOG_FILTER";

const DEFAULT_FILTER: &str = "info";

/// An error applying a logging configuration
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Logging has already been configured for this process
    #[error("logging has already been configured")]
    AlreadyApplied,
    /// A configuration value could not be understood
    #[error("invalid value `{value}` for `{key}`")]
    InvalidSetting {
        /// The setting's key
        key: &'static str,
        /// The offending value
        value: String,
    },
    /// The filter directives could not be parsed
    #[error("invalid log filter")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    /// The log file could not be opened
    #[error("unable to open log file `{}`", path.display())]
    LogFile {
        /// The log file path
        path: PathBuf,
        /// The underlying error
        #[source]
        source: io::Error,
    },
}

/// Which log outputs are enabled and what is written to them
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogConfiguration {
    console: bool,
    file: Option<PathBuf>,
    filter: String,
}

impl Default for LogConfiguration {
    fn default() -> Self {
        Self {
            console: true,
            file: None,
            filter: DEFAULT_FILTER.to_owned(),
        }
    }
}

/// Keeps file output flowing
///
/// Buffered log lines are flushed when the guard is dropped, so it should be
/// held for the life of the process.
#[derive(Debug)]
#[must_use = "file logging stops when the guard is dropped"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

impl LogConfiguration {
    /// Reads the configuration from the process environment
    ///
    /// * `INITIATOR_LOG_CONSOLE`: `true` or `false`, defaulting to `true`
    /// * `INITIATOR_LOG_FILE`: path of a file to append logs to, if any
    /// * `INITIATOR_LOG_FILTER`: filter directives, defaulting to `info`
    pub fn from_env() -> Result<Self, LoggingError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LoggingError> {
        let mut config = Self::default();

        if let Some(value) = lookup(LOG_CONSOLE_VAR) {
            config.console = parse_flag(LOG_CONSOLE_VAR, value)?;
        }

        config.file = lookup(LOG_FILE_VAR)
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        if let Some(filter) = lookup(LOG_FILTER_VAR).filter(|f| !f.trim().is_empty()) {
            config.filter = filter;
        }

        Ok(config)
    }

    /// Enables or disables console output
    #[inline]
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.console = enabled;
        self
    }

    /// Writes logs to the given file in addition to any other outputs
    #[inline]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Sets the filter directives, in the same syntax as `RUST_LOG`
    #[inline]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Whether console output is enabled
    #[inline]
    pub fn console(&self) -> bool {
        self.console
    }

    /// The file logs are written to, if any
    #[inline]
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// The filter directives
    #[inline]
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Installs this configuration as the process-wide subscriber
    ///
    /// # Errors
    ///
    /// Returns [`LoggingError::AlreadyApplied`] if a global subscriber has
    /// already been installed.
    pub fn apply(&self) -> Result<LoggingGuard, LoggingError> {
        let filter = EnvFilter::try_new(&self.filter)?;

        let console_layer = self
            .console
            .then(|| fmt::layer().with_target(true).compact());

        let (file_layer, file_guard) = match &self.file {
            Some(path) => {
                let (writer, guard) = tracing_appender::non_blocking(open_log_file(path)?);
                let layer = fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_thread_ids(true)
                    .with_target(true);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|_| LoggingError::AlreadyApplied)?;

        tracing::debug!(
            console = self.console,
            file = ?self.file,
            filter = %self.filter,
            "logging configured"
        );

        Ok(LoggingGuard { _file: file_guard })
    }
}

fn parse_flag(key: &'static str, value: String) -> Result<bool, LoggingError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(LoggingError::InvalidSetting { key, value }),
    }
}

fn open_log_file(path: &Path) -> Result<std::fs::File, LoggingError> {
    let open = || {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
    };

    open().map_err(|source| LoggingError::LogFile {
        path: path.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_to_console_at_info() {
        let config = LogConfiguration::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config, LogConfiguration::default());
        assert!(config.console());
        assert!(config.file().is_none());
        assert_eq!(config.filter(), "info");
    }

    #[test]
    fn reads_every_setting() {
        let config = LogConfiguration::from_lookup(lookup(&[
            (LOG_CONSOLE_VAR, "False"),
            (LOG_FILE_VAR, "logs/app.log"),
            (LOG_FILTER_VAR, "initiator_tokens=debug"),
        ]))
        .unwrap();

        assert!(!config.console());
        assert_eq!(config.file(), Some(Path::new("logs/app.log")));
        assert_eq!(config.filter(), "initiator_tokens=debug");
    }

    #[test]
    fn rejects_unreadable_flag() {
        let error = LogConfiguration::from_lookup(lookup(&[(LOG_CONSOLE_VAR, "sometimes")]))
            .unwrap_err();

        assert!(matches!(
            error,
            LoggingError::InvalidSetting { key: LOG_CONSOLE_VAR, ref value } if value == "sometimes"
        ));
    }

    #[test]
    fn rejects_bad_filter_before_installing() {
        let error = LogConfiguration::default()
            .with_filter("initiator=notalevel")
            .apply()
            .unwrap_err();

        assert!(matches!(error, LoggingError::Filter(_)));
    }

    #[test]
    fn can_only_be_applied_once() {
        let path = std::env::temp_dir().join(format!("initiator-log-{}.log", std::process::id()));
        let config = LogConfiguration::default()
            .with_console(false)
            .with_file(&path);

        let guard = config.apply().unwrap();
        tracing::info!("written to the log file");

        assert!(matches!(config.apply(), Err(LoggingError::AlreadyApplied)));

        drop(guard);
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("written to the log file"));
        std::fs::remove_file(&path).unwrap();
    }
}
