//! Logging context.
//!
//! Nothing is installed at load time. A run builds a [`LoggingGuard`] from a
//! [`LoggingConfig`] and either scopes it to the current thread (stage
//! drivers) or installs it process-wide (the server). Console output is
//! human-readable; the log file gets one JSON object per line.

use std::path::PathBuf;

use tracing::dispatcher::{self, DefaultGuard, Dispatch, SetGlobalDefaultError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub file_name: String,
    /// Filter used when `RUST_LOG` is unset
    pub default_filter: String,
    /// Also log to stderr
    pub console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            file_name: "running_logs.log".to_string(),
            default_filter: "info".to_string(),
            console: true,
        }
    }
}

impl LoggingConfig {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_filter))
    }

    /// Create the log directory and assemble the subscriber
    pub fn build(&self) -> std::io::Result<LoggingGuard> {
        std::fs::create_dir_all(&self.log_dir)?;

        let console_layer = self.console.then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_filter(self.filter())
        });

        // appends to an existing file
        let file_appender = tracing_appender::rolling::never(&self.log_dir, &self.file_name);
        let (non_blocking, worker) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_filter(self.filter());

        let subscriber = tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer);

        Ok(LoggingGuard {
            dispatch: Dispatch::new(subscriber),
            _worker: worker,
        })
    }
}

/// Owns the subscriber and the file writer; dropping it flushes the log file
pub struct LoggingGuard {
    dispatch: Dispatch,
    _worker: WorkerGuard,
}

impl LoggingGuard {
    /// Route this thread's events here until the returned guard is dropped
    pub fn scoped(&self) -> DefaultGuard {
        dispatcher::set_default(&self.dispatch)
    }

    /// Route every thread's events here for the rest of the process
    pub fn install_global(&self) -> Result<(), SetGlobalDefaultError> {
        dispatcher::set_global_default(self.dispatch.clone())
    }
}
