//! Logging Setup
//!
//! The process entry point owns logger initialization through
//! [`setup_logging`]. Components never configure logging themselves; they
//! receive a [`LogContext`] and emit records under its target so output of
//! concurrent jobs can be told apart and filtered with `RUST_LOG`.
//!
//! Components shared by every job (the context registry, the local backends
//! and the job store) log under their module path, e.g. `pipeflow::store`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::error::ConfigError;

/// Root log target of the crate.
pub const ROOT_TARGET: &str = "pipeflow";

/// Explicit logger handle passed into component constructors.
///
/// ```
/// use log::info;
/// use pipeflow::logging::LogContext;
///
/// let log = LogContext::new("job").child("1a2b3c4d");
/// assert_eq!(log.target(), "pipeflow::job::1a2b3c4d");
/// info!(target: log.target(), "starting");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogContext {
    target: String,
}

impl LogContext {
    pub fn new(component: &str) -> Self {
        Self {
            target: format!("{}::{}", ROOT_TARGET, component),
        }
    }

    /// A nested handle, e.g. a step below its job.
    pub fn child(&self, name: &str) -> Self {
        Self {
            target: format!("{}::{}", self.target, name),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Default for LogContext {
    fn default() -> Self {
        Self {
            target: ROOT_TARGET.to_string(),
        }
    }
}

/// Configures the global logger.
///
/// `level` is the filter used when `RUST_LOG` is unset. When `log_file` is
/// given, records are appended to it instead of stderr. Debug level adds the
/// source location to each line.
pub fn setup_logging(level: &str, log_file: Option<&Path>) -> Result<(), ConfigError> {
    let verbose = matches!(level, "debug" | "trace");

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    builder.format(move |buf, record| {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        match (verbose, record.file(), record.line()) {
            (true, Some(file), Some(line)) => writeln!(
                buf,
                "{} [{}] {} ({}:{}) {}",
                stamp,
                record.level(),
                record.target(),
                file,
                line,
                record.args()
            ),
            _ => writeln!(buf, "{} [{}] {}", stamp, record.level(), record.args()),
        }
    });

    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| ConfigError::LogFile {
                path: path.display().to_string(),
                source,
            })?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    // A second initialization (tests, embedding) keeps the first logger.
    let _ = builder.try_init();
    Ok(())
}
