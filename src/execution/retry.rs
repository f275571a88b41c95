//! Retry Policy
//!
//! Backend calls are wrapped by one explicit policy object. Each failure is
//! classified before deciding whether to try again.

use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::config::IoRetryConfig;
use crate::error::BackendError;

/// How a failed call should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Try again after the delay
    Retry,
    /// Renew credentials, then try again
    RefreshAndRetry,
    /// The target does not exist; trying again cannot help
    NotFound,
    /// Give up immediately
    Permanent,
}

/// Maps a backend error onto a [`Classification`].
pub fn classify(error: &BackendError) -> Classification {
    match error {
        BackendError::Transient(_) => Classification::Retry,
        BackendError::Unauthorized(_) => Classification::RefreshAndRetry,
        BackendError::NotFound(_) => Classification::NotFound,
        BackendError::Io { source, .. } => match source.kind() {
            std::io::ErrorKind::NotFound => Classification::NotFound,
            std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::WouldBlock => Classification::Retry,
            _ => Classification::Permanent,
        },
        _ => Classification::Permanent,
    }
}

/// Maximum attempts and delay between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&IoRetryConfig::default())
    }
}

impl From<&IoRetryConfig> for RetryPolicy {
    fn from(config: &IoRetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            delay: Duration::from_millis(config.delay_ms),
        }
    }
}

impl RetryPolicy {
    /// A policy making exactly one attempt.
    pub fn once() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
        }
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `refresh` is called before retrying a call classified as
    /// [`Classification::RefreshAndRetry`]; a failing refresh ends the loop.
    pub fn call<T, F, R>(&self, what: &str, mut op: F, mut refresh: R) -> Result<T, BackendError>
    where
        F: FnMut() -> Result<T, BackendError>,
        R: FnMut() -> Result<(), BackendError>,
    {
        let mut attempt = 1;
        loop {
            let error = match op() {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let class = classify(&error);
            if attempt >= self.attempts
                || matches!(class, Classification::Permanent | Classification::NotFound)
            {
                debug!("{} failed ({:?}) after {} attempt(s)", what, class, attempt);
                return Err(error);
            }

            warn!(
                "{} failed (attempt {}/{}): {}",
                what, attempt, self.attempts, error
            );

            if class == Classification::RefreshAndRetry {
                refresh()?;
            }

            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            attempt += 1;
        }
    }
}
