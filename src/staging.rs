//! Staging Unit
//!
//! Data with one canonical location (the source context) and zero or more
//! mirrors in other contexts. Staging copies the canonical data into every
//! mirror. Shared by workflow inputs and workflow steps.

use std::collections::BTreeMap;

use log::{debug, info, warn};

use crate::error::StagingError;
use crate::execution::registry::ContextRegistry;
use crate::logging::LogContext;
use crate::uri::Uri;

#[derive(Debug, Clone)]
pub struct StageableData {
    uris: BTreeMap<String, String>,
    parsed: BTreeMap<String, Uri>,
    source_context: String,
    clean: bool,
    staged: bool,
    log: LogContext,
}

impl StageableData {
    /// `uris` maps context names to locations; `source_context` must be one
    /// of them. With `clean`, existing mirrors are deleted before copying.
    pub fn new(uris: BTreeMap<String, String>, source_context: impl Into<String>, clean: bool) -> Self {
        Self {
            uris,
            parsed: BTreeMap::new(),
            source_context: source_context.into(),
            clean,
            staged: false,
            log: LogContext::new("staging"),
        }
    }

    /// Logs under the target of the owning input or step.
    pub fn with_log(mut self, log: LogContext) -> Self {
        self.log = log;
        self
    }

    /// Parses every location. Fails on a root path or a missing source.
    pub fn initialize(&mut self) -> Result<(), StagingError> {
        let mut parsed = BTreeMap::new();
        for (context, raw) in &self.uris {
            let uri = Uri::parse(raw)?;
            if uri.is_root() {
                return Err(StagingError::RootPath {
                    context: context.clone(),
                    uri: raw.clone(),
                });
            }
            parsed.insert(context.clone(), uri);
        }

        if !parsed.contains_key(&self.source_context) {
            return Err(StagingError::MissingSource(self.source_context.clone()));
        }

        self.parsed = parsed;
        Ok(())
    }

    /// Copies the canonical data into every other context, stopping at the
    /// first failure.
    pub fn stage(&mut self, registry: &ContextRegistry) -> Result<(), StagingError> {
        let source = self
            .parsed
            .get(&self.source_context)
            .ok_or(StagingError::NotInitialized)?;

        for (context, dest) in &self.parsed {
            if *context == self.source_context {
                continue;
            }

            if self.clean {
                match registry.exists(dest) {
                    Ok(true) => {
                        if let Err(e) = registry.delete(dest) {
                            warn!(
                                target: self.log.target(),
                                "Cannot clean staging target {}: {}",
                                dest,
                                e
                            );
                        }
                    }
                    Ok(false) => {}
                    Err(e) => warn!(
                        target: self.log.target(),
                        "Cannot check staging target {}: {}",
                        dest,
                        e
                    ),
                }
            }

            debug!(
                target: self.log.target(),
                "Staging {} -> {} ({} -> {})",
                source,
                dest,
                self.source_context,
                context
            );
            registry.copy(source, dest).map_err(|e| StagingError::Copy {
                from_context: self.source_context.clone(),
                to_context: context.clone(),
                from: source.to_string(),
                to: dest.to_string(),
                source: e,
            })?;
        }

        if self.parsed.len() > 1 {
            info!(
                target: self.log.target(),
                "Staged {} to {} context(s)",
                source,
                self.parsed.len() - 1
            );
        }
        self.staged = true;
        Ok(())
    }

    pub fn get_data_uri(&self, context: &str) -> Result<&Uri, StagingError> {
        self.parsed
            .get(context)
            .ok_or_else(|| StagingError::UnknownContext(context.to_string()))
    }

    /// Canonical location.
    pub fn source_uri(&self) -> Result<&Uri, StagingError> {
        self.get_data_uri(&self.source_context)
    }

    pub fn source_context(&self) -> &str {
        &self.source_context
    }

    pub fn contexts(&self) -> impl Iterator<Item = &str> {
        self.uris.keys().map(|k| k.as_str())
    }

    pub fn is_staged(&self) -> bool {
        self.staged
    }
}
