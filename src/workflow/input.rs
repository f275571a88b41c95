//! Input Unit
//!
//! A workflow-level input: user data living in one context and mirrored
//! into the work area of every other context whose steps read it.

use std::collections::BTreeMap;

use log::info;

use crate::error::StagingError;
use crate::execution::registry::ContextRegistry;
use crate::logging::LogContext;
use crate::staging::StageableData;
use crate::uri::Uri;

pub struct WorkflowInput {
    name: String,
    staging: StageableData,
    log: LogContext,
}

impl WorkflowInput {
    pub fn new(
        name: impl Into<String>,
        uris: BTreeMap<String, String>,
        source_context: impl Into<String>,
        log: LogContext,
    ) -> Self {
        Self {
            name: name.into(),
            staging: StageableData::new(uris, source_context, false).with_log(log.clone()),
            log,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initialize(&mut self) -> Result<(), StagingError> {
        self.staging.initialize()
    }

    pub fn stage(&mut self, registry: &ContextRegistry) -> Result<(), StagingError> {
        self.staging.stage(registry)?;
        info!(
            target: self.log.target(),
            "Input '{}' staged from {}",
            self.name,
            self.staging.source_uri()?
        );
        Ok(())
    }

    pub fn get_data_uri(&self, context: &str) -> Result<&Uri, StagingError> {
        self.staging.get_data_uri(context)
    }

    pub fn is_staged(&self) -> bool {
        self.staging.is_staged()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::testing::MemoryData;
    use std::sync::Arc;

    #[test]
    fn test_input_staged_into_other_context() {
        let mem = Arc::new(MemoryData::new("mem"));
        mem.touch("/data/reads/a.fq");
        let mut registry = ContextRegistry::new();
        registry.register_data(mem.clone());

        let uris = BTreeMap::from([
            ("mem".to_string(), "mem:/data/reads".to_string()),
            ("scratch".to_string(), "mem:/work/_input-reads/reads".to_string()),
        ]);
        let mut input = WorkflowInput::new("reads", uris, "mem", LogContext::new("test"));
        input.initialize().unwrap();
        input.stage(&registry).unwrap();

        assert!(input.is_staged());
        assert!(mem.is_file("/work/_input-reads/reads/a.fq"));
        assert_eq!(input.get_data_uri("scratch").unwrap().name(), "reads");
    }

    #[test]
    fn test_input_at_root_rejected() {
        let uris = BTreeMap::from([("local".to_string(), "local:/".to_string())]);
        let mut input = WorkflowInput::new("reads", uris, "local", LogContext::default());
        assert!(matches!(input.initialize(), Err(StagingError::RootPath { .. })));
    }
}
