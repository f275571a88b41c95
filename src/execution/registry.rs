//! Context Registry
//!
//! Maps context names to execution backends and URI schemes to data
//! backends. Backends are registered once at startup; every data operation
//! goes through the registry so the scheme's retry policy is applied
//! uniformly.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use super::backend::{DataBackend, ExecBackend, Transfer};
use super::local::{LocalData, LocalExecutor, LOCAL};
use super::retry::RetryPolicy;
use crate::config::EngineConfig;
use crate::error::BackendError;
use crate::uri::Uri;

#[derive(Default)]
pub struct ContextRegistry {
    data: BTreeMap<String, Arc<dyn DataBackend>>,
    exec: BTreeMap<String, Arc<dyn ExecBackend>>,
    transfers: BTreeMap<(String, String), Arc<dyn Transfer>>,
    policies: BTreeMap<String, RetryPolicy>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry serving the `local` context from `config`.
    pub fn with_local(config: &EngineConfig) -> Self {
        let local = config.context(LOCAL);
        let mut registry = Self::new();
        registry.register_data(Arc::new(LocalData));
        registry.register_exec(Arc::new(LocalExecutor::new(local.job_retry)));
        registry.apply_config(config);
        registry
    }

    pub fn register_data(&mut self, backend: Arc<dyn DataBackend>) {
        debug!("Registered data backend for scheme '{}'", backend.scheme());
        self.data.insert(backend.scheme().to_string(), backend);
    }

    pub fn register_exec(&mut self, backend: Arc<dyn ExecBackend>) {
        debug!(
            "Registered execution backend '{}' (data scheme '{}')",
            backend.context(),
            backend.data_scheme()
        );
        self.exec.insert(backend.context().to_string(), backend);
    }

    /// Registers a copy path between two different schemes.
    pub fn register_transfer(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        transfer: Arc<dyn Transfer>,
    ) {
        self.transfers.insert((from.into(), to.into()), transfer);
    }

    pub fn set_policy(&mut self, scheme: impl Into<String>, policy: RetryPolicy) {
        self.policies.insert(scheme.into(), policy);
    }

    /// Installs the I/O retry policy of every configured context.
    pub fn apply_config(&mut self, config: &EngineConfig) {
        for (name, context) in &config.contexts {
            self.set_policy(name.clone(), RetryPolicy::from(&context.io_retry));
        }
    }

    pub fn exec(&self, context: &str) -> Result<Arc<dyn ExecBackend>, BackendError> {
        self.exec
            .get(context)
            .cloned()
            .ok_or_else(|| BackendError::UnknownContext(context.to_string()))
    }

    pub fn data(&self, scheme: &str) -> Result<Arc<dyn DataBackend>, BackendError> {
        self.data
            .get(scheme)
            .cloned()
            .ok_or_else(|| BackendError::UnknownScheme(scheme.to_string()))
    }

    /// Data scheme used by an execution context.
    pub fn data_scheme_of(&self, context: &str) -> Result<String, BackendError> {
        Ok(self.exec(context)?.data_scheme().to_string())
    }

    pub fn policy(&self, scheme: &str) -> RetryPolicy {
        self.policies.get(scheme).copied().unwrap_or_default()
    }

    pub fn list(&self, uri: &Uri) -> Result<Vec<String>, BackendError> {
        let backend = self.data(uri.scheme())?;
        self.policy(uri.scheme()).call(
            &format!("list {}", uri),
            || backend.list(uri),
            || backend.refresh(),
        )
    }

    pub fn exists(&self, uri: &Uri) -> Result<bool, BackendError> {
        let backend = self.data(uri.scheme())?;
        self.policy(uri.scheme()).call(
            &format!("exists {}", uri),
            || backend.exists(uri),
            || backend.refresh(),
        )
    }

    pub fn mkdir(&self, uri: &Uri, recursive: bool) -> Result<(), BackendError> {
        let backend = self.data(uri.scheme())?;
        self.policy(uri.scheme()).call(
            &format!("mkdir {}", uri),
            || backend.mkdir(uri, recursive),
            || backend.refresh(),
        )
    }

    pub fn delete(&self, uri: &Uri) -> Result<(), BackendError> {
        let backend = self.data(uri.scheme())?;
        self.policy(uri.scheme()).call(
            &format!("delete {}", uri),
            || backend.delete(uri),
            || backend.refresh(),
        )
    }

    /// Copies `src` to `dest`, within one scheme or through a registered
    /// transfer.
    pub fn copy(&self, src: &Uri, dest: &Uri) -> Result<(), BackendError> {
        let what = format!("copy {} -> {}", src, dest);
        let policy = self.policy(dest.scheme());

        if src.scheme() == dest.scheme() {
            let backend = self.data(src.scheme())?;
            return policy.call(&what, || backend.copy(src, dest), || backend.refresh());
        }

        let transfer = self
            .transfers
            .get(&(src.scheme().to_string(), dest.scheme().to_string()))
            .cloned()
            .ok_or_else(|| BackendError::NoTransfer {
                from: src.scheme().to_string(),
                to: dest.scheme().to_string(),
            })?;
        let refresher = self.data(dest.scheme()).ok();
        policy.call(
            &what,
            || transfer.copy(src, dest),
            || match &refresher {
                Some(backend) => backend.refresh(),
                None => Ok(()),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::testing::{MemoryData, ScriptedExecutor};

    #[test]
    fn test_with_local_registers_local() {
        let registry = ContextRegistry::with_local(&EngineConfig::default());
        assert_eq!(registry.exec("local").unwrap().context(), "local");
        assert_eq!(registry.data_scheme_of("local").unwrap(), "local");
        assert!(registry.data("local").is_ok());
    }

    #[test]
    fn test_unknown_context_and_scheme() {
        let registry = ContextRegistry::new();
        assert!(matches!(
            registry.exec("gridengine"),
            Err(BackendError::UnknownContext(_))
        ));
        let uri = Uri::parse("s3://bucket/x").unwrap();
        assert!(matches!(registry.list(&uri), Err(BackendError::UnknownScheme(_))));
    }

    #[test]
    fn test_exec_context_maps_to_data_scheme() {
        let mut registry = ContextRegistry::new();
        registry.register_exec(Arc::new(ScriptedExecutor::new("grid", "mem")));
        assert_eq!(registry.data_scheme_of("grid").unwrap(), "mem");
    }

    #[test]
    fn test_cross_scheme_copy_needs_transfer() {
        let mut registry = ContextRegistry::new();
        registry.register_data(Arc::new(MemoryData::new("mem")));
        let src = Uri::parse("local:/a").unwrap();
        let dest = Uri::parse("mem:/b").unwrap();
        assert!(matches!(
            registry.copy(&src, &dest),
            Err(BackendError::NoTransfer { .. })
        ));
    }

    #[test]
    fn test_policy_applied_to_data_calls() {
        let mem = Arc::new(MemoryData::new("mem"));
        mem.fail_next_lists(2);

        let mut registry = ContextRegistry::new();
        registry.register_data(mem.clone());
        registry.set_policy(
            "mem",
            RetryPolicy {
                attempts: 3,
                delay: std::time::Duration::ZERO,
            },
        );

        let dir = Uri::parse("mem:/dir").unwrap();
        registry.mkdir(&dir, true).unwrap();
        assert!(registry.list(&dir).unwrap().is_empty());
        assert_eq!(mem.list_calls(), 3);
    }
}
