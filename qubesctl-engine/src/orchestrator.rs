//! Orchestrator: one locked load / reconcile / save transaction per call.

use std::sync::Arc;

use qubesctl_hypervisor::{Qid, VmManager};
use qubesctl_telemetry::HostFacts;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::converge::converge;
use crate::error::{RegistryError, Result, ValidationError};
use crate::options::resolve;
use crate::registry::Registry;
use crate::request::{VmRef, VmRequest};
use crate::store::RegistryStore;
use crate::teardown;

/// Result of applying one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub name: String,
    pub changed: bool,
}

/// Changes to the registry-wide defaults. `None` and [`VmRef::Default`]
/// leave a pointer alone; [`VmRef::None`] clears it.
#[derive(Debug, Clone, Default)]
pub struct DefaultsUpdate {
    pub template: Option<VmRef>,
    pub netvm: Option<VmRef>,
    pub kernel: Option<VmRef>,
}

/// Drives requests through derivation, convergence and teardown.
pub struct Orchestrator {
    store: Arc<dyn RegistryStore>,
    manager: Arc<dyn VmManager>,
    host: Arc<dyn HostFacts>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        manager: Arc<dyn VmManager>,
        host: Arc<dyn HostFacts>,
    ) -> Self {
        Self {
            store,
            manager,
            host,
        }
    }

    /// Apply one request in its own transaction.
    #[instrument(skip(self, request), fields(vm_name = %request.name, state = ?request.state))]
    pub fn apply(&self, request: &VmRequest) -> Result<ApplyOutcome> {
        let _lock = self.store.lock_exclusive()?;
        let mut registry = self.store.load()?;

        let outcome = self.apply_locked(request, &mut registry)?;
        if outcome.changed {
            self.store.save(&registry)?;
        }
        Ok(outcome)
    }

    /// Apply a batch under a single lock.
    ///
    /// Stops at the first failure. Requests completed before it have already
    /// reached the backend, so their registry changes are saved before the
    /// error is returned.
    #[instrument(skip(self, requests), fields(count = requests.len()))]
    pub fn apply_all(&self, requests: &[VmRequest]) -> Result<Vec<ApplyOutcome>> {
        let _lock = self.store.lock_exclusive()?;
        let mut registry = self.store.load()?;

        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            match self.apply_locked(request, &mut registry) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    if outcomes.iter().any(|o| o.changed) {
                        warn!(
                            vm_name = %request.name,
                            completed = outcomes.len(),
                            "Batch stopped; saving completed requests"
                        );
                        self.store.save(&registry)?;
                    }
                    return Err(e);
                }
            }
        }

        if outcomes.iter().any(|o| o.changed) {
            self.store.save(&registry)?;
        }
        info!(
            changed = outcomes.iter().filter(|o| o.changed).count(),
            "Batch applied"
        );
        Ok(outcomes)
    }

    /// Update the registry-wide default pointers.
    #[instrument(skip(self))]
    pub fn set_defaults(&self, update: &DefaultsUpdate) -> Result<()> {
        let _lock = self.store.lock_exclusive()?;
        let mut registry = self.store.load()?;

        match &update.template {
            Some(VmRef::None) => registry.set_default_template(None)?,
            Some(VmRef::Named(name)) => {
                let qid = qid_of(&registry, name)?;
                registry.set_default_template(Some(qid))?;
            }
            Some(VmRef::Default) | None => {}
        }
        match &update.netvm {
            Some(VmRef::None) => registry.set_default_netvm(None)?,
            Some(VmRef::Named(name)) => {
                let qid = qid_of(&registry, name)?;
                registry.set_default_netvm(Some(qid))?;
            }
            Some(VmRef::Default) | None => {}
        }
        match &update.kernel {
            Some(VmRef::None) => registry.set_default_kernel(None),
            Some(VmRef::Named(name)) => {
                if !self.host.kernel_installed(name) {
                    return Err(ValidationError::KernelNotFound(name.clone()).into());
                }
                registry.set_default_kernel(Some(name.clone()));
            }
            Some(VmRef::Default) | None => {}
        }

        self.store.save(&registry)?;
        info!(
            default_template = ?registry.default_template(),
            default_netvm = ?registry.default_netvm(),
            default_kernel = ?registry.default_kernel(),
            "Defaults updated"
        );
        Ok(())
    }

    /// Current registry, read under the lock.
    pub fn registry(&self) -> Result<Registry> {
        let _lock = self.store.lock_exclusive()?;
        Ok(self.store.load()?)
    }

    fn apply_locked(&self, request: &VmRequest, registry: &mut Registry) -> Result<ApplyOutcome> {
        self.refresh_running(&request.name, registry)?;

        let changed = if request.is_absent() {
            teardown::run(&request.name, registry, self.manager.as_ref())?
        } else {
            let resolved = resolve(request, registry, self.host.as_ref())?;
            converge(&resolved, registry, self.manager.as_ref())?.changed
        };

        info!(vm_name = %request.name, changed, "Request applied");
        Ok(ApplyOutcome {
            name: request.name.clone(),
            changed,
        })
    }

    /// The stored running flag may be stale; ask the backend.
    fn refresh_running(&self, name: &str, registry: &mut Registry) -> Result<()> {
        let Some(record) = registry.by_name(name) else {
            return Ok(());
        };
        let running = self.manager.is_running(record)?;
        debug!(vm_name = %name, running, "Running state refreshed");
        let qid = record.qid;
        registry.set_running(qid, running);
        Ok(())
    }
}

fn qid_of(registry: &Registry, name: &str) -> std::result::Result<Qid, RegistryError> {
    registry
        .by_name(name)
        .map(|vm| vm.qid)
        .ok_or_else(|| RegistryError::UnknownVm(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::store::MemoryRegistryStore;
    use qubesctl_hypervisor::{MockBackend, VmKind};
    use qubesctl_telemetry::StaticHostFacts;

    fn orchestrator() -> (Orchestrator, Arc<MemoryRegistryStore>, Arc<MockBackend>) {
        let store = Arc::new(MemoryRegistryStore::new());
        let backend = Arc::new(MockBackend::new());
        let host = Arc::new(StaticHostFacts::new(8192, 4).with_kernel("4.4.14-11"));
        let orchestrator = Orchestrator::new(store.clone(), backend.clone(), host);
        (orchestrator, store, backend)
    }

    #[test]
    fn test_lock_released_after_error() {
        let (orchestrator, store, _) = orchestrator();
        let err = orchestrator
            .apply(&VmRequest::present("work", VmKind::AppVm, "red"))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::NoDefaultTemplate(_))
        ));
        assert!(!store.is_locked());
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn test_held_lock_blocks_apply() {
        let (orchestrator, store, _) = orchestrator();
        let _held = store.lock_exclusive().unwrap();
        let err = orchestrator
            .apply(&VmRequest::absent("work"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Registry(RegistryError::LockTimeout { .. })));
    }

    #[test]
    fn test_failed_batch_keeps_completed_requests() {
        let (orchestrator, store, backend) = orchestrator();
        let err = orchestrator
            .apply_all(&[
                VmRequest::present("fedora-23", VmKind::TemplateVm, "black"),
                VmRequest::present("sys-net", VmKind::NetVm, "red"),
            ])
            .unwrap_err();
        // sys-net needs a default template.
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::NoDefaultTemplate(_))
        ));
        let registry = store.snapshot();
        assert_eq!(registry.len(), 1);
        let qid = registry.by_name("fedora-23").unwrap().qid;
        assert!(backend.contains(qid));
        assert_eq!(store.save_count(), 1);
        assert!(!store.is_locked());
    }

    #[test]
    fn test_failed_first_request_saves_nothing() {
        let (orchestrator, store, _) = orchestrator();
        orchestrator
            .apply_all(&[
                VmRequest::present("sys-net", VmKind::NetVm, "red"),
                VmRequest::present("fedora-23", VmKind::TemplateVm, "black"),
            ])
            .unwrap_err();
        assert!(store.snapshot().is_empty());
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn test_set_defaults() {
        let (orchestrator, store, _) = orchestrator();
        orchestrator
            .apply(&VmRequest::present("fedora-23", VmKind::TemplateVm, "black"))
            .unwrap();
        orchestrator
            .set_defaults(&DefaultsUpdate {
                template: Some(VmRef::from("fedora-23")),
                kernel: Some(VmRef::from("4.4.14-11")),
                ..Default::default()
            })
            .unwrap();
        let registry = store.snapshot();
        assert_eq!(registry.default_template(), registry.by_name("fedora-23").map(|vm| vm.qid));
        assert_eq!(registry.default_kernel(), Some("4.4.14-11"));

        let err = orchestrator
            .set_defaults(&DefaultsUpdate {
                netvm: Some(VmRef::from("fedora-23")),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Registry(RegistryError::WrongCapability { .. })));

        let err = orchestrator
            .set_defaults(&DefaultsUpdate {
                kernel: Some(VmRef::from("2.6.32")),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::KernelNotFound(_))));
    }

    #[test]
    fn test_running_flag_refreshed_from_backend() {
        let (orchestrator, store, backend) = orchestrator();
        orchestrator
            .apply(&VmRequest::present("fedora-23", VmKind::TemplateVm, "black"))
            .unwrap();
        let qid = store.snapshot().by_name("fedora-23").unwrap().qid;
        backend.start(qid).unwrap();

        assert!(orchestrator.apply(&VmRequest::absent("fedora-23")).unwrap().changed);
        assert!(backend.journal().contains(&"force_shutdown:fedora-23".to_string()));
        assert!(store.snapshot().is_empty());
    }
}
