//! # qubesctl Engine
//!
//! Declarative qube reconciliation. A [`VmRequest`] says what a qube should
//! look like; the engine works out what that means on this host and applies
//! only the difference.
//!
//! ## Flow
//!
//! ```text
//! Orchestrator::apply
//!   ├─ RegistryStore::lock_exclusive + load
//!   ├─ refresh is_running from the VmManager
//!   ├─ present: options::resolve ─► converge::converge
//!   ├─ absent:  teardown::run (plan_removal + commit)
//!   └─ RegistryStore::save (only when something changed)
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use qubesctl_engine::{MemoryRegistryStore, Orchestrator, VmRequest};
//! use qubesctl_hypervisor::{MockBackend, VmKind};
//! use qubesctl_telemetry::StaticHostFacts;
//!
//! let orchestrator = Orchestrator::new(
//!     Arc::new(MemoryRegistryStore::new()),
//!     Arc::new(MockBackend::new()),
//!     Arc::new(StaticHostFacts::new(8192, 4)),
//! );
//! let outcome = orchestrator
//!     .apply(&VmRequest::present("win7", VmKind::Hvm, "orange"))
//!     .unwrap();
//! assert!(outcome.changed);
//! ```

pub mod capability;
pub mod converge;
pub mod dump;
pub mod error;
pub mod options;
pub mod orchestrator;
pub mod registry;
pub mod request;
pub mod store;
pub mod teardown;

pub use capability::{Capabilities, KindCapabilities};
pub use converge::{converge, ConvergeOutcome};
pub use dump::{dump_registry, QubesDocument};
pub use error::{
    ConvergeError, EngineError, RegistryError, Result, TeardownError, ValidationError,
};
pub use options::{resolve, ResolvedOptions};
pub use orchestrator::{ApplyOutcome, DefaultsUpdate, Orchestrator};
pub use registry::{Registry, DEFAULT_POOL};
pub use request::{DesiredState, TimezoneSpec, VmRef, VmRequest};
pub use store::{
    FileRegistryStore, MemoryRegistryStore, RegistryLock, RegistryStore, DEFAULT_LOCK_TIMEOUT_MS,
};
pub use teardown::{plan_removal, TeardownPlan};
