//! # qubesctl Hypervisor
//!
//! VM-management layer used by the convergence engine.
//!
//! The engine talks to a [`VmManager`]; the crate ships two backends:
//! - **LocalBackend** - one directory per VM under a storage root
//! - **MockBackend** - in memory, with failure injection for tests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │             VmManager Trait             │
//! │ (create, provision_disk, set_property,  │
//! │  force_shutdown, remove_from_disk)      │
//! └─────────────────────┬───────────────────┘
//!                       │
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │   LocalBackend    │     │    MockBackend    │
//! │ (storage root)    │     │    (in memory)    │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use qubesctl_hypervisor::{Label, MockBackend, NewVm, VmKind, VmManager, VmProperties};
//!
//! let backend = MockBackend::new();
//! let vm = NewVm {
//!     qid: 1,
//!     name: "work".to_string(),
//!     kind: VmKind::AppVm,
//!     pool: "default".to_string(),
//!     properties: VmProperties::defaults_for(VmKind::AppVm, Label::Blue),
//! };
//! let record = backend.create(&vm).unwrap();
//! backend.provision_disk(&record, None).unwrap();
//! ```

pub mod error;
pub mod local;
pub mod mock;
pub mod traits;
pub mod types;

pub use error::HypervisorError;
pub use local::{LocalBackend, DEFAULT_PRIVATE_SIZE_MIB, DEFAULT_STORAGE_PATH};
pub use mock::{MockBackend, MockOperation};
pub use traits::VmManager;
pub use types::*;
