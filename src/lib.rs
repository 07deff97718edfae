//! Cross-architecture RPM build orchestration.
//!
//! Packages are built inside disposable QEMU guests, one per target
//! architecture, then signed and published into repositories kept in the
//! annex. Upstream repositories can be mirrored locally so guests build
//! against a stable package set.
//!
//! # Architecture
//!
//! ```text
//! rpm-forge
//!     │
//!     ├── coordinator   per-arch planning, bounded parallel builds
//!     │     └── vm      overlay disk, cloud-init seed, QEMU, SSH, teardown
//!     ├── testsuite     package tests inside a guest, JUnit reports
//!     ├── sync          dnf / lftp / epel mirroring with manifests
//!     ├── publish       rpmsign, createrepo, atomic generation swap
//!     └── config        project.toml + local.toml + per-arch overrides
//! ```
//!
//! Every external tool runs through [`process::ToolRunner`], so the whole
//! pipeline can be driven by a fake runner in tests.

pub mod annex;
pub mod arch;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod preflight;
pub mod process;
pub mod publish;
pub mod runs;
pub mod sync;
pub mod testsuite;
pub mod vm;

pub use config::BuildConfig;
pub use coordinator::{BuildResult, Coordinator, FailurePolicy};
pub use error::{ForgeError, ForgeResult, TimeoutPhase};
pub use publish::{PublishResult, Publisher};
pub use sync::{SyncReport, Synchronizer};
pub use vm::VmManager;
