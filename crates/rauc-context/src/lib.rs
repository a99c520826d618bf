//! # rauc-context
//!
//! Process-wide context of an update controller.
//!
//! This crate handles:
//! - Lazy resolution of the system configuration (file, dtb or file
//!   variant, system-info handler)
//! - Detection of the booted slot from the kernel command line
//! - Busy/pending arbitration between running operations and reconfiguration
//! - Weighted, nested progress reporting to a single observer
//!
//! ## Contracts
//!
//! Misuse of the context (mis-nested progress steps, toggling busy to its
//! current value, reconfiguring while busy) is reported as
//! [`ContractViolation`]. Such errors are unrecoverable; see
//! [`ContextError::is_unrecoverable`].

pub mod bootslot;
pub mod config;
pub mod context;
pub mod error;
pub mod progress;
#[cfg(test)]
mod proptests;
pub mod resolver;
pub mod sysinfo;

// Re-export main types for convenience
pub use bootslot::{boot_slot_from_cmdline, BootSlotResolver, CmdlineSource, EXTERNAL_BOOT_SLOT};
pub use config::{
    ConfigLoader, ConfigMode, SystemConfig, SystemPaths, TomlConfigLoader, VariantSource,
};
pub use context::{
    Context, ContextBuilder, ContextOverrides, ContextView, InstallInfo, NoopSubsystems,
    SharedContext, Subsystems,
};
pub use error::{ContextError, ContractViolation};
pub use progress::{ProgressCallback, ProgressStep, ProgressTracker, ProgressUpdate};
pub use resolver::{ConfigResolver, Resolution};
pub use sysinfo::SystemInfoHarvester;
