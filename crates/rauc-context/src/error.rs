//! Error types for the update context.
//!
//! Two families live here. Environmental failures (missing files, broken
//! handlers) are ordinary [`ContextError`] variants and are recoverable at
//! the granularity documented on each one. Programming-contract breaches
//! are collected in [`ContractViolation`]; they mean the context is in an
//! inconsistent state and callers must not retry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Errors that can occur while configuring or driving the context.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Configuration file exists but could not be read or parsed
    #[error("failed to load system config ({path}): {reason}")]
    ConfigLoad { path: PathBuf, reason: String },

    /// Configuration file does not exist
    #[error("system config {path} not found")]
    ConfigMissing { path: PathBuf },

    /// System-info handler could not be started
    #[error("failed to spawn system-info handler {handler}: {source}")]
    HandlerSpawn {
        handler: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// System-info handler terminated unsuccessfully.
    ///
    /// `harvested` holds every variable parsed before the handler exited.
    #[error("system-info handler {handler} failed: {status}")]
    HandlerExit {
        handler: PathBuf,
        status: ExitStatus,
        harvested: HashMap<String, String>,
    },

    /// Reading the handler output failed
    #[error("failed to read output of system-info handler {handler}: {source}")]
    HandlerIo {
        handler: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// System variant could not be read (non-fatal)
    #[error("failed to read system variant from {path}: {source}")]
    VariantRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Booted slot could not be determined (non-fatal)
    #[error("failed to determine booted slot: {0}")]
    BootSlotResolution(String),

    /// Network or signature subsystem failed to initialize
    #[error("failed to initialize {subsystem}: {reason}")]
    SubsystemInit {
        subsystem: &'static str,
        reason: String,
    },

    /// Lazy reconfiguration failed; no valid context exists
    #[error("failed to initialize context: {0}")]
    ContextInit(#[source] Box<ContextError>),

    /// Caller broke the context contract
    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ContextError {
    /// Whether the error leaves the context unusable.
    ///
    /// Callers are expected to log and terminate on these instead of
    /// retrying the operation.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Contract(_) | Self::ContextInit(_))
    }
}

/// Breaches of the context's usage contract.
///
/// Each of these indicates a caller bug (mis-nested steps, double
/// registration, toggling busy to its current value) rather than an
/// unavailable input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    /// `end_step` or `set_step_percentage` named a step that is not on top
    #[error("step nesting wrong: expected '{expected}', got '{actual}'")]
    StepMismatch { expected: String, actual: String },

    /// A parent step has no substep budget left for another child
    #[error("step nesting wrong: {parent} contains {child} exceeding step limit ({attempted}/{total})")]
    StepLimitExceeded {
        parent: String,
        child: String,
        attempted: u32,
        total: u32,
    },

    /// A child would represent a larger share than its parent
    #[error("step {child} would exceed the share of its parent {parent}")]
    StepShareExceeded { parent: String, child: String },

    #[error("too many substeps: {name} ({done}/{total})")]
    TooManySubsteps { name: String, done: u32, total: u32 },

    #[error("not enough substeps: {name} ({done}/{total})")]
    NotEnoughSubsteps { name: String, done: u32, total: u32 },

    /// Substep counting and explicit percentages are mutually exclusive
    #[error("step {name} has {substeps} substeps and cannot take an explicit percentage")]
    ExplicitPercentageWithSubsteps { name: String, substeps: u32 },

    #[error("percentage {percent} for step {name} is outside 0..=100")]
    PercentageOutOfRange { name: String, percent: i32 },

    #[error("percentage for step {name} decreased from {last} to {percent}")]
    PercentageDecreased { name: String, last: i32, percent: i32 },

    /// The accumulated progress went above 100
    #[error("accumulated progress {0} exceeds 100")]
    ProgressOverflow(i32),

    #[error("no progress step is active")]
    EmptyProgressStack,

    #[error("progress observer already registered")]
    ObserverAlreadyRegistered,

    #[error("context busy flag is already {0}")]
    BusyUnchanged(bool),

    #[error("context cannot be reconfigured while busy")]
    ReconfigureWhileBusy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_errors_are_unrecoverable() {
        let err: ContextError = ContractViolation::BusyUnchanged(true).into();
        assert!(err.is_unrecoverable());

        let err = ContextError::ContextInit(Box::new(ContextError::ConfigMissing {
            path: PathBuf::from("/etc/rauc/system.conf"),
        }));
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn test_environmental_errors_are_recoverable() {
        let err = ContextError::ConfigMissing {
            path: PathBuf::from("/etc/rauc/system.conf"),
        };
        assert!(!err.is_unrecoverable());
        assert_eq!(err.to_string(), "system config /etc/rauc/system.conf not found");
    }

    #[test]
    fn test_step_limit_message() {
        let violation = ContractViolation::StepLimitExceeded {
            parent: "install".to_string(),
            child: "copy".to_string(),
            attempted: 3,
            total: 2,
        };
        assert_eq!(
            violation.to_string(),
            "step nesting wrong: install contains copy exceeding step limit (3/2)"
        );
    }
}
