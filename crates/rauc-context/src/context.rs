//! Update context - the control plane shared by all update operations.
//!
//! The Context combines the update components:
//! - ConfigResolver for lazily resolving the system configuration
//! - BootSlotResolver (through the resolver) for the booted slot
//! - ProgressTracker for reporting nested progress to an observer
//!
//! It arbitrates reconfiguration against running operations: the
//! configuration is resolved on first read or when an operation marks the
//! context busy, and never while it is busy.
//!
//! ```text
//!            build()           read()/set_busy(true)       set_busy(false)
//! Builder ──────────▶ Idle(pending) ───────────────▶ Busy ───────────────▶ Idle
//!                        ▲                                                  │
//!                        └──────────────────── conf() ◀─────────────────────┘
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, warn};

use crate::bootslot::CmdlineSource;
use crate::config::{ConfigLoader, ConfigMode, SystemConfig, SystemPaths, TomlConfigLoader};
use crate::error::{ContextError, ContractViolation};
use crate::progress::{ProgressTracker, ProgressUpdate};
use crate::resolver::ConfigResolver;

/// Values supplied by the caller instead of, or on top of, the system
/// configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextOverrides {
    /// Configuration file; forces [`ConfigMode::Required`] when set
    pub config_path: Option<PathBuf>,
    pub config_mode: ConfigMode,
    /// Signing certificate
    pub cert_path: Option<PathBuf>,
    /// Signing key
    pub key_path: Option<PathBuf>,
    /// Keyring used for verification
    pub keyring_path: Option<PathBuf>,
    pub keyring_directory: Option<PathBuf>,
    /// Keyring used to check signer certificates
    pub signing_keyring_path: Option<PathBuf>,
    /// Intermediate certificates added to signatures
    pub intermediate_paths: Vec<PathBuf>,
    pub mount_prefix: Option<PathBuf>,
    /// Booted slot, bypassing command line detection
    pub boot_slot: Option<String>,
    /// Extra arguments passed to slot handlers
    pub handler_extra: Option<String>,
    pub mksquashfs_args: Option<String>,
    pub casync_args: Option<String>,
}

/// State of a running installation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallInfo {
    /// Mount point of the bundle being installed
    pub mounted_bundle: Option<PathBuf>,
}

/// External subsystems initialized once per context.
pub trait Subsystems {
    /// Prepare the network stack used for remote bundles.
    fn init_network(&mut self) -> Result<(), String>;
    /// Prepare the signature verification backend.
    fn init_signature(&mut self) -> Result<(), String>;
}

/// Subsystems that need no initialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSubsystems;

impl Subsystems for NoopSubsystems {
    fn init_network(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn init_signature(&mut self) -> Result<(), String> {
        Ok(())
    }
}

/// Builder for [`Context`].
///
/// # Example
///
/// ```no_run
/// use rauc_context::Context;
///
/// let mut context = Context::builder()
///     .with_config_path("/etc/rauc/system.conf")
///     .with_mount_prefix("/run/rauc")
///     .build()?;
///
/// let view = context.read()?;
/// println!("booted from {:?}", view.boot_slot());
/// # Ok::<(), rauc_context::ContextError>(())
/// ```
pub struct ContextBuilder {
    overrides: ContextOverrides,
    paths: SystemPaths,
    cmdline: Option<String>,
    loader: Box<dyn ConfigLoader>,
    subsystems: Box<dyn Subsystems>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            overrides: ContextOverrides::default(),
            paths: SystemPaths::default(),
            cmdline: None,
            loader: Box::new(TomlConfigLoader::new()),
            subsystems: Box::new(NoopSubsystems),
        }
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all overrides at once.
    pub fn with_overrides(mut self, overrides: ContextOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.overrides.config_path = Some(path.into());
        self
    }

    pub fn with_config_mode(mut self, mode: ConfigMode) -> Self {
        self.overrides.config_mode = mode;
        self
    }

    pub fn with_mount_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.overrides.mount_prefix = Some(prefix.into());
        self
    }

    pub fn with_keyring_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.overrides.keyring_path = Some(path.into());
        self
    }

    pub fn with_keyring_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.overrides.keyring_directory = Some(path.into());
        self
    }

    pub fn with_boot_slot(mut self, slot: impl Into<String>) -> Self {
        self.overrides.boot_slot = Some(slot.into());
        self
    }

    pub fn with_handler_extra(mut self, args: impl Into<String>) -> Self {
        self.overrides.handler_extra = Some(args.into());
        self
    }

    /// Use `cmdline` instead of reading the kernel command line.
    pub fn with_cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.cmdline = Some(cmdline.into());
        self
    }

    pub fn with_system_paths(mut self, paths: SystemPaths) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_loader(mut self, loader: impl ConfigLoader + 'static) -> Self {
        self.loader = Box::new(loader);
        self
    }

    pub fn with_subsystems(mut self, subsystems: impl Subsystems + 'static) -> Self {
        self.subsystems = Box::new(subsystems);
        self
    }

    /// Initialize the external subsystems and create the context.
    ///
    /// The configuration is not resolved yet; that happens on first use.
    pub fn build(mut self) -> Result<Context, ContextError> {
        self.subsystems
            .init_network()
            .map_err(|reason| subsystem_error("network", reason))?;
        self.subsystems
            .init_signature()
            .map_err(|reason| subsystem_error("signature", reason))?;

        let cmdline = match self.cmdline {
            Some(text) => CmdlineSource::Literal(text),
            None => CmdlineSource::File(self.paths.proc_cmdline.clone()),
        };

        debug!("Context created");
        Ok(Context {
            config: SystemConfig::default(),
            busy: false,
            pending: true,
            progress: ProgressTracker::new(),
            boot_slot: self.overrides.boot_slot.clone(),
            system_serial: None,
            overrides: self.overrides,
            install_info: InstallInfo::default(),
            paths: self.paths,
            cmdline,
            loader: self.loader,
        })
    }
}

fn subsystem_error(subsystem: &'static str, reason: String) -> ContextError {
    warn!("{} initialization failed: {}", subsystem, reason);
    ContextError::SubsystemInit { subsystem, reason }
}

/// The update context.
///
/// Holds the resolved configuration, the busy/pending flags and the
/// progress stack. Not designed for concurrent use; wrap it in a
/// [`SharedContext`] when several threads need it.
pub struct Context {
    /// Only readable while `pending` is false
    config: SystemConfig,
    busy: bool,
    pending: bool,
    progress: ProgressTracker,
    boot_slot: Option<String>,
    system_serial: Option<String>,
    overrides: ContextOverrides,
    install_info: InstallInfo,
    paths: SystemPaths,
    cmdline: CmdlineSource,
    loader: Box<dyn ConfigLoader>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("busy", &self.busy)
            .field("pending", &self.pending)
            .field("progress", &self.progress)
            .field("boot_slot", &self.boot_slot)
            .field("system_serial", &self.system_serial)
            .field("overrides", &self.overrides)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Resolved view of the context, resolving the configuration first if
    /// it is pending.
    ///
    /// A failed resolution is returned as [`ContextError::ContextInit`],
    /// which is unrecoverable.
    pub fn read(&mut self) -> Result<ContextView<'_>, ContextError> {
        if self.pending {
            self.reconfigure().map_err(init_failed)?;
        }

        Ok(ContextView { context: self })
    }

    /// Change overrides. Marks the configuration pending.
    ///
    /// Rejected while the context is busy.
    pub fn conf<F>(&mut self, update: F) -> Result<(), ContextError>
    where
        F: FnOnce(&mut ContextOverrides),
    {
        if self.busy {
            return Err(contract(ContractViolation::ReconfigureWhileBusy));
        }

        let previous_slot = self.overrides.boot_slot.clone();
        update(&mut self.overrides);
        // A cleared override drops the cached slot so the command line is
        // consulted again.
        if self.overrides.boot_slot != previous_slot {
            self.boot_slot = self.overrides.boot_slot.clone();
        }
        self.pending = true;
        Ok(())
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Mark the start or end of an update operation.
    ///
    /// `busy` must differ from the current state. Becoming busy resolves a
    /// pending configuration first; a failure there is unrecoverable.
    pub fn set_busy(&mut self, busy: bool) -> Result<(), ContextError> {
        if self.busy == busy {
            return Err(contract(ContractViolation::BusyUnchanged(busy)));
        }

        if busy && self.pending {
            self.reconfigure().map_err(init_failed)?;
        }

        self.busy = busy;
        Ok(())
    }

    /// Resolve the configuration now.
    ///
    /// On failure the context stays pending, so the previous configuration
    /// is no longer readable.
    pub fn reconfigure(&mut self) -> Result<(), ContextError> {
        if self.busy {
            return Err(contract(ContractViolation::ReconfigureWhileBusy));
        }

        self.pending = true;

        let resolution = ConfigResolver::new(self.loader.as_ref(), &self.paths, &self.cmdline)
            .resolve(&self.overrides, self.boot_slot.as_deref())?;

        if self.overrides.config_path.is_none() {
            self.overrides.config_path = resolution.loaded_from;
        }
        if resolution.system_serial.is_some() {
            self.system_serial = resolution.system_serial;
        }
        self.boot_slot = resolution.boot_slot;
        self.config = resolution.config;
        self.pending = false;

        debug!("Context configured, booted slot {:?}", self.boot_slot);
        Ok(())
    }

    /// Register the progress observer. Only one may ever be registered.
    pub fn register_progress_observer<F>(&mut self, observer: F) -> Result<(), ContextError>
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        Ok(self.progress.register_observer(observer)?)
    }

    pub fn begin_step(
        &mut self,
        name: &str,
        description: impl Into<String>,
        substeps: u32,
    ) -> Result<(), ContextError> {
        Ok(self.progress.begin_step(name, description, substeps)?)
    }

    pub fn begin_step_fmt(
        &mut self,
        name: &str,
        substeps: u32,
        description: fmt::Arguments<'_>,
    ) -> Result<(), ContextError> {
        Ok(self.progress.begin_step_fmt(name, substeps, description)?)
    }

    pub fn end_step(&mut self, name: &str, success: bool) -> Result<(), ContextError> {
        Ok(self.progress.end_step(name, success)?)
    }

    pub fn set_step_percentage(&mut self, name: &str, percent: i32) -> Result<(), ContextError> {
        Ok(self.progress.set_step_percentage(name, percent)?)
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn overrides(&self) -> &ContextOverrides {
        &self.overrides
    }

    pub fn install_info(&self) -> &InstallInfo {
        &self.install_info
    }

    pub fn install_info_mut(&mut self) -> &mut InstallInfo {
        &mut self.install_info
    }
}

fn contract(violation: ContractViolation) -> ContextError {
    error!("Context contract violated: {}", violation);
    violation.into()
}

fn init_failed(err: ContextError) -> ContextError {
    error!("Failed to initialize context: {}", err);
    ContextError::ContextInit(Box::new(err))
}

/// Read-only view of a configured context.
#[derive(Debug, Clone, Copy)]
pub struct ContextView<'a> {
    context: &'a Context,
}

impl<'a> ContextView<'a> {
    pub fn config(&self) -> &'a SystemConfig {
        &self.context.config
    }

    pub fn boot_slot(&self) -> Option<&'a str> {
        self.context.boot_slot.as_deref()
    }

    pub fn system_serial(&self) -> Option<&'a str> {
        self.context.system_serial.as_deref()
    }

    /// Configuration file in use, if one was loaded or given.
    pub fn config_path(&self) -> Option<&'a Path> {
        self.context.overrides.config_path.as_deref()
    }

    pub fn overrides(&self) -> &'a ContextOverrides {
        &self.context.overrides
    }

    pub fn install_info(&self) -> &'a InstallInfo {
        &self.context.install_info
    }

    pub fn is_busy(&self) -> bool {
        self.context.busy
    }
}

/// A [`Context`] shared between threads.
///
/// Every operation runs under one lock, so configuration, flags and the
/// progress stack always change together.
#[derive(Debug, Clone)]
pub struct SharedContext {
    inner: Arc<Mutex<Context>>,
}

impl SharedContext {
    pub fn new(context: Context) -> Self {
        Self {
            inner: Arc::new(Mutex::new(context)),
        }
    }

    /// Lock the context for the duration of the guard.
    pub fn lock(&self) -> MutexGuard<'_, Context> {
        // Poisoning is ignored; broken nesting is caught by the contract checks.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` with exclusive access to the context.
    pub fn with<R>(&self, f: impl FnOnce(&mut Context) -> R) -> R {
        f(&mut self.lock())
    }
}
