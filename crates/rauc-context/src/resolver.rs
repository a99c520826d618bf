//! Configuration resolution.
//!
//! Turns the context overrides, the system configuration file and a few
//! system sources (device tree, variant file, system-info handler, kernel
//! command line) into one resolved configuration. Only the handler and the
//! configuration file itself can fail resolution; the other sources degrade
//! to "unknown" with a warning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::bootslot::{BootSlotResolver, CmdlineSource};
use crate::config::{ConfigLoader, ConfigMode, SystemConfig, SystemPaths, VariantSource};
use crate::context::ContextOverrides;
use crate::error::ContextError;
use crate::sysinfo::{SystemInfoHarvester, SYSTEM_SERIAL_VAR, SYSTEM_VARIANT_VAR};

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub config: SystemConfig,
    /// Configuration file that was loaded, if any
    pub loaded_from: Option<PathBuf>,
    /// Serial reported by the system-info handler
    pub system_serial: Option<String>,
    pub boot_slot: Option<String>,
}

/// Resolves the system configuration for a context.
pub struct ConfigResolver<'a> {
    loader: &'a dyn ConfigLoader,
    paths: &'a SystemPaths,
    cmdline: &'a CmdlineSource,
}

impl<'a> ConfigResolver<'a> {
    pub fn new(
        loader: &'a dyn ConfigLoader,
        paths: &'a SystemPaths,
        cmdline: &'a CmdlineSource,
    ) -> Self {
        Self {
            loader,
            paths,
            cmdline,
        }
    }

    /// Run a full resolution pass.
    ///
    /// `known_boot_slot` is the override or the slot found by an earlier
    /// pass; the command line is only consulted when it is `None`.
    pub fn resolve(
        &self,
        overrides: &ContextOverrides,
        known_boot_slot: Option<&str>,
    ) -> Result<Resolution, ContextError> {
        let (mode, path) = match &overrides.config_path {
            Some(path) => (ConfigMode::Required, path.clone()),
            None => (overrides.config_mode, self.paths.default_config.clone()),
        };

        let (mut config, loaded_from) = self.load(mode, &path)?;

        match config.variant_source {
            VariantSource::Dtb => {
                config.system_variant = match read_dtb_compatible(&self.paths.dtb_compatible) {
                    Ok(compatible) => Some(compatible),
                    Err(e) => {
                        warn!("Failed to read dtb compatible: {}", e);
                        None
                    }
                };
            }
            VariantSource::File => {
                let file = config.system_variant.take().map(PathBuf::from);
                config.system_variant = match file.as_deref().map(read_variant_file) {
                    Some(Ok(variant)) => Some(variant),
                    Some(Err(e)) => {
                        warn!("Failed to read system variant from file: {}", e);
                        None
                    }
                    None => {
                        warn!("System variant file not configured");
                        None
                    }
                };
            }
            VariantSource::None => {}
        }

        let mut system_serial = None;
        if let Some(handler) = config.systeminfo_handler.clone().filter(|h| h.exists()) {
            info!("Getting Systeminfo: {}", handler.display());
            let vars = SystemInfoHarvester::new(handler).harvest(&HashMap::new())?;

            for (key, value) in vars {
                match key.as_str() {
                    SYSTEM_SERIAL_VAR => system_serial = Some(value),
                    SYSTEM_VARIANT_VAR => config.system_variant = Some(value),
                    _ => info!("Ignoring unknown variable {}", key),
                }
            }
        }

        if let Some(variant) = &config.system_variant {
            if variant.trim() != variant {
                warn!(
                    "Ignoring surrounding whitespace in system variant: {}",
                    variant
                );
            }
        }

        let boot_slot = match known_boot_slot {
            Some(slot) => Some(slot.to_string()),
            None => BootSlotResolver::new(self.cmdline.clone()).resolve(config.bootloader.as_deref()),
        };

        if let Some(prefix) = &overrides.mount_prefix {
            config.mount_prefix = prefix.clone();
        }
        if let Some(keyring) = &overrides.keyring_path {
            config.keyring_path = Some(keyring.clone());
        }
        if let Some(directory) = &overrides.keyring_directory {
            config.keyring_directory = Some(directory.clone());
        }

        Ok(Resolution {
            config,
            loaded_from,
            system_serial,
            boot_slot,
        })
    }

    fn load(
        &self,
        mode: ConfigMode,
        path: &Path,
    ) -> Result<(SystemConfig, Option<PathBuf>), ContextError> {
        match mode {
            ConfigMode::None => Ok((SystemConfig::default(), None)),
            ConfigMode::Auto => match self.loader.load(path) {
                Ok(config) => {
                    info!("valid {} found, using it", path.display());
                    Ok((config, Some(path.to_path_buf())))
                }
                Err(ContextError::ConfigMissing { .. }) => {
                    debug!("{} not found, using default configuration", path.display());
                    Ok((SystemConfig::default(), None))
                }
                Err(e) => Err(e),
            },
            ConfigMode::Required => {
                let config = self.loader.load(path)?;
                Ok((config, Some(path.to_path_buf())))
            }
        }
    }
}

/// Read the first entry of the device tree compatible list.
///
/// The file holds NUL-separated strings; everything after the first NUL is
/// ignored.
fn read_dtb_compatible(path: &Path) -> Result<String, ContextError> {
    let contents = std::fs::read(path).map_err(|source| ContextError::VariantRead {
        path: path.to_path_buf(),
        source,
    })?;
    let first = contents.split(|b| *b == 0).next().unwrap_or_default();
    Ok(String::from_utf8_lossy(first).into_owned())
}

/// Read a variant file, dropping a single trailing newline.
fn read_variant_file(path: &Path) -> Result<String, ContextError> {
    let mut contents = std::fs::read(path).map_err(|source| ContextError::VariantRead {
        path: path.to_path_buf(),
        source,
    })?;
    if contents.last() == Some(&b'\n') {
        contents.pop();
    }
    Ok(String::from_utf8_lossy(&contents).into_owned())
}
