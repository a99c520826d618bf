//! System configuration consumed by the context.
//!
//! The context only needs a handful of resolved fields from the system
//! configuration. The on-disk grammar sits behind the [`ConfigLoader`]
//! trait; [`TomlConfigLoader`] is the default implementation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ContextError;

/// Default location of the system configuration.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rauc/system.conf";
/// Kernel command line of the running system.
pub const PROC_CMDLINE_PATH: &str = "/proc/cmdline";
/// Compatible string of the firmware device tree.
pub const DTB_COMPATIBLE_PATH: &str = "/sys/firmware/devicetree/base/compatible";
/// Default prefix under which slots and bundles are mounted.
pub const DEFAULT_MOUNT_PREFIX: &str = "/mnt/rauc";

/// Where the system variant comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantSource {
    /// Variant is given verbatim (or not at all)
    #[default]
    None,
    /// Variant is the device tree compatible string
    Dtb,
    /// Variant is read from a file named by `system_variant`
    File,
}

/// How the configuration file is treated during reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigMode {
    /// Do not load anything, use defaults
    None,
    /// Load the file if present, fall back to defaults if it is absent
    #[default]
    Auto,
    /// Loading the file must succeed
    Required,
}

/// Resolved system configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemConfig {
    /// Compatible string identifying the update stream
    pub compatible: Option<String>,
    /// Bootloader name (e.g. "barebox", "grub", "uboot")
    pub bootloader: Option<String>,
    /// Source kind of the system variant
    pub variant_source: VariantSource,
    /// Variant value, or the variant file path for [`VariantSource::File`]
    pub system_variant: Option<String>,
    /// Program queried for system information
    pub systeminfo_handler: Option<PathBuf>,
    /// Mount prefix
    pub mount_prefix: PathBuf,
    /// Keyring file for signature verification
    pub keyring_path: Option<PathBuf>,
    /// Keyring directory for signature verification
    pub keyring_directory: Option<PathBuf>,
    /// Persistent data directory
    pub data_directory: Option<PathBuf>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            compatible: None,
            bootloader: None,
            variant_source: VariantSource::None,
            system_variant: None,
            systeminfo_handler: None,
            mount_prefix: PathBuf::from(DEFAULT_MOUNT_PREFIX),
            keyring_path: None,
            keyring_directory: None,
            data_directory: None,
        }
    }
}

/// Loads a [`SystemConfig`] from a path.
///
/// Implementations must report an absent file as
/// [`ContextError::ConfigMissing`] and every other failure as
/// [`ContextError::ConfigLoad`]; the resolver relies on that distinction.
pub trait ConfigLoader: Send {
    fn load(&self, path: &Path) -> Result<SystemConfig, ContextError>;
}

/// Loader for TOML system configuration files.
///
/// ```toml
/// [system]
/// compatible = "acme-board"
/// bootloader = "barebox"
/// mountprefix = "/run/rauc"
/// variant-file = "/etc/variant"
///
/// [handlers]
/// system-info = "/usr/lib/rauc/system-info"
///
/// [keyring]
/// path = "/etc/rauc/keyring.pem"
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TomlConfigLoader;

impl TomlConfigLoader {
    pub fn new() -> Self {
        Self
    }

    /// Parse configuration text; `path` is only used for error reporting.
    pub fn parse(&self, content: &str, path: &Path) -> Result<SystemConfig, ContextError> {
        let raw: RawConfig = toml::from_str(content).map_err(|e| ContextError::ConfigLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        raw.into_config(path)
    }
}

impl ConfigLoader for TomlConfigLoader {
    fn load(&self, path: &Path) -> Result<SystemConfig, ContextError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ContextError::ConfigMissing {
                    path: path.to_path_buf(),
                }
            } else {
                ContextError::ConfigLoad {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
            }
        })?;
        self.parse(&content, path)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    system: RawSystem,
    #[serde(default)]
    handlers: RawHandlers,
    #[serde(default)]
    keyring: RawKeyring,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawSystem {
    compatible: Option<String>,
    bootloader: Option<String>,
    #[serde(rename = "mountprefix")]
    mount_prefix: Option<PathBuf>,
    #[serde(default)]
    variant_dtb: bool,
    variant_file: Option<PathBuf>,
    variant_name: Option<String>,
    data_directory: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawHandlers {
    system_info: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawKeyring {
    path: Option<PathBuf>,
    directory: Option<PathBuf>,
}

impl RawConfig {
    fn into_config(self, path: &Path) -> Result<SystemConfig, ContextError> {
        let system = self.system;

        let (variant_source, system_variant) =
            match (system.variant_dtb, system.variant_file, system.variant_name) {
                (false, None, None) => (VariantSource::None, None),
                (true, None, None) => (VariantSource::Dtb, None),
                (false, Some(file), None) => {
                    (VariantSource::File, Some(file.to_string_lossy().into_owned()))
                }
                (false, None, Some(name)) => (VariantSource::None, Some(name)),
                _ => {
                    return Err(ContextError::ConfigLoad {
                        path: path.to_path_buf(),
                        reason: "only one of variant-dtb, variant-file and variant-name may be set"
                            .to_string(),
                    })
                }
            };

        Ok(SystemConfig {
            compatible: system.compatible,
            bootloader: system.bootloader,
            variant_source,
            system_variant,
            systeminfo_handler: self.handlers.system_info,
            mount_prefix: system
                .mount_prefix
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MOUNT_PREFIX)),
            keyring_path: self.keyring.path,
            keyring_directory: self.keyring.directory,
            data_directory: system.data_directory,
        })
    }
}

/// Fixed system locations read during reconfiguration.
///
/// Production code uses [`SystemPaths::default`]; tests point these at
/// temporary files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemPaths {
    /// Configuration file used when no explicit path is given
    pub default_config: PathBuf,
    /// Kernel command line
    pub proc_cmdline: PathBuf,
    /// Device tree compatible string
    pub dtb_compatible: PathBuf,
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            default_config: PathBuf::from(DEFAULT_CONFIG_PATH),
            proc_cmdline: PathBuf::from(PROC_CMDLINE_PATH),
            dtb_compatible: PathBuf::from(DTB_COMPATIBLE_PATH),
        }
    }
}
