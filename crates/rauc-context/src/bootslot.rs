//! Booted slot detection.
//!
//! The slot the system booted from is derived from the kernel command line.
//! Rules are tried in order and the first match wins:
//!
//! 1. `rauc.external` marks a boot from outside any slot
//! 2. `rauc.slot=<name>` names the slot explicitly
//! 3. `bootstate.active=` / `bootchooser.active=` (barebox only)
//! 4. `root=` or, failing that, `systemd.verity_root_data=`
//!
//! Values of rule 4 are mapped to `/dev/disk/by-*` paths when they use a
//! `PARTLABEL=`, `PARTUUID=` or `UUID=` specifier and are then resolved to
//! their canonical device path where possible.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::error::ContextError;

/// Boot slot reported when `rauc.external` is on the command line.
pub const EXTERNAL_BOOT_SLOT: &str = "_external_";

const EXTERNAL_TOKEN: &str = "rauc.external";
const SLOT_PREFIXES: &[&str] = &["rauc.slot="];
const BAREBOX_PREFIXES: &[&str] = &["bootstate.active=", "bootchooser.active="];
const ROOT_PREFIXES: &[&str] = &["root="];
const VERITY_ROOT_PREFIXES: &[&str] = &["systemd.verity_root_data="];

/// Device specifiers and the directory their symlinks live in.
const DEVICE_SPECIFIERS: &[(&str, &str)] = &[
    ("PARTLABEL=", "/dev/disk/by-partlabel"),
    ("PARTUUID=", "/dev/disk/by-partuuid"),
    ("UUID=", "/dev/disk/by-uuid"),
];

/// Where the kernel command line is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdlineSource {
    /// Read from a file (normally `/proc/cmdline`)
    File(PathBuf),
    /// Use the given text instead of reading anything
    Literal(String),
}

impl CmdlineSource {
    fn read(&self) -> Result<String, ContextError> {
        match self {
            Self::File(path) => std::fs::read(path)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .map_err(|e| {
                    ContextError::BootSlotResolution(format!(
                        "cannot read {}: {}",
                        path.display(),
                        e
                    ))
                }),
            Self::Literal(text) => Ok(text.clone()),
        }
    }
}

/// Determines the booted slot from the kernel command line.
#[derive(Debug, Clone)]
pub struct BootSlotResolver {
    source: CmdlineSource,
}

impl BootSlotResolver {
    pub fn new(source: CmdlineSource) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &CmdlineSource {
        &self.source
    }

    /// Resolve the booted slot, or `None` if it cannot be determined.
    ///
    /// Failing to read the command line is logged and treated as unknown.
    pub fn resolve(&self, bootloader: Option<&str>) -> Option<String> {
        match self.source.read() {
            Ok(cmdline) => boot_slot_from_cmdline(&cmdline, bootloader),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }
}

/// Apply the boot slot rules to command line text.
pub fn boot_slot_from_cmdline(cmdline: &str, bootloader: Option<&str>) -> Option<String> {
    if cmdline
        .split_whitespace()
        .any(|token| token.starts_with(EXTERNAL_TOKEN))
    {
        return Some(EXTERNAL_BOOT_SLOT.to_string());
    }

    if let Some(slot) = token_value(cmdline, SLOT_PREFIXES) {
        return Some(slot.to_string());
    }

    if bootloader == Some("barebox") {
        if let Some(slot) = token_value(cmdline, BAREBOX_PREFIXES) {
            return Some(slot.to_string());
        }
    }

    let root = token_value(cmdline, ROOT_PREFIXES)
        .or_else(|| token_value(cmdline, VERITY_ROOT_PREFIXES))?;

    Some(canonical_device(&device_path(root)))
}

/// Value of the first token starting with any of `prefixes`.
fn token_value<'a>(cmdline: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    cmdline.split_whitespace().find_map(|token| {
        prefixes
            .iter()
            .find_map(|prefix| token.strip_prefix(prefix))
            .filter(|value| !value.is_empty())
    })
}

/// Map `PARTLABEL=`/`PARTUUID=`/`UUID=` specifiers to device paths.
fn device_path(value: &str) -> String {
    DEVICE_SPECIFIERS
        .iter()
        .find_map(|(prefix, dir)| {
            value
                .strip_prefix(prefix)
                .map(|name| format!("{}/{}", dir, name))
        })
        .unwrap_or_else(|| value.to_string())
}

/// Follow symlinks to the real device; keep the input if that fails.
fn canonical_device(device: &str) -> String {
    match std::fs::canonicalize(device) {
        Ok(real) => {
            let real = real.to_string_lossy().into_owned();
            if real != device {
                debug!("Resolved bootname {} to {}", device, real);
            }
            real
        }
        Err(e) => {
            info!("Failed to resolve realpath for '{}': {}", device, e);
            device.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_external_wins_over_slot() {
        let cmdline = "console=ttyS0 rauc.slot=A rauc.external quiet";
        assert_eq!(
            boot_slot_from_cmdline(cmdline, None).as_deref(),
            Some("_external_")
        );
    }

    #[test]
    fn test_explicit_slot() {
        let cmdline = "console=ttyS0 root=/dev/mmcblk0p2 rauc.slot=system1";
        assert_eq!(
            boot_slot_from_cmdline(cmdline, Some("barebox")).as_deref(),
            Some("system1")
        );
    }

    #[test]
    fn test_barebox_bootstate() {
        let cmdline = "root=/dev/mmcblk0p2 bootstate.active=system0";
        assert_eq!(
            boot_slot_from_cmdline(cmdline, Some("barebox")).as_deref(),
            Some("system0")
        );

        let cmdline = "bootchooser.active=system1 root=/dev/mmcblk0p3";
        assert_eq!(
            boot_slot_from_cmdline(cmdline, Some("barebox")).as_deref(),
            Some("system1")
        );
    }

    #[test]
    fn test_bootstate_ignored_for_other_bootloaders() {
        let cmdline = "bootstate.active=system0 root=/nonexistent/rootdev";
        assert_eq!(
            boot_slot_from_cmdline(cmdline, Some("grub")).as_deref(),
            Some("/nonexistent/rootdev")
        );
    }

    #[test]
    fn test_partuuid_without_symlink_is_unresolved() {
        assert_eq!(
            boot_slot_from_cmdline("root=PARTUUID=ABCD", None).as_deref(),
            Some("/dev/disk/by-partuuid/ABCD")
        );
    }

    #[test]
    fn test_device_specifiers() {
        assert_eq!(
            device_path("PARTLABEL=rootfs-a"),
            "/dev/disk/by-partlabel/rootfs-a"
        );
        assert_eq!(device_path("UUID=1234-5678"), "/dev/disk/by-uuid/1234-5678");
        assert_eq!(device_path("/dev/sda2"), "/dev/sda2");
        assert_eq!(device_path("ubi0:rootfs"), "ubi0:rootfs");
    }

    #[test]
    fn test_verity_root_fallback() {
        let cmdline = "quiet systemd.verity_root_data=PARTLABEL=verity-b";
        assert_eq!(
            boot_slot_from_cmdline(cmdline, None).as_deref(),
            Some("/dev/disk/by-partlabel/verity-b")
        );
    }

    #[test]
    fn test_root_preferred_over_verity_root() {
        let cmdline = "systemd.verity_root_data=/nonexistent/b root=/nonexistent/a";
        assert_eq!(
            boot_slot_from_cmdline(cmdline, None).as_deref(),
            Some("/nonexistent/a")
        );
    }

    #[test]
    fn test_no_match() {
        assert_eq!(boot_slot_from_cmdline("console=ttyS0 quiet", None), None);
        assert_eq!(boot_slot_from_cmdline("", Some("barebox")), None);
    }

    #[test]
    fn test_empty_values_are_skipped() {
        assert_eq!(boot_slot_from_cmdline("rauc.slot= quiet", None), None);
        assert_eq!(
            boot_slot_from_cmdline("rauc.slot= rauc.slot=B", None).as_deref(),
            Some("B")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_is_resolved() {
        let temp_dir = TempDir::new().unwrap();
        let device = temp_dir.path().join("mmcblk0p2");
        std::fs::write(&device, b"").unwrap();
        let link = temp_dir.path().join("rootfs-a");
        std::os::unix::fs::symlink(&device, &link).unwrap();

        let cmdline = format!("root={}", link.display());
        let expected = std::fs::canonicalize(&device).unwrap();
        assert_eq!(
            boot_slot_from_cmdline(&cmdline, None),
            Some(expected.to_string_lossy().into_owned())
        );
    }

    #[test]
    fn test_resolver_reads_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cmdline");
        std::fs::write(&path, "console=ttyS0 rauc.slot=recovery\n").unwrap();

        let resolver = BootSlotResolver::new(CmdlineSource::File(path));
        assert_eq!(resolver.resolve(None).as_deref(), Some("recovery"));
    }

    #[test]
    fn test_resolver_tolerates_invalid_utf8() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cmdline");
        std::fs::write(&path, b"console=ttyS0 label=\xff rauc.slot=A\n").unwrap();

        let resolver = BootSlotResolver::new(CmdlineSource::File(path));
        assert_eq!(resolver.resolve(None).as_deref(), Some("A"));
    }

    #[test]
    fn test_resolver_unreadable_cmdline() {
        let temp_dir = TempDir::new().unwrap();
        let resolver =
            BootSlotResolver::new(CmdlineSource::File(temp_dir.path().join("missing")));
        assert_eq!(resolver.resolve(None), None);
    }
}
