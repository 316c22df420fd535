//! Device root discovery
//!
//! Finds the directory holding the usbfs device tree: first the configured
//! well-known locations, then any mount of the filesystem listed in the mount
//! table, and finally a private mount if allowed.

use crate::error::{Error, Result};
use common::config::{RootCandidate, RootCheck, UsbfsSettings};
use nix::mount::{MsFlags, mount};
use nix::sys::statfs::{FsType, USBDEVICE_SUPER_MAGIC, statfs};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A filesystem that exposes USB devices as files
#[derive(Debug, Clone, Copy)]
pub struct FileSystemKind {
    /// Type passed to mount(2)
    pub name: &'static str,
    /// Type names it may appear under in the mount table
    pub aliases: &'static [&'static str],
    /// statfs magic, when the kernel defines one
    pub magic: Option<FsType>,
}

/// The usbfs device filesystem
pub const USBFS: FileSystemKind = FileSystemKind {
    name: "usbfs",
    aliases: &["usbfs", "usbdevfs"],
    magic: Some(USBDEVICE_SUPER_MAGIC),
};

/// Locate the device root for `kind`
///
/// Returns `None` when there is none; that only means no devices of this
/// kind are available.
pub fn locate_device_root(kind: &FileSystemKind, settings: &UsbfsSettings) -> Option<PathBuf> {
    for candidate in &settings.roots {
        if verify_candidate(kind, candidate) {
            info!("USB device root: {}", candidate.path.display());
            return Some(candidate.path.clone());
        }
        debug!("USB device root candidate rejected: {}", candidate.path.display());
    }

    if let Some(path) = find_mount_point(&settings.mounts_file, kind.aliases) {
        info!("USB device root (mounted): {}", path.display());
        return Some(path);
    }

    if settings.allow_mount {
        match mount_private(kind, &settings.mount_point) {
            Ok(path) => {
                info!("USB device root (private mount): {}", path.display());
                return Some(path);
            }
            Err(e) => debug!("Cannot mount {} at {}: {}", kind.name, settings.mount_point.display(), e),
        }
    }

    debug!("No {} device root found", kind.name);
    None
}

/// Like [`locate_device_root`] but as an error
pub fn require_device_root(kind: &FileSystemKind, settings: &UsbfsSettings) -> Result<PathBuf> {
    locate_device_root(kind, settings).ok_or(Error::NoDeviceRoot)
}

fn verify_candidate(kind: &FileSystemKind, candidate: &RootCandidate) -> bool {
    match candidate.check {
        RootCheck::Directory => candidate.path.is_dir(),
        RootCheck::UsbfsMagic => kind.magic.is_some_and(|magic| {
            statfs(candidate.path.as_path())
                .map(|stat| stat.filesystem_type() == magic)
                .unwrap_or(false)
        }),
    }
}

/// Search a mount table (`/proc/mounts` format) for a mount of one of
/// `types`
pub fn find_mount_point(mounts_file: &Path, types: &[&str]) -> Option<PathBuf> {
    let table = match fs::read_to_string(mounts_file) {
        Ok(table) => table,
        Err(e) => {
            debug!("Cannot read mount table {}: {}", mounts_file.display(), e);
            return None;
        }
    };

    table.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let _source = fields.next()?;
        let target = fields.next()?;
        let fs_type = fields.next()?;
        if !types.contains(&fs_type) {
            return None;
        }
        let path = PathBuf::from(unescape_mount_field(target));
        path.is_dir().then_some(path)
    })
}

/// Undo the octal escapes (`\040` and friends) used in mount tables
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn mount_private(kind: &FileSystemKind, mount_point: &Path) -> Result<PathBuf> {
    fs::create_dir_all(mount_point)?;
    mount(
        Some(kind.name),
        mount_point,
        Some(kind.name),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| Error::os("mount", e))?;
    Ok(mount_point.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::create_mounts_file;

    fn settings(roots: Vec<RootCandidate>, mounts_file: PathBuf) -> UsbfsSettings {
        UsbfsSettings {
            roots,
            mounts_file,
            allow_mount: false,
            ..UsbfsSettings::default()
        }
    }

    #[test]
    fn test_first_valid_candidate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("bus");
        fs::create_dir_all(&root).unwrap();

        let settings = settings(
            vec![
                RootCandidate {
                    path: dir.path().join("missing"),
                    check: RootCheck::Directory,
                },
                RootCandidate {
                    path: root.clone(),
                    check: RootCheck::Directory,
                },
            ],
            dir.path().join("mounts"),
        );
        assert_eq!(locate_device_root(&USBFS, &settings), Some(root));
    }

    #[test]
    fn test_magic_check_rejects_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(
            vec![RootCandidate {
                path: dir.path().to_path_buf(),
                check: RootCheck::UsbfsMagic,
            }],
            dir.path().join("mounts"),
        );
        assert_eq!(locate_device_root(&USBFS, &settings), None);
        assert!(matches!(
            require_device_root(&USBFS, &settings),
            Err(Error::NoDeviceRoot)
        ));
    }

    #[test]
    fn test_mount_table_search() {
        let dir = tempfile::tempdir().unwrap();
        let usb = dir.path().join("usb devices");
        fs::create_dir_all(&usb).unwrap();
        let mounts = dir.path().join("mounts");
        create_mounts_file(
            &mounts,
            &[
                ("proc", Path::new("/proc"), "proc"),
                ("none", &usb, "usbdevfs"),
            ],
        )
        .unwrap();

        let settings = settings(Vec::new(), mounts);
        assert_eq!(locate_device_root(&USBFS, &settings), Some(usb));
    }

    #[test]
    fn test_unescape_mount_field() {
        assert_eq!(unescape_mount_field("/a\\040b"), "/a b");
        assert_eq!(unescape_mount_field("/plain"), "/plain");
        assert_eq!(unescape_mount_field("/trail\\04"), "/trail\\04");
    }
}
