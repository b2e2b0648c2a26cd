//! Staging and swap helpers shared by pack and unpack.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Suffix of the directory an unpack stages into.
pub const UNPACK_SUFFIX: &str = "._part";
/// Suffix of the file a pack stages into.
pub const PACK_SUFFIX: &str = ".part";
/// Suffix the original is renamed to while the staged copy moves in.
pub const BACKUP_SUFFIX: &str = "._prev";

/// `path` with `suffix` appended to its final component. Trailing
/// separators and `.` components are dropped first.
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let normalized: PathBuf = path.components().collect();
    let mut name = normalized.into_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Make sure nothing exists at `path`, clearing read-only attributes on the
/// way down.
pub fn destroy(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            destroy(&entry?.path())?;
        }
        make_writable(path, &meta)?;
        fs::remove_dir(path)?;
    } else {
        make_writable(path, &meta)?;
        fs::remove_file(path)?;
    }

    if fs::symlink_metadata(path).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{} is not empty", path.display()),
        ));
    }
    Ok(())
}

fn make_writable(path: &Path, meta: &fs::Metadata) -> io::Result<()> {
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    let mut perms = meta.permissions();
    if perms.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

// ── Staging guard ────────────────────────────────────────────────────────────

/// Owns a temporary artifact and removes it on drop unless it was moved into
/// place.
#[derive(Debug)]
pub struct Staging {
    path:  PathBuf,
    armed: bool,
}

impl Staging {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the staged artifact over `target` (see [`swap_into_place`]).
    pub fn commit(mut self, target: &Path) -> io::Result<()> {
        swap_into_place(&self.path, target)?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = destroy(&self.path) {
            warn!(path = %self.path.display(), error = %e, "could not remove staging artifact");
        }
    }
}

// ── Swap ─────────────────────────────────────────────────────────────────────

/// Replace `target` with `staged`: rename the original to a backup, move the
/// staged copy in, then delete the backup.
///
/// If the second rename fails the backup is renamed back. Failing to delete
/// the backup afterwards is only logged; the replacement is already in place.
pub fn swap_into_place(staged: &Path, target: &Path) -> io::Result<()> {
    let backup = sibling(target, BACKUP_SUFFIX);
    if fs::symlink_metadata(&backup).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("remove {} first", backup.display()),
        ));
    }

    fs::rename(target, &backup)?;
    if let Err(e) = fs::rename(staged, target) {
        if let Err(restore) = fs::rename(&backup, target) {
            warn!(
                backup = %backup.display(),
                error = %restore,
                "could not restore original after failed swap"
            );
        }
        return Err(e);
    }

    if let Err(e) = destroy(&backup) {
        warn!(backup = %backup.display(), error = %e, "could not remove backup");
    }
    Ok(())
}
