// Copyright 2023, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Filesystem helpers shared by the storage daemon: directory preparation
//! with a fixed mode and owner, recursive deletion that never follows
//! symlinks, and disk usage queries.

pub mod cache;

use anyhow::{bail, Context, Result};
use log::warn;
use nix::sys::statvfs::statvfs;
use nix::unistd::{chown, Gid, Uid};
use std::fs;
use std::fs::Metadata;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

/// Ensure `path` is a directory with exactly `mode`, owned by `(uid, gid)`.
/// An existing directory with the wrong mode or owner is fixed up in place.
pub fn prepare_dir(path: &Path, mode: u32, uid: Uid, gid: Gid) -> Result<()> {
    prepare_dir_impl(path, mode, uid, gid, false)
}

/// Like [`prepare_dir`], but refuses to adopt a pre-existing entry: a
/// symlink, a non-directory, or a directory with a mismatched mode or owner
/// is an error rather than something to fix up.
pub fn prepare_dir_strict(path: &Path, mode: u32, uid: Uid, gid: Gid) -> Result<()> {
    prepare_dir_impl(path, mode, uid, gid, true)
}

fn prepare_dir_impl(path: &Path, mode: u32, uid: Uid, gid: Gid, strict: bool) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if !meta.is_dir() {
                bail!("Not a directory: {}", path.display());
            }
            let cur_mode = meta.permissions().mode() & 0o7777;
            let matches =
                cur_mode == mode && meta.uid() == uid.as_raw() && meta.gid() == gid.as_raw();
            if matches {
                return Ok(());
            }
            if strict {
                bail!(
                    "Existing directory {} has mode {:o} owner {}:{}, wanted {:o} {}:{}",
                    path.display(),
                    cur_mode,
                    meta.uid(),
                    meta.gid(),
                    mode,
                    uid,
                    gid
                );
            }
            warn!("Fixing up mode/owner of existing directory {}", path.display());
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir(path).with_context(|| format!("Failed to mkdir {}", path.display()))?;
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    }
    // mkdir is subject to umask, so always set the mode explicitly.
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to chmod {}", path.display()))?;
    chown(path, Some(uid), Some(gid))
        .with_context(|| format!("Failed to chown {}", path.display()))?;
    Ok(())
}

/// Recursively delete everything inside `path`, keeping `path` itself.
/// Symlinks are removed, never followed.
pub fn delete_dir_contents(path: &Path) -> Result<()> {
    let mut failures = 0;
    delete_contents_inner(path, &mut failures)
        .with_context(|| format!("Failed to clear {}", path.display()))?;
    if failures > 0 {
        bail!("Failed to remove {} entries under {}", failures, path.display());
    }
    Ok(())
}

/// Recursively delete `path` and everything inside it.
pub fn delete_dir_contents_and_dir(path: &Path) -> Result<()> {
    delete_dir_contents(path)?;
    fs::remove_dir(path).with_context(|| format!("Failed to rmdir {}", path.display()))?;
    Ok(())
}

fn delete_contents_inner(path: &Path, failures: &mut u32) -> Result<()> {
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let child = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let removed = if is_dir {
            delete_contents_inner(&child, failures).is_ok() && fs::remove_dir(&child).is_ok()
        } else {
            fs::remove_file(&child).is_ok()
        };
        if !removed {
            warn!("Failed to remove {}", child.display());
            *failures += 1;
        }
    }
    Ok(())
}

/// Bytes available to unprivileged callers on the filesystem holding `path`.
pub fn disk_free(path: &Path) -> Result<u64> {
    let stats =
        statvfs(path).with_context(|| format!("Failed to statvfs {}", path.display()))?;
    Ok(stats.blocks_available() as u64 * stats.fragment_size() as u64)
}

/// The space an inode actually occupies, as opposed to its apparent length.
pub fn stat_size(meta: &Metadata) -> u64 {
    meta.blocks() * 512
}

/// Total occupied size of the tree rooted at `path`. Best effort: unreadable
/// entries contribute nothing. Symlinks are counted, not followed.
pub fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    for entry in entries.flatten() {
        if let Ok(meta) = entry.metadata() {
            total += stat_size(&meta);
            if meta.is_dir() {
                total += dir_size(&entry.path());
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{getgid, getuid};
    use std::os::unix::fs::symlink;

    #[test]
    fn prepare_dir_creates_with_mode() -> Result<()> {
        let temp = tempfile::TempDir::new()?;
        let dir = temp.path().join("subdir");
        prepare_dir(&dir, 0o751, getuid(), getgid())?;
        let meta = fs::metadata(&dir)?;
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o7777, 0o751);
        Ok(())
    }

    #[test]
    fn prepare_dir_is_idempotent() -> Result<()> {
        let temp = tempfile::TempDir::new()?;
        let dir = temp.path().join("subdir");
        prepare_dir_strict(&dir, 0o700, getuid(), getgid())?;
        prepare_dir_strict(&dir, 0o700, getuid(), getgid())?;
        Ok(())
    }

    #[test]
    fn prepare_dir_strict_rejects_mismatched_mode() -> Result<()> {
        let temp = tempfile::TempDir::new()?;
        let dir = temp.path().join("subdir");
        prepare_dir(&dir, 0o700, getuid(), getgid())?;
        assert!(prepare_dir_strict(&dir, 0o751, getuid(), getgid()).is_err());
        Ok(())
    }

    #[test]
    fn prepare_dir_strict_rejects_symlink() -> Result<()> {
        let temp = tempfile::TempDir::new()?;
        let real = temp.path().join("real");
        fs::create_dir(&real)?;
        let link = temp.path().join("link");
        symlink(&real, &link)?;
        assert!(prepare_dir_strict(&link, 0o751, getuid(), getgid()).is_err());
        Ok(())
    }

    #[test]
    fn prepare_dir_fixes_up_mode() -> Result<()> {
        let temp = tempfile::TempDir::new()?;
        let dir = temp.path().join("subdir");
        prepare_dir(&dir, 0o700, getuid(), getgid())?;
        prepare_dir(&dir, 0o751, getuid(), getgid())?;
        let meta = fs::metadata(&dir)?;
        assert_eq!(meta.permissions().mode() & 0o7777, 0o751);
        Ok(())
    }

    #[test]
    fn delete_contents_keeps_top_dir() -> Result<()> {
        let temp = tempfile::TempDir::new()?;
        let dir = temp.path().join("d");
        fs::create_dir_all(dir.join("nested"))?;
        fs::write(dir.join("file"), b"x")?;
        fs::write(dir.join("nested/file"), b"y")?;
        delete_dir_contents(&dir)?;
        assert!(dir.exists());
        assert_eq!(fs::read_dir(&dir)?.count(), 0);
        Ok(())
    }

    #[test]
    fn delete_contents_does_not_follow_symlinks() -> Result<()> {
        let temp = tempfile::TempDir::new()?;
        let target = temp.path().join("target");
        fs::create_dir(&target)?;
        fs::write(target.join("precious"), b"keep")?;
        let dir = temp.path().join("d");
        fs::create_dir(&dir)?;
        symlink(&target, dir.join("link"))?;
        delete_dir_contents_and_dir(&dir)?;
        assert!(!dir.exists());
        assert!(target.join("precious").exists());
        Ok(())
    }

    #[test]
    fn delete_contents_of_missing_dir_is_an_error() {
        let temp = tempfile::TempDir::new().unwrap();
        assert!(delete_dir_contents(&temp.path().join("nope")).is_err());
    }

    #[test]
    fn disk_free_reports_something() -> Result<()> {
        let temp = tempfile::TempDir::new()?;
        assert!(disk_free(temp.path())? > 0);
        Ok(())
    }

    #[test]
    fn dir_size_counts_nested_files() -> Result<()> {
        let temp = tempfile::TempDir::new()?;
        let dir = temp.path().join("d");
        fs::create_dir_all(dir.join("sub"))?;
        fs::write(dir.join("a"), vec![0u8; 4096])?;
        fs::write(dir.join("sub/b"), vec![0u8; 4096])?;
        let expected = stat_size(&fs::metadata(dir.join("a"))?)
            + stat_size(&fs::metadata(dir.join("sub/b"))?)
            + stat_size(&fs::metadata(dir.join("sub"))?);
        assert_eq!(dir_size(&dir), expected);
        Ok(())
    }
}
