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

//! Execution of system-update move scripts: each file in the update
//! commands directory names a destination/source package pair followed by
//! whitespace-indented relative paths to rename across, creating missing
//! intermediate directories owned by the destination package.
//!
//! Script grammar, line by line:
//!   `dstpkg:srcpkg`   switch to a new package pair
//!   `<ws>rel/path`    move that entry from srcpkg to dstpkg
//!   `# ...` / empty   ignored

use anyhow::Result;
use log::{debug, warn};
use nix::unistd::{chown, Gid, Uid};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::paths;
use crate::{Installd, PKG_PATH_MAX};

/// Mode of intermediate directories created along a destination path.
const INNER_DIR_MODE: u32 = 0o771;

/// One `dstpkg:srcpkg` binding, resolved to concrete roots and the
/// destination's owner.
struct MovePair {
    src_root: PathBuf,
    dst_root: PathBuf,
    dst_uid: u32,
    dst_gid: u32,
}

impl Installd {
    /// Process every update script. Per-entry failures are logged and do not
    /// stop the run; scripts whose packages no longer exist are skipped.
    pub fn movefiles(&self) -> Result<()> {
        let dirs = &self.deps().dirs;
        let scripts = match fs::read_dir(&dirs.update_commands) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        for entry in scripts.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(true) {
                continue;
            }
            let path = entry.path();
            let file = match fs::File::open(&path) {
                Ok(file) => file,
                Err(e) => {
                    warn!("Unable to open update commands at {}: {}", path.display(), e);
                    continue;
                }
            };
            self.run_script(&path, BufReader::new(file));
        }
        Ok(())
    }

    fn run_script<R: BufRead>(&self, script: &Path, reader: R) {
        let mut pair: Option<MovePair> = None;
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Failure reading update commands in {}: {}", script.display(), e);
                    break;
                }
            };
            if line.len() >= PKG_PATH_MAX {
                warn!("Line too long in {}, skipping", script.display());
                continue;
            }
            let indented = line.starts_with(char::is_whitespace);
            let body = line.trim();
            if body.is_empty() || body.starts_with('#') {
                continue;
            }
            if indented {
                match &pair {
                    // Skip silently: the source package no longer exists.
                    None => {}
                    Some(pair) => self.move_entry(pair, body),
                }
            } else {
                pair = self.parse_package_line(script, body);
            }
        }
    }

    /// Resolve `dstpkg:srcpkg`. Either package being absent disables the
    /// following path lines.
    fn parse_package_line(&self, script: &Path, body: &str) -> Option<MovePair> {
        let dirs = &self.deps().dirs;
        let Some((dst_pkg, src_pkg)) = body.split_once(':') else {
            warn!("Bad package spec in {}; no ':' sep: {}", script.display(), body);
            return None;
        };
        let src_root = paths::data_user_package_path(dirs, None, 0, src_pkg)
            .map_err(|e| warn!("Bad source package in {}: {:#}", script.display(), e))
            .ok()?;
        let dst_root = paths::data_user_package_path(dirs, None, 0, dst_pkg)
            .map_err(|e| warn!("Bad destination package in {}: {:#}", script.display(), e))
            .ok()?;
        if fs::symlink_metadata(&src_root).is_err() {
            // Source package no longer exists -- skip.
            return None;
        }
        let dst_meta = match fs::symlink_metadata(&dst_root) {
            Ok(meta) => meta,
            // Destination package doesn't exist... due to original-package,
            // this is normal, so don't be noisy about it.
            Err(_) => return None,
        };
        use std::os::unix::fs::MetadataExt;
        debug!("Transferring from {} to {}: uid={}", src_pkg, dst_pkg, dst_meta.uid());
        Some(MovePair {
            src_root,
            dst_root,
            dst_uid: dst_meta.uid(),
            dst_gid: dst_meta.gid(),
        })
    }

    fn move_entry(&self, pair: &MovePair, rel: &str) {
        let rel = Path::new(rel);
        if rel.is_absolute() || rel.components().any(|c| c.as_os_str() == "..") {
            warn!("Refusing to move suspicious path {}", rel.display());
            return;
        }
        let src = pair.src_root.join(rel);
        let dst = pair.dst_root.join(rel);
        if src.as_os_str().len() >= PKG_PATH_MAX || dst.as_os_str().len() >= PKG_PATH_MAX {
            warn!("Path too long; skipping: {}", rel.display());
            return;
        }
        debug!("Move entry: {} (from {} to {})", rel.display(), src.display(), dst.display());
        move_file_or_dir(&src, &dst, &pair.dst_root, pair.dst_uid, pair.dst_gid);
    }
}

/// Rename one entry, recursing into directories so files land individually
/// and empty source directories can be left behind for the package manager
/// to reap with the rest of the old install.
fn move_file_or_dir(src: &Path, dst: &Path, dst_base: &Path, uid: u32, gid: u32) {
    let meta = match fs::symlink_metadata(src) {
        Ok(meta) => meta,
        Err(e) => {
            warn!("Unable to stat {}: {}", src.display(), e);
            return;
        }
    };

    if !meta.is_dir() {
        make_inner_dirs(dst_base, dst, uid, gid);
        debug!("Renaming {} to {} (uid {})", src.display(), dst.display(), uid);
        if let Err(e) = fs::rename(src, dst) {
            warn!("Unable to rename {} to {}: {}", src.display(), dst.display(), e);
            return;
        }
        if let Err(e) = chown(dst, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))) {
            warn!("Cannot chown {}: {}", dst.display(), e);
            let _ = fs::remove_file(dst);
        }
        return;
    }

    let entries = match fs::read_dir(src) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Unable to opendir {}: {}", src.display(), e);
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let child_src = src.join(&name);
        let child_dst = dst.join(&name);
        if child_src.as_os_str().len() >= PKG_PATH_MAX {
            warn!("Source path too long; skipping: {}", child_src.display());
            continue;
        }
        if child_dst.as_os_str().len() >= PKG_PATH_MAX {
            warn!("Destination path too long; skipping: {}", child_dst.display());
            continue;
        }
        move_file_or_dir(&child_src, &child_dst, dst_base, uid, gid);
    }
}

/// Create any missing directories between `dst_base` and `dst`'s parent,
/// owned by the destination package.
fn make_inner_dirs(dst_base: &Path, dst: &Path, uid: u32, gid: u32) {
    let Some(parent) = dst.parent() else { return };
    let Ok(rel) = parent.strip_prefix(dst_base) else { return };
    let mut current = dst_base.to_path_buf();
    for component in rel.components() {
        current.push(component);
        if fs::symlink_metadata(&current).is_err() {
            debug!("Making directory: {}", current.display());
            if let Err(e) = fs::create_dir(&current) {
                warn!("Unable to make directory {}: {}", current.display(), e);
                return;
            }
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&current, fs::Permissions::from_mode(INNER_DIR_MODE));
            if let Err(e) = chown(&current, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))) {
                warn!("Unable to chown directory {}: {}", current.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::testing::test_deps;

    fn fixture() -> (tempfile::TempDir, Installd) {
        let temp = tempfile::TempDir::new().unwrap();
        let installd = Installd::new(test_deps(temp.path()));
        (temp, installd)
    }

    fn pkg_root(installd: &Installd, pkg: &str) -> PathBuf {
        paths::data_user_package_path(&installd.deps().dirs, None, 0, pkg).unwrap()
    }

    fn write_script(installd: &Installd, name: &str, contents: &str) {
        let dir = &installd.deps().dirs.update_commands;
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn moves_listed_paths_between_packages() {
        let (_temp, installd) = fixture();
        let src = pkg_root(&installd, "com.old");
        let dst = pkg_root(&installd, "com.new");
        fs::create_dir_all(src.join("files/sub")).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("files/a.txt"), b"a").unwrap();
        fs::write(src.join("files/sub/b.txt"), b"b").unwrap();
        fs::write(src.join("files/untouched.txt"), b"u").unwrap();

        write_script(
            &installd,
            "com.new",
            "# update script\ncom.new:com.old\n\tfiles/a.txt\n\tfiles/sub\n",
        );
        installd.movefiles().unwrap();

        assert_eq!(fs::read(dst.join("files/a.txt")).unwrap(), b"a");
        assert_eq!(fs::read(dst.join("files/sub/b.txt")).unwrap(), b"b");
        assert!(!src.join("files/a.txt").exists());
        assert!(!src.join("files/sub/b.txt").exists());
        // Unlisted entries stay put.
        assert!(src.join("files/untouched.txt").exists());
    }

    #[test]
    fn skips_when_source_package_is_gone() {
        let (_temp, installd) = fixture();
        let dst = pkg_root(&installd, "com.new");
        fs::create_dir_all(&dst).unwrap();

        write_script(&installd, "com.new", "com.new:com.vanished\n\tfiles/a.txt\n");
        installd.movefiles().unwrap();
        assert!(!dst.join("files").exists());
    }

    #[test]
    fn path_lines_before_any_package_line_are_ignored() {
        let (_temp, installd) = fixture();
        let src = pkg_root(&installd, "com.old");
        fs::create_dir_all(src.join("files")).unwrap();
        fs::write(src.join("files/a.txt"), b"a").unwrap();

        write_script(&installd, "stray", "\tfiles/a.txt\n");
        installd.movefiles().unwrap();
        assert!(src.join("files/a.txt").exists());
    }

    #[test]
    fn rejects_escaping_relative_paths() {
        let (_temp, installd) = fixture();
        let src = pkg_root(&installd, "com.old");
        let dst = pkg_root(&installd, "com.new");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        let outside = installd.deps().dirs.data.join("secret");
        fs::write(&outside, b"secret").unwrap();

        write_script(&installd, "evil", "com.new:com.old\n\t../../secret\n");
        installd.movefiles().unwrap();
        assert!(outside.exists());
    }

    #[test]
    fn missing_update_dir_is_fine() {
        let (_temp, installd) = fixture();
        fs::remove_dir_all(&installd.deps().dirs.update_commands).unwrap();
        installd.movefiles().unwrap();
    }
}
