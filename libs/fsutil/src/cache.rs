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

//! Cache-file accumulator used by the reclamation sweep. Callers register
//! roots whose per-package `cache/` subtrees may be evicted from; eviction
//! then deletes the least recently modified files first until the
//! free-space target is met.
//!
//! mtime is only an approximation of recency (atime is unreliable on these
//! volumes), so this is deliberately not a strict LRU.

use anyhow::Result;
use log::{debug, warn};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::{disk_free, stat_size};

struct CacheFile {
    path: PathBuf,
    mtime: i64,
    size: u64,
}

/// One reclamation session. Dropping the collection releases everything it
/// has gathered without touching the filesystem.
#[derive(Default)]
pub struct CacheCollection {
    files: Vec<CacheFile>,
    dirs: Vec<PathBuf>,
}

impl CacheCollection {
    pub fn new() -> Self {
        Default::default()
    }

    /// Register the `cache/` subtree of every package directory under
    /// `base` as evictable. Hidden entries and missing or unreadable
    /// subtrees contribute nothing; the `cache/` directories themselves are
    /// retained.
    pub fn add_cache_files(&mut self, base: &Path) {
        let entries = match fs::read_dir(base) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            self.scan(&entry.path().join("cache"));
        }
    }

    fn scan(&mut self, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("Skipping unreadable cache entry {}: {}", path.display(), e);
                    continue;
                }
            };
            if meta.is_dir() {
                self.scan(&path);
                self.dirs.push(path);
            } else {
                self.files.push(CacheFile {
                    path,
                    mtime: meta.mtime(),
                    size: stat_size(&meta),
                });
            }
        }
    }

    /// Number of files currently registered for eviction.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Evict registered files, oldest mtime first, until `volume_root`'s
    /// filesystem reports at least `target_free` bytes available. Emptied
    /// cache subdirectories are pruned afterwards. Per-file failures are
    /// logged and do not stop the sweep.
    pub fn purge(&mut self, volume_root: &Path, target_free: u64) -> Result<()> {
        self.purge_until(target_free, || disk_free(volume_root))
    }

    fn purge_until<F>(&mut self, target_free: u64, free: F) -> Result<()>
    where
        F: Fn() -> Result<u64>,
    {
        self.files.sort_by_key(|f| f.mtime);
        for file in &self.files {
            if free()? >= target_free {
                break;
            }
            debug!("Evicting {} ({} bytes)", file.path.display(), file.size);
            if let Err(e) = fs::remove_file(&file.path) {
                warn!("Failed to evict {}: {}", file.path.display(), e);
            }
        }
        // Deeper directories were recorded before their parents, so one
        // forward pass removes whatever the eviction emptied.
        for dir in &self.dirs {
            let _ = fs::remove_dir(dir);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::stat::utimes;
    use nix::sys::time::TimeVal;

    fn write_with_mtime(path: &Path, len: usize, mtime: i64) {
        fs::write(path, vec![0u8; len]).unwrap();
        utimes(path, &TimeVal::new(mtime, 0), &TimeVal::new(mtime, 0)).unwrap();
    }

    #[test]
    fn collects_per_package_cache_subtrees_only() {
        let temp = tempfile::TempDir::new().unwrap();
        let base = temp.path();
        fs::create_dir_all(base.join("com.a/cache/sub")).unwrap();
        fs::create_dir_all(base.join("com.a/files")).unwrap();
        fs::create_dir_all(base.join("com.b/cache")).unwrap();
        fs::create_dir_all(base.join(".hidden/cache")).unwrap();
        write_with_mtime(&base.join("com.a/cache/a"), 10, 1000);
        write_with_mtime(&base.join("com.a/cache/sub/b"), 10, 2000);
        write_with_mtime(&base.join("com.a/files/keep"), 10, 500);
        write_with_mtime(&base.join("com.b/cache/c"), 10, 3000);
        write_with_mtime(&base.join(".hidden/cache/d"), 10, 100);

        let mut cache = CacheCollection::new();
        cache.add_cache_files(base);
        assert_eq!(cache.file_count(), 3);
    }

    #[test]
    fn evicts_oldest_first_until_target() {
        let temp = tempfile::TempDir::new().unwrap();
        let base = temp.path();
        fs::create_dir_all(base.join("com.a/cache")).unwrap();
        write_with_mtime(&base.join("com.a/cache/old"), 4096, 1000);
        write_with_mtime(&base.join("com.a/cache/mid"), 4096, 2000);
        write_with_mtime(&base.join("com.a/cache/new"), 4096, 3000);

        let mut cache = CacheCollection::new();
        cache.add_cache_files(base);

        let occupied = |name: &str| {
            fs::metadata(base.join("com.a/cache").join(name))
                .map(|m| stat_size(&m))
                .unwrap_or(0)
        };
        let per_file = occupied("old");
        let total = occupied("old") + occupied("mid") + occupied("new");

        // Simulated filesystem: starts with 0 free, gains the occupied size
        // of each file as it disappears.
        let count_freed = || Ok(total - (occupied("old") + occupied("mid") + occupied("new")));

        cache.purge_until(per_file + 1, count_freed).unwrap();
        assert!(!base.join("com.a/cache/old").exists());
        assert!(!base.join("com.a/cache/mid").exists());
        assert!(base.join("com.a/cache/new").exists());
    }

    #[test]
    fn purge_prunes_emptied_subdirectories() {
        let temp = tempfile::TempDir::new().unwrap();
        let base = temp.path();
        fs::create_dir_all(base.join("com.a/cache/deep/deeper")).unwrap();
        write_with_mtime(&base.join("com.a/cache/deep/deeper/f"), 10, 1000);

        let mut cache = CacheCollection::new();
        cache.add_cache_files(base);
        cache.purge_until(u64::MAX, || Ok(0)).unwrap();
        assert!(!base.join("com.a/cache/deep").exists());
        assert!(base.join("com.a/cache").exists());
    }

    #[test]
    fn purge_is_a_noop_when_target_already_met() {
        let temp = tempfile::TempDir::new().unwrap();
        let base = temp.path();
        fs::create_dir_all(base.join("com.a/cache")).unwrap();
        write_with_mtime(&base.join("com.a/cache/f"), 10, 1000);

        let mut cache = CacheCollection::new();
        cache.add_cache_files(base);
        cache.purge_until(100, || Ok(1000)).unwrap();
        assert!(base.join("com.a/cache/f").exists());
    }
}
