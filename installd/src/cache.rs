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

//! Best-effort cache reclamation: when free space on a volume drops below a
//! target, evict app cache files oldest-first until the target is met. The
//! core only decides which roots participate; the eviction policy lives in
//! the accumulator.

use anyhow::{bail, Result};
use fsutil::cache::CacheCollection;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths;
use crate::{Installd, PKG_PATH_MAX};

impl Installd {
    /// Try to ensure `free_size` bytes are available on the volume. Returns
    /// an error iff the target could not be met; whatever was already
    /// evicted stays evicted.
    pub fn free_cache(&self, uuid: Option<&str>, free_size: u64) -> Result<()> {
        let dirs = &self.deps().dirs;
        let data_path = paths::data_path(dirs, uuid)?;

        let avail = fsutil::disk_free(&data_path)?;
        info!("free_cache({}) avail {}", free_size, avail);
        if avail >= free_size {
            return Ok(());
        }

        let mut cache = CacheCollection::new();

        // Special case for the owner on internal storage.
        if uuid.is_none() {
            cache.add_cache_files(&paths::data_user_path(dirs, None, 0)?);
        }

        // Secondary users on this volume.
        for dir in numeric_children(&data_path.join("user"), |name| name != "0") {
            cache.add_cache_files(&dir);
        }

        // External media for all users, but only trees that really look like
        // app storage; anything else mounted there is left alone.
        let media_root = paths::data_media_root(dirs, uuid)?;
        for dir in numeric_children(&media_root, |_| true) {
            let app_data = lookup_media_dir(&dir, "Android")
                .and_then(|android| lookup_media_dir(&android, "data"));
            if let Some(app_data) = app_data {
                cache.add_cache_files(&app_data);
            }
        }

        cache.purge(&data_path, free_size)?;

        if fsutil::disk_free(&data_path)? >= free_size {
            Ok(())
        } else {
            bail!("Unable to free {} bytes on {}", free_size, data_path.display());
        }
    }
}

/// Directories under `base` whose names start with a digit and pass
/// `accept`. Hidden names and names that would overrun the path length
/// limit are skipped, the latter with a warning.
fn numeric_children<F>(base: &Path, accept: F) -> Vec<PathBuf>
where
    F: Fn(&str) -> bool,
{
    let mut found = Vec::new();
    let entries = match fs::read_dir(base) {
        Ok(entries) => entries,
        Err(_) => return found,
    };
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        if base.as_os_str().len() + name.len() + 1 >= PKG_PATH_MAX {
            warn!("Path exceeds limit: {}/{}", base.display(), name);
            continue;
        }
        if accept(name) {
            found.push(entry.path());
        }
    }
    found
}

/// Case-insensitive lookup of a child directory, for trees that may have
/// passed through a case-mangling filesystem.
fn lookup_media_dir(base: &Path, name: &str) -> Option<PathBuf> {
    for entry in fs::read_dir(base).ok()?.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        if entry.file_name().to_string_lossy().eq_ignore_ascii_case(name) {
            return Some(entry.path());
        }
    }
    None
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

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"cached").unwrap();
    }

    fn populate(installd: &Installd) -> Vec<PathBuf> {
        let data = &installd.deps().dirs.data;
        let evictable = vec![
            data.join("user/0/com.a/cache/f1"),
            data.join("user/10/com.b/cache/f2"),
            data.join("media/0/Android/data/com.c/cache/f3"),
            data.join("media/2/android/DATA/com.d/cache/f4"),
        ];
        for path in &evictable {
            touch(path);
        }
        touch(&data.join("user/0/com.a/files/keep"));
        touch(&data.join("media/0/SomeOther/cache/untouchable"));
        touch(&data.join("media/1/Junk/cache/untouchable"));
        evictable
    }

    #[test]
    fn sweep_covers_exactly_the_participating_roots() {
        let (_temp, installd) = fixture();
        let evictable = populate(&installd);

        // An unmeetable target sweeps every participating root.
        assert!(installd.free_cache(None, u64::MAX).is_err());

        for path in evictable {
            assert!(!path.exists(), "{} should have been evicted", path.display());
        }
        let data = &installd.deps().dirs.data;
        assert!(data.join("user/0/com.a/files/keep").exists());
        assert!(data.join("user/0/com.a/cache").exists());
        // Media trees without both Android/ and Android/data/ are sacred.
        assert!(data.join("media/0/SomeOther/cache/untouchable").exists());
        assert!(data.join("media/1/Junk/cache/untouchable").exists());
    }

    #[test]
    fn sweep_returns_early_when_target_already_met() {
        let (_temp, installd) = fixture();
        let evictable = populate(&installd);

        installd.free_cache(None, 1).unwrap();
        for path in evictable {
            assert!(path.exists());
        }
    }
}
