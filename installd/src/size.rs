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

//! Storage accounting for one package, split into the four buckets the
//! settings UI reports: code, data, cache, and secure-container usage.

use anyhow::Result;
use log::warn;
use std::fs;
use std::path::Path;

use crate::paths::{self, CACHE_DIR_NAME, LIB_DIR_NAME};
use crate::{Installd, StorageFlags};

/// Occupied bytes per bucket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AppSize {
    pub code: u64,
    pub data: u64,
    pub cache: u64,
    pub asec: u64,
}

impl Installd {
    /// Measure a package's footprint. `user` of `None` means all known
    /// users. The APK itself counts as code unless it is preinstalled on the
    /// system partition or lives in a secure container; within the per-user
    /// directory, `lib` counts as code, `cache` as cache, and everything
    /// else as data.
    #[allow(clippy::too_many_arguments)]
    pub fn get_app_size(
        &self,
        uuid: Option<&str>,
        pkg: &str,
        user: Option<u32>,
        flags: StorageFlags,
        apk_path: &str,
        lib_dir_path: Option<&str>,
        fwdlock_apk_path: Option<&str>,
        asec_path: Option<&str>,
        instruction_set: &str,
    ) -> Result<AppSize> {
        let dirs = &self.deps().dirs;
        let mut size = AppSize::default();

        // The source apk is code, but only when the app owns it: not on the
        // system partition and not inside a secure container.
        let is_system = paths::validate_system_app_path(dirs, apk_path).is_ok();
        let in_asec = Path::new(apk_path).starts_with(&dirs.asec);
        if !is_system && !in_asec {
            if let Ok(meta) = fs::metadata(apk_path) {
                size.code += fsutil::stat_size(&meta);
                if meta.is_dir() {
                    size.code += fsutil::dir_size(Path::new(apk_path));
                }
            }
        }

        if let Some(fwdlock) = fwdlock_apk_path {
            if let Ok(meta) = fs::metadata(fwdlock) {
                size.code += fsutil::stat_size(&meta);
            }
        }

        // The cached compiled artifact is code too.
        if let Ok(oat) = paths::cache_oat_path(dirs, apk_path, instruction_set) {
            if let Ok(meta) = fs::metadata(&oat) {
                size.code += fsutil::stat_size(&meta);
            }
        }

        if let Some(lib_dir) = lib_dir_path {
            size.code += fsutil::dir_size(Path::new(lib_dir));
        }

        if let Some(asec) = asec_path {
            if let Ok(meta) = fs::metadata(asec) {
                size.asec += fsutil::stat_size(&meta);
            }
        }

        let users = match user {
            Some(user) => vec![user],
            None => self.known_users(uuid),
        };

        for user in users {
            if !flags.contains(StorageFlags::CE) {
                continue;
            }
            let pkg_dir = paths::data_user_package_path(dirs, uuid, user, pkg)?;
            let entries = match fs::read_dir(&pkg_dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Failed to open {}: {}", pkg_dir.display(), e);
                    continue;
                }
            };
            // One level of classification, then whole subtrees: lib and
            // below is code, cache and below is cache, the rest is data.
            for entry in entries.flatten() {
                let name = entry.file_name();
                let path = entry.path();
                let Ok(meta) = fs::symlink_metadata(&path) else { continue };
                let occupied = fsutil::stat_size(&meta);
                if meta.is_dir() {
                    let subtree = occupied + fsutil::dir_size(&path);
                    if name == LIB_DIR_NAME {
                        size.code += subtree;
                    } else if name == CACHE_DIR_NAME {
                        size.cache += subtree;
                    } else {
                        size.data += subtree;
                    }
                } else if meta.file_type().is_symlink() && name == LIB_DIR_NAME {
                    // The symlink to the app's native code; the app didn't
                    // create it, so it isn't data.
                    size.code += occupied;
                } else {
                    size.data += occupied;
                }
            }
        }

        Ok(size)
    }
}
