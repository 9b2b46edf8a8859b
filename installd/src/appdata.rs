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

//! Lifecycle of per-app private data directories: creation with the right
//! mode, owner and SELinux label; clearing; destruction; label restoration.
//! Also the small path-validated mutations that share this territory
//! (linklib, link_file, per-user config dirs, user removal).

use anyhow::{Context, Result};
use log::{error, warn};
use nix::unistd::{chown, Gid, Uid};
use std::fs;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::Path;

use crate::paths::{self, CACHE_DIR_NAME, CODE_CACHE_DIR_NAME, LIB_DIR_NAME};
use crate::{multiuser_get_uid, Installd, StorageFlags, AID_EVERYBODY, AID_INSTALL, AID_SYSTEM};

/// Mode of every app-private data directory.
const APP_DATA_DIR_MODE: u32 = 0o751;
/// Mode of a per-user config directory.
const USER_CONFIG_DIR_MODE: u32 = 0o750;

/// Keep the first failure while still attempting the rest.
fn merge(acc: Result<()>, next: Result<()>) -> Result<()> {
    match (acc, next) {
        (Ok(()), r) => r,
        (err, Ok(())) => err,
        (err, Err(e)) => {
            error!("{:#}", e);
            err
        }
    }
}

impl Installd {
    /// Create the app's private directory on each requested storage class,
    /// mode 0751 owned by the app uid, and label it. Fails rather than adopt
    /// a pre-existing mismatched entry or symlink.
    pub fn create_app_data(
        &self,
        uuid: Option<&str>,
        pkg: &str,
        user: u32,
        flags: StorageFlags,
        appid: u32,
        seinfo: &str,
    ) -> Result<()> {
        let deps = self.deps();
        let uid = multiuser_get_uid(user, appid);
        if flags.contains(StorageFlags::CE) {
            let path = paths::data_user_package_path(&deps.dirs, uuid, user, pkg)?;
            fsutil::prepare_dir_strict(&path, APP_DATA_DIR_MODE, Uid::from_raw(uid), Gid::from_raw(uid))
                .with_context(|| format!("Failed to prepare {}", path.display()))?;
            deps.selinux
                .setfilecon(&path, pkg, seinfo, uid)
                .with_context(|| format!("Failed to setfilecon {}", path.display()))?;
        }
        if flags.contains(StorageFlags::DE) {
            let path = paths::data_user_de_package_path(&deps.dirs, uuid, user, pkg)?;
            fsutil::prepare_dir_strict(&path, APP_DATA_DIR_MODE, Uid::from_raw(uid), Gid::from_raw(uid))
                .with_context(|| format!("Failed to prepare {}", path.display()))?;
            deps.selinux
                .setfilecon(&path, pkg, seinfo, uid)
                .with_context(|| format!("Failed to setfilecon {}", path.display()))?;
        }
        Ok(())
    }

    /// Delete the contents of the app's directory on each requested class,
    /// keeping the directory itself. `CLEAR_CACHE_ONLY` /
    /// `CLEAR_CODE_CACHE_ONLY` restrict the wipe to that subtree. Missing
    /// directories are fine.
    pub fn clear_app_data(
        &self,
        uuid: Option<&str>,
        pkg: &str,
        user: u32,
        flags: StorageFlags,
    ) -> Result<()> {
        let dirs = &self.deps().dirs;
        let subtree = if flags.contains(StorageFlags::CLEAR_CACHE_ONLY) {
            Some(CACHE_DIR_NAME)
        } else if flags.contains(StorageFlags::CLEAR_CODE_CACHE_ONLY) {
            Some(CODE_CACHE_DIR_NAME)
        } else {
            None
        };

        let mut res = Ok(());
        if flags.contains(StorageFlags::CE) {
            let mut path = paths::data_user_package_path(dirs, uuid, user, pkg)?;
            if let Some(subtree) = subtree {
                path.push(subtree);
            }
            if path.exists() {
                res = merge(res, fsutil::delete_dir_contents(&path));
            }
        }
        if flags.contains(StorageFlags::DE) {
            let mut path = paths::data_user_de_package_path(dirs, uuid, user, pkg)?;
            if let Some(subtree) = subtree {
                path.push(subtree);
            }
            if path.exists() {
                res = merge(res, fsutil::delete_dir_contents(&path));
            }
        }
        res
    }

    /// Delete the app's directory and its contents on each requested class.
    pub fn destroy_app_data(
        &self,
        uuid: Option<&str>,
        pkg: &str,
        user: u32,
        flags: StorageFlags,
    ) -> Result<()> {
        let dirs = &self.deps().dirs;
        let mut res = Ok(());
        if flags.contains(StorageFlags::CE) {
            let path = paths::data_user_package_path(dirs, uuid, user, pkg)?;
            res = merge(res, fsutil::delete_dir_contents_and_dir(&path));
        }
        if flags.contains(StorageFlags::DE) {
            let path = paths::data_user_de_package_path(dirs, uuid, user, pkg)?;
            res = merge(res, fsutil::delete_dir_contents_and_dir(&path));
        }
        res
    }

    /// Recursively re-apply the SELinux label of the app's directory on each
    /// requested class. Failures on DE storage are logged and swallowed
    /// pending an upstream labelling fix; failures on CE propagate.
    pub fn restorecon_app_data(
        &self,
        uuid: Option<&str>,
        pkg: &str,
        user: u32,
        flags: StorageFlags,
        appid: u32,
        seinfo: &str,
    ) -> Result<()> {
        let deps = self.deps();
        let uid = multiuser_get_uid(user, appid);
        let mut res = Ok(());
        if flags.contains(StorageFlags::CE) {
            let path = paths::data_user_package_path(&deps.dirs, uuid, user, pkg)?;
            res = merge(
                res,
                deps.selinux
                    .restorecon_pkgdir(&path, seinfo, uid)
                    .with_context(|| format!("restorecon failed for {}", path.display())),
            );
        }
        if flags.contains(StorageFlags::DE) {
            let path = paths::data_user_de_package_path(&deps.dirs, uuid, user, pkg)?;
            if let Err(e) = deps.selinux.restorecon_pkgdir(&path, seinfo, uid) {
                warn!("restorecon failed for {}: {:#}", path.display(), e);
            }
        }
        res
    }

    /// Prepare the per-user config directory on internal storage.
    pub fn make_user_config(&self, user: u32) -> Result<()> {
        let path = paths::user_config_path(&self.deps().dirs, user);
        fsutil::prepare_dir(
            &path,
            USER_CONFIG_DIR_MODE,
            Uid::from_raw(AID_SYSTEM),
            Gid::from_raw(AID_EVERYBODY),
        )
        .with_context(|| format!("Failed to prepare {}", path.display()))
    }

    /// Remove every trace of a user from a volume: CE and DE data roots and
    /// the media tree, plus the config directory on internal storage.
    pub fn delete_user(&self, uuid: Option<&str>, user: u32) -> Result<()> {
        let dirs = &self.deps().dirs;
        let mut res = Ok(());
        res = merge(res, fsutil::delete_dir_contents_and_dir(&paths::data_user_path(dirs, uuid, user)?));
        res = merge(
            res,
            fsutil::delete_dir_contents_and_dir(&paths::data_user_de_path(dirs, uuid, user)?),
        );
        res = merge(res, fsutil::delete_dir_contents_and_dir(&paths::data_media_path(dirs, uuid, user)?));
        if uuid.is_none() {
            res = merge(
                res,
                fsutil::delete_dir_contents_and_dir(&paths::user_config_path(dirs, user)),
            );
        }
        res
    }

    /// Replace `<pkg dir>/lib` with a symlink to the secure container's
    /// library directory. The package directory is made 0700 installer-owned
    /// for the duration and restored afterwards, whatever the outcome.
    pub fn linklib(
        &self,
        uuid: Option<&str>,
        pkg: &str,
        asec_lib_dir: &str,
        user: u32,
    ) -> Result<()> {
        let dirs = &self.deps().dirs;
        let pkgdir = paths::data_user_package_path(dirs, uuid, user, pkg)?;
        let libsymlink = pkgdir.join(LIB_DIR_NAME);

        let saved = fs::metadata(&pkgdir)
            .with_context(|| format!("Failed to stat {}", pkgdir.display()))?;

        chown(
            &pkgdir,
            Some(Uid::from_raw(AID_INSTALL)),
            Some(Gid::from_raw(AID_INSTALL)),
        )
        .with_context(|| format!("Failed to chown {}", pkgdir.display()))?;

        let inner = (|| -> Result<()> {
            fs::set_permissions(&pkgdir, fs::Permissions::from_mode(0o700))
                .with_context(|| format!("Failed to chmod {}", pkgdir.display()))?;

            match fs::symlink_metadata(&libsymlink) {
                Ok(meta) if meta.is_dir() => {
                    fsutil::delete_dir_contents_and_dir(&libsymlink)?;
                }
                Ok(meta) if meta.file_type().is_symlink() => {
                    fs::remove_file(&libsymlink)
                        .with_context(|| format!("Failed to unlink {}", libsymlink.display()))?;
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to stat {}", libsymlink.display()))
                }
            }

            symlink(asec_lib_dir, &libsymlink).with_context(|| {
                format!("Failed to symlink {} -> {}", libsymlink.display(), asec_lib_dir)
            })?;
            Ok(())
        })();

        // Restore the original mode and owner no matter how the body fared.
        let restored = fs::set_permissions(
            &pkgdir,
            fs::Permissions::from_mode(saved.permissions().mode() & 0o7777),
        )
        .with_context(|| format!("Failed to restore mode of {}", pkgdir.display()))
        .and_then(|()| {
            chown(
                &pkgdir,
                Some(Uid::from_raw(saved.uid())),
                Some(Gid::from_raw(saved.gid())),
            )
            .with_context(|| format!("Failed to restore owner of {}", pkgdir.display()))
        });

        merge(inner, restored)
    }

    /// Hard-link one file between two app directories. Both endpoints must
    /// validate as app paths.
    pub fn link_file(&self, relative_path: &str, from_base: &str, to_base: &str) -> Result<()> {
        let dirs = &self.deps().dirs;
        let from = format!("{}/{}", from_base, relative_path);
        let to = format!("{}/{}", to_base, relative_path);
        paths::validate_apk_path_subdirs(dirs, &from)?;
        paths::validate_apk_path_subdirs(dirs, &to)?;
        fs::hard_link(&from, &to).with_context(|| format!("link({}, {}) failed", from, to))
    }

    /// Delete an installed package's code directory.
    pub fn rm_package_dir(&self, apk_dir: &str) -> Result<()> {
        paths::validate_apk_path(&self.deps().dirs, apk_dir)?;
        fsutil::delete_dir_contents_and_dir(Path::new(apk_dir))
    }

    /// Users present on a volume: user 0 plus every numeric directory under
    /// the volume's CE user root.
    pub fn known_users(&self, uuid: Option<&str>) -> Vec<u32> {
        let mut users = vec![0];
        if let Ok(root) = paths::data_path(&self.deps().dirs, uuid) {
            if let Ok(entries) = fs::read_dir(root.join("user")) {
                for entry in entries.flatten() {
                    if let Some(user) =
                        entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok())
                    {
                        users.push(user);
                    }
                }
            }
        }
        users.sort_unstable();
        users.dedup();
        users
    }
}
