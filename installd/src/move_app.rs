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

//! Moving a complete app between storage volumes: the code directory plus
//! every user's private data. The destination is treated as a transaction
//! and wiped on any failure; the source is never touched, so the framework
//! can delete it only after persisting the new location. That ordering keeps
//! the move recoverable across power loss.

use anyhow::{ensure, Context, Result};
use log::{debug, info, warn};
use nix::unistd::{Gid, Uid};
use std::path::Path;
use std::process::Command;

use crate::paths;
use crate::{Installd, StorageFlags, AID_SYSTEM};

/// Mode of a per-user data root.
const USER_DIR_MODE: u32 = 0o771;

impl Installd {
    /// Copy `/…/app/<data_app_name>` and, for each known user on the source
    /// volume, `/…/user/<u>/<pkg>`, from `from_uuid` to `to_uuid`.
    pub fn move_complete_app(
        &self,
        from_uuid: Option<&str>,
        to_uuid: Option<&str>,
        pkg: &str,
        data_app_name: &str,
        appid: u32,
        seinfo: &str,
    ) -> Result<()> {
        let users = self.known_users(from_uuid);
        let res = self.copy_app(from_uuid, to_uuid, pkg, data_app_name, appid, seinfo, &users);
        if res.is_err() {
            self.rollback_destination(to_uuid, pkg, data_app_name, &users);
        }
        res
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_app(
        &self,
        from_uuid: Option<&str>,
        to_uuid: Option<&str>,
        pkg: &str,
        data_app_name: &str,
        appid: u32,
        seinfo: &str,
        users: &[u32],
    ) -> Result<()> {
        let deps = self.deps();
        let dirs = &deps.dirs;

        // Copy the code directory first.
        let from = paths::data_app_package_path(dirs, from_uuid, data_app_name)?;
        let to = paths::data_app_package_path(dirs, to_uuid, data_app_name)?;
        let to_parent = paths::data_app_path(dirs, to_uuid)?;
        self.run_cp(&from, &to_parent)?;
        deps.selinux
            .restorecon(&to, true)
            .with_context(|| format!("Failed to restorecon {}", to.display()))?;

        // Then private data for all known users.
        for &user in users {
            let from = paths::data_user_package_path(dirs, from_uuid, user, pkg)?;
            let to = paths::data_user_package_path(dirs, to_uuid, user, pkg)?;
            let to_parent = paths::data_user_path(dirs, to_uuid, user)?;

            // Data source may not exist for all users; that's okay.
            if !from.exists() {
                info!("Missing source {}", from.display());
                continue;
            }

            let to_de_parent = paths::data_user_de_path(dirs, to_uuid, user)?;
            for user_root in [&to_parent, &to_de_parent] {
                fsutil::prepare_dir(
                    user_root,
                    USER_DIR_MODE,
                    Uid::from_raw(AID_SYSTEM),
                    Gid::from_raw(AID_SYSTEM),
                )
                .with_context(|| format!("Failed to prepare user target {}", user_root.display()))?;
            }

            self.create_app_data(
                to_uuid,
                pkg,
                user,
                StorageFlags::CE | StorageFlags::DE,
                appid,
                seinfo,
            )
            .with_context(|| format!("Failed to create package target {}", to.display()))?;

            self.run_cp(&from, &to_parent)?;

            self.restorecon_app_data(
                to_uuid,
                pkg,
                user,
                StorageFlags::CE | StorageFlags::DE,
                appid,
                seinfo,
            )
            .context("Failed to restorecon")?;
        }

        Ok(())
    }

    /// Recursive copy through the system `cp`: delete any existing
    /// destination entry first, preserve attributes, never follow or
    /// dereference symlinks.
    fn run_cp(&self, from: &Path, to_parent: &Path) -> Result<()> {
        let cp = self.deps().dirs.system_bin.join("cp");
        debug!("Copying {} to {}", from.display(), to_parent.display());
        let status = Command::new(&cp)
            .arg("-F") // delete any existing destination file first
            .arg("-p") // preserve timestamps, ownership, and permissions
            .arg("-R") // recurse into subdirectories
            .arg("-P") // do not follow symlinks
            .arg("-d") // don't dereference symlinks
            .arg(from)
            .arg(to_parent)
            .status()
            .with_context(|| format!("Failed to execute {}", cp.display()))?;
        ensure!(
            status.success(),
            "Failed copying {} to {}: {}",
            from.display(),
            to_parent.display(),
            status
        );
        Ok(())
    }

    /// Nuke everything the failed copy might already have written. The
    /// source is untouched.
    fn rollback_destination(
        &self,
        to_uuid: Option<&str>,
        pkg: &str,
        data_app_name: &str,
        users: &[u32],
    ) {
        let dirs = &self.deps().dirs;
        let mut targets = Vec::new();
        if let Ok(to) = paths::data_app_package_path(dirs, to_uuid, data_app_name) {
            targets.push(to);
        }
        for &user in users {
            if let Ok(to) = paths::data_user_package_path(dirs, to_uuid, user, pkg) {
                targets.push(to);
            }
        }
        for to in targets {
            if !to.exists() {
                continue;
            }
            if let Err(e) = fsutil::delete_dir_contents_and_dir(&to) {
                warn!("Failed to rollback {}: {:#}", to.display(), e);
            }
        }
    }
}
