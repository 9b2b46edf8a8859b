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

//! Generation of resource-overlay idmaps. The daemon creates the output
//! file under the resource cache (named by flattening the overlay's path),
//! then forks a child that drops to the app's uid, locks the output, and
//! execs the idmap tool with the output fd.

use anyhow::{bail, Context, Result};
use log::debug;
use nix::fcntl::{flock, open, FlockArg, OFlag};
use nix::sys::stat::{fchmod, Mode};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execv, fchown, fork, setgid, setuid, ForkResult, Gid, Uid};
use std::ffi::CString;
use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::exit;

use crate::dexopt::cstring_argv;
use crate::paths;
use crate::{Installd, AID_SYSTEM};

const IDMAP_SUFFIX: &str = "@idmap";

impl Installd {
    /// Build the idmap for `(target_apk, overlay_apk)` into the resource
    /// cache, owned by `(AID_SYSTEM, uid)` and world-readable. The idmap
    /// tool itself runs as `uid`. On failure nothing remains.
    pub fn idmap(&self, target_apk: &str, overlay_apk: &str, uid: u32) -> Result<()> {
        debug!("idmap target_apk={} overlay_apk={} uid={}", target_apk, overlay_apk, uid);
        let dirs = &self.deps().dirs;

        let prefix = format!("{}/resource-cache/", dirs.data.display());
        let idmap_path = PathBuf::from(
            paths::flatten_path(&prefix, IDMAP_SUFFIX, overlay_apk)
                .with_context(|| format!("Cannot derive idmap path for {}", overlay_apk))?,
        );

        let _ = fs::remove_file(&idmap_path);
        let idmap_fd = open(
            &idmap_path,
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::from_bits_truncate(0o644),
        )
        .map(|fd| {
            // SAFETY: freshly returned by open and owned by nobody else.
            unsafe { OwnedFd::from_raw_fd(fd) }
        })
        .with_context(|| format!("Cannot open {} for output", idmap_path.display()))?;

        let res = (|| -> Result<()> {
            fchown(idmap_fd.as_raw_fd(), Some(Uid::from_raw(AID_SYSTEM)), Some(Gid::from_raw(uid)))
                .with_context(|| format!("Cannot chown {}", idmap_path.display()))?;
            fchmod(idmap_fd.as_raw_fd(), Mode::from_bits_truncate(0o644))
                .with_context(|| format!("Cannot chmod {}", idmap_path.display()))?;

            // Built before forking; the child must not allocate.
            let bin = self.deps().dirs.system_bin.join("idmap");
            let args = idmap_args(&bin, target_apk, overlay_apk, idmap_fd.as_raw_fd());
            let (bin, argv) = cstring_argv(&bin, &args)?;

            // SAFETY: the child only runs the exec_idmap drop-and-exec
            // sequence, then exits.
            match unsafe { fork() }.context("Failed to fork idmap child")? {
                ForkResult::Child => exec_idmap(uid, idmap_fd.as_raw_fd(), &bin, &argv),
                ForkResult::Parent { child } => match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, 0)) => Ok(()),
                    Ok(status) => bail!("idmap failed: {:?}", status),
                    Err(e) => Err(e).context("Failed to wait for idmap child"),
                },
            }
        })();

        drop(idmap_fd);
        if res.is_err() {
            let _ = fs::remove_file(&idmap_path);
        }
        res
    }
}

/// Drop to the app's uid, lock the output, exec the idmap tool. Runs in the
/// forked child; never returns.
fn exec_idmap(uid: u32, idmap_fd: RawFd, bin: &CString, argv: &[CString]) -> ! {
    if setgid(Gid::from_raw(uid)).is_err() {
        exit(1);
    }
    if setuid(Uid::from_raw(uid)).is_err() {
        exit(1);
    }
    if flock(idmap_fd, FlockArg::LockExclusiveNonblock).is_err() {
        exit(1);
    }
    let _ = execv(bin, argv);
    exit(1);
}

/// The idmap argument vector: `idmap --fd <target> <overlay> <fd>`.
fn idmap_args(bin: &Path, target_apk: &str, overlay_apk: &str, idmap_fd: RawFd) -> Vec<String> {
    vec![
        bin.to_string_lossy().into_owned(),
        "--fd".to_string(),
        target_apk.to_string(),
        overlay_apk.to_string(),
        idmap_fd.to_string(),
    ]
}
