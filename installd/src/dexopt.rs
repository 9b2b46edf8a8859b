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

//! Orchestration of ahead-of-time compilation. The parent prepares every
//! file descriptor (input, output, optional swap, optional per-user
//! profiles), forks, and waits; the child drops to the app's uid, zeroes its
//! capabilities, locks the output, and execs the compiler. A failed child
//! leaves no output behind.

use anyhow::{anyhow, bail, ensure, Context, Result};
use log::{debug, error, warn};
use nix::errno::Errno;
use nix::fcntl::{flock, open, openat, FlockArg, OFlag};
use nix::sys::stat::{fchmod, utimes, Mode};
use nix::sys::time::TimeVal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execv, fchown, fork, setgid, setuid, ForkResult, Gid, Uid};
use std::ffi::CString;
use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::exit;
use thiserror::Error;

use crate::deps::PropertyStore;
use crate::paths::{self, CODE_CACHE_DIR_NAME};
use crate::{Installd, DexoptFlags, AID_INSTALL, AID_SYSTEM, PKG_PATH_MAX};

/// What kind of work the compiler child has to do, and therefore which input
/// it reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DexoptNeeded {
    /// Full compilation; the input is the APK itself.
    Dex2oatNeeded,
    /// Relocate the precompiled odex shipped alongside the APK.
    PatchoatNeeded,
    /// Re-relocate a previously produced output in place.
    SelfPatchoatNeeded,
}

/// Why the compiler child failed, reconstructed from its exit status. The
/// pre-exec sequence exits with a distinct code per step so the parent can
/// tell a privilege-drop failure from a compiler failure.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ChildFailure {
    #[error("child could not setgid")]
    SetgidFailed,
    #[error("child could not setuid")]
    SetuidFailed,
    #[error("child could not drop capabilities")]
    CapsetFailed,
    #[error("child could not lock its output")]
    FlockFailed,
    #[error("child could not exec the compiler")]
    ExecFailed,
    #[error("child could not enter background scheduling")]
    SchedPolicyFailed,
    #[error("child could not lower its priority")]
    PriorityFailed,
    #[error("compiler exited with status {0}")]
    CompilerStatus(i32),
    #[error("compiler killed by a signal")]
    Signalled,
}

const EXIT_SETGID_FAILED: i32 = 64;
const EXIT_SETUID_FAILED: i32 = 65;
const EXIT_CAPSET_FAILED: i32 = 66;
const EXIT_FLOCK_FAILED: i32 = 67;
const EXIT_EXEC_FAILED: i32 = 68;
const EXIT_SCHED_POLICY_FAILED: i32 = 70;
const EXIT_PRIORITY_FAILED: i32 = 71;

impl ChildFailure {
    fn from_exit(code: i32) -> ChildFailure {
        match code {
            EXIT_SETGID_FAILED => ChildFailure::SetgidFailed,
            EXIT_SETUID_FAILED => ChildFailure::SetuidFailed,
            EXIT_CAPSET_FAILED => ChildFailure::CapsetFailed,
            EXIT_FLOCK_FAILED => ChildFailure::FlockFailed,
            EXIT_EXEC_FAILED => ChildFailure::ExecFailed,
            EXIT_SCHED_POLICY_FAILED => ChildFailure::SchedPolicyFailed,
            EXIT_PRIORITY_FAILED => ChildFailure::PriorityFailed,
            other => ChildFailure::CompilerStatus(other),
        }
    }
}

const PROFILE_EXTENSION: &str = ".prof";
const REFERENCE_PROFILE_EXTENSION: &str = ".prof.ref";

/// ANDROID_PRIORITY_BACKGROUND.
const BACKGROUND_PRIORITY: libc::c_int = 10;

/// Compile-time swap policy. The override forces a swap file everywhere;
/// the default applies when the swap property is unset.
const ALWAYS_PROVIDE_SWAP_FILE: bool = false;
const DEFAULT_PROVIDE_SWAP_FILE: bool = true;

/// Current (app-written) and reference (compiler-merged) profile fds for one
/// user, inherited by the compiler child.
struct ProfilePair {
    current: OwnedFd,
    reference: OwnedFd,
}

/// Everything the dex2oat argument builder needs to know beyond properties.
struct Dex2oatInvocation<'a> {
    zip_fd: RawFd,
    zip_location: &'a str,
    oat_fd: RawFd,
    oat_location: &'a str,
    instruction_set: &'a str,
    swap_fd: Option<RawFd>,
    safe_mode: bool,
    debuggable: bool,
    post_bootcomplete: bool,
    use_jit: bool,
    profile_fds: &'a [(RawFd, RawFd)],
}

impl Installd {
    /// Produce (or refresh) the OAT artifact for `apk_path` on
    /// `instruction_set`. See [`DexoptNeeded`] for input selection. On
    /// success the output carries the input's atime/mtime, mode 0644 or 0640
    /// per the PUBLIC flag, and owner `(AID_SYSTEM, uid)`. On failure no
    /// output remains.
    #[allow(clippy::too_many_arguments)]
    pub fn dexopt(
        &self,
        apk_path: &str,
        uid: u32,
        pkg: &str,
        instruction_set: &str,
        dexopt_needed: DexoptNeeded,
        oat_dir: Option<&str>,
        flags: DexoptFlags,
        volume_uuid: Option<&str>,
        use_profiles: bool,
    ) -> Result<()> {
        let dirs = &self.deps().dirs;

        let profiles = if use_profiles {
            let profiles = self.open_profile_files(volume_uuid, uid, pkg);
            if profiles.is_empty() {
                // No profiles, so no profile-guided compilation to do.
                debug!("Skipping profile-guided dexopt of {}: no profiles", apk_path);
                return Ok(());
            }
            profiles
        } else {
            Vec::new()
        };

        // Best-effort early check that the output name and its ".swap"
        // sibling will fit the path length limit.
        ensure!(apk_path.len() < PKG_PATH_MAX - 8, "apk_path too long: {}", apk_path);

        let out_path = match oat_dir {
            Some(oat_dir) => {
                paths::validate_apk_path(dirs, oat_dir)
                    .with_context(|| format!("invalid oat_dir {}", oat_dir))?;
                paths::oat_file_path(Path::new(oat_dir), apk_path, instruction_set)?
            }
            None => paths::cache_oat_path(dirs, apk_path, instruction_set)?,
        };

        let input_file = match dexopt_needed {
            DexoptNeeded::Dex2oatNeeded => PathBuf::from(apk_path),
            DexoptNeeded::PatchoatNeeded => paths::odex_file_path(apk_path, instruction_set)?,
            DexoptNeeded::SelfPatchoatNeeded => out_path.clone(),
        };

        // Stat the input before the output is unlinked: when self-patching,
        // they are the same path and the old artifact's timestamps are the
        // ones to preserve.
        let input_stat = fs::metadata(&input_file)
            .with_context(|| format!("Cannot stat {}", input_file.display()))?;

        let input_fd = open(&input_file, OFlag::O_RDONLY, Mode::empty())
            .map(|fd| {
                // SAFETY: freshly returned by open and owned by nobody else.
                unsafe { OwnedFd::from_raw_fd(fd) }
            })
            .with_context(|| format!("Cannot open {} for input", input_file.display()))?;

        let _ = fs::remove_file(&out_path);
        let out_fd = open(
            &out_path,
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::from_bits_truncate(0o644),
        )
        .map(|fd| {
            // SAFETY: freshly returned by open and owned by nobody else.
            unsafe { OwnedFd::from_raw_fd(fd) }
        })
        .with_context(|| format!("Cannot open {} for output", out_path.display()))?;

        let res = self.run_dexopt_child(
            uid,
            instruction_set,
            dexopt_needed,
            flags,
            &input_file,
            &input_stat,
            input_fd.as_raw_fd(),
            &out_path,
            out_fd.as_raw_fd(),
            &profiles,
        );

        // Fds close on every path; the output survives only on success.
        drop(input_fd);
        drop(out_fd);
        drop(profiles);
        if res.is_err() {
            let _ = fs::remove_file(&out_path);
        }
        res
    }

    /// Everything between output creation and the wait verdict. Failing
    /// anywhere here makes the caller unlink the output.
    #[allow(clippy::too_many_arguments)]
    fn run_dexopt_child(
        &self,
        uid: u32,
        instruction_set: &str,
        dexopt_needed: DexoptNeeded,
        flags: DexoptFlags,
        input_file: &Path,
        input_stat: &fs::Metadata,
        input_fd: RawFd,
        out_path: &Path,
        out_fd: RawFd,
        profiles: &[ProfilePair],
    ) -> Result<()> {
        let is_public = flags.contains(DexoptFlags::PUBLIC);

        let out_mode = 0o640 | if is_public { 0o004 } else { 0 };
        fchmod(out_fd, Mode::from_bits_truncate(out_mode))
            .with_context(|| format!("Cannot chmod {}", out_path.display()))?;
        fchown(out_fd, Some(Uid::from_raw(AID_SYSTEM)), Some(Gid::from_raw(uid)))
            .with_context(|| format!("Cannot chown {}", out_path.display()))?;

        let swap_fd = if should_use_swap_file(self.deps().props.as_ref()) {
            create_swap_file(out_path)
        } else {
            None
        };

        // Build the compiler argv before forking; the child must not
        // allocate between fork and exec.
        let (bin, args) = match dexopt_needed {
            DexoptNeeded::Dex2oatNeeded => {
                let bin = self.deps().dirs.system_bin.join("dex2oat");
                let profile_fds: Vec<(RawFd, RawFd)> = profiles
                    .iter()
                    .map(|p| (p.current.as_raw_fd(), p.reference.as_raw_fd()))
                    .collect();
                let zip_location = input_file.to_string_lossy();
                let oat_location = out_path.to_string_lossy();
                let invocation = Dex2oatInvocation {
                    zip_fd: input_fd,
                    zip_location: &zip_location,
                    oat_fd: out_fd,
                    oat_location: &oat_location,
                    instruction_set,
                    swap_fd: swap_fd.as_ref().map(|fd| fd.as_raw_fd()),
                    safe_mode: flags.contains(DexoptFlags::SAFEMODE),
                    debuggable: flags.contains(DexoptFlags::DEBUGGABLE),
                    post_bootcomplete: flags.contains(DexoptFlags::BOOTCOMPLETE),
                    use_jit: flags.contains(DexoptFlags::USEJIT),
                    profile_fds: &profile_fds,
                };
                let args = dex2oat_args(&bin, &invocation, self.deps().props.as_ref());
                (bin, args)
            }
            DexoptNeeded::PatchoatNeeded | DexoptNeeded::SelfPatchoatNeeded => {
                let bin = self.deps().dirs.system_bin.join("patchoat");
                let args = patchoat_args(&bin, input_fd, out_fd, instruction_set);
                (bin, args)
            }
        };
        let (bin, argv) = cstring_argv(&bin, &args)?;

        debug!("DexInv: --- BEGIN {} ---", input_file.display());

        // SAFETY: the child only runs the async-signal-safe privilege drop
        // and exec sequence, then exits.
        match unsafe { fork() }.context("Failed to fork compiler child")? {
            ForkResult::Child => drop_privileges_and_exec(
                uid,
                flags.contains(DexoptFlags::BOOTCOMPLETE),
                out_fd,
                &bin,
                &argv,
            ),
            ForkResult::Parent { child } => {
                let res = match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, 0)) => Ok(()),
                    Ok(WaitStatus::Exited(_, code)) => Err(anyhow!(ChildFailure::from_exit(code))),
                    Ok(WaitStatus::Signaled(_, signal, _)) => {
                        Err(anyhow!(ChildFailure::Signalled).context(format!("signal {}", signal)))
                    }
                    Ok(status) => Err(anyhow!("Unexpected wait status {:?}", status)),
                    Err(e) => Err(e).context("Failed to wait for compiler child"),
                };
                match res {
                    Ok(()) => {
                        debug!("DexInv: --- END {} (success) ---", input_file.display());
                        // The output stands in for the input, so it keeps the
                        // input's timestamps.
                        let atime = TimeVal::new(input_stat.atime(), input_stat.atime_nsec() / 1000);
                        let mtime = TimeVal::new(input_stat.mtime(), input_stat.mtime_nsec() / 1000);
                        if let Err(e) = utimes(out_path, &atime, &mtime) {
                            warn!("Cannot copy timestamps onto {}: {}", out_path.display(), e);
                        }
                        Ok(())
                    }
                    Err(e) => {
                        error!("DexInv: --- END {} --- failed: {:#}", input_file.display(), e);
                        Err(e)
                    }
                }
            }
        }
    }

    /// For each known user on the volume, open the app's current and
    /// reference profiles out of its code cache. A user contributes a pair
    /// only when both fds could be obtained.
    fn open_profile_files(&self, uuid: Option<&str>, uid: u32, pkg: &str) -> Vec<ProfilePair> {
        let mut pairs = Vec::new();
        for user in self.known_users(uuid) {
            let code_cache = match paths::data_user_package_path(&self.deps().dirs, uuid, user, pkg)
            {
                Ok(pkg_dir) => pkg_dir.join(CODE_CACHE_DIR_NAME),
                Err(_) => continue,
            };
            let dir_fd = match open(
                &code_cache,
                OFlag::O_PATH | OFlag::O_CLOEXEC | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW,
                Mode::empty(),
            ) {
                // SAFETY: freshly returned by open and owned by nobody else.
                Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
                Err(Errno::ENOENT) => continue,
                Err(e) => {
                    error!("Failed to open code_cache {}: {}", code_cache.display(), e);
                    continue;
                }
            };
            if let Some(pair) = open_profile_pair(dir_fd.as_raw_fd(), uid, pkg) {
                pairs.push(pair);
            }
        }
        pairs
    }

    /// Prepare a package-local oat directory and its per-ISA subdirectory.
    pub fn create_oat_dir(&self, oat_dir: &str, instruction_set: &str) -> Result<()> {
        let deps = self.deps();
        paths::validate_apk_path(&deps.dirs, oat_dir)?;
        let oat_dir = Path::new(oat_dir);
        fsutil::prepare_dir(oat_dir, 0o775, Uid::from_raw(AID_SYSTEM), Gid::from_raw(AID_INSTALL))
            .with_context(|| format!("Failed to prepare {}", oat_dir.display()))?;
        deps.selinux
            .restorecon(oat_dir, false)
            .with_context(|| format!("Cannot restorecon {}", oat_dir.display()))?;
        let isa_dir = oat_dir.join(instruction_set);
        fsutil::prepare_dir(&isa_dir, 0o775, Uid::from_raw(AID_SYSTEM), Gid::from_raw(AID_INSTALL))
            .with_context(|| format!("Failed to prepare {}", isa_dir.display()))
    }

    /// Unlink the cached OAT artifact of an APK.
    pub fn rm_dex(&self, apk_path: &str, instruction_set: &str) -> Result<()> {
        let dirs = &self.deps().dirs;
        if paths::validate_apk_path(dirs, apk_path).is_err()
            && paths::validate_system_app_path(dirs, apk_path).is_err()
        {
            bail!("invalid apk path {} (bad prefix)", apk_path);
        }
        let dex_path = paths::cache_oat_path(dirs, apk_path, instruction_set)?;
        debug!("unlink {}", dex_path.display());
        fs::remove_file(&dex_path)
            .with_context(|| format!("Couldn't unlink {}", dex_path.display()))
    }

    /// First boot is over: clear the dalvik-cache marker for the ISA.
    pub fn mark_boot_complete(&self, instruction_set: &str) -> Result<()> {
        let marker = paths::boot_marker_path(&self.deps().dirs, instruction_set)?;
        fs::remove_file(&marker)
            .with_context(|| format!("Unable to unlink boot marker {}", marker.display()))
    }
}

/// Open `<pkg>.prof` (which must already exist) and `<pkg>.prof.ref`
/// (created on demand and handed to the app uid) inside an open code-cache
/// directory.
fn open_profile_pair(dir_fd: RawFd, uid: u32, pkg: &str) -> Option<ProfilePair> {
    // Read-write: the compiler folds the current profile into the reference
    // profile as it consumes it.
    let current = match openat(
        dir_fd,
        format!("{}{}", pkg, PROFILE_EXTENSION).as_str(),
        OFlag::O_RDWR | OFlag::O_NOFOLLOW,
        Mode::empty(),
    ) {
        // SAFETY: freshly returned by openat and owned by nobody else.
        Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
        // No profile recorded for this user; nothing to compile from.
        Err(Errno::ENOENT) => return None,
        Err(e) => {
            error!("Failed to open profile file for {}: {}", pkg, e);
            return None;
        }
    };
    let reference = match openat(
        dir_fd,
        format!("{}{}", pkg, REFERENCE_PROFILE_EXTENSION).as_str(),
        OFlag::O_CREAT | OFlag::O_RDWR | OFlag::O_NOFOLLOW,
        Mode::from_bits_truncate(0o600),
    ) {
        // SAFETY: freshly returned by openat and owned by nobody else.
        Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
        Err(e) => {
            error!("Failed to open reference profile for {}: {}", pkg, e);
            return None;
        }
    };
    if let Err(e) = fchown(reference.as_raw_fd(), Some(Uid::from_raw(uid)), Some(Gid::from_raw(uid)))
    {
        error!("Cannot change reference profile owner for {}: {}", pkg, e);
        return None;
    }
    Some(ProfilePair { current, reference })
}

/// Whether dexopt should hand the compiler a swap file: forced by the
/// build-time override, else decided by the swap property, else by the
/// build-time default, else by the low-RAM property.
fn should_use_swap_file(props: &dyn PropertyStore) -> bool {
    if ALWAYS_PROVIDE_SWAP_FILE {
        return true;
    }
    if let Some(value) = props.get("dalvik.vm.dex2oat-swap") {
        return value == "true";
    }
    if DEFAULT_PROVIDE_SWAP_FILE {
        return true;
    }
    props.get_bool("ro.config.low_ram", false)
}

/// Create `<out_path>.swap` and immediately unlink it, keeping only the fd,
/// so no durable file wears the flash. Any failure means compiling without
/// swap.
fn create_swap_file(out_path: &Path) -> Option<OwnedFd> {
    if out_path.as_os_str().len() + ".swap".len() >= PKG_PATH_MAX {
        warn!("No room for a swap file path next to {}", out_path.display());
        return None;
    }
    let mut swap_path = out_path.as_os_str().to_os_string();
    swap_path.push(".swap");
    let swap_path = PathBuf::from(swap_path);
    let _ = fs::remove_file(&swap_path);
    match open(
        &swap_path,
        OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
        Mode::from_bits_truncate(0o600),
    ) {
        Ok(fd) => {
            // SAFETY: freshly returned by open and owned by nobody else.
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            if let Err(e) = fs::remove_file(&swap_path) {
                warn!("Cannot unlink swap file {}: {}", swap_path.display(), e);
            }
            Some(fd)
        }
        Err(e) => {
            warn!("Could not create swap file {}: {}", swap_path.display(), e);
            None
        }
    }
}

/// Zero every capability set of the current process. Allocation-free so it
/// is safe between fork and exec.
fn drop_capabilities() -> nix::Result<()> {
    #[repr(C)]
    struct CapUserHeader {
        version: u32,
        pid: libc::c_int,
    }
    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    struct CapUserData {
        effective: u32,
        permitted: u32,
        inheritable: u32,
    }
    const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

    let header = CapUserHeader { version: LINUX_CAPABILITY_VERSION_3, pid: 0 };
    let data = [CapUserData::default(); 2];
    // SAFETY: header and data outlive the call and match the layout capset
    // expects for version 3.
    let rc = unsafe { libc::syscall(libc::SYS_capset, &header, data.as_ptr()) };
    if rc < 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// The dex2oat argument vector: the fixed fd/location set, then whatever the
/// properties and flags call for.
fn dex2oat_args(bin: &Path, inv: &Dex2oatInvocation, props: &dyn PropertyStore) -> Vec<String> {
    let mut args = vec![
        bin.to_string_lossy().into_owned(),
        format!("--zip-fd={}", inv.zip_fd),
        format!("--zip-location={}", inv.zip_location),
        format!("--oat-fd={}", inv.oat_fd),
        format!("--oat-location={}", inv.oat_location),
        format!("--instruction-set={}", inv.instruction_set),
    ];

    if let Some(variant) = props.get(&format!("dalvik.vm.isa.{}.variant", inv.instruction_set)) {
        args.push(format!("--instruction-set-variant={}", variant));
    }
    if let Some(features) = props.get(&format!("dalvik.vm.isa.{}.features", inv.instruction_set)) {
        args.push(format!("--instruction-set-features={}", features));
    }
    if let Some(xms) = props.get("dalvik.vm.dex2oat-Xms") {
        args.push("--runtime-arg".to_string());
        args.push(format!("-Xms{}", xms));
    }
    if let Some(xmx) = props.get("dalvik.vm.dex2oat-Xmx") {
        args.push("--runtime-arg".to_string());
        args.push(format!("-Xmx{}", xmx));
    }

    // If we are booting without the real /data, don't spend time compiling.
    let skip_compilation = matches!(
        props.get("vold.decrypt").as_deref(),
        Some("trigger_restart_min_framework") | Some("1")
    );
    let use_jit = inv.use_jit || props.get_bool("debug.usejit", false);
    if skip_compilation {
        args.push("--compiler-filter=verify-none".to_string());
    } else if inv.safe_mode {
        args.push("--compiler-filter=interpret-only".to_string());
    } else if use_jit {
        args.push("--compiler-filter=verify-at-runtime".to_string());
    } else if let Some(filter) = props.get("dalvik.vm.dex2oat-filter") {
        args.push(format!("--compiler-filter={}", filter));
    }

    let threads_prop = if inv.post_bootcomplete {
        "dalvik.vm.dex2oat-threads"
    } else {
        "dalvik.vm.boot-dex2oat-threads"
    };
    if let Some(threads) = props.get(threads_prop) {
        args.push(format!("-j{}", threads));
    }

    if let Some(swap_fd) = inv.swap_fd {
        args.push(format!("--swap-fd={}", swap_fd));
    }
    if props.get_bool("debug.generate-debug-info", false) {
        args.push("--generate-debug-info".to_string());
    }
    let debuggable = inv.debuggable
        || props.get("dalvik.vm.always_debuggable").as_deref() == Some("1");
    if debuggable {
        args.push("--debuggable".to_string());
    }
    // Extra flags come late so they can override the computed ones when
    // debugging.
    if let Some(extra) = props.get("dalvik.vm.dex2oat-flags") {
        args.extend(extra.split_whitespace().map(str::to_string));
    }
    if skip_compilation {
        args.push("--runtime-arg".to_string());
        args.push("-Xnorelocate".to_string());
    }
    for (profile_fd, reference_fd) in inv.profile_fds {
        args.push(format!("--profile-file-fd={}", profile_fd));
        args.push(format!("--reference-profile-file-fd={}", reference_fd));
    }
    args
}

/// The patchoat argument vector. The parent already holds the output lock,
/// hence `--no-lock-output`.
fn patchoat_args(bin: &Path, input_fd: RawFd, oat_fd: RawFd, instruction_set: &str) -> Vec<String> {
    vec![
        bin.to_string_lossy().into_owned(),
        "--patched-image-location=/system/framework/boot.art".to_string(),
        "--no-lock-output".to_string(),
        format!("--instruction-set={}", instruction_set),
        format!("--output-oat-fd={}", oat_fd),
        format!("--input-oat-fd={}", input_fd),
    ]
}

/// Convert an executable path and argv into the nul-terminated form execv
/// wants. Done in the parent: the child must not allocate.
pub(crate) fn cstring_argv(bin: &Path, args: &[String]) -> Result<(CString, Vec<CString>)> {
    use std::os::unix::ffi::OsStrExt;
    let bin = CString::new(bin.as_os_str().as_bytes()).context("Executable path contains NUL")?;
    let argv = args
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .context("Argument contains NUL")?;
    Ok((bin, argv))
}

/// The security-critical child sequence, in the mandated order: drop gid and
/// uid, zero every capability set, optionally move to background scheduling,
/// take the output lock, exec. Every failure exits with its own code so the
/// parent can diagnose; never returns.
fn drop_privileges_and_exec(
    uid: u32,
    to_background: bool,
    out_fd: RawFd,
    bin: &CString,
    argv: &[CString],
) -> ! {
    if setgid(Gid::from_raw(uid)).is_err() {
        exit(EXIT_SETGID_FAILED);
    }
    if setuid(Uid::from_raw(uid)).is_err() {
        exit(EXIT_SETUID_FAILED);
    }
    if drop_capabilities().is_err() {
        exit(EXIT_CAPSET_FAILED);
    }
    if to_background {
        // Post-boot compilation must not compete with the foreground.
        let param = libc::sched_param { sched_priority: 0 };
        // SAFETY: operates on the current process with a valid param.
        if unsafe { libc::sched_setscheduler(0, libc::SCHED_BATCH, &param) } < 0 {
            exit(EXIT_SCHED_POLICY_FAILED);
        }
        // SAFETY: operates on the current process.
        if unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, BACKGROUND_PRIORITY) } < 0 {
            exit(EXIT_PRIORITY_FAILED);
        }
    }
    if flock(out_fd, FlockArg::LockExclusiveNonblock).is_err() {
        exit(EXIT_FLOCK_FAILED);
    }
    let _ = execv(bin, argv);
    exit(EXIT_EXEC_FAILED);
}
