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

//! System dependencies injected into the command core: the directory layout
//! of the device, the read-only property store, and SELinux labelling.
//! Production implementations talk to the real system; tests inject fakes.

use anyhow::Result;
use std::path::{Path, PathBuf};

/// Read-only view of the system property store.
pub trait PropertyStore: Send + Sync {
    /// The property's value, or `None` when unset or empty. Absence is never
    /// an error.
    fn get(&self, name: &str) -> Option<String>;

    /// Boolean reading of a property; an absent property yields `default`.
    fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.get(name) {
            Some(value) => value == "true",
            None => default,
        }
    }
}

/// SELinux labelling operations the daemon performs on behalf of the
/// package manager.
pub trait SeLinux: Send + Sync {
    /// Compute and set the file context of a freshly created app-data
    /// directory from `(pkg, seinfo, uid)`.
    fn setfilecon(&self, path: &Path, pkg: &str, seinfo: &str, uid: u32) -> Result<()>;

    /// Restore the file context of `path` (and its subtree when `recurse`)
    /// from the file-contexts configuration.
    fn restorecon(&self, path: &Path, recurse: bool) -> Result<()>;

    /// Recursively restore contexts of an app-data directory, deriving the
    /// label from `(seinfo, uid)`.
    fn restorecon_pkgdir(&self, path: &Path, seinfo: &str, uid: u32) -> Result<()>;
}

/// Filesystem roots the daemon derives every path from. Fixed on a device;
/// relocated wholesale under a temporary root in tests.
#[derive(Clone, Debug)]
pub struct Dirs {
    /// Internal data root (`/data`).
    pub data: PathBuf,
    /// Root under which adopted volumes are mounted (`/mnt/expand`).
    pub mnt_expand: PathBuf,
    /// Secure-container root (`/mnt/asec`).
    pub asec: PathBuf,
    /// System partition root (`/system`).
    pub system: PathBuf,
    /// Directory of per-package movefiles scripts.
    pub update_commands: PathBuf,
    /// Directory holding the helper executables (`cp`, `dex2oat`, ...).
    pub system_bin: PathBuf,
}

impl Default for Dirs {
    fn default() -> Self {
        Dirs {
            data: PathBuf::from("/data"),
            mnt_expand: PathBuf::from("/mnt/expand"),
            asec: PathBuf::from("/mnt/asec"),
            system: PathBuf::from("/system"),
            update_commands: PathBuf::from("/system/etc/updatecmds"),
            system_bin: PathBuf::from("/system/bin"),
        }
    }
}

/// The bundle of injected dependencies owned by the command core.
pub struct Deps {
    pub dirs: Dirs,
    pub props: Box<dyn PropertyStore>,
    pub selinux: Box<dyn SeLinux>,
}

#[cfg(target_os = "android")]
impl Deps {
    /// Dependencies wired to the real device: bionic properties, libselinux,
    /// the standard directory layout.
    pub fn system() -> Self {
        Deps {
            dirs: Dirs::default(),
            props: Box::new(android::SystemProperties),
            selinux: Box::new(android::NativeSeLinux),
        }
    }
}

#[cfg(target_os = "android")]
mod android {
    use super::{PropertyStore, SeLinux};
    use anyhow::{bail, Result};
    use std::ffi::CString;
    use std::os::raw::{c_char, c_int, c_uint};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    // PROP_VALUE_MAX from bionic's property contract.
    const PROP_VALUE_MAX: usize = 92;

    pub struct SystemProperties;

    impl PropertyStore for SystemProperties {
        fn get(&self, name: &str) -> Option<String> {
            let name = CString::new(name).ok()?;
            let mut value = [0u8; PROP_VALUE_MAX];
            // SAFETY: name is nul-terminated and value is PROP_VALUE_MAX
            // bytes, the size __system_property_get is specified against.
            let len = unsafe {
                libc::__system_property_get(name.as_ptr(), value.as_mut_ptr() as *mut c_char)
            };
            if len > 0 {
                Some(String::from_utf8_lossy(&value[..len as usize]).into_owned())
            } else {
                None
            }
        }
    }

    const SELINUX_ANDROID_RESTORECON_RECURSE: c_uint = 0x4;

    #[link(name = "selinux")]
    extern "C" {
        fn selinux_android_setfilecon(
            pathname: *const c_char,
            pkgname: *const c_char,
            seinfo: *const c_char,
            uid: libc::uid_t,
        ) -> c_int;
        fn selinux_android_restorecon(pathname: *const c_char, flags: c_uint) -> c_int;
        fn selinux_android_restorecon_pkgdir(
            pathname: *const c_char,
            seinfo: *const c_char,
            uid: libc::uid_t,
            flags: c_uint,
        ) -> c_int;
    }

    fn path_cstr(path: &Path) -> Result<CString> {
        Ok(CString::new(path.as_os_str().as_bytes())?)
    }

    pub struct NativeSeLinux;

    impl SeLinux for NativeSeLinux {
        fn setfilecon(&self, path: &Path, pkg: &str, seinfo: &str, uid: u32) -> Result<()> {
            let path = path_cstr(path)?;
            let pkg = CString::new(pkg)?;
            let seinfo = CString::new(seinfo)?;
            // SAFETY: all pointers reference nul-terminated strings that
            // outlive the call.
            let rc = unsafe {
                selinux_android_setfilecon(path.as_ptr(), pkg.as_ptr(), seinfo.as_ptr(), uid)
            };
            if rc < 0 {
                bail!("setfilecon failed: {}", std::io::Error::last_os_error());
            }
            Ok(())
        }

        fn restorecon(&self, path: &Path, recurse: bool) -> Result<()> {
            let path = path_cstr(path)?;
            let flags = if recurse { SELINUX_ANDROID_RESTORECON_RECURSE } else { 0 };
            // SAFETY: path is a nul-terminated string that outlives the call.
            let rc = unsafe { selinux_android_restorecon(path.as_ptr(), flags) };
            if rc != 0 {
                bail!("restorecon failed: {}", std::io::Error::last_os_error());
            }
            Ok(())
        }

        fn restorecon_pkgdir(&self, path: &Path, seinfo: &str, uid: u32) -> Result<()> {
            let path = path_cstr(path)?;
            let seinfo = CString::new(seinfo)?;
            // SAFETY: all pointers reference nul-terminated strings that
            // outlive the call.
            let rc = unsafe {
                selinux_android_restorecon_pkgdir(
                    path.as_ptr(),
                    seinfo.as_ptr(),
                    uid,
                    SELINUX_ANDROID_RESTORECON_RECURSE,
                )
            };
            if rc < 0 {
                bail!("restorecon_pkgdir failed: {}", std::io::Error::last_os_error());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use anyhow::bail;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeProperties {
        values: HashMap<String, String>,
    }

    impl FakeProperties {
        pub fn new<const N: usize>(pairs: [(&str, &str); N]) -> Self {
            FakeProperties {
                values: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            }
        }
    }

    impl PropertyStore for FakeProperties {
        fn get(&self, name: &str) -> Option<String> {
            self.values.get(name).cloned()
        }
    }

    /// Records every labelling request; optionally fails paths containing a
    /// marker substring.
    #[derive(Default)]
    pub struct FakeSeLinux {
        pub ops: Mutex<Vec<String>>,
        pub fail_marker: Option<String>,
    }

    impl FakeSeLinux {
        fn record(&self, op: String, path: &Path) -> Result<()> {
            self.ops.lock().unwrap().push(format!("{} {}", op, path.display()));
            if let Some(marker) = &self.fail_marker {
                if path.to_string_lossy().contains(marker.as_str()) {
                    bail!("injected selinux failure for {}", path.display());
                }
            }
            Ok(())
        }

        pub fn ops_containing(&self, needle: &str) -> usize {
            self.ops.lock().unwrap().iter().filter(|op| op.contains(needle)).count()
        }
    }

    impl SeLinux for FakeSeLinux {
        fn setfilecon(&self, path: &Path, pkg: &str, seinfo: &str, uid: u32) -> Result<()> {
            self.record(format!("setfilecon {} {} {}", pkg, seinfo, uid), path)
        }

        fn restorecon(&self, path: &Path, recurse: bool) -> Result<()> {
            self.record(format!("restorecon recurse={}", recurse), path)
        }

        fn restorecon_pkgdir(&self, path: &Path, seinfo: &str, uid: u32) -> Result<()> {
            self.record(format!("restorecon_pkgdir {} {}", seinfo, uid), path)
        }
    }

    /// A directory layout rooted inside a test directory, with the standard
    /// data roots pre-created.
    pub fn test_dirs(root: &Path) -> Dirs {
        let dirs = Dirs {
            data: root.join("data"),
            mnt_expand: root.join("mnt/expand"),
            asec: root.join("mnt/asec"),
            system: root.join("system"),
            update_commands: root.join("system/etc/updatecmds"),
            system_bin: root.join("system/bin"),
        };
        for dir in [
            &dirs.data,
            &dirs.mnt_expand,
            &dirs.asec,
            &dirs.system_bin,
            &dirs.update_commands,
        ] {
            fs::create_dir_all(dir).unwrap();
        }
        dirs
    }

    pub fn test_deps(root: &Path) -> Deps {
        Deps {
            dirs: test_dirs(root),
            props: Box::new(FakeProperties::default()),
            selinux: Box::new(FakeSeLinux::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeProperties;
    use super::*;

    #[test]
    fn get_bool_parses_true_only() {
        let props = FakeProperties::new([("a", "true"), ("b", "false"), ("c", "1")]);
        assert!(props.get_bool("a", false));
        assert!(!props.get_bool("b", true));
        assert!(!props.get_bool("c", false));
        assert!(props.get_bool("missing", true));
        assert!(!props.get_bool("missing", false));
    }
}
