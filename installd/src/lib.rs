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

//! Command core of the privileged storage daemon backing the package
//! manager. The daemon owns the mutations the package manager cannot perform
//! itself: per-app private data directories across users and storage volumes
//! (with SELinux labelling and uid/gid ownership), ahead-of-time compilation
//! of application bytecode through a privilege-dropping child compiler, and
//! best-effort cache reclamation.
//!
//! The RPC dispatcher in front of these commands is a separate process
//! concern; commands here are synchronous, one at a time, and either complete
//! or roll back whatever they had already touched.

pub mod appdata;
pub mod cache;
pub mod deps;
pub mod dexopt;
pub mod idmap;
pub mod move_app;
pub mod movefiles;
pub mod paths;
pub mod size;

use bitflags::bitflags;

use crate::deps::Deps;

/// uid owning system services and the OAT artifacts they produce.
pub const AID_SYSTEM: u32 = 1000;
/// gid of the install daemon group, co-owner of OAT directories.
pub const AID_INSTALL: u32 = 1012;
/// Catch-all gid used for the shared per-user config directories.
pub const AID_EVERYBODY: u32 = 9997;
/// Offset between the uid ranges of consecutive users.
pub const AID_USER: u32 = 100_000;

/// Upper bound on any path the daemon constructs. Concatenations are checked
/// against this before use rather than assumed to fit.
pub const PKG_PATH_MAX: usize = 1024;
/// Upper bound on a package name.
pub const PKG_NAME_MAX: usize = 128;

bitflags! {
    /// Storage classes a command operates on, plus the clear-scope
    /// refinements accepted by `clear_app_data`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StorageFlags: u32 {
        /// Credential-encrypted storage, available after user unlock.
        const CE = 1 << 0;
        /// Device-encrypted storage, available from early boot.
        const DE = 1 << 1;
        /// Restrict `clear_app_data` to the `cache/` subtree.
        const CLEAR_CACHE_ONLY = 1 << 8;
        /// Restrict `clear_app_data` to the `code_cache/` subtree.
        const CLEAR_CODE_CACHE_ONLY = 1 << 9;
    }
}

bitflags! {
    /// Per-invocation dexopt options.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DexoptFlags: u32 {
        /// Make the OAT output world-readable.
        const PUBLIC = 1 << 1;
        /// The VM is in safe mode; compile for interpretation only.
        const SAFEMODE = 1 << 2;
        /// Produce a debuggable image.
        const DEBUGGABLE = 1 << 3;
        /// Boot has completed; the compiler runs at background priority and
        /// reads the post-boot thread-count property.
        const BOOTCOMPLETE = 1 << 4;
        /// The runtime will JIT; only verify ahead of time.
        const USEJIT = 1 << 5;
    }
}

/// Derive the per-user uid for an app: user 10 + appid 10123 -> 1010123.
pub fn multiuser_get_uid(user: u32, appid: u32) -> u32 {
    user * AID_USER + (appid % AID_USER)
}

/// The command core. One instance per daemon process; commands are invoked
/// one at a time by the dispatcher.
pub struct Installd {
    deps: Deps,
}

impl Installd {
    pub fn new(deps: Deps) -> Self {
        Installd { deps }
    }

    pub(crate) fn deps(&self) -> &Deps {
        &self.deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiuser_uid_derivation() {
        assert_eq!(multiuser_get_uid(0, 10123), 10123);
        assert_eq!(multiuser_get_uid(10, 10123), 1_010_123);
        // appid is taken modulo the per-user range
        assert_eq!(multiuser_get_uid(1, 100_001), 100_001);
    }
}
