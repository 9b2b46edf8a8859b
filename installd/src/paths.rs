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

//! Deterministic construction of every path the daemon touches, and the
//! validators every caller-supplied path must pass before the first
//! filesystem call. Paths are computed, never persisted.

use anyhow::{bail, ensure, Result};
use std::path::{Component, Path, PathBuf};

use crate::deps::Dirs;
use crate::{PKG_NAME_MAX, PKG_PATH_MAX};

/// Subdirectory of the data root holding per-package code directories.
const APP_SUBDIR: &str = "app";
/// Credential-encrypted per-user data, under the data root.
const USER_SUBDIR: &str = "user";
/// Device-encrypted per-user data, under the data root.
const USER_DE_SUBDIR: &str = "user_de";
/// Per-user external-media trees, under the data root.
const MEDIA_SUBDIR: &str = "media";
const MISC_SUBDIR: &str = "misc";
const DALVIK_CACHE_SUBDIR: &str = "dalvik-cache";
/// Marker present in a dalvik-cache ISA directory until first boot finishes.
pub const BOOT_MARKER_NAME: &str = ".booting";

pub const CACHE_DIR_NAME: &str = "cache";
pub const CODE_CACHE_DIR_NAME: &str = "code_cache";
pub const LIB_DIR_NAME: &str = "lib";

/// Data root of a volume: the internal data partition for `None`, an adopted
/// volume's mount point otherwise.
pub fn data_path(dirs: &Dirs, uuid: Option<&str>) -> Result<PathBuf> {
    match uuid {
        None => Ok(dirs.data.clone()),
        Some(uuid) => {
            validate_volume_uuid(uuid)?;
            Ok(dirs.mnt_expand.join(uuid))
        }
    }
}

pub fn data_app_path(dirs: &Dirs, uuid: Option<&str>) -> Result<PathBuf> {
    Ok(data_path(dirs, uuid)?.join(APP_SUBDIR))
}

/// `<volume>/app/<dir_name>`, the code directory of one installed package.
pub fn data_app_package_path(dirs: &Dirs, uuid: Option<&str>, dir_name: &str) -> Result<PathBuf> {
    validate_package_name(dir_name)?;
    Ok(data_app_path(dirs, uuid)?.join(dir_name))
}

/// Root of a user's credential-encrypted data on a volume.
pub fn data_user_path(dirs: &Dirs, uuid: Option<&str>, user: u32) -> Result<PathBuf> {
    Ok(data_path(dirs, uuid)?.join(USER_SUBDIR).join(user.to_string()))
}

/// Root of a user's device-encrypted data on a volume.
pub fn data_user_de_path(dirs: &Dirs, uuid: Option<&str>, user: u32) -> Result<PathBuf> {
    Ok(data_path(dirs, uuid)?.join(USER_DE_SUBDIR).join(user.to_string()))
}

pub fn data_user_package_path(
    dirs: &Dirs,
    uuid: Option<&str>,
    user: u32,
    pkg: &str,
) -> Result<PathBuf> {
    validate_package_name(pkg)?;
    Ok(data_user_path(dirs, uuid, user)?.join(pkg))
}

pub fn data_user_de_package_path(
    dirs: &Dirs,
    uuid: Option<&str>,
    user: u32,
    pkg: &str,
) -> Result<PathBuf> {
    validate_package_name(pkg)?;
    Ok(data_user_de_path(dirs, uuid, user)?.join(pkg))
}

/// Root of all users' media trees on a volume.
pub fn data_media_root(dirs: &Dirs, uuid: Option<&str>) -> Result<PathBuf> {
    Ok(data_path(dirs, uuid)?.join(MEDIA_SUBDIR))
}

pub fn data_media_path(dirs: &Dirs, uuid: Option<&str>, user: u32) -> Result<PathBuf> {
    Ok(data_media_root(dirs, uuid)?.join(user.to_string()))
}

/// Per-ISA compiled-code cache; internal storage only.
pub fn dalvik_cache_path(dirs: &Dirs, isa: &str) -> Result<PathBuf> {
    validate_isa(isa)?;
    Ok(dirs.data.join(DALVIK_CACHE_SUBDIR).join(isa))
}

pub fn boot_marker_path(dirs: &Dirs, isa: &str) -> Result<PathBuf> {
    Ok(dalvik_cache_path(dirs, isa)?.join(BOOT_MARKER_NAME))
}

/// Per-user config directory; internal storage only.
pub fn user_config_path(dirs: &Dirs, user: u32) -> PathBuf {
    dirs.data.join(MISC_SUBDIR).join(USER_SUBDIR).join(user.to_string())
}

/// The flat dalvik-cache output path for an APK: the APK's absolute path with
/// `/` escaped to `@`, suffixed with `@classes.dex`, inside the per-ISA cache
/// directory.
pub fn cache_oat_path(dirs: &Dirs, apk_path: &str, isa: &str) -> Result<PathBuf> {
    ensure!(apk_path.starts_with('/') && apk_path.len() >= 2, "Bad apk path {}", apk_path);
    let escaped = format!("{}@classes.dex", apk_path[1..].replace('/', "@"));
    let path = dalvik_cache_path(dirs, isa)?.join(escaped);
    ensure!(
        path.as_os_str().len() < PKG_PATH_MAX,
        "Cache path too long for {}",
        apk_path
    );
    Ok(path)
}

/// `<oat_dir>/<isa>/<apk stem>.odex`, the OAT output inside a package-local
/// oat directory.
pub fn oat_file_path(oat_dir: &Path, apk_path: &str, isa: &str) -> Result<PathBuf> {
    validate_isa(isa)?;
    let stem = apk_stem(apk_path)?;
    let path = oat_dir.join(isa).join(format!("{}.odex", stem));
    ensure!(path.as_os_str().len() < PKG_PATH_MAX, "Oat path too long for {}", apk_path);
    Ok(path)
}

/// `<apk dir>/oat/<isa>/<apk stem>.odex`, the precompiled odex shipped next
/// to an APK.
pub fn odex_file_path(apk_path: &str, isa: &str) -> Result<PathBuf> {
    validate_isa(isa)?;
    let parent = Path::new(apk_path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| anyhow::anyhow!("Bad apk path {}", apk_path))?;
    let stem = apk_stem(apk_path)?;
    let path = parent.join("oat").join(isa).join(format!("{}.odex", stem));
    ensure!(path.as_os_str().len() < PKG_PATH_MAX, "Odex path too long for {}", apk_path);
    Ok(path)
}

fn apk_stem(apk_path: &str) -> Result<&str> {
    let name = apk_path.rsplit('/').next().unwrap_or(apk_path);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => Ok(stem),
        _ => bail!("Apk filename has no extension: {}", apk_path),
    }
}

/// Flatten an absolute path into a single filename: `/a/b/c.apk` becomes
/// `<prefix>a@b@c.apk<suffix>`. Used for idmap outputs.
pub fn flatten_path(prefix: &str, suffix: &str, path: &str) -> Result<String> {
    ensure!(path.len() >= 2 && path.starts_with('/'), "Path to flatten must be absolute: {}", path);
    let total = prefix
        .len()
        .checked_add(path.len())
        .and_then(|n| n.checked_add(suffix.len()))
        .ok_or_else(|| anyhow::anyhow!("Flattened path length overflows"))?;
    ensure!(total < PKG_PATH_MAX, "Flattened path too long: {}", path);
    Ok(format!("{}{}{}", prefix, path[1..].replace('/', "@"), suffix))
}

/// A package (or package-directory) name usable as a single path component.
pub fn validate_package_name(name: &str) -> Result<()> {
    ensure!(!name.is_empty(), "Empty package name");
    ensure!(name.len() < PKG_NAME_MAX, "Package name too long: {}", name);
    ensure!(!name.starts_with('.'), "Package name may not start with '.': {}", name);
    ensure!(
        name.bytes().all(|b| b.is_ascii_alphanumeric() || b"._-".contains(&b)),
        "Invalid character in package name: {}",
        name
    );
    ensure!(!name.contains(".."), "Package name may not contain '..': {}", name);
    Ok(())
}

fn validate_volume_uuid(uuid: &str) -> Result<()> {
    ensure!(!uuid.is_empty(), "Empty volume uuid");
    ensure!(
        uuid.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-'),
        "Invalid character in volume uuid: {}",
        uuid
    );
    Ok(())
}

fn validate_isa(isa: &str) -> Result<()> {
    ensure!(
        !isa.is_empty() && isa.len() < 16 && isa.bytes().all(|b| b.is_ascii_alphanumeric()),
        "Invalid instruction set: {}",
        isa
    );
    Ok(())
}

/// How deep below an accepted prefix a validated path may reach.
const APK_PATH_MAX_DEPTH: usize = 2;

/// Accept an APK (or oat-dir) path directly under an app directory:
/// the per-volume app roots or the secure-container root, at most
/// [`APK_PATH_MAX_DEPTH`] components below the root.
pub fn validate_apk_path(dirs: &Dirs, path: &str) -> Result<()> {
    validate_path_under_app_roots(dirs, path, APK_PATH_MAX_DEPTH)
}

/// Accept a path anywhere inside an app directory, e.g. a native library
/// buried in a staging tree.
pub fn validate_apk_path_subdirs(dirs: &Dirs, path: &str) -> Result<()> {
    validate_path_under_app_roots(dirs, path, usize::MAX)
}

/// Accept a preinstalled APK under the system partition's app directories.
pub fn validate_system_app_path(dirs: &Dirs, path: &str) -> Result<()> {
    let path = sane_absolute(path)?;
    for root in [dirs.system.join("app"), dirs.system.join("priv-app")] {
        if path.strip_prefix(&root).is_ok_and(|rest| !rest.as_os_str().is_empty()) {
            return Ok(());
        }
    }
    bail!("Path has bad prefix: {}", path.display());
}

fn validate_path_under_app_roots(dirs: &Dirs, path: &str, max_depth: usize) -> Result<()> {
    let path = sane_absolute(path)?;
    let mut roots = vec![
        dirs.data.join(APP_SUBDIR),
        dirs.data.join("app-private"),
        dirs.asec.clone(),
    ];
    // Adopted volumes keep their app directories under the expand root.
    if let Ok(rest) = path.strip_prefix(&dirs.mnt_expand) {
        if let Some(Component::Normal(uuid)) = rest.components().next() {
            roots.push(dirs.mnt_expand.join(uuid).join(APP_SUBDIR));
        }
    }
    for root in roots {
        if let Ok(rest) = path.strip_prefix(&root) {
            let depth = rest.components().count();
            ensure!(depth >= 1, "Path is a bare app root: {}", path.display());
            ensure!(depth <= max_depth, "Path nests too deeply: {}", path.display());
            return Ok(());
        }
    }
    bail!("Path has bad prefix: {}", path.display());
}

/// Reject relative paths, oversized paths, and any `.`/`..` component.
fn sane_absolute(path: &str) -> Result<&Path> {
    ensure!(path.len() < PKG_PATH_MAX, "Path too long");
    let p = Path::new(path);
    ensure!(p.is_absolute(), "Path is not absolute: {}", path);
    ensure!(
        p.components().all(|c| matches!(c, Component::RootDir | Component::Normal(_))),
        "Path contains dot segments: {}",
        path
    );
    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::testing::test_dirs;

    fn dirs() -> (tempfile::TempDir, Dirs) {
        let temp = tempfile::TempDir::new().unwrap();
        let dirs = test_dirs(temp.path());
        (temp, dirs)
    }

    fn device_dirs() -> Dirs {
        Dirs::default()
    }

    #[test]
    fn user_package_paths() {
        let dirs = device_dirs();
        assert_eq!(
            data_user_package_path(&dirs, None, 10, "com.x").unwrap(),
            Path::new("/data/user/10/com.x")
        );
        assert_eq!(
            data_user_de_package_path(&dirs, None, 10, "com.x").unwrap(),
            Path::new("/data/user_de/10/com.x")
        );
        assert_eq!(
            data_user_package_path(&dirs, Some("57f8f4bc"), 0, "com.x").unwrap(),
            Path::new("/mnt/expand/57f8f4bc/user/0/com.x")
        );
    }

    #[test]
    fn package_name_validation() {
        assert!(validate_package_name("com.example.app").is_ok());
        assert!(validate_package_name("com.example-1").is_ok());
        assert!(validate_package_name("..").is_err());
        assert!(validate_package_name(".hidden").is_err());
        assert!(validate_package_name("a/b").is_err());
        assert!(validate_package_name("").is_err());
        assert!(validate_package_name(&"x".repeat(PKG_NAME_MAX)).is_err());
    }

    #[test]
    fn volume_uuid_validation() {
        let dirs = device_dirs();
        assert!(data_path(&dirs, Some("57f8f4bc-abcd")).is_ok());
        assert!(data_path(&dirs, Some("../evil")).is_err());
        assert!(data_path(&dirs, Some("")).is_err());
    }

    #[test]
    fn cache_oat_path_escapes_slashes() {
        let dirs = device_dirs();
        assert_eq!(
            cache_oat_path(&dirs, "/data/app/a.apk", "arm64").unwrap(),
            Path::new("/data/dalvik-cache/arm64/data@app@a.apk@classes.dex")
        );
    }

    #[test]
    fn cache_oat_path_rejects_oversize() {
        let dirs = device_dirs();
        let long = format!("/data/app/{}.apk", "a".repeat(PKG_PATH_MAX));
        assert!(cache_oat_path(&dirs, &long, "arm64").is_err());
    }

    #[test]
    fn oat_output_paths() {
        assert_eq!(
            oat_file_path(Path::new("/data/app/com.x-1/oat"), "/data/app/com.x-1/base.apk", "arm")
                .unwrap(),
            Path::new("/data/app/com.x-1/oat/arm/base.odex")
        );
        assert_eq!(
            odex_file_path("/data/app/com.x-1/base.apk", "arm").unwrap(),
            Path::new("/data/app/com.x-1/oat/arm/base.odex")
        );
        assert!(oat_file_path(Path::new("/data/app/x/oat"), "/data/app/x/noext", "arm").is_err());
    }

    #[test]
    fn flatten_path_escapes_and_wraps() {
        assert_eq!(
            flatten_path("/data/resource-cache/", "@idmap", "/a/b/c.apk").unwrap(),
            "/data/resource-cache/a@b@c.apk@idmap"
        );
        assert_eq!(
            flatten_path("/data/resource-cache/", "@idmap", "/vendor/overlay/O.apk").unwrap(),
            "/data/resource-cache/vendor@overlay@O.apk@idmap"
        );
    }

    #[test]
    fn flatten_path_rejects_bad_input() {
        assert!(flatten_path("p/", "@s", "relative/path.apk").is_err());
        assert!(flatten_path("p/", "@s", "/").is_err());
        let long = format!("/{}", "a".repeat(PKG_PATH_MAX));
        assert!(flatten_path("p/", "@s", &long).is_err());
    }

    #[test]
    fn apk_path_validation() {
        let dirs = device_dirs();
        assert!(validate_apk_path(&dirs, "/data/app/com.x-1/base.apk").is_ok());
        assert!(validate_apk_path(&dirs, "/data/app/legacy.apk").is_ok());
        assert!(validate_apk_path(&dirs, "/mnt/asec/com.x-1/base.apk").is_ok());
        assert!(validate_apk_path(&dirs, "/mnt/expand/uuid/app/com.x-1/base.apk").is_ok());

        // bad prefixes
        assert!(validate_apk_path(&dirs, "/data/appfoo/base.apk").is_err());
        assert!(validate_apk_path(&dirs, "/sdcard/base.apk").is_err());
        // escape attempts and depth
        assert!(validate_apk_path(&dirs, "/data/app/../system/evil.apk").is_err());
        assert!(validate_apk_path(&dirs, "/data/app/a/b/c/base.apk").is_err());
        assert!(validate_apk_path(&dirs, "/data/app").is_err());
        // relative
        assert!(validate_apk_path(&dirs, "data/app/x.apk").is_err());

        // the subdir variant accepts nested paths but still no dot segments
        assert!(validate_apk_path_subdirs(&dirs, "/data/app/a/lib/arm/libfoo.so").is_ok());
        assert!(validate_apk_path_subdirs(&dirs, "/data/app/a/../../etc").is_err());
    }

    #[test]
    fn system_app_path_validation() {
        let dirs = device_dirs();
        assert!(validate_system_app_path(&dirs, "/system/app/T.apk").is_ok());
        assert!(validate_system_app_path(&dirs, "/system/priv-app/T/T.apk").is_ok());
        assert!(validate_system_app_path(&dirs, "/data/app/T.apk").is_err());
    }

    #[test]
    fn dalvik_cache_paths_follow_isa() {
        let dirs = device_dirs();
        assert_eq!(
            boot_marker_path(&dirs, "arm64").unwrap(),
            Path::new("/data/dalvik-cache/arm64/.booting")
        );
        assert!(dalvik_cache_path(&dirs, "arm/../evil").is_err());
    }

    #[test]
    fn test_layout_paths_stay_under_root() {
        let (_temp, dirs) = dirs();
        let p = data_user_package_path(&dirs, None, 0, "com.x").unwrap();
        assert!(p.starts_with(&dirs.data));
    }
}
