//! Installed workload packages
//!
//! Packages are installed out of band; the store only resolves them to
//! absolute paths and reports missing ones as dependency errors.

use std::path::{Path, PathBuf};

use crate::error::{DependencyError, Result};

#[derive(Debug, Clone)]
pub struct PackageStore {
    packages_dir: PathBuf,
}

impl PackageStore {
    pub fn new<P: AsRef<Path>>(packages_dir: P) -> Self {
        Self { packages_dir: packages_dir.as_ref().to_path_buf() }
    }

    pub fn packages_dir(&self) -> &Path {
        &self.packages_dir
    }

    /// Platform identifier used for platform-specific package subdirectories
    pub fn platform() -> String {
        let os = match std::env::consts::OS {
            "macos" => "osx",
            "windows" => "win",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "x64",
            "aarch64" => "arm64",
            other => other,
        };
        format!("{}-{}", os, arch)
    }

    pub fn has_package(&self, name: &str) -> bool {
        self.packages_dir.join(name.to_lowercase()).is_dir() || self.packages_dir.join(name).is_dir()
    }

    /// Absolute path of an installed package
    pub fn get_package_path(&self, name: &str) -> Result<PathBuf> {
        [self.packages_dir.join(name), self.packages_dir.join(name.to_lowercase())]
            .into_iter()
            .find(|path| path.is_dir())
            .ok_or_else(|| {
                DependencyError::PackageNotFound {
                    name: name.to_string(),
                    path: self.packages_dir.join(name).to_string_lossy().to_string(),
                }
                .into()
            })
    }

    /// The `<platform>` subdirectory of a package when present, else the package root
    pub fn get_platform_path(&self, name: &str) -> Result<PathBuf> {
        let root = self.get_package_path(name)?;
        let platform = root.join(Self::platform());
        Ok(if platform.is_dir() { platform } else { root })
    }

    /// Join path segments with the platform separator
    pub fn combine<P: AsRef<Path>>(base: P, segments: &[&str]) -> PathBuf {
        segments.iter().fold(base.as_ref().to_path_buf(), |path, segment| path.join(segment))
    }
}
