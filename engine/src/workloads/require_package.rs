//! `RequirePackage`: assert that a workload package is installed

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::component::{Component, RunContext};
use crate::error::{DependencyError, Result};
use crate::packages::PackageStore;
use crate::profile::ProfileElement;

/// Parameters: `PackageName`, optional `RequiredFiles` (comma-separated,
/// relative to the package's platform directory)
#[derive(Debug, Clone)]
pub struct RequirePackage {
    package: String,
    required_files: Vec<String>,
}

impl RequirePackage {
    pub fn from_element(element: &ProfileElement) -> Result<Self> {
        let parameters = &element.parameters;
        let required_files = parameters
            .get_optional_string("RequiredFiles")
            .map(|files| {
                files
                    .split(',')
                    .map(str::trim)
                    .filter(|file| !file.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self { package: parameters.get_string("PackageName")?, required_files })
    }
}

#[async_trait]
impl Component for RequirePackage {
    async fn execute(&mut self, context: &RunContext, _cancel: &CancellationToken) -> Result<()> {
        let root = context.packages.get_platform_path(&self.package)?;

        for file in &self.required_files {
            let path = PackageStore::combine(&root, &[file.as_str()]);
            if !path.exists() {
                return Err(DependencyError::FileNotFound { path: path.to_string_lossy().to_string() }.into());
            }
        }

        info!(package = %self.package, path = %root.display(), "Package present");
        Ok(())
    }
}
