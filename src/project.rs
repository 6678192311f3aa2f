use std::path::{Path, PathBuf};
use uuid::Uuid;

/// On-disk layout of projects handled by this compute.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, project_id: &Uuid) -> PathBuf {
        self.root.join(project_id.to_string())
    }

    pub fn capture_dir(&self, project_id: &Uuid) -> PathBuf {
        self.project_dir(project_id).join("project-files").join("captures")
    }

    /// Capture directory for a project, created on first use.
    pub async fn capture_working_directory(&self, project_id: &Uuid) -> std::io::Result<PathBuf> {
        let dir = self.capture_dir(project_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}
