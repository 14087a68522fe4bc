use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use lucidcoder_schema::{ProjectInfo, ProjectPorts};
use serde::{Deserialize, Serialize};

use crate::ProjectStore;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProjectsFile {
    #[serde(default)]
    projects: Vec<ProjectInfo>,
}

/// Project metadata kept in `projects.yaml`, re-read on every call so edits
/// made by other tools are picked up.
#[derive(Debug, Clone)]
pub struct YamlProjectStore {
    path: PathBuf,
}

impl YamlProjectStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<root>/projects.yaml`.
    pub fn in_root(root: &Path) -> Self {
        Self::new(root.join("projects.yaml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<ProjectsFile> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(ProjectsFile::default()),
            Ok(raw) => serde_yaml::from_str(&raw)
                .with_context(|| format!("invalid yaml: {}", self.path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ProjectsFile::default()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read {}", self.path.display()))
            }
        }
    }

    async fn save(&self, file: &ProjectsFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = serde_yaml::to_string(file)?;
        let tmp = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    pub async fn list_projects(&self) -> Result<Vec<ProjectInfo>> {
        Ok(self.load().await?.projects)
    }
}

#[async_trait]
impl ProjectStore for YamlProjectStore {
    async fn get_project(&self, id: &str) -> Result<Option<ProjectInfo>> {
        let id = id.trim();
        Ok(self
            .load()
            .await?
            .projects
            .into_iter()
            .find(|project| project.id.trim() == id))
    }

    async fn update_project_ports(&self, id: &str, ports: ProjectPorts) -> Result<()> {
        let id = id.trim();
        let mut file = self.load().await?;
        let project = file
            .projects
            .iter_mut()
            .find(|project| project.id.trim() == id)
            .with_context(|| format!("unknown project: {id}"))?;
        if ports.frontend.is_some() {
            project.frontend_port = ports.frontend;
        }
        if ports.backend.is_some() {
            project.backend_port = ports.backend;
        }
        self.save(&file).await?;
        tracing::debug!(project_id = id, ?ports, "persisted project ports");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"
projects:
  - id: "12"
    path: /work/todo
    frontend_port: 5173
    frontend_framework: react
  - id: "99"
    path: /work/shop
"#;

    #[tokio::test]
    async fn missing_file_has_no_projects() {
        let dir = tempfile::tempdir().unwrap();
        let store = YamlProjectStore::in_root(dir.path());
        assert!(store.get_project("12").await.unwrap().is_none());
        assert!(store.list_projects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reads_projects_by_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("projects.yaml"), FIXTURE).unwrap();
        let store = YamlProjectStore::in_root(dir.path());

        let project = store.get_project(" 12 ").await.unwrap().unwrap();
        assert_eq!(project.path, "/work/todo");
        assert_eq!(project.frontend_port, Some(5173));
        assert_eq!(project.frontend_framework.as_deref(), Some("react"));
    }

    #[tokio::test]
    async fn updates_only_provided_ports() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("projects.yaml"), FIXTURE).unwrap();
        let store = YamlProjectStore::in_root(dir.path());

        store
            .update_project_ports(
                "12",
                ProjectPorts {
                    frontend: None,
                    backend: Some(5500),
                },
            )
            .await
            .unwrap();

        let project = store.get_project("12").await.unwrap().unwrap();
        assert_eq!(project.frontend_port, Some(5173));
        assert_eq!(project.backend_port, Some(5500));
        assert!(!dir.path().join("projects.yaml.tmp").exists());
    }

    #[tokio::test]
    async fn updating_unknown_project_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("projects.yaml"), FIXTURE).unwrap();
        let store = YamlProjectStore::in_root(dir.path());
        let err = store
            .update_project_ports("404", ProjectPorts::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown project"));
    }
}
