//! Where resource groups are stored.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::RwLock;

use super::PolicyAttachments;
use super::ResourceGroup;
use crate::error::ResourceError;

/// The outcome of [`ResourceRepository::fetch_latest`].
#[derive(Clone, Debug)]
pub struct FetchLatestResult {
    /// Whether the group changed since the previous fetch from the same repository.
    pub is_new: bool,
    pub resource_group: ResourceGroup,
}

/// Storage of the resource group document.
#[async_trait::async_trait]
pub trait ResourceRepository: Send + Sync + fmt::Debug {
    /// Reads the stored group, policy attachments included.
    async fn fetch_latest(&self) -> Result<FetchLatestResult, ResourceError>;

    /// Replaces the stored group.
    async fn update(&self, resource_group: &ResourceGroup) -> Result<(), ResourceError>;
}

/// Remembers the fingerprint of the last fetched group.
#[derive(Debug, Default)]
struct LastFetched(Mutex<Option<String>>);

impl LastFetched {
    fn is_new(&self, group: &ResourceGroup) -> bool {
        let fingerprint = group.fingerprint();
        let mut last = self.0.lock();
        let is_new = last.as_deref() != Some(fingerprint.as_str());
        *last = Some(fingerprint);
        is_new
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FileFormat {
    Json,
    Yaml,
}

impl FileFormat {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|extension| extension.to_str()) {
            Some("yaml" | "yml") => FileFormat::Yaml,
            _ => FileFormat::Json,
        }
    }
}

/// A resource group kept in one JSON or YAML file.
///
/// A missing file reads as an empty group. Policy modules cannot be stored in the file and are
/// attached with [`FileSystemResourceRepository::with_policy_attachments`].
pub struct FileSystemResourceRepository {
    path: PathBuf,
    format: FileFormat,
    policy_attachments: PolicyAttachments,
    last_fetched: LastFetched,
}

impl fmt::Debug for FileSystemResourceRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystemResourceRepository")
            .field("path", &self.path)
            .field("format", &self.format)
            .field(
                "policy_attachments",
                &self.policy_attachments.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl FileSystemResourceRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            format: FileFormat::of(&path),
            path,
            policy_attachments: PolicyAttachments::new(),
            last_fetched: LastFetched::default(),
        }
    }

    pub fn with_policy_attachments(mut self, policy_attachments: PolicyAttachments) -> Self {
        self.policy_attachments = policy_attachments;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<ResourceGroup, ResourceError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "resource file not found, serving an empty group");
                return Ok(ResourceGroup::default());
            }
            Err(error) => return Err(ResourceError::repository(error)),
        };
        if content.trim().is_empty() {
            return Ok(ResourceGroup::default());
        }
        match self.format {
            FileFormat::Json => serde_json::from_str(&content).map_err(ResourceError::repository),
            FileFormat::Yaml => serde_yaml::from_str(&content).map_err(ResourceError::repository),
        }
    }
}

#[async_trait::async_trait]
impl ResourceRepository for FileSystemResourceRepository {
    async fn fetch_latest(&self) -> Result<FetchLatestResult, ResourceError> {
        let mut resource_group = self.read().await?;
        let is_new = self.last_fetched.is_new(&resource_group);
        resource_group.policy_attachments = self.policy_attachments.clone();
        Ok(FetchLatestResult {
            is_new,
            resource_group,
        })
    }

    async fn update(&self, resource_group: &ResourceGroup) -> Result<(), ResourceError> {
        let content = match self.format {
            FileFormat::Json => {
                serde_json::to_string_pretty(resource_group).map_err(ResourceError::repository)?
            }
            FileFormat::Yaml => {
                serde_yaml::to_string(resource_group).map_err(ResourceError::repository)?
            }
        };
        tokio::fs::write(&self.path, content)
            .await
            .map_err(ResourceError::repository)?;
        tracing::debug!(path = %self.path.display(), "resource group written");
        Ok(())
    }
}

/// A resource group held in memory. Clones share the group.
#[derive(Clone, Debug, Default)]
pub struct InMemoryResourceRepository {
    group: Arc<RwLock<ResourceGroup>>,
    last_fetched: Arc<LastFetched>,
}

impl InMemoryResourceRepository {
    pub fn new(group: ResourceGroup) -> Self {
        Self {
            group: Arc::new(RwLock::new(group)),
            last_fetched: Default::default(),
        }
    }
}

#[async_trait::async_trait]
impl ResourceRepository for InMemoryResourceRepository {
    async fn fetch_latest(&self) -> Result<FetchLatestResult, ResourceError> {
        let resource_group = self.group.read().clone();
        Ok(FetchLatestResult {
            is_new: self.last_fetched.is_new(&resource_group),
            resource_group,
        })
    }

    async fn update(&self, resource_group: &ResourceGroup) -> Result<(), ResourceError> {
        let mut group = self.group.write();
        let policy_attachments = std::mem::take(&mut group.policy_attachments);
        *group = resource_group.clone();
        // Attachments live next to the document, an update only adds to them.
        for (key, module) in policy_attachments {
            group.policy_attachments.entry(key).or_insert(module);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::resource::tests::resource_group_json;

    #[tokio::test]
    async fn file_repository_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resources.json");
        std::fs::write(&path, resource_group_json().to_string()).unwrap();
        let repository = FileSystemResourceRepository::new(&path);

        let first = repository.fetch_latest().await.unwrap();
        assert!(first.is_new);
        assert_eq!(first.resource_group.schemas.len(), 1);

        let second = repository.fetch_latest().await.unwrap();
        assert!(!second.is_new);

        let mut group = second.resource_group;
        group.schemas.clear();
        repository.update(&group).await.unwrap();
        let third = repository.fetch_latest().await.unwrap();
        assert!(third.is_new);
        assert!(third.resource_group.schemas.is_empty());
    }

    #[tokio::test]
    async fn file_repository_reads_yaml_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = FileSystemResourceRepository::new(dir.path().join("missing.json"));
        assert_eq!(
            missing.fetch_latest().await.unwrap().resource_group,
            ResourceGroup::default()
        );

        let path = dir.path().join("resources.yaml");
        std::fs::write(
            &path,
            "schemas:\n  - metadata: {namespace: ns, name: a}\n    schema: \"type Query { a: String }\"\n",
        )
        .unwrap();
        let repository = FileSystemResourceRepository::new(&path);
        let group = repository.fetch_latest().await.unwrap().resource_group;
        assert_eq!(group.schemas[0].schema, "type Query { a: String }");

        repository.update(&group).await.unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("schemas:"));
    }

    #[tokio::test]
    async fn invalid_file_is_a_repository_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resources.json");
        std::fs::write(&path, "{ not json").unwrap();
        let error = FileSystemResourceRepository::new(&path)
            .fetch_latest()
            .await
            .unwrap_err();
        assert_eq!(error.code(), "RESOURCE_REPOSITORY_FAILURE");
    }

    #[tokio::test]
    async fn in_memory_repository_shares_updates() {
        let repository = InMemoryResourceRepository::default();
        let clone = repository.clone();
        assert!(repository.fetch_latest().await.unwrap().is_new);
        assert!(!clone.fetch_latest().await.unwrap().is_new);

        let group: ResourceGroup = serde_json::from_value(resource_group_json()).unwrap();
        clone.update(&group).await.unwrap();
        let latest = repository.fetch_latest().await.unwrap();
        assert!(latest.is_new);
        assert_eq!(latest.resource_group, group);
    }
}
