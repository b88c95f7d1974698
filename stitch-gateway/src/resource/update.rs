//! Changes to the stored resource group.

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use super::BasePolicy;
use super::DefaultUpstream;
use super::PolicyDefinition;
use super::RemoteSchema;
use super::Resource;
use super::ResourceGroup;
use super::ResourceMetadata;
use super::SchemaResource;
use super::Upstream;
use super::UpstreamClientCredentials;
use super::repository::ResourceRepository;
use super::validation::validate_resource_group;
use crate::error::ResourceError;
use crate::error::ResourceErrors;
use crate::policy::PolicyCompilers;
use crate::policy::PolicyRegistry;
use crate::schema::GatewaySchema;

/// Resources to create or replace. Lists left out are not touched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceGroupUpdates {
    pub schemas: Option<Vec<SchemaResource>>,
    pub upstreams: Option<Vec<Upstream>>,
    pub upstream_client_credentials: Option<Vec<UpstreamClientCredentials>>,
    pub policies: Option<Vec<PolicyDefinition>>,
    pub base_policy: Option<BasePolicy>,
    pub remote_schemas: Option<Vec<RemoteSchema>>,
    pub default_upstream: Option<DefaultUpstream>,
}

/// Resources to remove, by metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceGroupDeletions {
    pub schemas: Option<Vec<ResourceMetadata>>,
    pub upstreams: Option<Vec<ResourceMetadata>>,
    pub upstream_client_credentials: Option<Vec<ResourceMetadata>>,
    pub policies: Option<Vec<ResourceMetadata>>,
    pub base_policy: bool,
    pub default_upstream: bool,
}

fn apply_resource_updates<R: Resource>(resources: &mut Vec<R>, updates: Option<Vec<R>>) {
    for update in updates.into_iter().flatten() {
        match resources
            .iter_mut()
            .find(|existing| existing.metadata() == update.metadata())
        {
            Some(existing) => *existing = update,
            None => resources.push(update),
        }
    }
}

fn apply_resource_deletions<R: Resource>(
    resources: &mut Vec<R>,
    deletions: Option<&[ResourceMetadata]>,
) {
    if let Some(deletions) = deletions {
        resources.retain(|resource| !deletions.contains(resource.metadata()));
    }
}

/// Upserts resources by `(namespace, name)`. Replaced resources keep their position, new ones are
/// appended.
pub fn apply_resource_group_updates(
    mut group: ResourceGroup,
    updates: ResourceGroupUpdates,
) -> ResourceGroup {
    apply_resource_updates(&mut group.schemas, updates.schemas);
    apply_resource_updates(&mut group.upstreams, updates.upstreams);
    apply_resource_updates(
        &mut group.upstream_client_credentials,
        updates.upstream_client_credentials,
    );
    apply_resource_updates(&mut group.policies, updates.policies);
    for remote in updates.remote_schemas.into_iter().flatten() {
        match group.remote_schemas.iter_mut().find(|r| r.url == remote.url) {
            Some(existing) => *existing = remote,
            None => group.remote_schemas.push(remote),
        }
    }
    if let Some(base_policy) = updates.base_policy {
        group.base_policy = Some(base_policy);
    }
    if let Some(default_upstream) = updates.default_upstream {
        group.default_upstream = Some(default_upstream);
    }
    group
}

pub fn apply_resource_group_deletions(
    mut group: ResourceGroup,
    deletions: &ResourceGroupDeletions,
) -> ResourceGroup {
    apply_resource_deletions(&mut group.schemas, deletions.schemas.as_deref());
    apply_resource_deletions(&mut group.upstreams, deletions.upstreams.as_deref());
    apply_resource_deletions(
        &mut group.upstream_client_credentials,
        deletions.upstream_client_credentials.as_deref(),
    );
    apply_resource_deletions(&mut group.policies, deletions.policies.as_deref());
    if deletions.base_policy {
        group.base_policy = None;
    }
    if deletions.default_upstream {
        group.default_upstream = None;
    }
    group
}

/// Checks that `group` can be served: names and upstreams, policy compilation and argument
/// types, then a full schema build.
pub fn validate_resource_group_update(
    group: &ResourceGroup,
    compilers: &PolicyCompilers,
) -> Result<(), ResourceError> {
    validate_resource_group(group)?;
    let (_, mut errors) = PolicyRegistry::build(group, compilers);
    match errors.len() {
        0 => {}
        1 => return Err(errors.remove(0)),
        _ => return Err(ResourceError::Validation(ResourceErrors(errors))),
    }
    GatewaySchema::build(group.clone(), compilers)?;
    Ok(())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Validate without writing.
    pub dry_run: bool,
}

/// Applies changes to the stored group one at a time.
///
/// Each change reads the latest group, applies itself, validates the result and writes it back
/// while holding a process wide lock, so concurrent changes queue and each sees the previous.
#[derive(Debug)]
pub struct ResourceUpdater {
    repository: Arc<dyn ResourceRepository>,
    compilers: PolicyCompilers,
    lock: tokio::sync::Mutex<()>,
}

impl ResourceUpdater {
    pub fn new(repository: Arc<dyn ResourceRepository>, compilers: PolicyCompilers) -> Self {
        Self {
            repository,
            compilers,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn update(
        &self,
        updates: ResourceGroupUpdates,
        options: UpdateOptions,
    ) -> Result<ResourceGroup, ResourceError> {
        self.apply(|group| apply_resource_group_updates(group, updates), options)
            .await
    }

    pub async fn delete(
        &self,
        deletions: ResourceGroupDeletions,
        options: UpdateOptions,
    ) -> Result<ResourceGroup, ResourceError> {
        self.apply(
            |group| apply_resource_group_deletions(group, &deletions),
            options,
        )
        .await
    }

    async fn apply(
        &self,
        change: impl FnOnce(ResourceGroup) -> ResourceGroup,
        options: UpdateOptions,
    ) -> Result<ResourceGroup, ResourceError> {
        let _guard = self.lock.lock().await;
        let latest = self.repository.fetch_latest().await?.resource_group;
        let group = change(latest);
        if let Err(error) = validate_resource_group_update(&group, &self.compilers) {
            tracing::info!(code = error.code(), %error, "resource group update rejected");
            return Err(error);
        }
        if !options.dry_run {
            self.repository.update(&group).await?;
            tracing::info!(fingerprint = %group.fingerprint(), "resource group updated");
        }
        Ok(group)
    }
}
