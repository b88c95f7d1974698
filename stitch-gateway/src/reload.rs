//! Periodic refresh of the served schema from its resource repository.
//!
//! Requests load the current [`GatewaySchema`] once and keep it for their whole execution, so a
//! swap never affects a request in flight. A group that fails to build leaves the previous
//! snapshot in place.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::error::ResourceError;
use crate::policy::PolicyCompilers;
use crate::resource::ResourceRepository;
use crate::schema::GatewaySchema;
use crate::schema::SchemaOptions;

/// What a refresh did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Unchanged,
    /// A new snapshot is served, built from the group with this fingerprint.
    Swapped(String),
}

pub struct SchemaRefresher {
    repository: Arc<dyn ResourceRepository>,
    compilers: PolicyCompilers,
    options: SchemaOptions,
    current: Arc<ArcSwap<GatewaySchema>>,
}

impl SchemaRefresher {
    /// Fetches the latest group and builds the first snapshot. Fails when that build does.
    pub async fn new(
        repository: Arc<dyn ResourceRepository>,
        compilers: PolicyCompilers,
        options: SchemaOptions,
    ) -> Result<Self, ResourceError> {
        let latest = repository.fetch_latest().await?;
        let schema =
            GatewaySchema::build_with_options(latest.resource_group, &compilers, options.clone())?;
        tracing::info!(fingerprint = schema.fingerprint(), "serving resource group");
        Ok(Self {
            repository,
            compilers,
            options,
            current: Arc::new(ArcSwap::from_pointee(schema)),
        })
    }

    /// The snapshot served right now.
    pub fn current(&self) -> Arc<GatewaySchema> {
        self.current.load_full()
    }

    /// Rebuilds the snapshot if the stored group differs from the one served.
    /// `is_new` is ignored, other readers of the repository consume it.
    pub async fn refresh_once(&self) -> Result<RefreshOutcome, ResourceError> {
        let latest = self.repository.fetch_latest().await?;
        let fingerprint = latest.resource_group.fingerprint();
        if fingerprint == self.current.load().fingerprint() {
            tracing::trace!(%fingerprint, "resource group unchanged");
            return Ok(RefreshOutcome::Unchanged);
        }
        let schema = GatewaySchema::build_with_options(
            latest.resource_group,
            &self.compilers,
            self.options.clone(),
        )?;
        self.current.store(Arc::new(schema));
        tracing::info!(%fingerprint, "serving new resource group");
        Ok(RefreshOutcome::Swapped(fingerprint))
    }

    /// Refreshes every `interval` until the returned handle is dropped.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> RefreshHandle {
        let task = tokio::task::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(error) = self.refresh_once().await {
                    tracing::error!(
                        code = error.code(),
                        %error,
                        "could not refresh the resource group, still serving the previous one"
                    );
                }
            }
        });
        RefreshHandle { task }
    }
}

/// Stops the refresh task when dropped.
#[derive(Debug)]
pub struct RefreshHandle {
    task: tokio::task::JoinHandle<()>,
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
