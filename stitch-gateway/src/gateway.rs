use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use tracing::Instrument;

use crate::context::RequestContext;
use crate::error::ResourceError;
use crate::graphql::Request;
use crate::graphql::Response;
use crate::policy::PolicyCompilers;
use crate::reload::RefreshHandle;
use crate::reload::RefreshOutcome;
use crate::reload::SchemaRefresher;
use crate::resource::ResourceRepository;
use crate::resource::ResourceUpdater;
use crate::schema::GatewaySchema;
use crate::schema::SchemaOptions;

/// Serves GraphQL requests from the resource group stored in a repository.
#[derive(Clone)]
pub struct Gateway {
    updater: Arc<ResourceUpdater>,
    refresher: Arc<SchemaRefresher>,
}

#[buildstructor::buildstructor]
impl Gateway {
    /// Builds the first schema snapshot from `repository`.
    ///
    /// Policies compile with the default compilers and execution uses the default options
    /// unless given.
    #[builder(visibility = "pub")]
    async fn new(
        repository: Arc<dyn ResourceRepository>,
        compilers: Option<PolicyCompilers>,
        options: Option<SchemaOptions>,
    ) -> Result<Self, ResourceError> {
        let options = options.unwrap_or_default();
        let compilers = compilers.unwrap_or_else(|| PolicyCompilers::new(options.engine.clone()));
        let refresher =
            SchemaRefresher::new(repository.clone(), compilers.clone(), options).await?;
        Ok(Self {
            updater: Arc::new(ResourceUpdater::new(repository, compilers)),
            refresher: Arc::new(refresher),
        })
    }
}

impl Gateway {
    /// Executes `request` against the current snapshot.
    pub async fn execute(&self, request: Request, headers: HeaderMap) -> Response {
        let schema = self.refresher.current();
        let context = RequestContext::new(headers);
        let span = tracing::info_span!(
            "graphql_request",
            request_id = %context.id(),
            operation_name = request.operation_name.as_deref().unwrap_or_default(),
        );
        async move {
            let response = schema.execute(&request, context).await;
            tracing::debug!(errors = response.errors.len(), "request executed");
            response
        }
        .instrument(span)
        .await
    }

    /// The snapshot new requests are served from.
    pub fn current(&self) -> Arc<GatewaySchema> {
        self.refresher.current()
    }

    pub async fn refresh_once(&self) -> Result<RefreshOutcome, ResourceError> {
        self.refresher.refresh_once().await
    }

    /// Polls the repository every `interval` until the handle is dropped.
    pub fn spawn_refresh(&self, interval: Duration) -> RefreshHandle {
        self.refresher.clone().spawn(interval)
    }

    /// Applies updates and deletions to the repository this gateway serves from.
    ///
    /// Every call returns the same updater, so changes made through clones of this gateway
    /// queue behind each other.
    pub fn updater(&self) -> Arc<ResourceUpdater> {
        self.updater.clone()
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("updater", &self.updater)
            .field("schema", &self.refresher.current())
            .finish()
    }
}
