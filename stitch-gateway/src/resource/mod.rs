//! The resource group: schemas, upstreams, credentials and policies served by the gateway.

pub mod repository;
pub mod update;
mod validation;

use std::fmt;
use std::sync::Arc;

use derivative::Derivative;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::error::PolicyRef;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::policy::PolicyModule;

pub use self::repository::FetchLatestResult;
pub use self::repository::FileSystemResourceRepository;
pub use self::repository::InMemoryResourceRepository;
pub use self::repository::ResourceRepository;
pub use self::update::ResourceGroupDeletions;
pub use self::update::ResourceGroupUpdates;
pub use self::update::ResourceUpdater;
pub use self::update::UpdateOptions;
pub use self::update::apply_resource_group_deletions;
pub use self::update::apply_resource_group_updates;
pub use self::update::validate_resource_group_update;
pub use self::validation::validate_resource_group;

/// The `(namespace, name)` address of a resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub namespace: String,
    pub name: String,
}

impl ResourceMetadata {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub(crate) fn policy_ref(&self) -> PolicyRef {
        PolicyRef::new(self.namespace.clone(), self.name.clone())
    }
}

impl fmt::Display for ResourceMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Anything stored in a resource group list.
pub trait Resource {
    fn metadata(&self) -> &ResourceMetadata;
}

macro_rules! impl_resource {
    ($($resource:ty),*) => {
        $(impl Resource for $resource {
            fn metadata(&self) -> &ResourceMetadata {
                &self.metadata
            }
        })*
    };
}

impl_resource!(
    SchemaResource,
    Upstream,
    UpstreamClientCredentials,
    PolicyDefinition
);

/// A schema fragment as submitted by its owner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaResource {
    pub metadata: ResourceMetadata,
    pub schema: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthType {
    ActiveDirectory,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActiveDirectoryAuth {
    pub authority: String,
    pub resource: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamAuth {
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    pub active_directory: ActiveDirectoryAuth,
}

/// A host the gateway calls on behalf of schemas, with the credentials it needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    pub metadata: ResourceMetadata,
    pub host: String,
    pub auth: UpstreamAuth,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveDirectoryCredentials {
    pub authority: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamClientCredentials {
    pub metadata: ResourceMetadata,
    pub auth_type: AuthType,
    pub active_directory: ActiveDirectoryCredentials,
}

/// The language a policy's `code` is written in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    Opa,
    Expression,
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyType::Opa => f.write_str("opa"),
            PolicyType::Expression => f.write_str("expression"),
        }
    }
}

/// Declaration of one policy argument.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyArgument {
    /// A GraphQL input type, `String!` for example.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Used when the call site does not provide the argument. Strings are templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

/// A query a policy runs against the gateway before it is evaluated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyQuery {
    pub gql: String,
    /// Variables of the query. Strings are templates evaluated over the policy arguments.
    #[serde(default, skip_serializing_if = "Object::is_empty")]
    pub variables: Object,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDefinition {
    pub metadata: ResourceMetadata,
    #[serde(rename = "type")]
    pub policy_type: PolicyType,
    pub code: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub args: IndexMap<String, PolicyArgument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<PolicyQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_override_base_policy: Option<bool>,
}

impl PolicyDefinition {
    pub fn overrides_base_policy(&self) -> bool {
        self.should_override_base_policy.unwrap_or(false)
    }
}

/// The policy applied to fields that do not override it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BasePolicy {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Object>,
}

impl BasePolicy {
    pub(crate) fn policy_ref(&self) -> PolicyRef {
        PolicyRef::new(self.namespace.clone(), self.name.clone())
    }
}

/// The introspected schema of a service called through `@gql`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteSchema {
    pub url: String,
    pub schema: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefaultUpstream {
    pub auth: UpstreamAuth,
}

/// A compiled policy module attached to a resource group, keyed `namespace/name`.
pub type PolicyAttachments = IndexMap<String, Arc<dyn PolicyModule>>;

/// Everything the gateway serves, stored and versioned as one document.
#[derive(Clone, Default, Derivative, Serialize, Deserialize)]
#[derivative(Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceGroup {
    pub schemas: Vec<SchemaResource>,
    pub upstreams: Vec<Upstream>,
    pub upstream_client_credentials: Vec<UpstreamClientCredentials>,
    pub policies: Vec<PolicyDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_policy: Option<BasePolicy>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remote_schemas: Vec<RemoteSchema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_upstream: Option<DefaultUpstream>,

    /// Policy modules compiled outside the gateway. They take precedence over modules compiled
    /// from a policy's `code`.
    #[serde(skip)]
    #[derivative(Debug = "ignore", PartialEq = "ignore")]
    pub policy_attachments: PolicyAttachments,
}

impl ResourceGroup {
    /// The hex sha256 of the serialized group. Policy attachments are not part of it.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        match serde_json::to_vec(self) {
            Ok(bytes) => hasher.update(bytes),
            Err(error) => tracing::error!(%error, "could not serialize resource group"),
        }
        hex::encode(hasher.finalize())
    }

    pub fn policy(&self, policy: &PolicyRef) -> Option<&PolicyDefinition> {
        self.policies.iter().find(|definition| {
            definition.metadata.namespace == policy.namespace
                && definition.metadata.name == policy.name
        })
    }

    pub fn remote_schema(&self, url: &str) -> Option<&RemoteSchema> {
        self.remote_schemas.iter().find(|remote| remote.url == url)
    }

    /// Attaches an externally compiled module to the policy `namespace/name`.
    pub fn attach_policy(&mut self, policy: &PolicyRef, module: Arc<dyn PolicyModule>) {
        self.policy_attachments.insert(policy.to_string(), module);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    pub(crate) fn resource_group_json() -> Value {
        json!({
            "schemas": [{
                "metadata": {"namespace": "ns", "name": "hello"},
                "schema": "type Query { hello: String! @localResolver(value: \"world!\") }"
            }],
            "upstreams": [{
                "metadata": {"namespace": "ns", "name": "up"},
                "host": "example.com",
                "auth": {
                    "type": "ActiveDirectory",
                    "activeDirectory": {"authority": "https://login", "resource": "res"}
                }
            }],
            "upstreamClientCredentials": [{
                "metadata": {"namespace": "ns", "name": "creds"},
                "authType": "ActiveDirectory",
                "activeDirectory": {
                    "authority": "https://login",
                    "clientId": "client",
                    "clientSecret": "secret"
                }
            }],
            "policies": [{
                "metadata": {"namespace": "ns", "name": "admins"},
                "type": "expression",
                "code": "{ args.role === 'admin' }",
                "args": {"role": {"type": "String!", "default": "{jwt.role}"}},
                "shouldOverrideBasePolicy": true
            }],
            "basePolicy": {"namespace": "ns", "name": "admins"}
        })
    }

    #[test]
    fn deserializes_camel_case_group() {
        let group: ResourceGroup = serde_json::from_value(resource_group_json()).unwrap();
        assert_eq!(group.schemas[0].metadata, ResourceMetadata::new("ns", "hello"));
        assert_eq!(group.upstreams[0].auth.active_directory.resource, "res");
        assert_eq!(
            group.upstream_client_credentials[0].active_directory.client_id,
            "client"
        );
        let policy = &group.policies[0];
        assert_eq!(policy.policy_type, PolicyType::Expression);
        assert!(policy.overrides_base_policy());
        assert_eq!(policy.args["role"].default, Some(json!("{jwt.role}")));
        assert!(!policy.args["role"].optional);
        assert_eq!(
            group.base_policy.as_ref().map(BasePolicy::policy_ref),
            Some(PolicyRef::new("ns", "admins"))
        );
        assert!(group.policy(&PolicyRef::new("ns", "admins")).is_some());
        assert!(group.policy(&PolicyRef::new("ns", "other")).is_none());
    }

    #[test]
    fn missing_lists_default_to_empty() {
        let group: ResourceGroup = serde_json::from_value(json!({})).unwrap();
        assert_eq!(group, ResourceGroup::default());
    }

    #[test]
    fn fingerprint_follows_content() {
        let group: ResourceGroup = serde_json::from_value(resource_group_json()).unwrap();
        let same: ResourceGroup = serde_json::from_value(resource_group_json()).unwrap();
        assert_eq!(group.fingerprint(), same.fingerprint());
        assert_eq!(group.fingerprint().len(), 64);

        let mut changed = same;
        changed.schemas[0].schema = "type Query { hello: String }".to_string();
        assert_ne!(group.fingerprint(), changed.fingerprint());
    }
}
