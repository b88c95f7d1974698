//! The executable gateway schema: a resource group composed, planned and ready to serve.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use apollo_compiler::Schema;
use apollo_compiler::validation::Valid;
use indexmap::IndexMap;
use stitch_federation::SchemaFragment;
use stitch_federation::compose;

use crate::configuration::Configuration;
use crate::context::RequestContext;
use crate::directives::BUILTIN_DIRECTIVES;
use crate::directives::ResolverPlans;
use crate::error::PolicyRef;
use crate::error::ResourceError;
use crate::graphql::Request;
use crate::graphql::Response;
use crate::injection::TemplateEngine;
use crate::policy::PolicyCompilers;
use crate::policy::PolicyRegistry;
use crate::policy::query::policy_query_type_def;
use crate::resource::ResourceGroup;

const INTERNAL_NAMESPACE: &str = "internal";

/// Prepended to every fragment.
pub(crate) const BASE_TYPE_DEFS: &str = r#"
scalar JSON
scalar JSONObject
scalar Date
scalar Time
scalar DateTime

type PolicyResult {
  allow: Boolean!
}

type Policy {
  default: PolicyResult!
}
"#;

/// Served when the group has no schemas of its own.
const DEFAULT_SCHEMA: &str = r#"
type Query {
  default: String! @localResolver(value: "default")
}
"#;

/// The root of policy queries.
const POLICY_SCHEMA: &str = r#"
type Query {
  policy: Policy! @localResolver(value: {default: {allow: true}})
}
"#;

/// Execution settings shared by every request served from a schema.
#[derive(Clone, Debug)]
pub struct SchemaOptions {
    pub engine: TemplateEngine,
    /// Serve `__schema` and `__type`.
    pub introspection: bool,
    /// Used by `@rest` and `@gql` when the directive sets no timeout.
    pub remote_timeout: Duration,
    pub http_client: reqwest::Client,
}

impl Default for SchemaOptions {
    fn default() -> Self {
        Self {
            engine: TemplateEngine::default(),
            introspection: false,
            remote_timeout: Duration::from_secs(10),
            http_client: reqwest::Client::new(),
        }
    }
}

impl From<&Configuration> for SchemaOptions {
    fn from(configuration: &Configuration) -> Self {
        Self {
            engine: TemplateEngine::new(configuration.templates.timeout),
            introspection: configuration.execution.introspection,
            remote_timeout: configuration.remote.timeout,
            http_client: reqwest::Client::new(),
        }
    }
}

/// An immutable snapshot of everything needed to execute requests for one resource group.
pub struct GatewaySchema {
    pub(crate) schema: Valid<Schema>,
    sdl: String,
    pub(crate) plans: ResolverPlans,
    pub(crate) policies: PolicyRegistry,
    /// Parsed remote schemas by URL.
    pub(crate) remote_schemas: IndexMap<String, Schema>,
    pub(crate) options: SchemaOptions,
    group: ResourceGroup,
    fingerprint: String,
}

impl fmt::Debug for GatewaySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewaySchema")
            .field("fingerprint", &self.fingerprint)
            .field("types", &self.schema.types.len())
            .field("policies", &self.policies.len())
            .field("remote_schemas", &self.remote_schemas.len())
            .finish()
    }
}

impl GatewaySchema {
    pub fn build(group: ResourceGroup, compilers: &PolicyCompilers) -> Result<Self, ResourceError> {
        Self::build_with_options(group, compilers, SchemaOptions::default())
    }

    /// Composes the fragments of `group` and plans the resolution of every field.
    ///
    /// Policies that fail to compile do not fail the build: they are logged, and fail with
    /// `Unsupported policy type` when evaluated.
    pub fn build_with_options(
        group: ResourceGroup,
        compilers: &PolicyCompilers,
        options: SchemaOptions,
    ) -> Result<Self, ResourceError> {
        let fingerprint = group.fingerprint();
        let (policies, errors) = PolicyRegistry::build(&group, compilers);
        let mut invalid_arguments = HashSet::new();
        for error in &errors {
            tracing::warn!(code = error.code(), %error, "policy error");
            if let ResourceError::InvalidPolicyArgument { policy, .. } = error {
                invalid_arguments.insert(policy.clone());
            }
        }

        let fragments = fragments(&group, &invalid_arguments);
        let composed = compose(&fragments, BASE_TYPE_DEFS, BUILTIN_DIRECTIVES)?;

        if let Some(base) = &group.base_policy {
            if policies.get(&base.policy_ref()).is_none() {
                tracing::warn!(
                    policy = %base.policy_ref(),
                    "base policy is not defined, every field it applies to will fail"
                );
            }
        }

        let plans = ResolverPlans::build(&composed.schema, &policies)?;

        let mut remote_schemas = IndexMap::new();
        for remote in &group.remote_schemas {
            let schema = match Schema::parse(remote.schema.as_str(), remote.url.as_str()) {
                Ok(schema) => schema,
                Err(with_errors) => {
                    tracing::warn!(
                        url = %remote.url,
                        errors = %with_errors.errors,
                        "remote schema has errors"
                    );
                    with_errors.partial
                }
            };
            remote_schemas.insert(remote.url.clone(), schema);
        }

        tracing::debug!(
            %fingerprint,
            fragments = fragments.len(),
            policies = policies.len(),
            remote_schemas = remote_schemas.len(),
            "built gateway schema"
        );
        Ok(Self {
            sdl: composed.sdl(),
            schema: composed.schema,
            plans,
            policies,
            remote_schemas,
            options,
            group,
            fingerprint,
        })
    }

    /// The composed schema, custom directive usages included.
    pub fn sdl(&self) -> &str {
        &self.sdl
    }

    /// The fingerprint of the resource group this schema was built from.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn resource_group(&self) -> &ResourceGroup {
        &self.group
    }

    pub fn options(&self) -> &SchemaOptions {
        &self.options
    }

    pub async fn execute(&self, request: &Request, context: RequestContext) -> Response {
        crate::execution::execute(self, request, context).await
    }
}

/// The fragments composed for `group`: its schemas, or the default schema when it has none,
/// the policy root and one `Policy` field per policy with well-formed arguments.
fn fragments(group: &ResourceGroup, invalid_arguments: &HashSet<PolicyRef>) -> Vec<SchemaFragment> {
    let mut fragments = group
        .schemas
        .iter()
        .map(|schema| {
            SchemaFragment::new(
                schema.metadata.namespace.as_str(),
                schema.metadata.name.as_str(),
                schema.schema.as_str(),
            )
        })
        .collect::<Vec<_>>();
    if fragments.is_empty() {
        fragments.push(SchemaFragment::new(
            INTERNAL_NAMESPACE,
            "default",
            DEFAULT_SCHEMA,
        ));
    }
    fragments.push(SchemaFragment::new(
        INTERNAL_NAMESPACE,
        "policy",
        POLICY_SCHEMA,
    ));
    for definition in &group.policies {
        if invalid_arguments.contains(&definition.metadata.policy_ref()) {
            continue;
        }
        fragments.push(SchemaFragment::new(
            INTERNAL_NAMESPACE,
            format!(
                "policy-{}-{}",
                definition.metadata.namespace, definition.metadata.name
            ),
            policy_query_type_def(definition),
        ));
    }
    fragments
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn group(value: serde_json::Value) -> ResourceGroup {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn empty_groups_serve_the_default_schema() {
        let schema = GatewaySchema::build(ResourceGroup::default(), &PolicyCompilers::default())
            .unwrap();
        let query = schema.schema.get_object("Query").unwrap();
        assert!(query.fields.contains_key("default"));
        assert!(query.fields.contains_key("policy"));
        assert!(schema.sdl().contains("@localResolver"));
        assert_eq!(schema.fingerprint(), ResourceGroup::default().fingerprint());
    }

    #[test]
    fn policies_become_policy_fields() {
        let schema = GatewaySchema::build(
            group(json!({
                "policies": [
                    {
                        "metadata": {"namespace": "ns", "name": "is-admin"},
                        "type": "expression",
                        "code": "args.role == 'admin'",
                        "args": {"role": {"type": "String!"}}
                    },
                    {
                        "metadata": {"namespace": "ns", "name": "broken"},
                        "type": "expression",
                        "code": "true",
                        "args": {"x": {"type": "[Int"}}
                    }
                ]
            })),
            &PolicyCompilers::default(),
        )
        .unwrap();
        let policy = schema.schema.get_object("Policy").unwrap();
        let field = &policy.fields["ns___is_admin"];
        assert_eq!(field.ty.to_string(), "PolicyResult!");
        assert_eq!(field.arguments[0].ty.to_string(), "String!");
        assert!(!policy.fields.contains_key("ns___broken"));
    }

    #[test]
    fn invalid_fragments_fail_the_build() {
        let error = GatewaySchema::build(
            group(json!({
                "schemas": [{
                    "metadata": {"namespace": "ns", "name": "bad"},
                    "schema": "type Query { hello: }"
                }]
            })),
            &PolicyCompilers::default(),
        )
        .unwrap_err();
        assert_eq!(error.code(), "INVALID_SDL");
    }

    #[test]
    fn remote_schemas_are_parsed_by_url() {
        let schema = GatewaySchema::build(
            group(json!({
                "remoteSchemas": [{
                    "url": "http://remote/graphql",
                    "schema": "type Query { user(id: ID!): String }"
                }]
            })),
            &PolicyCompilers::default(),
        )
        .unwrap();
        let remote = &schema.remote_schemas["http://remote/graphql"];
        assert!(remote.get_object("Query").is_some());
    }
}
