use futures::future::join_all;
use serde::Deserialize;

use super::CompiledPolicy;
use super::PolicyCacheKey;
use super::PolicyRegistry;
use crate::context::RequestContext;
use crate::error::DeniedPolicies;
use crate::error::FieldError;
use crate::error::PolicyRef;
use crate::graphql::Response;
use crate::injection::TemplateEngine;
use crate::json_ext::Object;
use crate::json_ext::Value;

/// Runs the query a policy declares against the gateway's own schema.
#[async_trait::async_trait]
pub(crate) trait PolicyQueryRunner: Send + Sync {
    async fn run_policy_query(
        &self,
        query: &str,
        variables: Object,
        context: RequestContext,
    ) -> Response;
}

/// A policy applied at a call site, with the arguments given there.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub(crate) struct PolicyCall {
    pub(crate) namespace: String,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) args: Option<Object>,
}

impl PolicyCall {
    pub(crate) fn policy_ref(&self) -> PolicyRef {
        PolicyRef::new(self.namespace.clone(), self.name.clone())
    }
}

/// How the policies of `@policies` combine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub(crate) enum Relation {
    And,
    #[default]
    Or,
}

/// Evaluates policies for one request.
#[derive(Clone, Copy)]
pub(crate) struct PolicyEvaluator<'a> {
    pub(crate) registry: &'a PolicyRegistry,
    pub(crate) engine: &'a TemplateEngine,
    pub(crate) queries: &'a dyn PolicyQueryRunner,
    pub(crate) context: &'a RequestContext,
}

impl PolicyEvaluator<'_> {
    /// Whether `call` allows access.
    ///
    /// `scope` is the template scope of the field being resolved; argument templates are
    /// evaluated against it.
    pub(crate) async fn evaluate(&self, call: &PolicyCall, scope: &Object) -> Result<bool, FieldError> {
        let policy = call.policy_ref();
        let compiled = self
            .registry
            .get(&policy)
            .ok_or_else(|| FieldError::policy_failed(&policy, "The policy was not found"))?;
        let args = self.prepare_args(&policy, compiled, call.args.as_ref(), scope)?;

        let key = PolicyCacheKey {
            policy: policy.clone(),
            args: Value::Object(args.clone()).to_string(),
        };
        let allow = self
            .context
            .policy_cache()
            .get_or_try_evaluate(key, || self.run(&policy, compiled, args, scope))
            .await?;
        tracing::trace!(policy = %policy, allow, "policy evaluated");
        Ok(allow)
    }

    /// Fails with [`FieldError::UnauthorizedByPolicy`] unless `call` allows access.
    pub(crate) async fn validate(&self, call: &PolicyCall, scope: &Object) -> Result<(), FieldError> {
        if self.evaluate(call, scope).await? {
            Ok(())
        } else {
            Err(FieldError::unauthorized(call.policy_ref()))
        }
    }

    /// Validates several policies at once.
    ///
    /// Every policy is evaluated. When the relation is not satisfied, evaluation failures are
    /// reported before denials.
    pub(crate) async fn validate_all(
        &self,
        calls: &[PolicyCall],
        relation: Relation,
        scope: &Object,
    ) -> Result<(), FieldError> {
        let results = join_all(calls.iter().map(|call| self.validate(call, scope))).await;
        let approved = results.iter().filter(|result| result.is_ok()).count();
        let satisfied = match relation {
            Relation::And => approved == results.len(),
            Relation::Or => approved > 0,
        };
        if satisfied {
            return Ok(());
        }

        let (denied, failed): (Vec<_>, Vec<_>) = results
            .into_iter()
            .filter_map(Result::err)
            .partition(FieldError::is_unauthorized);
        if !failed.is_empty() {
            let message = failed
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(FieldError::resolver(message));
        }
        let policies = denied
            .into_iter()
            .flat_map(|error| match error {
                FieldError::UnauthorizedByPolicy { policies } => policies.0,
                _ => Vec::new(),
            })
            .collect();
        Err(FieldError::UnauthorizedByPolicy {
            policies: DeniedPolicies(policies),
        })
    }

    /// Applies the resource group's base policy, if there is one.
    pub(crate) async fn validate_base_policy(&self, scope: &Object) -> Result<(), FieldError> {
        let Some(base) = self.registry.base_policy() else {
            return Ok(());
        };
        let call = PolicyCall {
            namespace: base.namespace.clone(),
            name: base.name.clone(),
            args: base.args.clone(),
        };
        self.validate(&call, scope).await
    }

    fn prepare_args(
        &self,
        policy: &PolicyRef,
        compiled: &CompiledPolicy,
        provided: Option<&Object>,
        scope: &Object,
    ) -> Result<Object, FieldError> {
        let mut args = Object::new();
        for (name, declaration) in &compiled.definition.args {
            let value = match provided.and_then(|provided| provided.get(name)) {
                Some(value) => Some(value.clone()),
                None => declaration.default.clone(),
            };
            let value = match value {
                Some(Value::String(template)) => self.engine.evaluate(&template, scope),
                Some(value) => value,
                None if declaration.optional => Value::Null,
                None => {
                    tracing::debug!(policy = %policy, argument = %name, "missing policy argument");
                    return Err(FieldError::MissingPolicyArgument {
                        policy: policy.clone(),
                        argument: name.clone(),
                    });
                }
            };
            if value.is_null() && compiled.non_null_args.get(name).copied().unwrap_or(false) {
                return Err(FieldError::policy_failed(
                    policy,
                    format!(r#"Non-nullable argument "{name}" got value "null""#),
                ));
            }
            args.insert(name.clone(), value);
        }
        Ok(args)
    }

    async fn run(
        &self,
        policy: &PolicyRef,
        compiled: &CompiledPolicy,
        args: Object,
        scope: &Object,
    ) -> Result<bool, FieldError> {
        let module = compiled.module.as_ref().ok_or_else(|| {
            FieldError::policy_failed(
                policy,
                format!("Unsupported policy type {}", compiled.definition.policy_type),
            )
        })?;

        let query = match &compiled.definition.query {
            Some(query) => self.run_query(policy, &query.gql, &query.variables, &args, scope).await?,
            None => Value::Null,
        };

        let mut input = Object::new();
        input.insert("args".to_string(), Value::Object(args));
        input.insert("query".to_string(), query);
        let input = Value::Object(input);
        tracing::trace!(policy = %policy, input = %input, "executing policy");
        module.evaluate(&input).map_err(|error| {
            tracing::debug!(policy = %policy, %error, "policy evaluation failed");
            FieldError::policy_failed(policy, error.to_string())
        })
    }

    async fn run_query(
        &self,
        policy: &PolicyRef,
        gql: &str,
        variables: &Object,
        args: &Object,
        scope: &Object,
    ) -> Result<Value, FieldError> {
        let mut query_scope = scope.clone();
        query_scope.insert("args".to_string(), Value::Object(args.clone()));
        let variables = variables
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::String(template) => self.engine.evaluate(template, &query_scope),
                    other => other.clone(),
                };
                (name.clone(), value)
            })
            .collect();

        tracing::trace!(policy = %policy, "executing policy query");
        let response = self
            .queries
            .run_policy_query(gql, variables, self.context.for_policy_query())
            .await;
        if !response.errors.is_empty() {
            tracing::error!(policy = %policy, errors = ?response.errors, "Policy query execution failed");
            return Err(FieldError::policy_failed(policy, "Policy query execution failed"));
        }
        Ok(response.data.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::policy::PolicyCompilers;
    use crate::policy::test_modules::CountingModule;
    use crate::resource::ResourceGroup;

    /// Answers every policy query with fixed data and records the variables it got.
    #[derive(Default)]
    struct StaticQueries {
        data: Value,
        fail: bool,
        calls: AtomicUsize,
        variables: Mutex<Vec<(Object, bool)>>,
    }

    #[async_trait::async_trait]
    impl PolicyQueryRunner for StaticQueries {
        async fn run_policy_query(
            &self,
            _query: &str,
            variables: Object,
            context: RequestContext,
        ) -> Response {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.variables
                .lock()
                .push((variables, context.ignore_policies()));
            if self.fail {
                Response::from_errors(vec![crate::graphql::Error::builder().message("boom").build()])
            } else {
                Response::builder().data(self.data.clone()).build()
            }
        }
    }

    fn group(policies: Value) -> ResourceGroup {
        serde_json::from_value(json!({ "policies": policies })).unwrap()
    }

    fn scope(value: Value) -> Object {
        value.as_object().cloned().unwrap_or_default()
    }

    fn call(name: &str, args: Option<Value>) -> PolicyCall {
        PolicyCall {
            namespace: "ns".to_string(),
            name: name.to_string(),
            args: args.and_then(|args| args.as_object().cloned()),
        }
    }

    struct Harness {
        registry: PolicyRegistry,
        engine: TemplateEngine,
        queries: StaticQueries,
        context: RequestContext,
    }

    impl Harness {
        fn new(group: ResourceGroup) -> Self {
            let (registry, _) = PolicyRegistry::build(&group, &PolicyCompilers::default());
            Self {
                registry,
                engine: TemplateEngine::default(),
                queries: StaticQueries::default(),
                context: RequestContext::default(),
            }
        }

        fn evaluator(&self) -> PolicyEvaluator<'_> {
            PolicyEvaluator {
                registry: &self.registry,
                engine: &self.engine,
                queries: &self.queries,
                context: &self.context,
            }
        }
    }

    #[tokio::test]
    async fn arguments_come_from_call_site_or_defaults() {
        let harness = Harness::new(group(json!([{
            "metadata": {"namespace": "ns", "name": "owner"},
            "type": "expression",
            "code": "args.owner === args.user",
            "args": {
                "owner": {"type": "String!"},
                "user": {"type": "String!", "default": "{source.user}"}
            }
        }])));
        let evaluator = harness.evaluator();
        let scope = scope(json!({"source": {"user": "a", "owner": "a"}}));
        assert_eq!(
            evaluator
                .evaluate(&call("owner", Some(json!({"owner": "{source.owner}"}))), &scope)
                .await,
            Ok(true)
        );
        assert_eq!(
            evaluator
                .evaluate(&call("owner", Some(json!({"owner": "b"}))), &scope)
                .await,
            Ok(false)
        );
    }

    #[rstest]
    #[case::missing_required(
        json!({"a": {"type": "String"}}),
        None,
        "MISSING_POLICY_ARGUMENT",
        r#"Missing argument "a""#
    )]
    #[case::null_for_non_null(
        json!({"a": {"type": "String!", "optional": true}}),
        None,
        "POLICY_EXECUTION_FAILED",
        r#"Non-nullable argument "a" got value "null""#
    )]
    #[tokio::test]
    async fn argument_errors(
        #[case] args: Value,
        #[case] provided: Option<Value>,
        #[case] code: &str,
        #[case] message: &str,
    ) {
        use crate::graphql::ErrorExtension;

        let harness = Harness::new(group(json!([{
            "metadata": {"namespace": "ns", "name": "p"},
            "type": "expression",
            "code": "true",
            "args": args
        }])));
        let error = harness
            .evaluator()
            .evaluate(&call("p", provided), &Object::new())
            .await
            .unwrap_err();
        assert_eq!(error.extension_code(), code);
        assert_eq!(error.to_string(), message);
    }

    #[tokio::test]
    async fn optional_arguments_default_to_null() {
        let harness = Harness::new(group(json!([{
            "metadata": {"namespace": "ns", "name": "p"},
            "type": "expression",
            "code": "args.a === null",
            "args": {"a": {"type": "String", "optional": true}}
        }])));
        assert_eq!(
            harness.evaluator().evaluate(&call("p", None), &Object::new()).await,
            Ok(true)
        );
    }

    #[tokio::test]
    async fn unknown_and_uncompiled_policies_fail() {
        let harness = Harness::new(group(json!([{
            "metadata": {"namespace": "ns", "name": "opa"},
            "type": "opa",
            "code": "package p"
        }])));
        let evaluator = harness.evaluator();
        assert_eq!(
            evaluator
                .evaluate(&call("missing", None), &Object::new())
                .await
                .unwrap_err()
                .to_string(),
            "The policy was not found"
        );
        assert_eq!(
            evaluator
                .evaluate(&call("opa", None), &Object::new())
                .await
                .unwrap_err()
                .to_string(),
            "Unsupported policy type opa"
        );
    }

    #[tokio::test]
    async fn decisions_are_memoized_per_request() {
        let mut group = group(json!([{
            "metadata": {"namespace": "ns", "name": "counted"},
            "type": "opa",
            "code": "package p",
            "args": {"id": {"type": "ID!"}}
        }]));
        let module = CountingModule::new(true);
        group.attach_policy(&PolicyRef::new("ns", "counted"), module.clone());
        let harness = Harness::new(group);
        let evaluator = harness.evaluator();

        let same = call("counted", Some(json!({"id": "1"})));
        evaluator.validate(&same, &Object::new()).await.unwrap();
        evaluator.validate(&same, &Object::new()).await.unwrap();
        assert_eq!(module.calls(), 1);

        evaluator
            .validate(&call("counted", Some(json!({"id": "2"}))), &Object::new())
            .await
            .unwrap();
        assert_eq!(module.calls(), 2);

        let other_request = RequestContext::default();
        let evaluator = PolicyEvaluator {
            context: &other_request,
            ..evaluator
        };
        evaluator.validate(&same, &Object::new()).await.unwrap();
        assert_eq!(module.calls(), 3);
    }

    #[tokio::test]
    async fn policy_queries_feed_the_module() {
        let mut harness = Harness::new(group(json!([{
            "metadata": {"namespace": "ns", "name": "enabled"},
            "type": "expression",
            "code": "query.user.enabled",
            "args": {"id": {"type": "ID!"}},
            "query": {
                "gql": "query($id: ID!) { user(id: $id) { enabled } }",
                "variables": {"id": "{args.id}", "fixed": 1}
            }
        }])));
        harness.queries.data = json!({"user": {"enabled": true}});
        let allowed = harness
            .evaluator()
            .evaluate(&call("enabled", Some(json!({"id": "42"}))), &Object::new())
            .await;
        assert_eq!(allowed, Ok(true));
        let variables = harness.queries.variables.lock().clone();
        assert_eq!(variables, vec![(scope(json!({"id": "42", "fixed": 1})), true)]);

        harness.queries.fail = true;
        let error = harness
            .evaluator()
            .evaluate(&call("enabled", Some(json!({"id": "43"}))), &Object::new())
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "Policy query execution failed");
    }

    #[rstest]
    #[case::or_one_allows(Relation::Or, &["allow", "deny"], Ok(()))]
    #[case::or_none_allows(Relation::Or, &["deny", "deny2"], Err("Unauthorized by policy ns/deny, ns/deny2"))]
    #[case::and_all_allow(Relation::And, &["allow", "allow2"], Ok(()))]
    #[case::and_one_denies(Relation::And, &["allow", "deny"], Err("Unauthorized by policy ns/deny"))]
    #[case::failure_wins_over_deny(Relation::And, &["deny", "missing"], Err("The policy was not found"))]
    #[tokio::test]
    async fn policies_relations(
        #[case] relation: Relation,
        #[case] names: &[&str],
        #[case] expected: Result<(), &str>,
    ) {
        let harness = Harness::new(group(json!([
            {"metadata": {"namespace": "ns", "name": "allow"}, "type": "expression", "code": "true"},
            {"metadata": {"namespace": "ns", "name": "allow2"}, "type": "expression", "code": "true"},
            {"metadata": {"namespace": "ns", "name": "deny"}, "type": "expression", "code": "false"},
            {"metadata": {"namespace": "ns", "name": "deny2"}, "type": "expression", "code": "false"}
        ])));
        let calls = names.iter().map(|name| call(name, None)).collect::<Vec<_>>();
        let result = harness
            .evaluator()
            .validate_all(&calls, relation, &Object::new())
            .await
            .map_err(|error| error.to_string());
        assert_eq!(result, expected.map_err(str::to_string));
    }

    #[tokio::test]
    async fn base_policy_is_optional() {
        let harness = Harness::new(ResourceGroup::default());
        assert_eq!(
            harness.evaluator().validate_base_policy(&Object::new()).await,
            Ok(())
        );

        let mut group = group(json!([
            {"metadata": {"namespace": "ns", "name": "deny"}, "type": "expression", "code": "false"}
        ]));
        group.base_policy = serde_json::from_value(json!({"namespace": "ns", "name": "deny"})).unwrap();
        let harness = Harness::new(group);
        assert!(
            harness
                .evaluator()
                .validate_base_policy(&Object::new())
                .await
                .unwrap_err()
                .is_unauthorized()
        );
    }
}
