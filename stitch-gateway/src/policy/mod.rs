//! Policy authorization.
//!
//! A policy is a boolean check addressed by `namespace/name`. Its definition lives in the
//! resource group; the module that decides is either attached to the group by whoever compiled
//! it, or compiled by the gateway from the definition's `code`.

mod evaluate;
pub(crate) mod query;

use std::fmt;
use std::sync::Arc;

use apollo_compiler::parser::Parser;
use dashmap::DashMap;
use indexmap::IndexMap;

pub(crate) use self::evaluate::PolicyCall;
pub(crate) use self::evaluate::PolicyEvaluator;
pub(crate) use self::evaluate::PolicyQueryRunner;
pub(crate) use self::evaluate::Relation;
use crate::BoxError;
use crate::error::PolicyRef;
use crate::error::ResourceError;
use crate::injection::TemplateEngine;
use crate::json_ext::Value;
use crate::resource::BasePolicy;
use crate::resource::PolicyDefinition;
use crate::resource::PolicyType;
use crate::resource::ResourceGroup;

/// A compiled policy.
pub trait PolicyModule: Send + Sync + fmt::Debug {
    /// Decides whether access is allowed. `input` is `{ "args": {..}, "query": {..} }`, with
    /// `query` null when the policy declares no query.
    fn evaluate(&self, input: &Value) -> Result<bool, BoxError>;
}

/// Compiles the `code` of policies of one [`PolicyType`].
pub trait PolicyCompiler: Send + Sync + fmt::Debug {
    fn policy_type(&self) -> PolicyType;

    fn compile(&self, definition: &PolicyDefinition) -> Result<Arc<dyn PolicyModule>, BoxError>;
}

/// Compiles `expression` policies: the code is a template expression evaluated over
/// `{ args, query }` that must produce a boolean.
#[derive(Clone, Debug, Default)]
pub struct ExpressionPolicyCompiler {
    engine: TemplateEngine,
}

impl ExpressionPolicyCompiler {
    pub fn new(engine: TemplateEngine) -> Self {
        Self { engine }
    }
}

impl PolicyCompiler for ExpressionPolicyCompiler {
    fn policy_type(&self) -> PolicyType {
        PolicyType::Expression
    }

    fn compile(&self, definition: &PolicyDefinition) -> Result<Arc<dyn PolicyModule>, BoxError> {
        let code = definition.code.trim();
        let template = if code.starts_with('{') && code.ends_with('}') {
            code.to_string()
        } else {
            format!("{{{code}}}")
        };
        self.engine.check(&template)?;
        Ok(Arc::new(ExpressionPolicy {
            template,
            engine: self.engine.clone(),
        }))
    }
}

#[derive(Debug)]
struct ExpressionPolicy {
    template: String,
    engine: TemplateEngine,
}

#[derive(Debug, thiserror::Error, displaydoc::Display)]
/// policy expression evaluated to {0}, expected a boolean
struct NotABoolean(String);

impl PolicyModule for ExpressionPolicy {
    fn evaluate(&self, input: &Value) -> Result<bool, BoxError> {
        let scope = match input {
            Value::Object(scope) => scope.clone(),
            _ => Default::default(),
        };
        match self.engine.try_evaluate(&self.template, &scope)? {
            Some(Value::Bool(allow)) => Ok(allow),
            other => Err(Box::new(NotABoolean(
                other.map_or_else(|| "undefined".to_string(), |value| value.to_string()),
            ))),
        }
    }
}

/// The compilers available to the gateway, one per policy type.
#[derive(Clone, Debug)]
pub struct PolicyCompilers {
    compilers: IndexMap<PolicyType, Arc<dyn PolicyCompiler>>,
}

impl Default for PolicyCompilers {
    fn default() -> Self {
        Self::new(TemplateEngine::default())
    }
}

impl PolicyCompilers {
    /// Only `expression` policies can be compiled by default.
    pub fn new(engine: TemplateEngine) -> Self {
        Self::empty().with_compiler(Arc::new(ExpressionPolicyCompiler::new(engine)))
    }

    pub fn empty() -> Self {
        Self {
            compilers: IndexMap::new(),
        }
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn PolicyCompiler>) -> Self {
        self.compilers.insert(compiler.policy_type(), compiler);
        self
    }

    pub fn compile(
        &self,
        definition: &PolicyDefinition,
    ) -> Result<Arc<dyn PolicyModule>, ResourceError> {
        let policy = definition.metadata.policy_ref();
        let compiler = self.compilers.get(&definition.policy_type).ok_or_else(|| {
            ResourceError::PolicyCompilationFailure {
                policy: policy.clone(),
                message: format!(
                    "no compiler is available for {} policies",
                    definition.policy_type
                ),
            }
        })?;
        compiler
            .compile(definition)
            .map_err(|error| ResourceError::PolicyCompilationFailure {
                policy,
                message: error.to_string(),
            })
    }
}

/// A policy definition with the module that evaluates it.
#[derive(Clone, Debug)]
pub struct CompiledPolicy {
    pub definition: PolicyDefinition,
    /// Missing when the policy could not be compiled; evaluating it fails.
    pub(crate) module: Option<Arc<dyn PolicyModule>>,
    /// Whether each argument's declared type is non-null.
    pub(crate) non_null_args: IndexMap<String, bool>,
}

/// Every policy of a resource group, ready for evaluation.
#[derive(Clone, Debug, Default)]
pub struct PolicyRegistry {
    policies: IndexMap<PolicyRef, CompiledPolicy>,
    base_policy: Option<BasePolicy>,
}

impl PolicyRegistry {
    /// Compiles the policies of `group`.
    ///
    /// An attached module wins over compiling the definition. Policies that fail to compile or
    /// declare unparseable argument types are still registered; the errors are returned next to
    /// the registry so callers decide whether they are fatal.
    pub fn build(group: &ResourceGroup, compilers: &PolicyCompilers) -> (Self, Vec<ResourceError>) {
        let mut errors = Vec::new();
        let mut policies = IndexMap::new();
        for definition in &group.policies {
            let policy = definition.metadata.policy_ref();

            let mut non_null_args = IndexMap::new();
            for (argument, declaration) in &definition.args {
                match Parser::new().parse_type(declaration.type_name.as_str(), "policy-argument") {
                    Ok(ty) => {
                        non_null_args.insert(argument.clone(), ty.is_non_null());
                    }
                    Err(_) => {
                        errors.push(ResourceError::InvalidPolicyArgument {
                            policy: policy.clone(),
                            argument: argument.clone(),
                            type_name: declaration.type_name.clone(),
                        });
                        non_null_args.insert(argument.clone(), false);
                    }
                }
            }

            let module = match group.policy_attachments.get(&policy.to_string()) {
                Some(module) => Some(module.clone()),
                None => match compilers.compile(definition) {
                    Ok(module) => Some(module),
                    Err(error) => {
                        errors.push(error);
                        None
                    }
                },
            };
            policies.insert(
                policy,
                CompiledPolicy {
                    definition: definition.clone(),
                    module,
                    non_null_args,
                },
            );
        }
        (
            Self {
                policies,
                base_policy: group.base_policy.clone(),
            },
            errors,
        )
    }

    pub fn get(&self, policy: &PolicyRef) -> Option<&CompiledPolicy> {
        self.policies.get(policy)
    }

    pub fn base_policy(&self) -> Option<&BasePolicy> {
        self.base_policy.as_ref()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &PolicyDefinition> {
        self.policies.values().map(|policy| &policy.definition)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PolicyCacheKey {
    pub(crate) policy: PolicyRef,
    /// The effective arguments, serialized.
    pub(crate) args: String,
}

/// Policy decisions of one request.
///
/// Concurrent evaluations of the same key wait for the first one, so a module runs at most once
/// per key. Failed evaluations are not remembered.
#[derive(Clone, Debug, Default)]
pub struct PolicyCache(Arc<DashMap<PolicyCacheKey, Arc<tokio::sync::OnceCell<bool>>>>);

impl PolicyCache {
    pub(crate) async fn get_or_try_evaluate<F, Fut, E>(
        &self,
        key: PolicyCacheKey,
        evaluate: F,
    ) -> Result<bool, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<bool, E>>,
    {
        // The map guard must not be held across the await.
        let cell = self.0.entry(key).or_default().clone();
        cell.get_or_try_init(evaluate).await.copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::test_modules::CountingModule;
    use super::*;

    fn definition(value: Value) -> PolicyDefinition {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn expression_policies_evaluate_to_booleans() {
        let compilers = PolicyCompilers::default();
        let module = compilers
            .compile(&definition(json!({
                "metadata": {"namespace": "ns", "name": "admin"},
                "type": "expression",
                "code": "args.role === 'admin' && query == null"
            })))
            .unwrap();
        assert!(
            module
                .evaluate(&json!({"args": {"role": "admin"}, "query": null}))
                .unwrap()
        );
        assert!(
            !module
                .evaluate(&json!({"args": {"role": "user"}, "query": null}))
                .unwrap()
        );

        let braced = compilers
            .compile(&definition(json!({
                "metadata": {"namespace": "ns", "name": "query"},
                "type": "expression",
                "code": "{ query.user.enabled }"
            })))
            .unwrap();
        assert!(
            braced
                .evaluate(&json!({"args": {}, "query": {"user": {"enabled": true}}}))
                .unwrap()
        );
    }

    #[test]
    fn non_boolean_results_are_errors() {
        let module = PolicyCompilers::default()
            .compile(&definition(json!({
                "metadata": {"namespace": "ns", "name": "p"},
                "type": "expression",
                "code": "args.role"
            })))
            .unwrap();
        let error = module.evaluate(&json!({"args": {"role": "admin"}})).unwrap_err();
        assert_eq!(
            error.to_string(),
            r#"policy expression evaluated to "admin", expected a boolean"#
        );
    }

    #[test]
    fn compilation_failures() {
        let compilers = PolicyCompilers::default();
        let syntax = compilers.compile(&definition(json!({
            "metadata": {"namespace": "ns", "name": "p"},
            "type": "expression",
            "code": "args.role ==="
        })));
        assert_eq!(
            syntax.map(|_| ()).map_err(|e| e.code()),
            Err("POLICY_COMPILATION_FAILURE")
        );

        let opa = compilers.compile(&definition(json!({
            "metadata": {"namespace": "ns", "name": "p"},
            "type": "opa",
            "code": "package p"
        })));
        assert_eq!(
            opa.map(|_| ()).map_err(|e| e.to_string()),
            Err("policy ns/p could not be compiled: no compiler is available for opa policies".to_string())
        );
    }

    #[test]
    fn registry_prefers_attachments_and_reports_errors() {
        let mut group: ResourceGroup = serde_json::from_value(json!({
            "policies": [
                {"metadata": {"namespace": "ns", "name": "attached"}, "type": "opa", "code": "package p"},
                {"metadata": {"namespace": "ns", "name": "broken"}, "type": "opa", "code": "package p"},
                {
                    "metadata": {"namespace": "ns", "name": "typed"},
                    "type": "expression",
                    "code": "true",
                    "args": {"a": {"type": "String!"}, "b": {"type": "[Int"}}
                }
            ]
        }))
        .unwrap();
        group.attach_policy(&PolicyRef::new("ns", "attached"), CountingModule::new(true));

        let (registry, errors) = PolicyRegistry::build(&group, &PolicyCompilers::default());
        assert_eq!(registry.len(), 3);
        assert!(registry.get(&PolicyRef::new("ns", "attached")).unwrap().module.is_some());
        assert!(registry.get(&PolicyRef::new("ns", "broken")).unwrap().module.is_none());
        let typed = registry.get(&PolicyRef::new("ns", "typed")).unwrap();
        assert_eq!(typed.non_null_args.get("a"), Some(&true));
        assert_eq!(
            errors.iter().map(|e| e.code()).collect::<Vec<_>>(),
            vec!["POLICY_COMPILATION_FAILURE", "INVALID_POLICY_ARGUMENT"]
        );
    }

    #[tokio::test]
    async fn cache_evaluates_each_key_once() {
        let cache = PolicyCache::default();
        let key = PolicyCacheKey {
            policy: PolicyRef::new("ns", "p"),
            args: "{}".to_string(),
        };
        let module = CountingModule::new(true);
        for _ in 0..3 {
            let module = module.clone();
            let allow = cache
                .get_or_try_evaluate(key.clone(), || async move {
                    module.evaluate(&Value::Null).map_err(|e| e.to_string())
                })
                .await;
            assert_eq!(allow, Ok(true));
        }
        assert_eq!(module.calls(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn cache_does_not_remember_failures() {
        let cache = PolicyCache::default();
        let key = PolicyCacheKey {
            policy: PolicyRef::new("ns", "p"),
            args: "{}".to_string(),
        };
        let failed: Result<bool, &str> = cache
            .get_or_try_evaluate(key.clone(), || async { Err("boom") })
            .await;
        assert_eq!(failed, Err("boom"));
        let retried: Result<bool, &str> = cache
            .get_or_try_evaluate(key, || async { Ok(false) })
            .await;
        assert_eq!(retried, Ok(false));
    }
}
