use serde::Deserialize;
use serde_json::json;

use super::Next;
use crate::error::FieldError;
use crate::error::PolicyRef;
use crate::execution::FieldContext;
use crate::json_ext::Value;
use crate::policy::PolicyCall;
use crate::policy::Relation;

/// `@policy(namespace, name, args, postResolve)`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PolicyDirective {
    #[serde(flatten)]
    call: PolicyCall,
    #[serde(default)]
    post_resolve: Option<bool>,
}

impl PolicyDirective {
    pub(crate) fn policy_ref(&self) -> PolicyRef {
        self.call.policy_ref()
    }

    pub(super) async fn resolve<'a>(
        &'a self,
        field: &'a FieldContext<'a>,
        next: Next<'a>,
    ) -> Result<Value, FieldError> {
        if field.request().ignore_policies() {
            return next.run(field).await;
        }
        let policies = field.policies();
        if self.post_resolve.unwrap_or(false) {
            let result = next.run(field).await?;
            let scope = field.scope_with("result", result);
            policies.validate(&self.call, &scope).await?;
            Ok(scope.get("result").cloned().unwrap_or(Value::Null))
        } else {
            policies.validate(&self.call, field.scope()).await?;
            next.run(field).await
        }
    }
}

/// `@policies(policies, relation, postResolve)`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PoliciesDirective {
    policies: Vec<PolicyCall>,
    #[serde(default)]
    relation: Relation,
    #[serde(default)]
    post_resolve: bool,
}

impl PoliciesDirective {
    pub(super) async fn resolve<'a>(
        &'a self,
        field: &'a FieldContext<'a>,
        next: Next<'a>,
    ) -> Result<Value, FieldError> {
        if field.request().ignore_policies() {
            return next.run(field).await;
        }
        let policies = field.policies();
        if self.post_resolve {
            let result = next.run(field).await?;
            let scope = field.scope_with("result", result);
            policies
                .validate_all(&self.policies, self.relation, &scope)
                .await?;
            Ok(scope.get("result").cloned().unwrap_or(Value::Null))
        } else {
            policies
                .validate_all(&self.policies, self.relation, field.scope())
                .await?;
            next.run(field).await
        }
    }
}

/// `@policyQuery(namespace, name)`: answers `{ allow }` for a policy, the field arguments being
/// the policy arguments.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PolicyQueryDirective {
    namespace: String,
    name: String,
}

impl PolicyQueryDirective {
    pub(super) async fn resolve<'a>(&'a self, field: &'a FieldContext<'a>) -> Result<Value, FieldError> {
        let call = PolicyCall {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            args: Some(field.args.clone()),
        };
        let allow = field.policies().evaluate(&call, field.scope()).await?;
        Ok(json!({ "allow": allow }))
    }
}
