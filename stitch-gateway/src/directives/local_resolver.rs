use serde::Deserialize;

use super::Next;
use super::condition_holds;
use crate::error::FieldError;
use crate::execution::FieldContext;
use crate::json_ext::Value;
use crate::json_ext::ValueExt;

/// How an injected value combines with the value beneath it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub(crate) enum MergeStrategy {
    /// The injected value replaces the field; the resolvers beneath never run.
    #[default]
    Replace,
    Merge,
    MergeDeep,
}

/// `@localResolver(value, mergeStrategy, enabledIf)`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LocalResolver {
    #[serde(default)]
    value: Value,
    #[serde(default)]
    merge_strategy: MergeStrategy,
    enabled_if: Option<String>,
}

impl LocalResolver {
    pub(super) async fn resolve<'a>(
        &'a self,
        field: &'a FieldContext<'a>,
        next: Next<'a>,
    ) -> Result<Value, FieldError> {
        let enabled = match &self.enabled_if {
            Some(condition) => condition_holds(field.engine(), condition, field.scope()),
            None => true,
        };
        if !enabled {
            return next.run(field).await;
        }

        let injected = field.engine().inject(&self.value, field.scope());
        match self.merge_strategy {
            MergeStrategy::Replace => Ok(injected),
            MergeStrategy::Merge => {
                let mut value = next.run(field).await?;
                value.shallow_merge(injected);
                Ok(value)
            }
            MergeStrategy::MergeDeep => {
                let mut value = next.run(field).await?;
                value.deep_merge(injected);
                Ok(value)
            }
        }
    }
}
