use serde::Deserialize;

use crate::execution::FieldContext;
use crate::json_ext::Value;

/// `@stub(value: JSON)`: the injected value stands in for the field.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Stub {
    #[serde(default)]
    value: Value,
}

impl Stub {
    pub(super) fn resolve(&self, field: &FieldContext<'_>) -> Value {
        field.engine().inject(&self.value, field.scope())
    }
}
