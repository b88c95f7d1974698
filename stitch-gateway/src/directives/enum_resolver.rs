use apollo_compiler::Name;
use apollo_compiler::Schema;
use apollo_compiler::schema::EnumType;
use indexmap::IndexMap;
use serde::Deserialize;

use super::directive_arguments;
use crate::error::ResourceError;
use crate::json_ext::Value;

#[derive(Deserialize)]
struct EnumValueDirective {
    value: Value,
}

/// The values of an `@enumResolver` enum: each key maps to its `@enumValue`.
#[derive(Debug, Clone, Default)]
pub(crate) struct EnumMapping {
    values: IndexMap<Name, Value>,
}

impl EnumMapping {
    pub(super) fn build(
        schema: &Schema,
        type_name: &Name,
        definition: &EnumType,
    ) -> Result<Self, ResourceError> {
        let mut values = IndexMap::new();
        for (key, value) in &definition.values {
            let location = format!("{type_name}.{key}");
            let Some(directive) = value.directives.get("enumValue") else {
                return Err(ResourceError::SchemaBuild {
                    message: format!("{location}: Each ENUM_VALUE must have @enumValue directive"),
                });
            };
            let EnumValueDirective { value } = directive_arguments(schema, directive, &location)?;
            values.insert(key.clone(), value);
        }
        Ok(Self { values })
    }

    /// The key a resolved value is reported as.
    pub(crate) fn serialize(&self, value: &Value) -> Option<&Name> {
        self.values
            .iter()
            .find(|(_, mapped)| *mapped == value)
            .map(|(key, _)| key)
    }

    /// The value an input key stands for.
    pub(crate) fn parse(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}
