//! Input coercion: variables, field arguments and literals.

use apollo_compiler::ExecutableDocument;
use apollo_compiler::Node;
use apollo_compiler::ast;
use apollo_compiler::executable::Field;
use apollo_compiler::executable::Operation;

use super::Executor;
use crate::graphql::Error;
use crate::json_ext::Object;
use crate::json_ext::Value;

/// A GraphQL literal as JSON. Variables are read from `variables`, or are null without them.
pub(crate) fn graphql_value_to_json(value: &ast::Value, variables: Option<&Object>) -> Value {
    match value {
        ast::Value::Null => Value::Null,
        ast::Value::Enum(name) => Value::String(name.to_string()),
        ast::Value::Variable(name) => variables
            .and_then(|variables| variables.get(name.as_str()))
            .cloned()
            .unwrap_or(Value::Null),
        ast::Value::String(value) => Value::String(value.clone()),
        ast::Value::Float(value) => value
            .try_to_f64()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ast::Value::Int(value) => match value.as_str().parse::<i64>() {
            Ok(int) => Value::from(int),
            Err(_) => value
                .as_str()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        },
        ast::Value::Boolean(value) => Value::Bool(*value),
        ast::Value::List(items) => Value::Array(
            items
                .iter()
                .map(|item| graphql_value_to_json(item, variables))
                .collect(),
        ),
        ast::Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(name, value)| (name.to_string(), graphql_value_to_json(value, variables)))
                .collect(),
        ),
    }
}

/// Coerces the variables of a request against the operation's definitions.
///
/// Values are taken as given; only presence and nullability are checked, defaults are applied.
pub(crate) fn coerce_variables(
    document: &ExecutableDocument,
    operation: &Operation,
    provided: &Object,
) -> Result<Object, Vec<Error>> {
    let mut variables = Object::new();
    let mut errors = Vec::new();
    for definition in &operation.variables {
        let name = definition.name.as_str();
        let location = definition
            .line_column_range(&document.sources)
            .map(|range| (range.start.line, range.start.column));
        match provided.get(name) {
            Some(Value::Null) if definition.ty.is_non_null() => {
                errors.push(Error::from_diagnostic(
                    format!(
                        r#"Variable "${name}" of non-null type "{}" must not be null."#,
                        definition.ty
                    ),
                    location,
                    "VALIDATION_INVALID_TYPE_VARIABLE",
                ));
            }
            Some(value) => {
                variables.insert(name.to_string(), value.clone());
            }
            None => match &definition.default_value {
                Some(default) => {
                    variables.insert(name.to_string(), graphql_value_to_json(default, None));
                }
                None if definition.ty.is_non_null() => {
                    errors.push(Error::from_diagnostic(
                        format!(
                            r#"Variable "${name}" of required type "{}" was not provided."#,
                            definition.ty
                        ),
                        location,
                        "VALIDATION_INVALID_TYPE_VARIABLE",
                    ));
                }
                None => {}
            },
        }
    }
    if errors.is_empty() {
        Ok(variables)
    } else {
        Err(errors)
    }
}

/// The arguments of `field`, defaults applied and `@enumResolver` keys replaced by their values.
pub(crate) fn coerce_arguments(executor: &Executor<'_>, field: &Node<Field>) -> Object {
    let schema = executor.schema;
    let mut arguments = Object::new();
    for definition in &field.definition.arguments {
        let given = field
            .arguments
            .iter()
            .find(|argument| argument.name == definition.name);
        let value = match given.map(|argument| &*argument.value) {
            Some(ast::Value::Variable(variable)) => match executor.variables.get(variable.as_str()) {
                Some(value) => value.clone(),
                None => match &definition.default_value {
                    Some(default) => graphql_value_to_json(default, None),
                    None => continue,
                },
            },
            Some(value) => graphql_value_to_json(value, Some(&executor.variables)),
            None => match &definition.default_value {
                Some(default) => graphql_value_to_json(default, None),
                None => continue,
            },
        };
        arguments.insert(
            definition.name.to_string(),
            schema
                .plans
                .parse_input(&schema.schema, &definition.ty, value),
        );
    }
    arguments
}

#[cfg(test)]
mod tests {
    use apollo_compiler::ExecutableDocument;
    use apollo_compiler::Schema;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn coerce(query: &str, provided: Value) -> Result<Object, Vec<Error>> {
        let schema = Schema::parse_and_validate("type Query { a(x: Int, y: [String]): Int }", "s.graphql")
            .unwrap();
        let document = ExecutableDocument::parse_and_validate(&schema, query, "q.graphql").unwrap();
        let operation = document.operations.get(None).unwrap();
        coerce_variables(&document, operation, provided.as_object().unwrap())
    }

    #[test]
    fn literals_become_json() {
        let value = ast::Value::Object(vec![
            (apollo_compiler::name!("a"), Node::new(ast::Value::Int(12.into()))),
            (
                apollo_compiler::name!("b"),
                Node::new(ast::Value::List(vec![
                    Node::new(ast::Value::Enum(apollo_compiler::name!("RED"))),
                    Node::new(ast::Value::Variable(apollo_compiler::name!("v"))),
                ])),
            ),
        ]);
        let variables = json!({"v": "given"}).as_object().cloned().unwrap();
        assert_eq!(
            graphql_value_to_json(&value, Some(&variables)),
            json!({"a": 12, "b": ["RED", "given"]})
        );
    }

    #[test]
    fn defaults_and_required_variables() {
        let variables = coerce("query($x: Int = 3, $y: [String]) { a(x: $x, y: $y) }", json!({})).unwrap();
        assert_eq!(Value::Object(variables), json!({"x": 3}));

        let required = "query($x: Int!) { a(x: $x) }";
        let errors = coerce(required, json!({})).unwrap_err();
        assert_eq!(
            errors[0].message,
            r#"Variable "$x" of required type "Int!" was not provided."#
        );
        assert_eq!(errors[0].locations.len(), 1);
        let errors = coerce(required, json!({"x": null})).unwrap_err();
        assert_eq!(
            errors[0].extension_code().as_deref(),
            Some("VALIDATION_INVALID_TYPE_VARIABLE")
        );
    }
}
