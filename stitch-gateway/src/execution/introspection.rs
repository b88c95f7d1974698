//! `__schema` and `__type`, resolved lazily from the composed schema.
//!
//! A `__Type` value is `{"name": ..}` for a named type, or `{"kind": "NON_NULL" | "LIST",
//! "ofType": ..}` for a wrapper. Its fields are computed when selected. The other introspection
//! types are plain objects read by property.

use apollo_compiler::Node;
use apollo_compiler::Schema;
use apollo_compiler::ast;
use apollo_compiler::ast::OperationType;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::schema::FieldDefinition;
use apollo_compiler::schema::InputValueDefinition;
use apollo_compiler::schema::Type;
use serde_json::json;

use crate::json_ext::Object;
use crate::json_ext::Value;

const DEFAULT_DEPRECATION_REASON: &str = "No longer supported";

pub(super) fn is_introspection_type(type_name: &str) -> bool {
    type_name.starts_with("__")
}

/// The value of `__schema`.
pub(super) fn schema_root() -> Value {
    Value::Object(Object::new())
}

/// The value of `__type(name:)`.
pub(super) fn type_root(schema: &Schema, name: Option<&Value>) -> Value {
    match name.and_then(Value::as_str) {
        Some(name) if schema.types.contains_key(name) => named(name),
        _ => Value::Null,
    }
}

pub(super) fn resolve_field(
    schema: &Schema,
    type_name: &str,
    source: &Value,
    field_name: &str,
    args: &Object,
) -> Value {
    let include_deprecated = args
        .get("includeDeprecated")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    match type_name {
        "__Schema" => schema_field(schema, field_name),
        "__Type" => type_field(schema, source, field_name, include_deprecated),
        _ => source.get(field_name).cloned().unwrap_or(Value::Null),
    }
}

fn schema_field(schema: &Schema, field_name: &str) -> Value {
    let root = |operation_type| {
        schema
            .root_operation(operation_type)
            .map(|name| named(name))
            .unwrap_or(Value::Null)
    };
    match field_name {
        "description" => description(schema.schema_definition.description.as_ref()),
        "types" => schema.types.keys().map(|name| named(name)).collect(),
        "queryType" => root(OperationType::Query),
        "mutationType" => root(OperationType::Mutation),
        "subscriptionType" => root(OperationType::Subscription),
        "directives" => schema
            .directive_definitions
            .values()
            .map(|directive| {
                json!({
                    "name": directive.name.as_str(),
                    "description": description(directive.description.as_ref()),
                    "locations": directive
                        .locations
                        .iter()
                        .map(|location| location.name())
                        .collect::<Vec<_>>(),
                    "args": directive.arguments.iter().map(|argument| input_value(argument)).collect::<Vec<_>>(),
                    "isRepeatable": directive.repeatable,
                })
            })
            .collect(),
        _ => Value::Null,
    }
}

fn type_field(schema: &Schema, source: &Value, field_name: &str, include_deprecated: bool) -> Value {
    if let Some(kind) = source.get("kind") {
        return match field_name {
            "kind" => kind.clone(),
            "ofType" => source.get("ofType").cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        };
    }
    let Some((name, definition)) = source
        .get("name")
        .and_then(Value::as_str)
        .and_then(|name| schema.types.get_key_value(name))
    else {
        return Value::Null;
    };
    match field_name {
        "kind" => Value::from(match definition {
            ExtendedType::Scalar(_) => "SCALAR",
            ExtendedType::Object(_) => "OBJECT",
            ExtendedType::Interface(_) => "INTERFACE",
            ExtendedType::Union(_) => "UNION",
            ExtendedType::Enum(_) => "ENUM",
            ExtendedType::InputObject(_) => "INPUT_OBJECT",
        }),
        "name" => Value::from(name.as_str()),
        "description" => description(match definition {
            ExtendedType::Scalar(scalar) => scalar.description.as_ref(),
            ExtendedType::Object(object) => object.description.as_ref(),
            ExtendedType::Interface(interface) => interface.description.as_ref(),
            ExtendedType::Union(union_) => union_.description.as_ref(),
            ExtendedType::Enum(enum_) => enum_.description.as_ref(),
            ExtendedType::InputObject(input) => input.description.as_ref(),
        }),
        "fields" => {
            let fields = match definition {
                ExtendedType::Object(object) => object.fields.values(),
                ExtendedType::Interface(interface) => interface.fields.values(),
                _ => return Value::Null,
            };
            fields
                .filter(|field| include_deprecated || deprecation(&field.directives).is_none())
                .map(|field| field_value(field))
                .collect()
        }
        "interfaces" => match definition {
            ExtendedType::Object(object) => object
                .implements_interfaces
                .iter()
                .map(|name| named(name))
                .collect(),
            ExtendedType::Interface(interface) => interface
                .implements_interfaces
                .iter()
                .map(|name| named(name))
                .collect(),
            _ => Value::Null,
        },
        "possibleTypes" => match definition {
            ExtendedType::Interface(_) => schema
                .types
                .iter()
                .filter(|(_, ty)| {
                    matches!(ty, ExtendedType::Object(object) if object.implements_interfaces.contains(name.as_str()))
                })
                .map(|(name, _)| named(name))
                .collect(),
            ExtendedType::Union(union_) => union_.members.iter().map(|name| named(name)).collect(),
            _ => Value::Null,
        },
        "enumValues" => match definition {
            ExtendedType::Enum(enum_) => enum_
                .values
                .values()
                .filter(|value| include_deprecated || deprecation(&value.directives).is_none())
                .map(|value| {
                    let reason = deprecation(&value.directives);
                    json!({
                        "name": value.value.as_str(),
                        "description": description(value.description.as_ref()),
                        "isDeprecated": reason.is_some(),
                        "deprecationReason": reason,
                    })
                })
                .collect(),
            _ => Value::Null,
        },
        "inputFields" => match definition {
            ExtendedType::InputObject(input) => input
                .fields
                .values()
                .map(|field| input_value(field))
                .collect(),
            _ => Value::Null,
        },
        "specifiedByURL" => match definition {
            ExtendedType::Scalar(scalar) => scalar
                .directives
                .get("specifiedBy")
                .and_then(|directive| directive.specified_argument_by_name("url"))
                .and_then(|url| url.as_str())
                .map(Value::from)
                .unwrap_or(Value::Null),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

fn named(name: &str) -> Value {
    json!({ "name": name })
}

fn type_ref(ty: &Type) -> Value {
    match ty {
        Type::Named(name) => named(name),
        Type::NonNullNamed(name) => json!({ "kind": "NON_NULL", "ofType": named(name) }),
        Type::List(item) => json!({ "kind": "LIST", "ofType": type_ref(item) }),
        Type::NonNullList(item) => json!({
            "kind": "NON_NULL",
            "ofType": { "kind": "LIST", "ofType": type_ref(item) },
        }),
    }
}

fn field_value(field: &FieldDefinition) -> Value {
    let reason = deprecation(&field.directives);
    json!({
        "name": field.name.as_str(),
        "description": description(field.description.as_ref()),
        "args": field.arguments.iter().map(|argument| input_value(argument)).collect::<Vec<_>>(),
        "type": type_ref(&field.ty),
        "isDeprecated": reason.is_some(),
        "deprecationReason": reason,
    })
}

fn input_value(value: &InputValueDefinition) -> Value {
    json!({
        "name": value.name.as_str(),
        "description": description(value.description.as_ref()),
        "type": type_ref(&value.ty),
        "defaultValue": value.default_value.as_ref().map(|default| default.to_string()),
    })
}

fn description(description: Option<&Node<str>>) -> Value {
    description
        .map(|description| Value::from(&**description))
        .unwrap_or(Value::Null)
}

/// The deprecation reason, when `@deprecated` is applied.
fn deprecation(directives: &ast::DirectiveList) -> Option<String> {
    let directive = directives.get("deprecated")?;
    Some(
        directive
            .specified_argument_by_name("reason")
            .and_then(|reason| reason.as_str())
            .unwrap_or(DEFAULT_DEPRECATION_REASON)
            .to_string(),
    )
}
