use std::time::Duration;

use apollo_compiler::Schema;
use apollo_compiler::ast;
use apollo_compiler::ast::OperationType;
use apollo_compiler::executable::Selection;
use apollo_compiler::executable::SelectionSet;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::schema::Type;
use itertools::Itertools;
use serde::Deserialize;
use serde_json::json;

use crate::error::FieldError;
use crate::execution::Executor;
use crate::execution::FieldContext;
use crate::graphql::Response;
use crate::json_ext::Object;
use crate::json_ext::Value;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub(crate) enum GraphQLOperationType {
    #[default]
    Query,
    Mutation,
}

impl GraphQLOperationType {
    fn keyword(self) -> &'static str {
        match self {
            GraphQLOperationType::Query => "query",
            GraphQLOperationType::Mutation => "mutation",
        }
    }

    fn operation_type(self) -> OperationType {
        match self {
            GraphQLOperationType::Query => OperationType::Query,
            GraphQLOperationType::Mutation => OperationType::Mutation,
        }
    }
}

/// `@gql(url, fieldName, operationType, arguments, timeoutMs)`: delegates the field, with its
/// sub-selection, to a root field of a remote GraphQL service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GqlDirective {
    url: String,
    field_name: String,
    #[serde(default)]
    operation_type: Option<GraphQLOperationType>,
    arguments: Option<Object>,
    timeout_ms: Option<u64>,
}

impl GqlDirective {
    pub(super) async fn resolve<'a>(&'a self, field: &'a FieldContext<'a>) -> Result<Value, FieldError> {
        let failure = |message: String, status_code: Option<u16>| FieldError::RemoteDelegationFailure {
            service: self.url.clone(),
            message,
            status_code,
        };
        let remote = field
            .executor
            .schema
            .remote_schemas
            .get(&self.url)
            .ok_or_else(|| {
                failure(
                    format!("Remote schema for {} not found in resource group", self.url),
                    None,
                )
            })?;

        let query = self.document(field, remote);
        let timeout = self
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(field.options().remote_timeout);
        tracing::debug!(url = %self.url, %query, "@gql request");

        let response = field
            .options()
            .http_client
            .post(&self.url)
            .timeout(timeout)
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(|error| failure(error.to_string(), None))?;
        let status = response.status();
        let response: Response = response.json().await.map_err(|error| {
            failure(
                format!("invalid response from {}: {error}", self.url),
                Some(status.as_u16()),
            )
        })?;
        if !response.errors.is_empty() {
            let message = response.errors.iter().map(|error| &error.message).join("; ");
            return Err(failure(message, Some(status.as_u16())));
        }
        if !status.is_success() {
            return Err(failure(status.to_string(), Some(status.as_u16())));
        }
        Ok(response
            .data
            .and_then(|mut data| data.get_mut(&self.field_name).map(Value::take))
            .unwrap_or(Value::Null))
    }

    /// `query { fieldName(arguments) { ...selection } }`
    fn document(&self, field: &FieldContext<'_>, remote: &Schema) -> String {
        let operation_type = self.operation_type.unwrap_or_default();
        let arguments = match &self.arguments {
            Some(arguments) => match field
                .engine()
                .inject(&Value::Object(arguments.clone()), field.scope())
            {
                Value::Object(arguments) => arguments,
                _ => Object::new(),
            },
            None => field.args.clone(),
        };
        let root_field = remote
            .root_operation(operation_type.operation_type())
            .and_then(|root| remote.get_object(root))
            .and_then(|root| root.fields.get(self.field_name.as_str()));

        let mut document = format!("{} {{ {}", operation_type.keyword(), self.field_name);
        if !arguments.is_empty() {
            let printed = arguments
                .iter()
                .map(|(name, value)| {
                    let ty = root_field
                        .and_then(|definition| definition.argument_by_name(name))
                        .map(|argument| &*argument.ty);
                    format!("{name}: {}", typed_literal(value, ty, remote))
                })
                .join(", ");
            document.push_str(&format!("({printed})"));
        }
        if let Some(selection) = field.field.map(|field| &field.selection_set) {
            if !selection.selections.is_empty() {
                document.push(' ');
                SelectionPrinter {
                    executor: field.executor,
                }
                .print(selection, &mut document);
            }
        }
        document.push_str(" }");
        document
    }
}

/// Prints a local selection set for a remote service: fragments are inlined, variables are
/// replaced by their values, `@skip` and `@include` are applied locally.
struct SelectionPrinter<'a> {
    executor: &'a Executor<'a>,
}

impl SelectionPrinter<'_> {
    fn print(&self, selection_set: &SelectionSet, out: &mut String) {
        out.push('{');
        let is_abstract = matches!(
            self.executor.schema.schema.types.get(&selection_set.ty),
            Some(ExtendedType::Interface(_) | ExtendedType::Union(_))
        );
        if is_abstract {
            out.push_str(" __typename");
        }
        for selection in &selection_set.selections {
            match selection {
                Selection::Field(field) => {
                    if !self.executor.is_included(&field.directives) {
                        continue;
                    }
                    out.push(' ');
                    if let Some(alias) = &field.alias {
                        out.push_str(&format!("{alias}: "));
                    }
                    out.push_str(&field.name);
                    if !field.arguments.is_empty() {
                        let arguments = field
                            .arguments
                            .iter()
                            .map(|argument| format!("{}: {}", argument.name, self.value(&argument.value)))
                            .join(", ");
                        out.push_str(&format!("({arguments})"));
                    }
                    if !field.selection_set.selections.is_empty() {
                        out.push(' ');
                        self.print(&field.selection_set, out);
                    }
                }
                Selection::FragmentSpread(spread) => {
                    if !self.executor.is_included(&spread.directives) {
                        continue;
                    }
                    if let Some(fragment) = self.executor.document.fragments.get(&spread.fragment_name) {
                        out.push_str(&format!(" ... on {} ", fragment.type_condition()));
                        self.print(&fragment.selection_set, out);
                    }
                }
                Selection::InlineFragment(inline) => {
                    if !self.executor.is_included(&inline.directives) {
                        continue;
                    }
                    out.push_str(" ...");
                    if let Some(condition) = &inline.type_condition {
                        out.push_str(&format!(" on {condition}"));
                    }
                    out.push(' ');
                    self.print(&inline.selection_set, out);
                }
            }
        }
        out.push_str(" }");
    }

    fn value(&self, value: &ast::Value) -> String {
        match value {
            ast::Value::Variable(name) => json_literal(
                self.executor
                    .variables
                    .get(name.as_str())
                    .unwrap_or(&Value::Null),
            ),
            ast::Value::List(items) => format!("[{}]", items.iter().map(|item| self.value(item)).join(", ")),
            ast::Value::Object(fields) => format!(
                "{{{}}}",
                fields
                    .iter()
                    .map(|(name, value)| format!("{name}: {}", self.value(value)))
                    .join(", ")
            ),
            other => other.to_string(),
        }
    }
}

/// A GraphQL literal for `value`. Strings given for remote enum types are printed bare.
fn typed_literal(value: &Value, ty: Option<&Type>, remote: &Schema) -> String {
    match (value, ty) {
        (Value::String(name), Some(ty))
            if matches!(remote.types.get(ty.inner_named_type()), Some(ExtendedType::Enum(_))) =>
        {
            name.clone()
        }
        (Value::Array(items), Some(ty)) => format!(
            "[{}]",
            items
                .iter()
                .map(|item| typed_literal(item, Some(ty.item_type()), remote))
                .join(", ")
        ),
        (Value::Object(fields), Some(ty)) => {
            let input = match remote.types.get(ty.inner_named_type()) {
                Some(ExtendedType::InputObject(input)) => Some(input),
                _ => None,
            };
            format!(
                "{{{}}}",
                fields
                    .iter()
                    .map(|(name, value)| {
                        let field_ty = input
                            .and_then(|input| input.fields.get(name.as_str()))
                            .map(|field| &*field.ty);
                        format!("{name}: {}", typed_literal(value, field_ty, remote))
                    })
                    .join(", ")
            )
        }
        (value, _) => json_literal(value),
    }
}

/// A GraphQL literal for an untyped JSON value.
fn json_literal(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // JSON string escapes are valid GraphQL string escapes.
        Value::String(_) => value.to_string(),
        Value::Array(items) => format!("[{}]", items.iter().map(json_literal).join(", ")),
        Value::Object(fields) => format!(
            "{{{}}}",
            fields
                .iter()
                .map(|(name, value)| format!("{name}: {}", json_literal(value)))
                .join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn literals() {
        let remote = Schema::parse(
            r#"
            enum Sort { ASC DESC }
            input Page { sort: Sort, size: Int }
            type Query { items(sort: Sort, page: Page, tags: [String]): [String] }
            "#,
            "remote.graphql",
        )
        .unwrap();
        let items = remote.get_object("Query").unwrap().fields.get("items").unwrap();
        let ty = |name: &str| items.argument_by_name(name).map(|argument| &*argument.ty);

        assert_eq!(typed_literal(&json!("ASC"), ty("sort"), &remote), "ASC");
        assert_eq!(
            typed_literal(&json!({"sort": "DESC", "size": 2}), ty("page"), &remote),
            "{sort: DESC, size: 2}"
        );
        assert_eq!(
            typed_literal(&json!(["a", "b\"c"]), ty("tags"), &remote),
            r#"["a", "b\"c"]"#
        );
        assert_eq!(typed_literal(&json!("ASC"), None, &remote), r#""ASC""#);
    }
}
