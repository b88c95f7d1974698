//! GraphQL execution over the composed schema.
//!
//! Follows the ExecuteSelectionSet / CompleteValue algorithms of the GraphQL specification.
//! Every field is resolved through its [`FieldPlan`](crate::directives::FieldPlan); object
//! values go through the layers of their type's object plan before their fields resolve.

pub(crate) mod coercion;
mod field;
mod introspection;

use std::collections::HashSet;

use apollo_compiler::ExecutableDocument;
use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::ast;
use apollo_compiler::ast::OperationType;
use apollo_compiler::executable::DirectiveList;
use apollo_compiler::executable::Field;
use apollo_compiler::executable::Operation;
use apollo_compiler::executable::Selection;
use apollo_compiler::executable::SelectionSet;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::schema::ObjectType;
use apollo_compiler::schema::Type;
use apollo_compiler::validation::Valid;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;

use self::coercion::coerce_arguments;
use self::coercion::coerce_variables;
pub(crate) use self::field::FieldContext;
pub(crate) use self::field::ObjectFrame;
use crate::context::RequestContext;
use crate::directives::Next;
use crate::error::FieldError;
use crate::graphql::Error;
use crate::graphql::Location;
use crate::graphql::Request;
use crate::graphql::Response;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::Value;
use crate::policy::PolicyQueryRunner;
use crate::schema::GatewaySchema;

const VALIDATION_FAILED: &str = "GRAPHQL_VALIDATION_FAILED";

/// Fields of one selection set grouped by response key.
type GroupedFields<'a> = IndexMap<&'a Name, Vec<&'a Node<Field>>>;

/// A field error has been recorded; null propagates up to the closest nullable position.
#[derive(Debug, Clone, Copy)]
struct PropagateNull;

/// State shared by every field of one operation.
pub(crate) struct Executor<'a> {
    pub(crate) schema: &'a GatewaySchema,
    pub(crate) document: &'a Valid<ExecutableDocument>,
    pub(crate) operation: &'a Node<Operation>,
    pub(crate) variables: Object,
    pub(crate) context: &'a RequestContext,
    errors: Mutex<Vec<Error>>,
}

impl<'a> Executor<'a> {
    /// Applies `@skip` and `@include`.
    pub(crate) fn is_included(&self, directives: &DirectiveList) -> bool {
        let condition = |name: &str| {
            directives
                .get(name)
                .and_then(|directive| directive.specified_argument_by_name("if"))
                .map(|value| match &**value {
                    ast::Value::Boolean(value) => *value,
                    ast::Value::Variable(variable) => self
                        .variables
                        .get(variable.as_str())
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    _ => false,
                })
        };
        !condition("skip").unwrap_or(false) && condition("include").unwrap_or(true)
    }

    /// <https://spec.graphql.org/October2021/#CollectFields()>
    fn collect_fields(
        &self,
        object_type: &str,
        selection_set: &'a SelectionSet,
        fields: &mut GroupedFields<'a>,
        visited_fragments: &mut HashSet<&'a Name>,
    ) {
        let document = self.document;
        for selection in &selection_set.selections {
            match selection {
                Selection::Field(field) => {
                    if self.is_included(&field.directives) {
                        fields.entry(field.response_key()).or_default().push(field);
                    }
                }
                Selection::FragmentSpread(spread) => {
                    if !self.is_included(&spread.directives)
                        || !visited_fragments.insert(&spread.fragment_name)
                    {
                        continue;
                    }
                    let Some(fragment) = document.fragments.get(&spread.fragment_name) else {
                        continue;
                    };
                    if self.type_applies(object_type, fragment.type_condition()) {
                        self.collect_fields(
                            object_type,
                            &fragment.selection_set,
                            fields,
                            visited_fragments,
                        );
                    }
                }
                Selection::InlineFragment(inline) => {
                    if !self.is_included(&inline.directives) {
                        continue;
                    }
                    let applies = inline
                        .type_condition
                        .as_ref()
                        .is_none_or(|condition| self.type_applies(object_type, condition));
                    if applies {
                        self.collect_fields(
                            object_type,
                            &inline.selection_set,
                            fields,
                            visited_fragments,
                        );
                    }
                }
            }
        }
    }

    fn type_applies(&self, object_type: &str, condition: &str) -> bool {
        condition == object_type || self.schema.schema.is_subtype(condition, object_type)
    }

    /// Records `error` for the field at `path`.
    fn field_error(&self, error: &FieldError, path: &Path, field: &Node<Field>) -> PropagateNull {
        tracing::debug!(%path, %error, "field error");
        let mut error = error.to_graphql_error(Some(path.clone()));
        error.locations = field
            .line_column_range(&self.document.sources)
            .map(|range| Location {
                line: range.start.line as u32,
                column: range.start.column as u32,
            })
            .into_iter()
            .collect();
        self.errors.lock().push(error);
        PropagateNull
    }
}

/// Executes `request` against `schema`.
///
/// Request errors (parsing, validation, variables) produce a response without `data`. Field
/// errors are reported in `errors` next to the partial `data`.
pub(crate) async fn execute(
    schema: &GatewaySchema,
    request: &Request,
    context: RequestContext,
) -> Response {
    let Some(query) = request.query.as_deref().filter(|query| !query.trim().is_empty()) else {
        return request_error("Must provide query string.", VALIDATION_FAILED);
    };
    let document = match ExecutableDocument::parse_and_validate(&schema.schema, query, "query.graphql")
    {
        Ok(document) => document,
        Err(with_errors) => {
            let errors = with_errors
                .errors
                .iter()
                .map(|diagnostic| {
                    Error::from_diagnostic(
                        diagnostic.error.to_string(),
                        diagnostic
                            .line_column_range()
                            .map(|range| (range.start.line, range.start.column)),
                        VALIDATION_FAILED,
                    )
                })
                .collect::<Vec<_>>();
            tracing::debug!(errors = errors.len(), request_id = %context.id(), "invalid operation");
            return Response::from_errors(errors);
        }
    };
    let operation = match document.operations.get(request.operation_name.as_deref()) {
        Ok(operation) => operation,
        Err(_) => {
            let message = match &request.operation_name {
                Some(name) => format!(r#"Unknown operation named "{name}"."#),
                None => "Must provide operation name if query contains multiple operations."
                    .to_string(),
            };
            return request_error(message, VALIDATION_FAILED);
        }
    };
    if operation.operation_type == OperationType::Subscription {
        return request_error(
            "Subscriptions are not supported by the gateway",
            "SUBSCRIPTION_NOT_SUPPORTED",
        );
    }
    let Some(root) = schema
        .schema
        .root_operation(operation.operation_type)
        .and_then(|name| schema.schema.get_object(name))
    else {
        return request_error(
            format!("Schema is not configured for {}s.", operation.operation_type.name()),
            VALIDATION_FAILED,
        );
    };
    let variables = match coerce_variables(&document, operation, &request.variables) {
        Ok(variables) => variables,
        Err(errors) => return Response::from_errors(errors),
    };

    let executor = Executor {
        schema,
        document: &document,
        operation,
        variables,
        context: &context,
        errors: Mutex::new(Vec::new()),
    };
    let mut fields = GroupedFields::new();
    executor.collect_fields(
        &root.name,
        &operation.selection_set,
        &mut fields,
        &mut HashSet::new(),
    );
    let introspects = fields
        .values()
        .flatten()
        .any(|field| field.name == "__schema" || field.name == "__type");
    if introspects && !schema.options.introspection {
        return request_error(
            "GraphQL introspection is not allowed, but the query contained __schema or __type",
            "INTROSPECTION_DISABLED",
        );
    }

    let data = execute_root(&executor, root, &fields).await;
    let errors = executor.errors.into_inner();
    if !errors.is_empty() {
        tracing::debug!(errors = errors.len(), request_id = %context.id(), "operation completed with errors");
    }
    Response::builder()
        .data(data.map(Value::Object).unwrap_or(Value::Null))
        .errors(errors)
        .build()
}

fn request_error(message: impl Into<String>, code: &str) -> Response {
    Response::from_errors(vec![
        Error::builder()
            .message(message.into())
            .extension_code(code)
            .build(),
    ])
}

async fn execute_root(
    executor: &Executor<'_>,
    root: &Node<ObjectType>,
    fields: &GroupedFields<'_>,
) -> Result<Object, PropagateNull> {
    let empty = Value::Object(Object::new());
    let source = match executor.schema.plans.object(&root.name) {
        Some(plan) => {
            let frame = ObjectFrame::root(&root.name, &empty);
            let context = FieldContext::new(
                executor,
                &root.name,
                None,
                &empty,
                Object::new(),
                Path::empty(),
                &frame,
            );
            match Next::object(plan).run(&context).await {
                Ok(source) => source,
                Err(error) => {
                    tracing::debug!(%error, "root object layers failed");
                    executor.errors.lock().push(error.to_graphql_error(None));
                    return Err(PropagateNull);
                }
            }
        }
        None => empty.clone(),
    };
    let frame = ObjectFrame::root(&root.name, &source);
    let serial = executor.operation.operation_type == OperationType::Mutation;
    execute_selection_set(executor, &root.name, fields, &Path::empty(), &frame, serial).await
}

/// <https://spec.graphql.org/October2021/#ExecuteSelectionSet()>
///
/// Mutation root fields run one after another, every other selection set runs concurrently.
async fn execute_selection_set<'f>(
    executor: &'f Executor<'f>,
    object_type: &'f str,
    fields: &'f GroupedFields<'f>,
    path: &'f Path,
    frame: &'f ObjectFrame<'f>,
    serial: bool,
) -> Result<Object, PropagateNull> {
    let results = if serial {
        let mut results = Vec::with_capacity(fields.len());
        for (response_key, fields) in fields {
            results.push(execute_field(executor, object_type, response_key, fields, path, frame).await);
        }
        results
    } else {
        join_all(fields.iter().map(|(response_key, fields)| {
            execute_field(executor, object_type, response_key, fields, path, frame)
        }))
        .await
    };
    let mut object = Object::with_capacity(results.len());
    for (response_key, result) in fields.keys().zip(results) {
        object.insert(response_key.to_string(), result?);
    }
    Ok(object)
}

/// <https://spec.graphql.org/October2021/#ExecuteField()>
async fn execute_field<'f>(
    executor: &'f Executor<'f>,
    parent_type: &'f str,
    response_key: &Name,
    fields: &'f [&'f Node<Field>],
    path: &'f Path,
    frame: &'f ObjectFrame<'f>,
) -> Result<Value, PropagateNull> {
    let field = fields[0];
    let path = path.join_key(response_key.as_str());
    let ty = field.ty();
    if field.name == "__typename" {
        return Ok(Value::from(parent_type));
    }

    let args = coerce_arguments(executor, field);
    let resolved = if introspection::is_introspection_type(parent_type) {
        Ok(introspection::resolve_field(
            &executor.schema.schema,
            parent_type,
            frame.source(),
            &field.name,
            &args,
        ))
    } else {
        let context = FieldContext::new(
            executor,
            parent_type,
            Some(field),
            frame.source(),
            args.clone(),
            path.clone(),
            frame,
        );
        resolve_field(&context).await
    };
    let value = match resolved {
        Ok(value) => value,
        Err(error) => {
            return try_nullify(ty, Err(executor.field_error(&error, &path, field)));
        }
    };
    let completed = complete_value(executor, parent_type, ty, fields, &args, path, frame, value).await;
    try_nullify(ty, completed)
}

/// Runs the plan of a field, after the base policy unless the field is exempt from it.
async fn resolve_field(context: &FieldContext<'_>) -> Result<Value, FieldError> {
    let executor = context.executor;
    let field_name = context.field_name().unwrap_or_default();
    let plan = executor.schema.plans.field(context.parent_type, field_name);
    if !executor.context.ignore_policies() && !plan.base_policy_exempt {
        context.policies().validate_base_policy(context.scope()).await?;
    }
    match field_name {
        "__schema" => Ok(introspection::schema_root()),
        "__type" => Ok(introspection::type_root(
            &executor.schema.schema,
            context.args.get("name"),
        )),
        _ => Next::field(plan).run(context).await,
    }
}

/// <https://spec.graphql.org/October2021/#CompleteValue()>
#[allow(clippy::too_many_arguments)]
fn complete_value<'f>(
    executor: &'f Executor<'f>,
    parent_type: &'f str,
    ty: &'f Type,
    fields: &'f [&'f Node<Field>],
    args: &'f Object,
    path: Path,
    frame: &'f ObjectFrame<'f>,
    value: Value,
) -> BoxFuture<'f, Result<Value, PropagateNull>> {
    async move {
        let field = fields[0];
        if value.is_null() {
            return complete_null(executor, parent_type, ty, field, &path);
        }
        let type_name = match ty {
            Type::List(item_type) | Type::NonNullList(item_type) => {
                let Value::Array(items) = value else {
                    let error = FieldError::resolver(format!(
                        r#"Expected Iterable, but did not find one for field "{parent_type}.{}"."#,
                        field.name
                    ));
                    return Err(executor.field_error(&error, &path, field));
                };
                let items = join_all(items.into_iter().enumerate().map(|(index, item)| {
                    complete_value(
                        executor,
                        parent_type,
                        item_type,
                        fields,
                        args,
                        path.join_index(index),
                        frame,
                        item,
                    )
                    .map(|completed| try_nullify(item_type, completed))
                }))
                .await;
                return items
                    .into_iter()
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array);
            }
            Type::Named(type_name) | Type::NonNullNamed(type_name) => type_name,
        };

        let schema = &executor.schema.schema;
        let leaf = match schema.types.get(type_name) {
            Some(ExtendedType::Scalar(_)) => coerce_scalar(type_name, value),
            Some(ExtendedType::Enum(enum_type)) => {
                let key = match executor.schema.plans.enum_mapping(type_name) {
                    Some(mapping) => mapping.serialize(&value).map(|key| key.to_string()),
                    None => value
                        .as_str()
                        .filter(|key| enum_type.values.contains_key(*key))
                        .map(str::to_string),
                };
                key.map(Value::String).ok_or_else(|| {
                    format!(r#"Enum "{type_name}" cannot represent value: {value}"#)
                })
            }
            Some(ExtendedType::Object(_) | ExtendedType::Interface(_) | ExtendedType::Union(_)) => {
                return complete_object(executor, parent_type, ty, type_name, fields, args, path, frame, value)
                    .await;
            }
            Some(ExtendedType::InputObject(_)) | None => {
                Err(format!("Field {parent_type}.{} has no output type", field.name))
            }
        };
        leaf.map_err(|message| executor.field_error(&FieldError::resolver(message), &path, field))
    }
    .boxed()
}

#[allow(clippy::too_many_arguments)]
async fn complete_object<'f>(
    executor: &'f Executor<'f>,
    parent_type: &'f str,
    ty: &'f Type,
    type_name: &'f Name,
    fields: &'f [&'f Node<Field>],
    args: &'f Object,
    path: Path,
    frame: &'f ObjectFrame<'f>,
    value: Value,
) -> Result<Value, PropagateNull> {
    let field = fields[0];
    let schema = &executor.schema.schema;
    let object_type = match schema.get_object(type_name) {
        Some(object_type) => object_type,
        // Interfaces and unions need the concrete type in the value.
        None => {
            let Some(runtime_type) = value.get("__typename").and_then(Value::as_str) else {
                let error = FieldError::AbstractTypeResolution {
                    type_name: type_name.to_string(),
                };
                return Err(executor.field_error(&error, &path, field));
            };
            match schema.get_object(runtime_type) {
                Some(object_type) if schema.is_subtype(type_name, runtime_type) => object_type,
                _ => {
                    let error = FieldError::resolver(format!(
                        r#"Runtime Object type "{runtime_type}" is not a possible type for "{type_name}"."#
                    ));
                    return Err(executor.field_error(&error, &path, field));
                }
            }
        }
    };

    let value = match executor.schema.plans.object(&object_type.name) {
        Some(plan) => {
            let context = FieldContext::new(
                executor,
                &object_type.name,
                Some(field),
                &value,
                args.clone(),
                path.clone(),
                frame,
            );
            match Next::object(plan).run(&context).await {
                Ok(value) => value,
                Err(error) => return Err(executor.field_error(&error, &path, field)),
            }
        }
        None => value,
    };
    if value.is_null() {
        return complete_null(executor, parent_type, ty, field, &path);
    }
    if !value.is_object() {
        let error = FieldError::resolver(format!(
            r#"Expected a value of type "{}" but received: {value}"#,
            object_type.name
        ));
        return Err(executor.field_error(&error, &path, field));
    }

    let mut sub_fields = GroupedFields::new();
    let mut visited_fragments = HashSet::new();
    for field in fields {
        executor.collect_fields(
            &object_type.name,
            &field.selection_set,
            &mut sub_fields,
            &mut visited_fragments,
        );
    }
    let frame = frame.child(&object_type.name, &value);
    execute_selection_set(executor, &object_type.name, &sub_fields, &path, &frame, false)
        .await
        .map(Value::Object)
}

fn complete_null(
    executor: &Executor<'_>,
    parent_type: &str,
    ty: &Type,
    field: &Node<Field>,
    path: &Path,
) -> Result<Value, PropagateNull> {
    if ty.is_non_null() {
        let error = FieldError::NonNullViolation {
            type_name: parent_type.to_string(),
            field: field.name.to_string(),
        };
        Err(executor.field_error(&error, path, field))
    } else {
        Ok(Value::Null)
    }
}

fn try_nullify(ty: &Type, result: Result<Value, PropagateNull>) -> Result<Value, PropagateNull> {
    match result {
        Ok(value) => Ok(value),
        Err(PropagateNull) if ty.is_non_null() => Err(PropagateNull),
        Err(PropagateNull) => Ok(Value::Null),
    }
}

/// Result coercion of scalars. Custom scalars pass through unchanged.
fn coerce_scalar(type_name: &str, value: Value) -> Result<Value, String> {
    match type_name {
        "Int" => {
            let int = match &value {
                Value::Bool(value) => Some(i64::from(*value)),
                Value::Number(number) => number
                    .as_i64()
                    .or_else(|| number.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
                Value::String(text) => text.trim().parse::<i64>().ok(),
                _ => None,
            };
            match int.and_then(|int| i32::try_from(int).ok()) {
                Some(int) => Ok(Value::from(int)),
                None => Err(format!("Int cannot represent non-integer value: {value}")),
            }
        }
        "Float" => {
            let float = match &value {
                Value::Bool(value) => Some(if *value { 1.0 } else { 0.0 }),
                Value::Number(number) => number.as_f64(),
                Value::String(text) => text.trim().parse::<f64>().ok(),
                _ => None,
            };
            float
                .filter(|float| float.is_finite())
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("Float cannot represent non numeric value: {value}"))
        }
        "String" => match value {
            Value::String(_) => Ok(value),
            Value::Bool(value) => Ok(Value::String(value.to_string())),
            Value::Number(number) => Ok(Value::String(number_to_string(&number))),
            other => Err(format!("String cannot represent value: {other}")),
        },
        "Boolean" => match value {
            Value::Bool(_) => Ok(value),
            Value::Number(number) => Ok(Value::Bool(number.as_f64().is_some_and(|n| n != 0.0))),
            other => Err(format!("Boolean cannot represent a non boolean value: {other}")),
        },
        "ID" => match value {
            Value::String(_) => Ok(value),
            Value::Number(number) if number.is_i64() || number.is_u64() => {
                Ok(Value::String(number.to_string()))
            }
            other => Err(format!("ID cannot represent value: {other}")),
        },
        _ => Ok(value),
    }
}

/// Integral floats print without a fractional part.
fn number_to_string(number: &serde_json::Number) -> String {
    match number.as_f64() {
        Some(float) if number.is_f64() && float.fract() == 0.0 && float.abs() < 1e15 => {
            format!("{}", float as i64)
        }
        _ => number.to_string(),
    }
}

/// Policy queries run against the schema that declares the policy.
#[async_trait::async_trait]
impl PolicyQueryRunner for GatewaySchema {
    async fn run_policy_query(
        &self,
        query: &str,
        variables: Object,
        context: RequestContext,
    ) -> Response {
        let request = Request::builder()
            .query(query.to_string())
            .variables(variables)
            .build();
        execute(self, &request, context).await
    }
}
