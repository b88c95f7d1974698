use apollo_compiler::Node;
use apollo_compiler::executable::Field;
use once_cell::sync::OnceCell;

use super::Executor;
use crate::context::RequestContext;
use crate::directives::ResolverPlans;
use crate::injection::TemplateEngine;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::Value;
use crate::policy::PolicyEvaluator;
use crate::schema::SchemaOptions;

/// An object value being resolved, linked to the objects above it in the response.
pub(crate) struct ObjectFrame<'a> {
    type_name: &'a str,
    source: &'a Value,
    parent: Option<&'a ObjectFrame<'a>>,
}

impl<'a> ObjectFrame<'a> {
    pub(crate) fn root(type_name: &'a str, source: &'a Value) -> Self {
        Self {
            type_name,
            source,
            parent: None,
        }
    }

    pub(crate) fn child(&'a self, type_name: &'a str, source: &'a Value) -> Self {
        Self {
            type_name,
            source,
            parent: Some(self),
        }
    }

    pub(crate) fn source(&self) -> &'a Value {
        self.source
    }

    /// Values exported by this object and its ancestors. The closest exporter of a key wins.
    fn exports(&self, plans: &ResolverPlans) -> Object {
        let mut frames = Vec::new();
        let mut frame = Some(self);
        while let Some(current) = frame {
            frames.push(current);
            frame = current.parent;
        }
        let mut exports = Object::new();
        for frame in frames.into_iter().rev() {
            let Some(exported) = plans.exports(frame.type_name) else {
                continue;
            };
            for (key, field_name) in exported {
                let value = frame
                    .source
                    .get(field_name.as_str())
                    .cloned()
                    .unwrap_or(Value::Null);
                exports.insert(key.clone(), value);
            }
        }
        exports
    }
}

/// Everything a resolver layer can see while resolving one field, or one object value.
///
/// Object level layers have no field when they run for the root operation type.
pub(crate) struct FieldContext<'a> {
    pub(crate) executor: &'a Executor<'a>,
    pub(crate) parent_type: &'a str,
    pub(crate) field: Option<&'a Node<Field>>,
    pub(crate) source: &'a Value,
    pub(crate) args: Object,
    pub(crate) path: Path,
    frame: &'a ObjectFrame<'a>,
    scope: OnceCell<Object>,
}

impl<'a> FieldContext<'a> {
    pub(crate) fn new(
        executor: &'a Executor<'a>,
        parent_type: &'a str,
        field: Option<&'a Node<Field>>,
        source: &'a Value,
        args: Object,
        path: Path,
        frame: &'a ObjectFrame<'a>,
    ) -> Self {
        Self {
            executor,
            parent_type,
            field,
            source,
            args,
            path,
            frame,
            scope: OnceCell::new(),
        }
    }

    pub(crate) fn field_name(&self) -> Option<&'a str> {
        self.field.map(|field| field.name.as_str())
    }

    /// The template scope, built on first use.
    pub(crate) fn scope(&self) -> &Object {
        self.scope.get_or_init(|| {
            let executor = self.executor;
            let request = executor.context;
            let variables = Value::Object(executor.variables.clone());

            let mut info = Object::new();
            info.insert(
                "fieldName".to_string(),
                self.field_name().map(Value::from).unwrap_or(Value::Null),
            );
            info.insert("parentType".to_string(), Value::from(self.parent_type));
            info.insert(
                "returnType".to_string(),
                match self.field {
                    Some(field) => Value::String(field.ty().to_string()),
                    None => Value::from(self.parent_type),
                },
            );
            info.insert("path".to_string(), self.path.to_value());
            info.insert(
                "operationName".to_string(),
                executor
                    .operation
                    .name
                    .as_ref()
                    .map(|name| Value::from(name.as_str()))
                    .unwrap_or(Value::Null),
            );
            info.insert("variableValues".to_string(), variables.clone());

            let mut scope = Object::new();
            scope.insert("source".to_string(), self.source.clone());
            scope.insert("args".to_string(), Value::Object(self.args.clone()));
            scope.insert(
                "jwt".to_string(),
                request
                    .decode_once()
                    .map(|claims| Value::Object(claims.clone()))
                    .unwrap_or(Value::Null),
            );
            scope.insert("headers".to_string(), request.headers_value().clone());
            scope.insert(
                "isAnonymousAccess".to_string(),
                Value::Bool(request.is_anonymous_access()),
            );
            scope.insert("vars".to_string(), variables);
            scope.insert("info".to_string(), Value::Object(info));
            if executor.schema.plans.has_exports() {
                scope.insert(
                    "exports".to_string(),
                    Value::Object(self.frame.exports(&executor.schema.plans)),
                );
            }
            scope
        })
    }

    /// The scope with one more key, such as `result` or `error`.
    pub(crate) fn scope_with(&self, key: &str, value: Value) -> Object {
        let mut scope = self.scope().clone();
        scope.insert(key.to_string(), value);
        scope
    }

    pub(crate) fn engine(&self) -> &'a TemplateEngine {
        &self.executor.schema.options.engine
    }

    pub(crate) fn options(&self) -> &'a SchemaOptions {
        &self.executor.schema.options
    }

    pub(crate) fn request(&self) -> &'a RequestContext {
        self.executor.context
    }

    pub(crate) fn policies(&self) -> PolicyEvaluator<'a> {
        PolicyEvaluator {
            registry: &self.executor.schema.policies,
            engine: self.engine(),
            queries: self.executor.schema,
            context: self.executor.context,
        }
    }

    /// The default resolver: the field's name read from the parent value.
    ///
    /// Values fetched with `@gql` are keyed by response key, so an aliased field whose name is
    /// missing from the parent reads its alias instead.
    pub(crate) fn property(&self) -> Value {
        let Some(field) = self.field else {
            return Value::Null;
        };
        self.source
            .get(field.name.as_str())
            .or_else(|| {
                field
                    .alias
                    .as_ref()
                    .and_then(|alias| self.source.get(alias.as_str()))
            })
            .cloned()
            .unwrap_or(Value::Null)
    }
}
