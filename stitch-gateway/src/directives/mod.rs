//! Resolver plans built from the directives of the composed schema.
//!
//! Every object field gets a [`FieldPlan`]: one base resolver producing the raw value, wrapped by
//! layers that shape, authorize or rewrite it. Plans are built once per schema and shared by
//! every request.

mod enum_resolver;
mod error_handler;
mod gql;
mod local_resolver;
mod policy;
mod rest;
mod select;
mod stub;

use std::collections::HashMap;

use apollo_compiler::Name;
use apollo_compiler::Schema;
use apollo_compiler::ast;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::schema::FieldDefinition;
use apollo_compiler::schema::Type;
use apollo_compiler::validation::Valid;
use futures::FutureExt;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::de::DeserializeOwned;

pub(crate) use self::enum_resolver::EnumMapping;
use self::error_handler::ErrorHandler;
use self::gql::GqlDirective;
use self::local_resolver::LocalResolver;
use self::policy::PoliciesDirective;
use self::policy::PolicyDirective;
use self::policy::PolicyQueryDirective;
use self::rest::RestDirective;
use self::select::Select;
use self::stub::Stub;
use crate::error::FieldError;
use crate::error::PolicyRef;
use crate::error::ResourceError;
use crate::execution::FieldContext;
use crate::execution::coercion::graphql_value_to_json;
use crate::injection::TemplateEngine;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::json_ext::ValueExt;
use crate::policy::PolicyRegistry;

/// Definitions of the directives the gateway interprets, with the types their arguments use.
pub(crate) const BUILTIN_DIRECTIVES: &str = r#"
input PolicyDetails {
  namespace: String!
  name: String!
  args: JSONObject
}

enum Relation {
  AND
  OR
}

enum LocalResolverMergeStrategy {
  Replace
  Merge
  MergeDeep
}

enum GraphQLOperationType {
  Query
  Mutation
}

input KeyValue {
  key: String!
  value: String!
  required: Boolean
}

input CatchErrorInput {
  condition: String
  returnValue: JSON
}

input ThrowErrorInput {
  condition: String
  errorToThrow: String
}

directive @stub(value: JSON) on FIELD_DEFINITION

directive @rest(
  url: String!
  method: String = "GET"
  body: String
  bodyArg: String
  query: [KeyValue!]
  headers: [KeyValue!]
  timeoutMs: Int
  notFoundAsNull: Boolean
) on FIELD_DEFINITION

directive @gql(
  url: String!
  fieldName: String!
  operationType: GraphQLOperationType
  arguments: JSONObject
  timeoutMs: Int
) on FIELD_DEFINITION

directive @export(key: String!) on FIELD_DEFINITION

directive @select(path: [String!]!) on FIELD_DEFINITION

directive @policy(
  namespace: String!
  name: String!
  args: JSONObject
  postResolve: Boolean
) on OBJECT | FIELD_DEFINITION

directive @policies(
  policies: [PolicyDetails!]!
  relation: Relation = OR
  postResolve: Boolean = false
) on OBJECT | FIELD_DEFINITION

directive @policyQuery(namespace: String!, name: String!) on FIELD_DEFINITION

directive @localResolver(
  value: JSON
  mergeStrategy: LocalResolverMergeStrategy = Replace
  enabledIf: String = "{ true }"
) on OBJECT | FIELD_DEFINITION

directive @errorHandler(
  catchError: CatchErrorInput
  throwError: ThrowErrorInput
) on OBJECT | FIELD_DEFINITION

directive @enumValue(value: JSON!) on ENUM_VALUE

directive @enumResolver on ENUM
"#;

/// Produces the raw value of a field. Exactly one per field.
#[derive(Debug, Clone)]
pub(crate) enum BaseResolver {
    /// Reads the field's name from the parent value.
    Property,
    Stub(Stub),
    Rest(RestDirective),
    Gql(GqlDirective),
    PolicyQuery(PolicyQueryDirective),
}

impl BaseResolver {
    fn resolve<'a>(
        &'a self,
        field: &'a FieldContext<'a>,
    ) -> BoxFuture<'a, Result<Value, FieldError>> {
        match self {
            BaseResolver::Property => futures::future::ready(Ok(field.property())).boxed(),
            BaseResolver::Stub(stub) => futures::future::ready(Ok(stub.resolve(field))).boxed(),
            BaseResolver::Rest(rest) => rest.resolve(field).boxed(),
            BaseResolver::Gql(gql) => gql.resolve(field).boxed(),
            BaseResolver::PolicyQuery(policy_query) => policy_query.resolve(field).boxed(),
        }
    }
}

/// A directive wrapping the resolvers beneath it.
#[derive(Debug, Clone)]
pub(crate) enum Layer {
    LocalResolver(LocalResolver),
    Select(Select),
    Policy(PolicyDirective),
    Policies(PoliciesDirective),
    ErrorHandler(ErrorHandler),
}

impl Layer {
    fn resolve<'a>(
        &'a self,
        field: &'a FieldContext<'a>,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Value, FieldError>> {
        match self {
            Layer::LocalResolver(local) => local.resolve(field, next).boxed(),
            Layer::Select(select) => select.resolve(field, next).boxed(),
            Layer::Policy(policy) => policy.resolve(field, next).boxed(),
            Layer::Policies(policies) => policies.resolve(field, next).boxed(),
            Layer::ErrorHandler(handler) => handler.resolve(field, next).boxed(),
        }
    }
}

/// The rest of a resolver chain.
#[derive(Clone, Copy)]
pub(crate) struct Next<'a> {
    layers: &'a [Layer],
    base: Option<&'a BaseResolver>,
}

impl<'a> Next<'a> {
    pub(crate) fn field(plan: &'a FieldPlan) -> Self {
        Self {
            layers: &plan.layers,
            base: Some(&plan.base),
        }
    }

    /// The object chain ends with the object value itself.
    pub(crate) fn object(plan: &'a ObjectPlan) -> Self {
        Self {
            layers: &plan.layers,
            base: None,
        }
    }

    pub(crate) fn run(self, field: &'a FieldContext<'a>) -> BoxFuture<'a, Result<Value, FieldError>> {
        match self.layers.split_first() {
            Some((layer, layers)) => layer.resolve(
                field,
                Next {
                    layers,
                    base: self.base,
                },
            ),
            None => match self.base {
                Some(base) => base.resolve(field),
                None => futures::future::ready(Ok(field.source.clone())).boxed(),
            },
        }
    }
}

/// How one field is resolved. Layers are ordered outermost first.
#[derive(Debug, Clone)]
pub(crate) struct FieldPlan {
    pub(crate) base: BaseResolver,
    pub(crate) layers: Vec<Layer>,
    pub(crate) export: Option<String>,
    pub(crate) base_policy_exempt: bool,
}

static DEFAULT_FIELD_PLAN: FieldPlan = FieldPlan {
    base: BaseResolver::Property,
    layers: Vec::new(),
    export: None,
    base_policy_exempt: false,
};

impl FieldPlan {
    fn build(
        schema: &Schema,
        policies: &PolicyRegistry,
        type_name: &Name,
        field: &FieldDefinition,
        inherited_policy: Option<&PolicyDirective>,
    ) -> Result<Self, ResourceError> {
        let location = format!("{type_name}.{}", field.name);
        let mut base = None;
        let mut shaping = Vec::new();
        let mut auth = Vec::new();
        let mut handlers = Vec::new();
        let mut export = None;
        let mut own_policies = Vec::new();

        for directive in field.directives.iter() {
            let resolver = match directive.name.as_str() {
                "stub" => Some(BaseResolver::Stub(directive_arguments(schema, directive, &location)?)),
                "rest" => Some(BaseResolver::Rest(directive_arguments(schema, directive, &location)?)),
                "gql" => Some(BaseResolver::Gql(directive_arguments(schema, directive, &location)?)),
                "policyQuery" => Some(BaseResolver::PolicyQuery(directive_arguments(
                    schema, directive, &location,
                )?)),
                "localResolver" => {
                    shaping.push(Layer::LocalResolver(directive_arguments(
                        schema, directive, &location,
                    )?));
                    None
                }
                "select" => {
                    shaping.push(Layer::Select(directive_arguments(schema, directive, &location)?));
                    None
                }
                "export" => {
                    let ExportDirective { key } = directive_arguments(schema, directive, &location)?;
                    export = Some(key);
                    None
                }
                "policy" => {
                    let policy: PolicyDirective = directive_arguments(schema, directive, &location)?;
                    own_policies.push(policy.policy_ref());
                    auth.push(Layer::Policy(policy));
                    None
                }
                "policies" => {
                    auth.push(Layer::Policies(directive_arguments(schema, directive, &location)?));
                    None
                }
                "errorHandler" => {
                    handlers.push(Layer::ErrorHandler(directive_arguments(
                        schema, directive, &location,
                    )?));
                    None
                }
                _ => None,
            };
            if let Some(resolver) = resolver {
                if base.replace(resolver).is_some() {
                    return Err(ResourceError::SchemaBuild {
                        message: format!("{location} has more than one resolver directive"),
                    });
                }
            }
        }

        if own_policies.is_empty() {
            if let Some(inherited) = inherited_policy {
                auth.push(Layer::Policy(inherited.clone()));
            }
        }

        let base_policy_exempt = own_policies.iter().any(|policy: &PolicyRef| {
            policies
                .get(policy)
                .is_some_and(|compiled| compiled.definition.overrides_base_policy())
        });

        // The first directive of a kind is the innermost.
        let layers = handlers
            .into_iter()
            .rev()
            .chain(auth.into_iter().rev())
            .chain(shaping.into_iter().rev())
            .collect();

        Ok(Self {
            base: base.unwrap_or(BaseResolver::Property),
            layers,
            export,
            base_policy_exempt,
        })
    }
}

/// Layers applied once to every value of an object type, before its fields resolve.
#[derive(Debug, Clone, Default)]
pub(crate) struct ObjectPlan {
    pub(crate) layers: Vec<Layer>,
}

impl ObjectPlan {
    fn build<'d>(
        schema: &Schema,
        type_name: &Name,
        directives: impl Iterator<Item = &'d ast::Directive>,
    ) -> Result<Self, ResourceError> {
        let location = type_name.to_string();
        let mut shaping = Vec::new();
        let mut auth = Vec::new();
        let mut handlers = Vec::new();
        for directive in directives {
            match directive.name.as_str() {
                "localResolver" => shaping.push(Layer::LocalResolver(directive_arguments(
                    schema, directive, &location,
                )?)),
                "policies" => {
                    auth.push(Layer::Policies(directive_arguments(schema, directive, &location)?))
                }
                "errorHandler" => handlers.push(Layer::ErrorHandler(directive_arguments(
                    schema, directive, &location,
                )?)),
                _ => {}
            }
        }
        Ok(Self {
            layers: handlers
                .into_iter()
                .rev()
                .chain(auth.into_iter().rev())
                .chain(shaping.into_iter().rev())
                .collect(),
        })
    }
}

#[derive(Deserialize)]
struct ExportDirective {
    key: String,
}

/// Every plan of a composed schema.
#[derive(Debug, Default)]
pub(crate) struct ResolverPlans {
    fields: HashMap<Name, IndexMap<Name, FieldPlan>>,
    objects: HashMap<Name, ObjectPlan>,
    enums: HashMap<Name, EnumMapping>,
    /// Per type, export key to the field whose value is exported.
    exports: HashMap<Name, IndexMap<String, Name>>,
}

impl ResolverPlans {
    pub(crate) fn build(
        schema: &Valid<Schema>,
        policies: &PolicyRegistry,
    ) -> Result<Self, ResourceError> {
        let mut plans = Self::default();
        for (type_name, definition) in &schema.types {
            if definition.is_built_in() {
                continue;
            }
            match definition {
                ExtendedType::Object(object) => {
                    let location = type_name.to_string();
                    let inherited_policy = object
                        .directives
                        .get("policy")
                        .map(|directive| {
                            directive_arguments::<PolicyDirective>(schema, directive, &location)
                        })
                        .transpose()?;
                    let object_plan = ObjectPlan::build(
                        schema,
                        type_name,
                        object.directives.iter().map(|directive| &***directive),
                    )?;
                    if !object_plan.layers.is_empty() {
                        plans.objects.insert(type_name.clone(), object_plan);
                    }

                    let mut fields = IndexMap::new();
                    for (field_name, field) in &object.fields {
                        let plan = FieldPlan::build(
                            schema,
                            policies,
                            type_name,
                            field,
                            inherited_policy.as_ref(),
                        )?;
                        if let Some(key) = &plan.export {
                            plans
                                .exports
                                .entry(type_name.clone())
                                .or_default()
                                .insert(key.clone(), field_name.clone());
                        }
                        fields.insert(field_name.clone(), plan);
                    }
                    plans.fields.insert(type_name.clone(), fields);
                }
                ExtendedType::Enum(enum_type) if enum_type.directives.get("enumResolver").is_some() => {
                    plans.enums.insert(
                        type_name.clone(),
                        EnumMapping::build(schema, type_name, enum_type)?,
                    );
                }
                _ => {}
            }
        }
        tracing::debug!(
            types = plans.fields.len(),
            objects = plans.objects.len(),
            enums = plans.enums.len(),
            "resolver plans built"
        );
        Ok(plans)
    }

    /// The plan of `type_name.field_name`; fields without directives read the parent value.
    pub(crate) fn field(&self, type_name: &str, field_name: &str) -> &FieldPlan {
        self.fields
            .get(type_name)
            .and_then(|fields| fields.get(field_name))
            .unwrap_or(&DEFAULT_FIELD_PLAN)
    }

    pub(crate) fn object(&self, type_name: &str) -> Option<&ObjectPlan> {
        self.objects.get(type_name)
    }

    pub(crate) fn enum_mapping(&self, type_name: &str) -> Option<&EnumMapping> {
        self.enums.get(type_name)
    }

    pub(crate) fn exports(&self, type_name: &str) -> Option<&IndexMap<String, Name>> {
        self.exports.get(type_name)
    }

    pub(crate) fn has_exports(&self) -> bool {
        !self.exports.is_empty()
    }

    /// Replaces `@enumResolver` keys found in an input value by their mapped values.
    pub(crate) fn parse_input(&self, schema: &Schema, ty: &Type, value: Value) -> Value {
        match (ty, value) {
            (_, Value::Null) => Value::Null,
            (Type::List(inner) | Type::NonNullList(inner), Value::Array(items)) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.parse_input(schema, inner, item))
                    .collect(),
            ),
            // A single value is coerced into a list of one.
            (Type::List(inner) | Type::NonNullList(inner), item) => {
                Value::Array(vec![self.parse_input(schema, inner, item)])
            }
            (Type::Named(name) | Type::NonNullNamed(name), value) => {
                self.parse_named_input(schema, name, value)
            }
        }
    }

    fn parse_named_input(&self, schema: &Schema, type_name: &Name, value: Value) -> Value {
        if let Some(mapping) = self.enums.get(type_name) {
            return match &value {
                Value::String(key) => mapping.parse(key).cloned().unwrap_or(value),
                _ => value,
            };
        }
        match (schema.types.get(type_name), value) {
            (Some(ExtendedType::InputObject(input)), Value::Object(mut object)) => {
                for (field_name, field) in &input.fields {
                    match object.get_mut(field_name.as_str()) {
                        Some(slot) => {
                            let value = slot.take();
                            *slot = self.parse_input(schema, &field.ty, value);
                        }
                        None => {
                            if let Some(default) = &field.default_value {
                                let value = graphql_value_to_json(default, None);
                                object.insert(
                                    field_name.to_string(),
                                    self.parse_input(schema, &field.ty, value),
                                );
                            }
                        }
                    }
                }
                Value::Object(object)
            }
            (_, value) => value,
        }
    }
}

/// Deserializes the arguments of `directive`, defaults from its definition included.
fn directive_arguments<T: DeserializeOwned>(
    schema: &Schema,
    directive: &ast::Directive,
    location: &str,
) -> Result<T, ResourceError> {
    let mut arguments = Object::new();
    if let Some(definition) = schema.directive_definitions.get(&directive.name) {
        for argument in &definition.arguments {
            if let Some(default) = &argument.default_value {
                arguments.insert(
                    argument.name.to_string(),
                    graphql_value_to_json(default, None),
                );
            }
        }
    }
    for argument in &directive.arguments {
        arguments.insert(
            argument.name.to_string(),
            graphql_value_to_json(&argument.value, None),
        );
    }
    serde_json::from_value(Value::Object(arguments)).map_err(|error| ResourceError::SchemaBuild {
        message: format!("invalid @{} on {location}: {error}", directive.name),
    })
}

/// Whether `template` evaluates to a truthy value. Evaluation failures count as false.
pub(crate) fn condition_holds(engine: &TemplateEngine, template: &str, scope: &Object) -> bool {
    match engine.try_evaluate(template, scope) {
        Ok(Some(value)) => value.is_truthy(),
        Ok(None) => false,
        Err(error) => {
            tracing::trace!(template, %error, "condition could not be evaluated");
            false
        }
    }
}
