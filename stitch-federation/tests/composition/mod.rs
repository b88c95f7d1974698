mod directive_round_trip;
mod validation_errors;

pub(crate) mod test_helpers {
    use stitch_federation::ComposedSchema;
    use stitch_federation::CompositionError;
    use stitch_federation::SchemaFragment;
    use stitch_federation::compose;

    pub(crate) const BASE_TYPE_DEFS: &str = r#"
        scalar JSON
        scalar JSONObject
        type PolicyResult { allow: Boolean! }
        type Policy { default: PolicyResult! }
    "#;

    pub(crate) const BUILTIN_DIRECTIVES: &str = r#"
        directive @localResolver(value: JSON) on OBJECT | FIELD_DEFINITION
        directive @policy(namespace: String!, name: String!, args: JSONObject) on OBJECT | FIELD_DEFINITION
        directive @select(path: [String!]!) on FIELD_DEFINITION
        directive @enumResolver on ENUM
        directive @enumValue(value: JSON!) on ENUM_VALUE
        directive @tag(name: String!) repeatable on OBJECT | INTERFACE | FIELD_DEFINITION
    "#;

    pub(crate) struct ServiceDefinition<'a> {
        pub(crate) name: &'a str,
        pub(crate) type_defs: &'a str,
    }

    /// Composes every service as a fragment of the `test` namespace.
    pub(crate) fn compose_services(
        service_list: &[ServiceDefinition<'_>],
    ) -> Result<ComposedSchema, CompositionError> {
        let fragments = service_list
            .iter()
            .map(|service| SchemaFragment::new("test", service.name, service.type_defs))
            .collect::<Vec<_>>();
        compose(&fragments, BASE_TYPE_DEFS, BUILTIN_DIRECTIVES)
    }

    pub(crate) fn error_codes(result: &Result<ComposedSchema, CompositionError>) -> Vec<&'static str> {
        match result {
            Ok(_) => panic!("Expected an error, but got a successful composition"),
            Err(err) => err.errors().iter().map(|e| e.code()).collect(),
        }
    }
}

pub(crate) use test_helpers::ServiceDefinition;
pub(crate) use test_helpers::compose_services;
pub(crate) use test_helpers::error_codes;
