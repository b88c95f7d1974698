use pretty_assertions::assert_eq;
use stitch_federation::CompositionError;

use super::ServiceDefinition;
use super::compose_services;
use super::error_codes;

const USERS: ServiceDefinition<'static> = ServiceDefinition {
    name: "users",
    type_defs: r#"
        type Query { me: User }
        type User @key(fields: "id") @key(fields: "email") {
          id: ID!
          email: String!
          name: String
        }
    "#,
};

mod entities {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn extension_with_a_key_unknown_to_the_owner() {
        let result = compose_services(&[
            USERS,
            ServiceDefinition {
                name: "reviews",
                type_defs: r#"
                    extend type User @key(fields: "name") {
                      name: String @external
                      reviews: [String]
                    }
                "#,
            },
        ]);
        assert_eq!(error_codes(&result), ["KEY_MISSING_ON_BASE"]);
        let message = result.unwrap_err().to_string();
        assert!(message.starts_with("Federation validation failed: [test/reviews] User -> extends from test/users"));
        assert!(message.contains(r#"@key(fields: "id"), @key(fields: "email")"#));
    }

    #[test]
    fn extension_with_more_than_one_key() {
        let result = compose_services(&[
            USERS,
            ServiceDefinition {
                name: "reviews",
                type_defs: r#"
                    extend type User @key(fields: "id") @key(fields: "email") {
                      id: ID! @external
                      email: String! @external
                    }
                "#,
            },
        ]);
        assert_eq!(error_codes(&result), ["MULTIPLE_KEYS_ON_EXTENSION"]);
    }

    #[test]
    fn key_selecting_a_field_the_owner_lacks() {
        let result = compose_services(&[ServiceDefinition {
            name: "users",
            type_defs: r#"
                type Query { me: User }
                type User @key(fields: "uuid") { id: ID! }
            "#,
        }]);
        assert_eq!(error_codes(&result), ["KEY_FIELDS_MISSING_ON_BASE"]);
    }

    #[test]
    fn extension_key_selecting_an_undeclared_field() {
        let result = compose_services(&[
            USERS,
            ServiceDefinition {
                name: "reviews",
                type_defs: r#"
                    extend type User @key(fields: "id") {
                      reviews: [String]
                    }
                "#,
            },
        ]);
        assert_eq!(error_codes(&result), ["KEY_FIELDS_MISSING_EXTERNAL"]);
    }

    #[test]
    fn malformed_key_field_set() {
        let result = compose_services(&[ServiceDefinition {
            name: "users",
            type_defs: r#"
                type Query { me: User }
                type User @key(fields: "id {") { id: ID! }
            "#,
        }]);
        assert_eq!(error_codes(&result), ["INVALID_FIELD_SET"]);
    }

    #[test]
    fn two_owners_for_one_entity() {
        let result = compose_services(&[
            USERS,
            ServiceDefinition {
                name: "accounts",
                type_defs: r#"type User @key(fields: "id") { id: ID! }"#,
            },
        ]);
        assert_eq!(
            error_codes(&result),
            ["DUPLICATE_ENTITY_OWNER", "FIELD_DEFINED_MULTIPLE_TIMES"]
        );
    }

    #[test]
    fn external_field_missing_on_the_owner() {
        let result = compose_services(&[
            USERS,
            ServiceDefinition {
                name: "reviews",
                type_defs: r#"
                    extend type User @key(fields: "id") {
                      id: ID! @external
                      nickname: String @external
                    }
                "#,
            },
        ]);
        assert_eq!(error_codes(&result), ["EXTERNAL_MISSING_ON_BASE"]);
    }

    #[test]
    fn extension_without_any_base() {
        let result = compose_services(&[ServiceDefinition {
            name: "reviews",
            type_defs: r#"
                type Query { a: String }
                extend type Review @key(fields: "id") { id: ID! @external }
            "#,
        }]);
        assert_eq!(error_codes(&result), ["EXTENSION_WITH_NO_BASE"]);
    }

    #[test]
    fn matching_extension_composes() {
        let composed = compose_services(&[
            USERS,
            ServiceDefinition {
                name: "reviews",
                type_defs: r#"
                    extend type User @key(fields: "email") {
                      email: String! @external
                      reviews: [String]
                    }
                "#,
            },
        ])
        .unwrap();
        let user = composed.schema.get_object("User").unwrap();
        let fields = user.fields.keys().map(|name| name.as_str()).collect::<Vec<_>>();
        assert_eq!(fields, ["id", "email", "name", "reviews"]);
    }
}

mod value_types {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn same_field_with_different_types() {
        let result = compose_services(&[
            ServiceDefinition {
                name: "a",
                type_defs: "type Query { money: Money } type Money { amount: Int }",
            },
            ServiceDefinition {
                name: "b",
                type_defs: "type Money { amount: Float }",
            },
        ]);
        assert_eq!(error_codes(&result), ["FIELD_TYPE_MISMATCH"]);
    }

    #[test]
    fn same_name_with_different_kinds() {
        let result = compose_services(&[
            ServiceDefinition {
                name: "a",
                type_defs: "type Query { color: Color } type Color { hex: String }",
            },
            ServiceDefinition {
                name: "b",
                type_defs: "enum Color { RED }",
            },
        ]);
        assert_eq!(error_codes(&result), ["VALUE_TYPE_KIND_MISMATCH"]);
    }

    #[test]
    fn root_fields_have_a_single_owner() {
        let result = compose_services(&[
            ServiceDefinition {
                name: "a",
                type_defs: "type Query { shared: String }",
            },
            ServiceDefinition {
                name: "b",
                type_defs: "type Query { shared: String }",
            },
        ]);
        assert_eq!(error_codes(&result), ["FIELD_DEFINED_MULTIPLE_TIMES"]);
    }

    #[test]
    fn root_fields_merge_across_fragments() {
        let composed = compose_services(&[
            ServiceDefinition {
                name: "a",
                type_defs: "type Query { a: String }",
            },
            ServiceDefinition {
                name: "b",
                type_defs: "extend type Query { b: String }",
            },
        ])
        .unwrap();
        let query = composed.schema.get_object("Query").unwrap();
        assert_eq!(query.fields.len(), 2);
    }
}

mod failures {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn syntax_errors_abort_before_merging() {
        let result = compose_services(&[
            ServiceDefinition {
                name: "ok",
                type_defs: "type Query { a: String }",
            },
            ServiceDefinition {
                name: "broken",
                type_defs: "type Query {",
            },
        ]);
        let Err(err) = result else {
            panic!("Expected an error, but got a successful composition");
        };
        assert_eq!(err.code(), "INVALID_SDL");
        assert!(matches!(&err, CompositionError::InvalidSdl { fragment, .. } if fragment == "test/broken"));
        assert!(err.errors().is_empty());
    }

    #[test]
    fn unknown_types_fail_validation() {
        let result = compose_services(&[ServiceDefinition {
            name: "a",
            type_defs: "type Query { a: Unknown }",
        }]);
        let codes = error_codes(&result);
        assert!(!codes.is_empty());
        assert!(codes.iter().all(|code| *code == "INVALID_GRAPHQL"));
    }

    #[test]
    fn undefined_custom_directives_fail_validation() {
        let result = compose_services(&[ServiceDefinition {
            name: "a",
            type_defs: r#"type Query { a: String @nope(value: 1) }"#,
        }]);
        let codes = error_codes(&result);
        assert!(!codes.is_empty());
        assert!(codes.iter().all(|code| *code == "INVALID_GRAPHQL"));
    }

    #[test]
    fn aggregate_message_is_truncated_after_five_errors() {
        let services = (0..7)
            .map(|i| format!("type Query {{ shared: String }} type T{i} {{ a: Int }}"))
            .collect::<Vec<_>>();
        let services = services
            .iter()
            .enumerate()
            .map(|(i, type_defs)| ServiceDefinition {
                name: ["a", "b", "c", "d", "e", "f", "g"][i],
                type_defs: type_defs.as_str(),
            })
            .collect::<Vec<_>>();
        let err = compose_services(&services).unwrap_err();
        assert_eq!(err.code(), "FEDERATION_VALIDATION_FAILURE");
        assert_eq!(err.errors().len(), 6);
        assert!(err.to_string().ends_with("...and 1 other errors"));
    }
}
