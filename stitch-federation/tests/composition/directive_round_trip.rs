use stitch_federation::DirectiveTarget;

use super::ServiceDefinition;
use super::compose_services;

fn printed_usages(sdl: &str) -> String {
    let composed = compose_services(&[ServiceDefinition {
        name: "main",
        type_defs: sdl,
    }])
    .unwrap();
    composed
        .directive_usages
        .iter()
        .map(|usage| {
            let owner = match &usage.owner_field {
                Some(field) => format!("{}.{field}", usage.owner_type),
                None => usage.owner_type.to_string(),
            };
            format!("{:?} {owner} {}", usage.target, usage.directive)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

mod simple_cases {
    use super::*;

    #[test]
    fn field_directive_survives_composition() {
        let composed = compose_services(&[ServiceDefinition {
            name: "hello",
            type_defs: r#"type Query { hello: String! @localResolver(value: "world!") }"#,
        }])
        .unwrap();
        assert!(
            composed
                .sdl()
                .contains(r#"hello: String! @localResolver(value: "world!")"#)
        );
        let field = composed.schema.type_field("Query", "hello").unwrap();
        assert!(field.directives.get("localResolver").is_some());
    }

    #[test]
    fn records_every_usage_with_its_owner() {
        insta::assert_snapshot!(printed_usages(r##"
            type Query @policy(namespace: "ns", name: "read") {
              user: User @select(path: ["data", "user"])
            }

            type User @tag(name: "user") @tag(name: "person") {
              id: ID!
              color: Color @localResolver(value: "RED")
            }

            enum Color @enumResolver {
              RED @enumValue(value: "#f00")
              GREEN @enumValue(value: "#0f0")
            }
        "##), @r###"
        Object Query @policy(namespace: "ns", name: "read")
        Field Query.user @select(path: ["data", "user"])
        Object User @tag(name: "user")
        Object User @tag(name: "person")
        Field User.color @localResolver(value: "RED")
        Enum Color @enumResolver
        EnumValue Color.RED @enumValue(value: "#f00")
        EnumValue Color.GREEN @enumValue(value: "#0f0")
        "###);
    }

    #[test]
    fn federation_directives_are_not_recorded_or_printed() {
        let composed = compose_services(&[ServiceDefinition {
            name: "products",
            type_defs: r#"
                type Query { product: Product }
                type Product @key(fields: "id") @tag(name: "product") {
                  id: ID!
                  name: String @deprecated(reason: "use title")
                }
            "#,
        }])
        .unwrap();
        let sdl = composed.sdl();
        assert!(!sdl.contains("@key"));
        assert!(sdl.contains(r#"@deprecated(reason: "use title")"#));
        assert!(sdl.contains(r#"type Product @tag(name: "product")"#));
        assert_eq!(composed.directive_usages.len(), 1);
    }

    #[test]
    fn interface_usages_are_reattached() {
        let composed = compose_services(&[ServiceDefinition {
            name: "nodes",
            type_defs: r#"
                type Query { node: Node }
                interface Node @tag(name: "node") { id: ID! @tag(name: "id") }
                type Thing implements Node { id: ID! }
            "#,
        }])
        .unwrap();
        let node = composed.schema.get_interface("Node").unwrap();
        assert!(node.directives.get("tag").is_some());
        let id = composed.schema.type_field("Node", "id").unwrap();
        assert!(id.directives.get("tag").is_some());
        assert!(
            composed
                .directive_usages
                .iter()
                .any(|usage| usage.target == DirectiveTarget::Field)
        );
    }
}

mod across_fragments {
    use super::*;

    #[test]
    fn extension_usages_land_on_the_composed_type() {
        let composed = compose_services(&[
            ServiceDefinition {
                name: "users",
                type_defs: r#"
                    type Query { me: User }
                    type User @key(fields: "id") { id: ID! }
                "#,
            },
            ServiceDefinition {
                name: "reviews",
                type_defs: r#"
                    extend type User @key(fields: "id") @policy(namespace: "reviews", name: "owner") {
                      id: ID! @external
                      reviews: [String] @localResolver(value: ["great"])
                    }
                "#,
            },
        ])
        .unwrap();
        let user = composed.schema.get_object("User").unwrap();
        assert!(user.directives.get("policy").is_some());
        assert!(user.fields.contains_key("reviews"));
        let reviews = composed.schema.type_field("User", "reviews").unwrap();
        assert!(reviews.directives.get("localResolver").is_some());
    }

    #[test]
    fn extends_directive_counts_as_an_extension() {
        let composed = compose_services(&[
            ServiceDefinition {
                name: "users",
                type_defs: r#"type User @key(fields: "id") { id: ID! } type Query { me: User }"#,
            },
            ServiceDefinition {
                name: "accounts",
                type_defs: r#"
                    type User @extends @key(fields: "id") {
                      id: ID! @external
                      plan: String @localResolver(value: "free")
                    }
                "#,
            },
        ])
        .unwrap();
        assert!(composed.sdl().contains(r#"plan: String @localResolver(value: "free")"#));
        assert!(!composed.sdl().contains("@extends"));
    }

    #[test]
    fn value_type_field_usages_concatenate_in_fragment_order() {
        let composed = compose_services(&[
            ServiceDefinition {
                name: "a",
                type_defs: r#"
                    type Query { money: Money }
                    type Money { amount: Int @tag(name: "a") }
                "#,
            },
            ServiceDefinition {
                name: "b",
                type_defs: r#"type Money { amount: Int @tag(name: "b") }"#,
            },
        ])
        .unwrap();
        assert!(
            composed
                .sdl()
                .contains(r#"amount: Int @tag(name: "a") @tag(name: "b")"#)
        );
    }

    #[test]
    fn enum_usages_keep_the_first_fragment() {
        let composed = compose_services(&[
            ServiceDefinition {
                name: "a",
                type_defs: r#"
                    type Query { color: Color }
                    enum Color @enumResolver { RED @enumValue(value: "r") }
                "#,
            },
            ServiceDefinition {
                name: "b",
                type_defs: r#"enum Color @enumResolver { RED @enumValue(value: "red") BLUE @enumValue(value: "b") }"#,
            },
        ])
        .unwrap();
        let sdl = composed.sdl();
        assert!(sdl.contains(r#"RED @enumValue(value: "r")"#));
        assert!(!sdl.contains(r#""red""#));
        assert!(sdl.contains(r#"BLUE @enumValue(value: "b")"#));
        assert_eq!(sdl.matches("@enumResolver").count(), 2);
    }
}
