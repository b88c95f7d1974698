//! Requests served end to end from resource groups held in memory.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use http::HeaderMap;
use pretty_assertions::assert_eq;
use rstest::rstest;
use serde_json::Value;
use serde_json::json;
use stitch_gateway::BoxError;
use stitch_gateway::Gateway;
use stitch_gateway::SchemaOptions;
use stitch_gateway::error::PolicyRef;
use stitch_gateway::error::ResourceError;
use stitch_gateway::graphql::JsonPath;
use stitch_gateway::graphql::Request;
use stitch_gateway::graphql::Response;
use stitch_gateway::policy::PolicyModule;
use stitch_gateway::reload::RefreshOutcome;
use stitch_gateway::resource::FetchLatestResult;
use stitch_gateway::resource::InMemoryResourceRepository;
use stitch_gateway::resource::ResourceGroup;
use stitch_gateway::resource::ResourceGroupUpdates;
use stitch_gateway::resource::ResourceRepository;
use stitch_gateway::resource::UpdateOptions;

fn group(value: Value) -> ResourceGroup {
    serde_json::from_value(value).unwrap()
}

fn schemas(sdl: &[&str]) -> Value {
    sdl.iter()
        .enumerate()
        .map(|(i, sdl)| {
            json!({
                "metadata": {"namespace": "ns", "name": format!("fragment-{i}")},
                "schema": sdl
            })
        })
        .collect()
}

fn expression_policy(name: &str, code: &str) -> Value {
    json!({
        "metadata": {"namespace": "ns", "name": name},
        "type": "expression",
        "code": code
    })
}

async fn gateway_with(group: ResourceGroup, options: SchemaOptions) -> Gateway {
    let repository: Arc<dyn ResourceRepository> = Arc::new(InMemoryResourceRepository::new(group));
    Gateway::builder()
        .repository(repository)
        .options(options)
        .build()
        .await
        .unwrap()
}

async fn gateway(group: ResourceGroup) -> Gateway {
    gateway_with(group, SchemaOptions::default()).await
}

async fn execute(gateway: &Gateway, query: &str) -> Response {
    gateway
        .execute(Request::builder().query(query).build(), HeaderMap::new())
        .await
}

#[derive(Debug)]
struct CountingModule {
    allow: bool,
    calls: AtomicUsize,
}

impl PolicyModule for CountingModule {
    fn evaluate(&self, _input: &Value) -> Result<bool, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.allow)
    }
}

#[test_log::test(tokio::test)]
async fn hello_world() {
    let gateway = gateway(group(json!({
        "schemas": schemas(&[r#"type Query { hello: String! @localResolver(value: "world!") }"#])
    })))
    .await;
    let response = execute(&gateway, "{ hello }").await;
    assert_eq!(response.errors, vec![]);
    assert_eq!(response.data, Some(json!({"hello": "world!"})));
}

#[tokio::test]
async fn empty_groups_serve_the_default_field() {
    let gateway = gateway(ResourceGroup::default()).await;
    let response = execute(&gateway, "{ default policy { default { allow } } }").await;
    assert_eq!(
        response.data,
        Some(json!({"default": "default", "policy": {"default": {"allow": true}}}))
    );
}

#[tokio::test]
async fn denied_fields_are_null_with_an_error() {
    let gateway = gateway(group(json!({
        "schemas": schemas(&[r#"
            type Query {
              secret: String @localResolver(value: "s3cr3t") @policy(namespace: "ns", name: "deny")
              public: String @localResolver(value: "hi")
            }
        "#]),
        "policies": [expression_policy("deny", "false")]
    })))
    .await;
    let response = execute(&gateway, "{ secret public }").await;
    assert_eq!(response.data, Some(json!({"secret": null, "public": "hi"})));
    assert_eq!(response.errors.len(), 1);
    let error = &response.errors[0];
    assert_eq!(error.message, "Unauthorized by policy ns/deny");
    assert_eq!(error.path, Some(JsonPath::from("/secret")));
    assert_eq!(
        error.extension_code().as_deref(),
        Some("UNAUTHORIZED_BY_POLICY")
    );
    assert_eq!(
        error.extensions["policies"],
        json!([{"namespace": "ns", "name": "deny"}])
    );
}

#[tokio::test]
async fn denied_non_null_fields_null_their_parent() {
    let gateway = gateway(group(json!({
        "schemas": schemas(&[r#"
            type Query { user: User @localResolver(value: {name: "Ada"}) }
            type User {
              name: String
              secret: String! @localResolver(value: "x") @policy(namespace: "ns", name: "deny")
            }
        "#]),
        "policies": [expression_policy("deny", "false")]
    })))
    .await;
    let response = execute(&gateway, "{ user { name secret } }").await;
    assert_eq!(response.data, Some(json!({"user": null})));
    assert_eq!(response.errors[0].path, Some(JsonPath::from("/user/secret")));
}

#[rstest]
#[case::base_allows("true", "plain", true)]
#[case::base_denies("false", "plain", false)]
#[case::override_skips_the_base_policy("false", "overriding", true)]
#[case::other_policies_do_not_override("false", "guarded", false)]
#[tokio::test]
async fn base_policy(#[case] base: &str, #[case] field: &str, #[case] allowed: bool) {
    let gateway = gateway(group(json!({
        "schemas": schemas(&[r#"
            type Query {
              plain: String @localResolver(value: "value")
              overriding: String @localResolver(value: "value") @policy(namespace: "ns", name: "override")
              guarded: String @localResolver(value: "value") @policy(namespace: "ns", name: "allow")
            }
        "#]),
        "policies": [
            expression_policy("base", base),
            expression_policy("allow", "true"),
            {
                "metadata": {"namespace": "ns", "name": "override"},
                "type": "expression",
                "code": "true",
                "shouldOverrideBasePolicy": true
            }
        ],
        "basePolicy": {"namespace": "ns", "name": "base"}
    })))
    .await;
    let response = execute(&gateway, &format!("{{ {field} }}")).await;
    if allowed {
        assert_eq!(response.errors, vec![]);
        assert_eq!(response.data, Some(json!({ field: "value" })));
    } else {
        assert_eq!(response.data, Some(json!({ field: null })));
        assert_eq!(response.errors[0].message, "Unauthorized by policy ns/base");
    }
}

#[tokio::test]
async fn policy_decisions_are_memoized_per_request() {
    let module = Arc::new(CountingModule {
        allow: true,
        calls: AtomicUsize::new(0),
    });
    let mut group = group(json!({
        "schemas": schemas(&[r#"
            type Query {
              guarded(id: String): String
                @localResolver(value: "ok")
                @policy(namespace: "ns", name: "counted", args: {id: "{ args.id }"})
            }
        "#]),
        "policies": [{
            "metadata": {"namespace": "ns", "name": "counted"},
            "type": "opa",
            "code": "package counted",
            "args": {"id": {"type": "String"}}
        }]
    }));
    group.attach_policy(&PolicyRef::new("ns", "counted"), module.clone());
    let gateway = gateway(group).await;

    let query = r#"{ a: guarded(id: "1") b: guarded(id: "1") c: guarded(id: "2") }"#;
    let response = execute(&gateway, query).await;
    assert_eq!(
        response.data,
        Some(json!({"a": "ok", "b": "ok", "c": "ok"}))
    );
    assert_eq!(module.calls.load(Ordering::SeqCst), 2);

    execute(&gateway, query).await;
    assert_eq!(module.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn policies_can_query_the_gateway() {
    let gateway = gateway(group(json!({
        "schemas": schemas(&[r#"
            type Query {
              account(id: String!): Account
                @localResolver(value: {id: "{ args.id }", enabled: "{ args.id === 'a1' }"})
              document(owner: String!): String
                @localResolver(value: "content")
                @policy(namespace: "ns", name: "enabled-owner", args: {id: "{ args.owner }"})
            }
            type Account { id: String enabled: Boolean }
        "#]),
        "policies": [{
            "metadata": {"namespace": "ns", "name": "enabled-owner"},
            "type": "expression",
            "code": "query.account.enabled",
            "args": {"id": {"type": "String!"}},
            "query": {
                "gql": "query($id: String!) { account(id: $id) { enabled } }",
                "variables": {"id": "{ args.id }"}
            }
        }]
    })))
    .await;

    let response = execute(
        &gateway,
        r#"{ ok: document(owner: "a1") nope: document(owner: "b2") }"#,
    )
    .await;
    assert_eq!(response.data, Some(json!({"ok": "content", "nope": null})));
    assert_eq!(
        response.errors[0].message,
        "Unauthorized by policy ns/enabled-owner"
    );

    let response = execute(
        &gateway,
        r#"{ policy { yes: ns___enabled_owner(id: "a1") { allow } no: ns___enabled_owner(id: "b2") { allow } } }"#,
    )
    .await;
    assert_eq!(
        response.data,
        Some(json!({"policy": {"yes": {"allow": true}, "no": {"allow": false}}}))
    );
}

#[tokio::test]
async fn missing_policy_arguments_fail_the_field() {
    let gateway = gateway(group(json!({
        "schemas": schemas(&[r#"
            type Query { field: String @localResolver(value: "v") @policy(namespace: "ns", name: "needs-id") }
        "#]),
        "policies": [{
            "metadata": {"namespace": "ns", "name": "needs-id"},
            "type": "expression",
            "code": "true",
            "args": {"id": {"type": "ID!"}}
        }]
    })))
    .await;
    let response = execute(&gateway, "{ field }").await;
    assert_eq!(response.data, Some(json!({"field": null})));
    assert_eq!(response.errors[0].message, r#"Missing argument "id""#);
    assert_eq!(
        response.errors[0].extension_code().as_deref(),
        Some("MISSING_POLICY_ARGUMENT")
    );
}

#[rstest]
#[case::replace("replaced", json!({"city": null, "zip": {"code": "69001", "area": null}}))]
#[case::merge("merged", json!({"city": "Paris", "zip": {"code": "69001", "area": null}}))]
#[case::merge_deep("deep", json!({"city": "Paris", "zip": {"code": "69001", "area": "center"}}))]
#[tokio::test]
async fn local_resolver_merge_strategies(#[case] field: &str, #[case] expected: Value) {
    let gateway = gateway(group(json!({
        "schemas": schemas(&[r#"
            type Query {
              replaced: Address
                @stub(value: {city: "Paris", zip: {code: "75001", area: "center"}})
                @localResolver(value: {zip: {code: "69001"}})
              merged: Address
                @stub(value: {city: "Paris", zip: {code: "75001", area: "center"}})
                @localResolver(value: {zip: {code: "69001"}}, mergeStrategy: Merge)
              deep: Address
                @stub(value: {city: "Paris", zip: {code: "75001", area: "center"}})
                @localResolver(value: {zip: {code: "69001"}}, mergeStrategy: MergeDeep)
            }
            type Address { city: String zip: Zip }
            type Zip { code: String area: String }
        "#])
    })))
    .await;
    let response = execute(&gateway, &format!("{{ {field} {{ city zip {{ code area }} }} }}")).await;
    assert_eq!(response.errors, vec![]);
    assert_eq!(response.data, Some(json!({ field: expected })));
}

#[tokio::test]
async fn exported_values_reach_nested_templates() {
    let gateway = gateway(group(json!({
        "schemas": schemas(&[r#"
            type Query { user: User @localResolver(value: {id: "u1", name: "Ada"}) }
            type User {
              id: ID! @export(key: "userId")
              name: String
              profile: Profile @localResolver(value: {owner: "{ exports.userId }"})
            }
            type Profile { owner: String label: String @localResolver(value: "profile of { exports.userId }") }
        "#])
    })))
    .await;
    let response = execute(&gateway, "{ user { name profile { owner label } } }").await;
    assert_eq!(response.errors, vec![]);
    assert_eq!(
        response.data,
        Some(json!({
            "user": {"name": "Ada", "profile": {"owner": "u1", "label": "profile of u1"}}
        }))
    );
}

#[tokio::test]
async fn enum_resolvers_map_values_both_ways() {
    let gateway = gateway(group(json!({
        "schemas": schemas(&[r##"
            enum Color @enumResolver {
              RED @enumValue(value: "#f00")
              GREEN @enumValue(value: "#0f0")
            }
            type Query {
              color: Color @localResolver(value: "#0f0")
              hex(color: Color): String @localResolver(value: "{ args.color }")
            }
        "##])
    })))
    .await;
    let response = execute(&gateway, "{ color hex(color: RED) }").await;
    assert_eq!(response.errors, vec![]);
    assert_eq!(response.data, Some(json!({"color": "GREEN", "hex": "#f00"})));
}

#[tokio::test]
async fn error_handlers_catch_and_throw() {
    let gateway = gateway(group(json!({
        "schemas": schemas(&[r#"
            type Query {
              caught: String
                @localResolver(value: "hidden")
                @policy(namespace: "ns", name: "deny")
                @errorHandler(catchError: {
                  condition: "{ error.extensions.code === 'UNAUTHORIZED_BY_POLICY' }",
                  returnValue: "fallback"
                })
              thrown: String
                @localResolver(value: "bad")
                @errorHandler(throwError: {condition: "{ result === 'bad' }", errorToThrow: "value was {result}"})
              kept: String
                @localResolver(value: "good")
                @errorHandler(throwError: {condition: "{ result === 'bad' }", errorToThrow: "value was {result}"})
              literal: String
                @localResolver(value: "good")
                @errorHandler(throwError: {condition: "true", errorToThrow: "never"})
              blank: String
                @localResolver(value: "good")
                @errorHandler(throwError: {})
            }
        "#]),
        "policies": [expression_policy("deny", "false")]
    })))
    .await;
    let response = execute(&gateway, "{ caught thrown kept literal blank }").await;
    assert_eq!(
        response.data,
        Some(json!({
            "caught": "fallback",
            "thrown": null,
            "kept": "good",
            "literal": "good",
            "blank": null
        }))
    );
    let mut errors = response
        .errors
        .iter()
        .map(|error| (error.message.clone(), error.extension_code()))
        .collect::<Vec<_>>();
    errors.sort();
    assert_eq!(
        errors,
        vec![
            (String::new(), Some("THROWN_ERROR".to_string())),
            ("value was bad".to_string(), Some("THROWN_ERROR".to_string())),
        ]
    );
}

#[tokio::test]
async fn interfaces_resolve_through_typename() {
    let gateway = gateway(group(json!({
        "schemas": schemas(&[r#"
            interface Animal { name: String }
            type Dog implements Animal { name: String barks: Boolean }
            type Cat implements Animal { name: String }
            type Query {
              animals: [Animal]
                @localResolver(value: [{__typename: "Dog", name: "Rex", barks: true}, {__typename: "Cat", name: "Tom"}])
              unknown: Animal @localResolver(value: {name: "?"})
            }
        "#])
    })))
    .await;
    let response = execute(
        &gateway,
        "{ animals { __typename name ... on Dog { barks } } unknown { name } }",
    )
    .await;
    assert_eq!(
        response.data,
        Some(json!({
            "animals": [
                {"__typename": "Dog", "name": "Rex", "barks": true},
                {"__typename": "Cat", "name": "Tom"}
            ],
            "unknown": null
        }))
    );
    assert_eq!(
        response.errors[0].extension_code().as_deref(),
        Some("ABSTRACT_TYPE_RESOLUTION")
    );
}

#[tokio::test]
async fn introspection_requires_opting_in() {
    let sdl = r#"type Query { hello: String @localResolver(value: "world") }"#;
    let query = "{ __typename __schema { queryType { name } } }";

    let closed = gateway(group(json!({"schemas": schemas(&[sdl])}))).await;
    let response = execute(&closed, query).await;
    assert_eq!(response.data, None);
    assert_eq!(
        response.errors[0].extension_code().as_deref(),
        Some("INTROSPECTION_DISABLED")
    );
    let response = execute(&closed, "{ __typename hello }").await;
    assert_eq!(
        response.data,
        Some(json!({"__typename": "Query", "hello": "world"}))
    );

    let open = gateway_with(
        group(json!({"schemas": schemas(&[sdl])})),
        SchemaOptions {
            introspection: true,
            ..Default::default()
        },
    )
    .await;
    let response = execute(&open, query).await;
    assert_eq!(response.errors, vec![]);
    assert_eq!(
        response.data,
        Some(json!({"__typename": "Query", "__schema": {"queryType": {"name": "Query"}}}))
    );
    let response = execute(&open, r#"{ __type(name: "Query") { kind fields { name } } }"#).await;
    assert_eq!(
        response.data.unwrap()["__type"]["fields"][0],
        json!({"name": "hello"})
    );
}

#[tokio::test]
async fn request_errors_have_no_data() {
    let gateway = gateway(ResourceGroup::default()).await;
    let response = execute(&gateway, "{ missing }").await;
    assert_eq!(response.data, None);
    assert_eq!(
        response.errors[0].extension_code().as_deref(),
        Some("GRAPHQL_VALIDATION_FAILED")
    );
    assert_eq!(response.errors[0].locations.len(), 1);

    let response = gateway
        .execute(
            Request::builder()
                .query("query($skip: Boolean!) { default @skip(if: $skip) }")
                .build(),
            HeaderMap::new(),
        )
        .await;
    assert_eq!(response.data, None);
    assert_eq!(
        response.errors[0].message,
        r#"Variable "$skip" of required type "Boolean!" was not provided."#
    );
}

#[tokio::test]
async fn failed_compositions_keep_serving_the_previous_schema() {
    let repository = InMemoryResourceRepository::new(group(json!({
        "schemas": schemas(&[r#"type Query { hello: String @localResolver(value: "world") }"#])
    })));
    let shared: Arc<dyn ResourceRepository> = Arc::new(repository.clone());
    let gateway = Gateway::builder().repository(shared).build().await.unwrap();

    repository
        .update(&group(json!({
            "schemas": schemas(&[
                r#"type Query { hello: String @localResolver(value: "world") } type User { id: ID }"#,
                "type User { id: String }",
            ])
        })))
        .await
        .unwrap();
    let error = gateway.refresh_once().await.unwrap_err();
    assert_eq!(error.code(), "FEDERATION_VALIDATION_FAILURE");
    assert_eq!(
        execute(&gateway, "{ hello }").await.data,
        Some(json!({"hello": "world"}))
    );

    let next = group(json!({
        "schemas": schemas(&[r#"type Query { hello: String @localResolver(value: "again") }"#])
    }));
    repository.update(&next).await.unwrap();
    assert_eq!(
        gateway.refresh_once().await.unwrap(),
        RefreshOutcome::Swapped(next.fingerprint())
    );
    assert_eq!(
        execute(&gateway, "{ hello }").await.data,
        Some(json!({"hello": "again"}))
    );
}

fn schema_update(name: &str, sdl: &str) -> ResourceGroupUpdates {
    serde_json::from_value(json!({
        "schemas": [{"metadata": {"namespace": "ns", "name": name}, "schema": sdl}]
    }))
    .unwrap()
}

#[tokio::test]
async fn accepted_updates_are_served_after_rejected_ones() {
    let gateway = gateway(ResourceGroup::default()).await;
    let updater = gateway.updater();
    updater
        .update(
            schema_update("hello", r#"type Query { hello: String @localResolver(value: "hi") }"#),
            UpdateOptions::default(),
        )
        .await
        .unwrap();
    let rejected = updater
        .update(schema_update("broken", "type Query {"), UpdateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(rejected.code(), "INVALID_SDL");
    updater
        .update(
            schema_update("other", "type Query { other: String }"),
            UpdateOptions { dry_run: true },
        )
        .await
        .unwrap();

    assert!(matches!(
        gateway.refresh_once().await.unwrap(),
        RefreshOutcome::Swapped(_)
    ));
    let response = execute(&gateway, "{ hello }").await;
    assert_eq!(response.data, Some(json!({"hello": "hi"})));
}

/// Reads slowly so that unserialized updates would overlap.
#[derive(Debug, Default)]
struct SlowRepository(InMemoryResourceRepository);

#[async_trait::async_trait]
impl ResourceRepository for SlowRepository {
    async fn fetch_latest(&self) -> Result<FetchLatestResult, ResourceError> {
        let latest = self.0.fetch_latest().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        latest
    }

    async fn update(&self, resource_group: &ResourceGroup) -> Result<(), ResourceError> {
        self.0.update(resource_group).await
    }
}

#[tokio::test]
async fn updates_through_the_gateway_are_serialized() {
    let repository: Arc<dyn ResourceRepository> = Arc::new(SlowRepository::default());
    let gateway = Gateway::builder()
        .repository(repository.clone())
        .build()
        .await
        .unwrap();

    let first = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            gateway
                .updater()
                .update(
                    schema_update("a", "type Query { a: String }"),
                    UpdateOptions::default(),
                )
                .await
        })
    };
    let second = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            gateway
                .updater()
                .update(
                    schema_update("b", "type Query { b: String }"),
                    UpdateOptions::default(),
                )
                .await
        })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let stored = repository.fetch_latest().await.unwrap().resource_group;
    let mut names = stored
        .schemas
        .iter()
        .map(|schema| schema.metadata.name.clone())
        .collect::<Vec<_>>();
    names.sort();
    assert_eq!(names, vec!["a", "b"]);
}
