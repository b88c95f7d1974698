//! Every policy is also queryable as a field of the `Policy` type.

use itertools::Itertools;

use crate::resource::PolicyDefinition;
use crate::resource::ResourceMetadata;

/// `namespace___name` with dashes made GraphQL friendly.
pub(crate) fn policy_query_field_name(metadata: &ResourceMetadata) -> String {
    format!("{}___{}", metadata.namespace, metadata.name).replace('-', "_")
}

/// The `extend type Policy` fragment exposing `definition` as a field.
///
/// Optional arguments lose their non-null marker so they can be left out of the query.
pub(crate) fn policy_query_type_def(definition: &PolicyDefinition) -> String {
    let args = if definition.args.is_empty() {
        String::new()
    } else {
        format!(
            "({})",
            definition
                .args
                .iter()
                .map(|(name, argument)| {
                    let type_name = argument.type_name.trim();
                    let type_name = match type_name.strip_suffix('!') {
                        Some(nullable) if argument.optional => nullable,
                        _ => type_name,
                    };
                    format!("{name}: {type_name}")
                })
                .join(", ")
        )
    };
    format!(
        "extend type Policy {{\n  {field}{args}: PolicyResult! @policyQuery(namespace: {namespace:?}, name: {name:?})\n}}\n",
        field = policy_query_field_name(&definition.metadata),
        namespace = definition.metadata.namespace,
        name = definition.metadata.name,
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn definition(args: serde_json::Value) -> PolicyDefinition {
        serde_json::from_value(json!({
            "metadata": {"namespace": "my-ns", "name": "can-read"},
            "type": "expression",
            "code": "true",
            "args": args
        }))
        .unwrap()
    }

    #[test]
    fn type_def_without_args() {
        insta::assert_snapshot!(policy_query_type_def(&definition(json!({}))), @r###"
        extend type Policy {
          my_ns___can_read: PolicyResult! @policyQuery(namespace: "my-ns", name: "can-read")
        }
        "###);
    }

    #[test]
    fn type_def_with_args() {
        let definition = definition(json!({
            "id": {"type": "ID!"},
            "tags": {"type": "[String!]!", "optional": true},
            "limit": {"type": "Int", "optional": true}
        }));
        insta::assert_snapshot!(policy_query_type_def(&definition), @r###"
        extend type Policy {
          my_ns___can_read(id: ID!, tags: [String!], limit: Int): PolicyResult! @policyQuery(namespace: "my-ns", name: "can-read")
        }
        "###);
    }
}
