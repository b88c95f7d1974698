use serde::Deserialize;

use super::Next;
use crate::error::FieldError;
use crate::execution::FieldContext;
use crate::json_ext::Value;

/// `@select(path: [String!]!)`
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Select {
    path: Vec<String>,
}

impl Select {
    pub(super) async fn resolve<'a>(
        &'a self,
        field: &'a FieldContext<'a>,
        next: Next<'a>,
    ) -> Result<Value, FieldError> {
        let value = next.run(field).await?;
        Ok(select(value, &self.path))
    }
}

/// Walks `path` down `value`. Numeric segments index into arrays; a missing segment is null.
fn select(value: Value, path: &[String]) -> Value {
    path.iter().try_fold(value, |value, segment| match value {
        Value::Object(mut object) => object.remove(segment),
        Value::Array(mut items) => segment
            .parse::<usize>()
            .ok()
            .filter(|index| *index < items.len())
            .map(|index| items.swap_remove(index)),
        _ => None,
    })
    .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case::nested(&["a", "b"], json!(1))]
    #[case::index(&["list", "1", "name"], json!("second"))]
    #[case::missing(&["a", "missing"], json!(null))]
    #[case::through_scalar(&["a", "b", "c"], json!(null))]
    #[case::empty(&[], json!({"a": {"b": 1}, "list": [{"name": "first"}, {"name": "second"}]}))]
    fn selects_along_the_path(#[case] path: &[&str], #[case] expected: Value) {
        let value = json!({"a": {"b": 1}, "list": [{"name": "first"}, {"name": "second"}]});
        let path = path.iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(select(value, &path), expected);
    }
}
