use std::time::Duration;

use http::HeaderName;
use http::HeaderValue;
use http::StatusCode;
use reqwest::Method;
use serde::Deserialize;
use url::Url;

use crate::error::FieldError;
use crate::execution::FieldContext;
use crate::injection::to_js_string;
use crate::json_ext::Value;
use crate::json_ext::ValueExt;

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct KeyValue {
    key: String,
    value: String,
}

/// `@rest(url, method, body, bodyArg, query, headers, timeoutMs, notFoundAsNull)`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RestDirective {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    body: Option<String>,
    body_arg: Option<String>,
    #[serde(default)]
    query: Option<Vec<KeyValue>>,
    #[serde(default)]
    headers: Option<Vec<KeyValue>>,
    timeout_ms: Option<u64>,
    #[serde(default)]
    not_found_as_null: Option<bool>,
}

fn default_method() -> String {
    "GET".to_string()
}

const DEFAULT_BODY_ARG: &str = "input";

impl RestDirective {
    pub(super) async fn resolve<'a>(&'a self, field: &'a FieldContext<'a>) -> Result<Value, FieldError> {
        let engine = field.engine();
        let scope = field.scope();

        let url = to_js_string(Some(&engine.evaluate(&self.url, scope)));
        let mut url = Url::parse(&url).map_err(|error| {
            FieldError::resolver(format!("@rest url '{url}' is invalid: {error}"))
        })?;
        let service = url.host_str().unwrap_or_default().to_string();
        let failure = |message: String, status_code: Option<u16>| FieldError::RemoteDelegationFailure {
            service: service.clone(),
            message,
            status_code,
        };

        for parameter in self.query.iter().flatten() {
            match engine.evaluate(&parameter.value, scope) {
                value if !value.is_truthy() => {}
                Value::Array(values) => {
                    for value in values {
                        url.query_pairs_mut()
                            .append_pair(&parameter.key, &to_js_string(Some(&value)));
                    }
                }
                value => {
                    url.query_pairs_mut()
                        .append_pair(&parameter.key, &to_js_string(Some(&value)));
                }
            }
        }

        let method = Method::from_bytes(self.method.to_uppercase().as_bytes())
            .map_err(|error| FieldError::resolver(format!("@rest method is invalid: {error}")))?;
        let timeout = self
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(field.options().remote_timeout);
        let mut request = field
            .options()
            .http_client
            .request(method.clone(), url.clone())
            .timeout(timeout);

        for header in self.headers.iter().flatten() {
            let value = to_js_string(Some(&engine.evaluate(&header.value, scope)));
            let name = HeaderName::from_bytes(header.key.as_bytes());
            let value = HeaderValue::from_str(&value);
            match (name, value) {
                (Ok(name), Ok(value)) => request = request.header(name, value),
                _ => tracing::debug!(header = %header.key, "skipping invalid @rest header"),
            }
        }

        let body_arg = self.body_arg.as_deref().unwrap_or(DEFAULT_BODY_ARG);
        if let Some(body) = field.args.get(body_arg).filter(|body| !body.is_null()) {
            request = request.json(body);
        } else if let Some(body) = &self.body {
            request = match engine.evaluate(body, scope) {
                Value::String(text) => request.body(text),
                value => request.json(&value),
            };
        }

        tracing::debug!(%method, %url, "@rest request");
        let response = request
            .send()
            .await
            .map_err(|error| failure(error.to_string(), None))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND && self.not_found_as_null.unwrap_or(false) {
            return Ok(Value::Null);
        }
        if !status.is_success() {
            tracing::debug!(%url, %status, "@rest request failed");
            return Err(failure(status.to_string(), Some(status.as_u16())));
        }
        let text = response
            .text()
            .await
            .map_err(|error| failure(error.to_string(), Some(status.as_u16())))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}
