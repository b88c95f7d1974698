//! Gateway errors.
use std::fmt;

use displaydoc::Display;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use stitch_federation::CompositionError;
use stitch_federation::error::FederationErrors;
use thiserror::Error;

pub use crate::configuration::ConfigurationError;
pub use crate::graphql::Error;
use crate::graphql::ErrorExtension;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::Value;

/// The `(namespace, name)` address of a policy definition.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyRef {
    pub namespace: String,
    pub name: String,
}

impl PolicyRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PolicyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The policies that denied a field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeniedPolicies(pub Vec<PolicyRef>);

impl fmt::Display for DeniedPolicies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, policy) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{policy}")?;
        }
        Ok(())
    }
}

/// Error types raised while resolving a single field.
///
/// These never abort a request: the executor turns them into entries of the response's `errors`
/// with the field's path.
#[derive(Error, Display, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum FieldError {
    /// Unauthorized by policy {policies}
    UnauthorizedByPolicy { policies: DeniedPolicies },

    /// Missing argument "{argument}"
    MissingPolicyArgument { policy: PolicyRef, argument: String },

    /// {message}
    PolicyExecutionFailed { policy: PolicyRef, message: String },

    /// {message}
    RemoteDelegationFailure {
        /// The remote the field delegates to.
        service: String,
        message: String,
        status_code: Option<u16>,
    },

    /// {message}
    Thrown { message: String, extensions: Object },

    /// {message}
    Resolver { message: String },

    /// Cannot return null for non-nullable field {type_name}.{field}.
    NonNullViolation { type_name: String, field: String },

    /// Expecting a "__typename" property in source when resolving an interface or union: {type_name}.
    AbstractTypeResolution { type_name: String },
}

impl FieldError {
    pub(crate) fn unauthorized(policy: PolicyRef) -> Self {
        Self::UnauthorizedByPolicy {
            policies: DeniedPolicies(vec![policy]),
        }
    }

    pub(crate) fn policy_failed(policy: &PolicyRef, message: impl Into<String>) -> Self {
        Self::PolicyExecutionFailed {
            policy: policy.clone(),
            message: message.into(),
        }
    }

    pub(crate) fn resolver(message: impl Into<String>) -> Self {
        Self::Resolver {
            message: message.into(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::UnauthorizedByPolicy { .. })
    }

    /// The value templates see under `error`.
    pub(crate) fn to_template_value(&self) -> Value {
        let mut error = Object::new();
        error.insert("message".to_string(), Value::String(self.to_string()));
        error.insert("name".to_string(), Value::String(self.name().to_string()));
        let mut extensions = self.custom_extension_details().unwrap_or_default();
        extensions.insert("code".to_string(), Value::String(self.extension_code()));
        error.insert("extensions".to_string(), Value::Object(extensions));
        Value::Object(error)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::UnauthorizedByPolicy { .. } => "UnauthorizedByPolicyError",
            Self::MissingPolicyArgument { .. } | Self::PolicyExecutionFailed { .. } => {
                "PolicyExecutionFailedError"
            }
            Self::RemoteDelegationFailure { .. } => "RemoteDelegationError",
            Self::Thrown { .. } | Self::Resolver { .. } => "Error",
            Self::NonNullViolation { .. } | Self::AbstractTypeResolution { .. } => "GraphQLError",
        }
    }

    /// Convert the field error to a GraphQL error.
    pub(crate) fn to_graphql_error(&self, path: Option<Path>) -> Error {
        let mut extensions = self.custom_extension_details().unwrap_or_default();
        extensions
            .entry("code")
            .or_insert_with(|| self.extension_code().into());
        Error::builder()
            .message(self.to_string())
            .and_path(path)
            .extensions(extensions)
            .build()
    }
}

impl ErrorExtension for FieldError {
    fn extension_code(&self) -> String {
        match self {
            Self::UnauthorizedByPolicy { .. } => "UNAUTHORIZED_BY_POLICY",
            Self::MissingPolicyArgument { .. } => "MISSING_POLICY_ARGUMENT",
            Self::PolicyExecutionFailed { .. } => "POLICY_EXECUTION_FAILED",
            Self::RemoteDelegationFailure { .. } => "REMOTE_DELEGATION_FAILURE",
            Self::Thrown { .. } => "THROWN_ERROR",
            Self::Resolver { .. } => "RESOLVER_ERROR",
            Self::NonNullViolation { .. } => "NON_NULL_VIOLATION",
            Self::AbstractTypeResolution { .. } => "ABSTRACT_TYPE_RESOLUTION",
        }
        .to_string()
    }

    fn custom_extension_details(&self) -> Option<Object> {
        let details = match self {
            Self::UnauthorizedByPolicy { policies } => json!({ "policies": policies.0 }),
            Self::MissingPolicyArgument { policy, argument } => {
                json!({ "policy": policy, "argument": argument })
            }
            Self::PolicyExecutionFailed { policy, .. } => json!({ "policy": policy }),
            Self::RemoteDelegationFailure {
                service,
                status_code,
                ..
            } => match status_code {
                Some(status) => json!({ "service": service, "http": { "status": status } }),
                None => json!({ "service": service }),
            },
            Self::Thrown { extensions, .. } => Value::Object(extensions.clone()),
            _ => return None,
        };
        match details {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }
}

/// Errors rejecting a resource group update.
///
/// The group being served is left untouched by any of these.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResourceError {
    /// invalid SDL in fragment '{fragment}': {message}
    InvalidSdl { fragment: String, message: String },

    /// Federation validation failed: {0}
    FederationValidationFailure(FederationErrors),

    /// policy {policy} could not be compiled: {message}
    PolicyCompilationFailure { policy: PolicyRef, message: String },

    /// {message}
    DuplicateOrConflictingResource { code: &'static str, message: String },

    /// policy {policy} declares argument '{argument}' with invalid type '{type_name}'
    InvalidPolicyArgument {
        policy: PolicyRef,
        argument: String,
        type_name: String,
    },

    /// {message}
    InvalidResourceName { message: String },

    /// schema build failed: {message}
    SchemaBuild { message: String },

    /// Resource validation failed: {0}
    Validation(ResourceErrors),

    /// could not access the resource repository: {message}
    Repository { message: String },
}

impl ResourceError {
    /// The extension code reported to whoever submitted the update.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSdl { .. } => "INVALID_SDL",
            Self::FederationValidationFailure(_) => "FEDERATION_VALIDATION_FAILURE",
            Self::PolicyCompilationFailure { .. } => "POLICY_COMPILATION_FAILURE",
            Self::DuplicateOrConflictingResource { code, .. } => *code,
            Self::InvalidPolicyArgument { .. } => "INVALID_POLICY_ARGUMENT",
            Self::InvalidResourceName { .. } => "INVALID_CHARACTERS_IN_NAME",
            Self::SchemaBuild { .. } => "SCHEMA_BUILD_FAILURE",
            Self::Validation(_) => "RESOURCE_VALIDATION_FAILURE",
            Self::Repository { .. } => "RESOURCE_REPOSITORY_FAILURE",
        }
    }

    /// The individual errors of an aggregate, or this error alone.
    pub fn errors(&self) -> Vec<&ResourceError> {
        match self {
            Self::Validation(errors) => errors.0.iter().collect(),
            other => vec![other],
        }
    }

    pub(crate) fn repository(error: impl fmt::Display) -> Self {
        Self::Repository {
            message: error.to_string(),
        }
    }

    /// Convert the resource error to a GraphQL error.
    pub fn to_graphql_error(&self) -> Error {
        let mut extensions = self.custom_extension_details().unwrap_or_default();
        extensions.insert("code".to_string(), self.extension_code().into());
        Error::builder()
            .message(self.to_string())
            .extensions(extensions)
            .build()
    }
}

impl ErrorExtension for ResourceError {
    fn extension_code(&self) -> String {
        self.code().to_string()
    }

    fn custom_extension_details(&self) -> Option<Object> {
        let errors = match self {
            Self::FederationValidationFailure(errors) => errors
                .0
                .iter()
                .map(|error| json!({ "code": error.code(), "message": error.to_string() }))
                .collect::<Vec<_>>(),
            Self::Validation(errors) => errors
                .0
                .iter()
                .map(|error| json!({ "code": error.code(), "message": error.to_string() }))
                .collect(),
            _ => return None,
        };
        let mut details = Object::new();
        details.insert("errors".to_string(), errors.into());
        Some(details)
    }
}

impl From<CompositionError> for ResourceError {
    fn from(error: CompositionError) -> Self {
        match error {
            CompositionError::InvalidSdl { fragment, message } => {
                Self::InvalidSdl { fragment, message }
            }
            CompositionError::FederationValidationFailure(errors) => {
                Self::FederationValidationFailure(errors)
            }
            // Future composition failures are reported with the message only.
            other => Self::SchemaBuild {
                message: other.to_string(),
            },
        }
    }
}

/// The aggregate carried by [`ResourceError::Validation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceErrors(pub Vec<ResourceError>);

impl fmt::Display for ResourceErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn unauthorized_error_names_the_policy() {
        let error = FieldError::unauthorized(PolicyRef::new("ns", "deny"));
        let graphql_error = error.to_graphql_error(Some(Path::from("/field")));
        assert_eq!(graphql_error.message, "Unauthorized by policy ns/deny");
        assert_eq!(
            serde_json::to_value(&graphql_error).unwrap(),
            json!({
                "message": "Unauthorized by policy ns/deny",
                "path": ["field"],
                "extensions": {
                    "policies": [{"namespace": "ns", "name": "deny"}],
                    "code": "UNAUTHORIZED_BY_POLICY"
                }
            })
        );
    }

    #[test]
    fn aggregated_resource_errors_list_their_parts() {
        let error = ResourceError::Validation(ResourceErrors(vec![
            ResourceError::InvalidResourceName {
                message: "bad name".to_string(),
            },
            ResourceError::repository("disk full"),
        ]));
        assert_eq!(error.extension_code(), "RESOURCE_VALIDATION_FAILURE");
        let extensions = error.to_graphql_error().extensions;
        assert_eq!(extensions["code"], json!("RESOURCE_VALIDATION_FAILURE"));
        assert_eq!(
            extensions["errors"],
            json!([
                {"code": "INVALID_CHARACTERS_IN_NAME", "message": "bad name"},
                {
                    "code": "RESOURCE_REPOSITORY_FAILURE",
                    "message": "could not access the resource repository: disk full"
                }
            ])
        );

        let single = ResourceError::InvalidResourceName {
            message: "bad name".to_string(),
        };
        assert_eq!(single.custom_extension_details(), None);
        assert_eq!(
            serde_json::to_value(single.to_graphql_error()).unwrap(),
            json!({
                "message": "bad name",
                "extensions": {"code": "INVALID_CHARACTERS_IN_NAME"}
            })
        );
    }

    #[test]
    fn missing_argument_message() {
        let error = FieldError::MissingPolicyArgument {
            policy: PolicyRef::new("ns", "p"),
            argument: "x".to_string(),
        };
        assert_eq!(error.to_string(), r#"Missing argument "x""#);
        assert_eq!(error.extension_code(), "MISSING_POLICY_ARGUMENT");
    }

    #[test]
    fn thrown_error_keeps_extensions() {
        let mut extensions = Object::new();
        extensions.insert("code".to_string(), json!("CUSTOM"));
        let error = FieldError::Thrown {
            message: "boom".to_string(),
            extensions,
        };
        let graphql_error = error.to_graphql_error(None);
        assert_eq!(graphql_error.extension_code().as_deref(), Some("CUSTOM"));
    }
}
