//! Composition errors.
use std::fmt;

use apollo_compiler::validation::DiagnosticList;
use displaydoc::Display;
use itertools::Itertools;
use thiserror::Error;

/// A single conflict found while merging fragments.
///
/// Codes follow the federation 1 composition error codes where one exists.
#[derive(Debug, Clone, Error, Display, PartialEq, Eq)]
#[non_exhaustive]
pub enum SingleFederationError {
    /// [{service}] {type_name} -> A @key selects {field}, but {type_name}.{field} could not be found
    KeyFieldsMissingOnBase {
        service: String,
        type_name: String,
        field: String,
    },

    /// [{service}] {type_name} -> A @key selects {field}, but {type_name}.{field} is not declared in this extension
    KeyFieldsMissingExternal {
        service: String,
        type_name: String,
        field: String,
    },

    /// [{service}] {type_name} -> extends from {owner} but specifies an invalid @key directive. Valid @key directives are specified by the originating type. Available @key directives for this type are: {available}
    KeyMissingOnBase {
        service: String,
        owner: String,
        type_name: String,
        available: String,
    },

    /// [{service}] {type_name} -> is extended from service {owner} but specifies multiple @key directives. Extensions may only specify one @key.
    MultipleKeysOnExtension {
        service: String,
        owner: String,
        type_name: String,
    },

    /// [{service}] {type_name} -> @key(fields: "{fields}") is not a valid field set: {reason}
    InvalidFieldSet {
        service: String,
        type_name: String,
        fields: String,
        reason: String,
    },

    /// [{service}] {type_name} -> is an entity owned by {owner} and cannot be redefined. Use `extend type {type_name}` instead.
    DuplicateEntityOwner {
        service: String,
        owner: String,
        type_name: String,
    },

    /// [{service}] {type_name}.{field} -> marked @external but {type_name}.{field} is not defined on the base service of {type_name} ({owner})
    ExternalMissingOnBase {
        service: String,
        owner: String,
        type_name: String,
        field: String,
    },

    /// [{service}] {type_name}.{field} -> Type `{actual}` does not match the type of the original field in {owner} (`{expected}`)
    FieldTypeMismatch {
        service: String,
        owner: String,
        type_name: String,
        field: String,
        expected: String,
        actual: String,
    },

    /// [{service}] {type_name}.{field} -> Field "{type_name}.{field}" can only be defined once. It is already defined by {owner}.
    FieldDefinedMultipleTimes {
        service: String,
        owner: String,
        type_name: String,
        field: String,
    },

    /// [{service}] {type_name} -> Found kind mismatch on expected value type belonging to services {owner} and {service}. `{type_name}` is defined as both a `{expected}` and a `{actual}`.
    TypeKindMismatch {
        service: String,
        owner: String,
        type_name: String,
        expected: String,
        actual: String,
    },

    /// [{service}] {type_name} -> `{type_name}` is an extension type, but `{type_name}` is not defined in any service
    ExtensionWithNoBase { service: String, type_name: String },

    /// {message}
    InvalidGraphQL { message: String },
}

impl SingleFederationError {
    /// The stable error code of this conflict.
    pub fn code(&self) -> &'static str {
        match self {
            Self::KeyFieldsMissingOnBase { .. } => "KEY_FIELDS_MISSING_ON_BASE",
            Self::KeyFieldsMissingExternal { .. } => "KEY_FIELDS_MISSING_EXTERNAL",
            Self::KeyMissingOnBase { .. } => "KEY_MISSING_ON_BASE",
            Self::MultipleKeysOnExtension { .. } => "MULTIPLE_KEYS_ON_EXTENSION",
            Self::InvalidFieldSet { .. } => "INVALID_FIELD_SET",
            Self::DuplicateEntityOwner { .. } => "DUPLICATE_ENTITY_OWNER",
            Self::ExternalMissingOnBase { .. } => "EXTERNAL_MISSING_ON_BASE",
            Self::FieldTypeMismatch { .. } => "FIELD_TYPE_MISMATCH",
            Self::FieldDefinedMultipleTimes { .. } => "FIELD_DEFINED_MULTIPLE_TIMES",
            Self::TypeKindMismatch { .. } => "VALUE_TYPE_KIND_MISMATCH",
            Self::ExtensionWithNoBase { .. } => "EXTENSION_WITH_NO_BASE",
            Self::InvalidGraphQL { .. } => "INVALID_GRAPHQL",
        }
    }
}

/// Errors preventing a set of fragments from being composed.
///
/// Composition is all-or-nothing: no schema is produced alongside any of these.
#[derive(Debug, Clone, Error, Display, PartialEq, Eq)]
#[non_exhaustive]
pub enum CompositionError {
    /// invalid SDL in fragment '{fragment}': {message}
    InvalidSdl { fragment: String, message: String },

    /// Federation validation failed: {0}
    FederationValidationFailure(FederationErrors),
}

impl CompositionError {
    /// The extension code reported to whoever submitted the fragments.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSdl { .. } => "INVALID_SDL",
            Self::FederationValidationFailure(_) => "FEDERATION_VALIDATION_FAILURE",
        }
    }

    /// The individual conflicts of a federation failure, empty for SDL errors.
    pub fn errors(&self) -> &[SingleFederationError] {
        match self {
            Self::InvalidSdl { .. } => &[],
            Self::FederationValidationFailure(errors) => &errors.0,
        }
    }

    pub(crate) fn invalid_sdl(fragment: &str, errors: &DiagnosticList) -> Self {
        Self::InvalidSdl {
            fragment: fragment.to_string(),
            message: errors.iter().map(|d| d.error.to_string()).join("; "),
        }
    }
}

/// The aggregate carried by [`CompositionError::FederationValidationFailure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederationErrors(pub Vec<SingleFederationError>);

impl fmt::Display for FederationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut errors = self.0.iter();
        for (i, error) in errors.by_ref().take(5).enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{error}")?;
        }
        let remaining = errors.count();
        if remaining > 0 {
            write!(f, "\n...and {remaining} other errors")?;
        }
        Ok(())
    }
}

impl From<Vec<SingleFederationError>> for CompositionError {
    fn from(errors: Vec<SingleFederationError>) -> Self {
        Self::FederationValidationFailure(FederationErrors(errors))
    }
}
