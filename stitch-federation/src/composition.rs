use std::fmt;

use apollo_compiler::Schema;
use apollo_compiler::ast;
use apollo_compiler::ast::Definition;
use apollo_compiler::validation::Valid;
use indexmap::IndexSet;

use crate::directives::DirectiveUsages;
use crate::error::CompositionError;
use crate::error::SingleFederationError;
use crate::fragment::SchemaFragment;
use crate::fragment::StrippedFragment;
use crate::merge::merge_fragments;

/// The output of a successful [`compose`].
pub struct ComposedSchema {
    /// The validated composed schema, custom directive usages included.
    pub schema: Valid<Schema>,
    /// The composed schema as SDL AST.
    pub document: ast::Document,
    pub directive_usages: DirectiveUsages,
    pub composition_hints: Vec<String>,
}

impl ComposedSchema {
    /// Prints the composed schema.
    pub fn sdl(&self) -> String {
        self.document.to_string()
    }
}

impl fmt::Debug for ComposedSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposedSchema")
            .field("directive_usages", &self.directive_usages.len())
            .field("composition_hints", &self.composition_hints)
            .finish()
    }
}

/// Composes `fragments` into one schema.
///
/// `base_type_defs` is prepended to every fragment before merging. `builtin_directives` holds
/// the definitions of the custom directives used by the fragments, along with the input types
/// and enums those definitions reference. They are added to the composed document before it is
/// validated.
///
/// Composition is all-or-nothing: the first fragment with invalid SDL aborts it, and every
/// federation conflict found is reported together.
pub fn compose(
    fragments: &[SchemaFragment],
    base_type_defs: &str,
    builtin_directives: &str,
) -> Result<ComposedSchema, CompositionError> {
    let base_type_defs = parse_support_document("base type definitions", base_type_defs)?;
    let builtin_directives = parse_support_document("builtin directives", builtin_directives)?;

    let stripped = fragments
        .iter()
        .map(|fragment| StrippedFragment::parse(fragment, &base_type_defs))
        .collect::<Result<Vec<_>, _>>()?;

    let merged = merge_fragments(&stripped).map_err(|failure| {
        tracing::debug!(
            errors = failure.errors.len(),
            "federation validation failed: {failure:?}"
        );
        CompositionError::from(failure.errors)
    })?;
    for hint in &merged.composition_hints {
        tracing::debug!(hint = %hint, "composition hint");
    }

    // The merged document is printed and parsed again so that every node carries a location
    // in the composed source.
    let printed = merged.document.to_string();
    let mut document = ast::Document::parse(printed, "composed.graphql").map_err(|with_errors| {
        CompositionError::from(
            with_errors
                .errors
                .iter()
                .map(|diagnostic| SingleFederationError::InvalidGraphQL {
                    message: diagnostic.error.to_string(),
                })
                .collect::<Vec<_>>(),
        )
    })?;

    let directive_usages = DirectiveUsages::merge(stripped.into_iter().map(|f| f.usages));
    directive_usages.attach(&mut document);
    add_builtin_definitions(&mut document, builtin_directives);

    let schema = document.to_schema_validate().map_err(|with_errors| {
        CompositionError::from(
            with_errors
                .errors
                .iter()
                .map(|diagnostic| SingleFederationError::InvalidGraphQL {
                    message: diagnostic.error.to_string(),
                })
                .collect::<Vec<_>>(),
        )
    })?;

    tracing::debug!(
        fragments = fragments.len(),
        types = schema.types.len(),
        directive_usages = directive_usages.len(),
        "composed schema"
    );
    Ok(ComposedSchema {
        schema,
        document,
        directive_usages,
        composition_hints: merged.composition_hints,
    })
}

fn parse_support_document(label: &str, sdl: &str) -> Result<ast::Document, CompositionError> {
    ast::Document::parse(sdl, label).map_err(|with_errors| {
        CompositionError::invalid_sdl(label, &with_errors.errors)
    })
}

/// Puts the builtin definitions first. A directive defined there replaces any definition of
/// the same name carried over from a fragment.
fn add_builtin_definitions(document: &mut ast::Document, builtins: ast::Document) {
    let builtin_directive_names = builtins
        .definitions
        .iter()
        .filter_map(|definition| match definition {
            Definition::DirectiveDefinition(directive) => Some(directive.name.clone()),
            _ => None,
        })
        .collect::<IndexSet<_>>();
    let composed = std::mem::take(&mut document.definitions);
    document.definitions = builtins.definitions;
    document.definitions.extend(composed.into_iter().filter(|definition| {
        !matches!(
            definition,
            Definition::DirectiveDefinition(directive)
                if builtin_directive_names.contains(&directive.name)
        )
    }));
}
