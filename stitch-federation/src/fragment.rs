use apollo_compiler::ast;

use crate::directives::DirectiveUsages;
use crate::error::CompositionError;

/// An independently authored piece of SDL, addressed by `(namespace, name)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaFragment {
    pub namespace: String,
    pub name: String,
    pub sdl: String,
}

impl SchemaFragment {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        sdl: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            sdl: sdl.into(),
        }
    }

    /// The `namespace/name` key fragments are composed under.
    pub fn service_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Synthetic URL of the service this fragment is composed as.
    pub fn service_url(&self) -> String {
        format!("https://stitch/{}", self.service_name())
    }
}

/// A fragment after custom directives have been taken out of its AST.
#[derive(Clone, Debug)]
pub(crate) struct StrippedFragment {
    pub(crate) service: String,
    pub(crate) document: ast::Document,
    pub(crate) usages: DirectiveUsages,
}

impl StrippedFragment {
    /// Parses `fragment` together with `base_type_defs` and removes every directive usage that
    /// federation does not understand.
    pub(crate) fn parse(
        fragment: &SchemaFragment,
        base_type_defs: &ast::Document,
    ) -> Result<Self, CompositionError> {
        let service = fragment.service_name();
        let mut document = ast::Document::parse(fragment.sdl.as_str(), fragment.service_url())
            .map_err(|with_errors| CompositionError::invalid_sdl(&service, &with_errors.errors))?;
        let usages = DirectiveUsages::strip(&mut document);
        let mut definitions = base_type_defs.definitions.clone();
        definitions.append(&mut document.definitions);
        document.definitions = definitions;
        tracing::trace!(
            service = %service,
            directive_usages = usages.len(),
            "stripped custom directives from fragment"
        );
        Ok(Self {
            service,
            document,
            usages,
        })
    }
}
