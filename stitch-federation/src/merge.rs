use std::fmt::Debug;
use std::fmt::Formatter;

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::ast;
use apollo_compiler::ast::Definition;
use apollo_compiler::ast::DirectiveDefinition;
use apollo_compiler::ast::EnumValueDefinition;
use apollo_compiler::ast::FieldDefinition;
use apollo_compiler::ast::InputValueDefinition;
use indexmap::IndexMap;
use indexmap::IndexSet;
use indexmap::map::Entry::Occupied;
use indexmap::map::Entry::Vacant;
use itertools::Itertools;

use crate::directives::is_federation_directive;
use crate::error::SingleFederationError;
use crate::fragment::StrippedFragment;

type MergeWarning = String;

const ROOT_TYPE_NAMES: [&str; 3] = ["Query", "Mutation", "Subscription"];

pub(crate) struct Merger {
    errors: Vec<SingleFederationError>,
    composition_hints: Vec<MergeWarning>,
}

pub(crate) struct MergeSuccess {
    pub(crate) document: ast::Document,
    pub(crate) composition_hints: Vec<MergeWarning>,
}

pub(crate) struct MergeFailure {
    pub(crate) errors: Vec<SingleFederationError>,
    pub(crate) composition_hints: Vec<MergeWarning>,
}

impl Debug for MergeFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("MergeFailure")
            .field("errors", &self.errors)
            .field("composition_hints", &self.composition_hints)
            .finish()
    }
}

/// Merges stripped fragments following federation 1 ownership rules.
///
/// Fragments are merged in the order given; that order decides ownership reporting and the
/// order of merged fields.
pub(crate) fn merge_fragments(
    fragments: &[StrippedFragment],
) -> Result<MergeSuccess, MergeFailure> {
    Merger::new().merge(fragments)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TypeKind {
    Scalar,
    Object,
    Interface,
    Union,
    Enum,
    InputObject,
}

impl TypeKind {
    fn definition_name(self) -> &'static str {
        match self {
            TypeKind::Scalar => "ScalarTypeDefinition",
            TypeKind::Object => "ObjectTypeDefinition",
            TypeKind::Interface => "InterfaceTypeDefinition",
            TypeKind::Union => "UnionTypeDefinition",
            TypeKind::Enum => "EnumTypeDefinition",
            TypeKind::InputObject => "InputObjectTypeDefinition",
        }
    }
}

type BasesAndExtensions<'o, 'a> = (Vec<&'o TypeOccurrence<'a>>, Vec<&'o TypeOccurrence<'a>>);

/// One definition or extension of a named type, as found in one fragment.
struct TypeOccurrence<'a> {
    service: &'a str,
    name: &'a Name,
    kind: TypeKind,
    is_extension: bool,
    description: Option<&'a Node<str>>,
    directives: &'a ast::DirectiveList,
    implements: &'a [Name],
    fields: &'a [Node<FieldDefinition>],
    input_fields: &'a [Node<InputValueDefinition>],
    values: &'a [Node<EnumValueDefinition>],
    members: &'a [Name],
}

impl<'a> TypeOccurrence<'a> {
    fn new(
        service: &'a str,
        name: &'a Name,
        kind: TypeKind,
        is_extension: bool,
        description: Option<&'a Node<str>>,
        directives: &'a ast::DirectiveList,
    ) -> Self {
        Self {
            service,
            name,
            kind,
            // `@extends` is the federation 1 spelling of `extend type`
            is_extension: is_extension || directives.iter().any(|d| d.name == "extends"),
            description,
            directives,
            implements: &[],
            fields: &[],
            input_fields: &[],
            values: &[],
            members: &[],
        }
    }

    fn from_definition(service: &'a str, definition: &'a Definition) -> Option<Self> {
        use TypeKind::*;
        let occurrence = match definition {
            Definition::ObjectTypeDefinition(def) => TypeOccurrence {
                implements: &def.implements_interfaces,
                fields: &def.fields,
                ..Self::new(service, &def.name, Object, false, def.description.as_ref(), &def.directives)
            },
            Definition::ObjectTypeExtension(def) => TypeOccurrence {
                implements: &def.implements_interfaces,
                fields: &def.fields,
                ..Self::new(service, &def.name, Object, true, None, &def.directives)
            },
            Definition::InterfaceTypeDefinition(def) => TypeOccurrence {
                implements: &def.implements_interfaces,
                fields: &def.fields,
                ..Self::new(service, &def.name, Interface, false, def.description.as_ref(), &def.directives)
            },
            Definition::InterfaceTypeExtension(def) => TypeOccurrence {
                implements: &def.implements_interfaces,
                fields: &def.fields,
                ..Self::new(service, &def.name, Interface, true, None, &def.directives)
            },
            Definition::UnionTypeDefinition(def) => TypeOccurrence {
                members: &def.members,
                ..Self::new(service, &def.name, Union, false, def.description.as_ref(), &def.directives)
            },
            Definition::UnionTypeExtension(def) => TypeOccurrence {
                members: &def.members,
                ..Self::new(service, &def.name, Union, true, None, &def.directives)
            },
            Definition::EnumTypeDefinition(def) => TypeOccurrence {
                values: &def.values,
                ..Self::new(service, &def.name, Enum, false, def.description.as_ref(), &def.directives)
            },
            Definition::EnumTypeExtension(def) => TypeOccurrence {
                values: &def.values,
                ..Self::new(service, &def.name, Enum, true, None, &def.directives)
            },
            Definition::InputObjectTypeDefinition(def) => TypeOccurrence {
                input_fields: &def.fields,
                ..Self::new(service, &def.name, InputObject, false, def.description.as_ref(), &def.directives)
            },
            Definition::InputObjectTypeExtension(def) => TypeOccurrence {
                input_fields: &def.fields,
                ..Self::new(service, &def.name, InputObject, true, None, &def.directives)
            },
            Definition::ScalarTypeDefinition(def) => {
                Self::new(service, &def.name, Scalar, false, def.description.as_ref(), &def.directives)
            }
            Definition::ScalarTypeExtension(def) => {
                Self::new(service, &def.name, Scalar, true, None, &def.directives)
            }
            _ => return None,
        };
        Some(occurrence)
    }

    fn keys(&self) -> impl Iterator<Item = &'a Node<ast::Directive>> + use<'a> {
        self.directives.iter().filter(|d| d.name == "key")
    }

    fn field(&self, name: &str) -> Option<&'a Node<FieldDefinition>> {
        self.fields.iter().find(|field| field.name == name)
    }
}

struct MergedField {
    service: String,
    definition: Node<FieldDefinition>,
}

struct MergedType {
    name: Name,
    kind: TypeKind,
    description: Option<Node<str>>,
    directives: ast::DirectiveList,
    implements: IndexSet<Name>,
    fields: IndexMap<Name, MergedField>,
    input_fields: IndexMap<Name, (String, Node<InputValueDefinition>)>,
    values: IndexMap<Name, Node<EnumValueDefinition>>,
    members: IndexSet<Name>,
}

impl MergedType {
    fn new(name: Name, kind: TypeKind) -> Self {
        Self {
            name,
            kind,
            description: None,
            directives: Default::default(),
            implements: Default::default(),
            fields: Default::default(),
            input_fields: Default::default(),
            values: Default::default(),
            members: Default::default(),
        }
    }

    fn into_definition(self) -> Definition {
        let MergedType {
            name,
            kind,
            description,
            directives,
            implements,
            fields,
            input_fields,
            values,
            members,
        } = self;
        match kind {
            TypeKind::Object => Definition::ObjectTypeDefinition(Node::new(ast::ObjectTypeDefinition {
                description,
                name,
                implements_interfaces: implements.into_iter().collect(),
                directives,
                fields: fields.into_values().map(|f| f.definition).collect(),
            })),
            TypeKind::Interface => {
                Definition::InterfaceTypeDefinition(Node::new(ast::InterfaceTypeDefinition {
                    description,
                    name,
                    implements_interfaces: implements.into_iter().collect(),
                    directives,
                    fields: fields.into_values().map(|f| f.definition).collect(),
                }))
            }
            TypeKind::Union => Definition::UnionTypeDefinition(Node::new(ast::UnionTypeDefinition {
                description,
                name,
                directives,
                members: members.into_iter().collect(),
            })),
            TypeKind::Enum => Definition::EnumTypeDefinition(Node::new(ast::EnumTypeDefinition {
                description,
                name,
                directives,
                values: values.into_values().collect(),
            })),
            TypeKind::InputObject => {
                Definition::InputObjectTypeDefinition(Node::new(ast::InputObjectTypeDefinition {
                    description,
                    name,
                    directives,
                    fields: input_fields.into_values().map(|(_, f)| f).collect(),
                }))
            }
            TypeKind::Scalar => Definition::ScalarTypeDefinition(Node::new(ast::ScalarTypeDefinition {
                description,
                name,
                directives,
            })),
        }
    }
}

impl Merger {
    fn new() -> Self {
        Merger {
            errors: Vec::new(),
            composition_hints: Vec::new(),
        }
    }

    fn merge(mut self, fragments: &[StrippedFragment]) -> Result<MergeSuccess, MergeFailure> {
        let mut occurrences: IndexMap<&Name, Vec<TypeOccurrence>> = IndexMap::new();
        let mut directive_definitions: IndexMap<Name, Node<DirectiveDefinition>> = IndexMap::new();
        for fragment in fragments {
            for definition in &fragment.document.definitions {
                if let Definition::DirectiveDefinition(directive) = definition {
                    if !is_federation_directive(&directive.name) {
                        directive_definitions
                            .entry(directive.name.clone())
                            .or_insert_with(|| directive.clone());
                    }
                    continue;
                }
                if let Some(occurrence) = TypeOccurrence::from_definition(&fragment.service, definition) {
                    occurrences.entry(occurrence.name).or_default().push(occurrence);
                }
            }
        }

        let mut merged_types = Vec::with_capacity(occurrences.len());
        for (name, occurrences) in &occurrences {
            if !self.check_kinds(occurrences) {
                continue;
            }
            let merged = match occurrences[0].kind {
                TypeKind::Object | TypeKind::Interface => self.merge_composite_type(name, occurrences),
                TypeKind::InputObject => self.merge_input_object_type(name, occurrences),
                TypeKind::Enum => self.merge_enum_type(name, occurrences),
                TypeKind::Union => self.merge_union_type(name, occurrences),
                TypeKind::Scalar => self.merge_scalar_type(name, occurrences),
            };
            merged_types.extend(merged);
        }

        if !self.errors.is_empty() {
            return Err(MergeFailure {
                errors: self.errors,
                composition_hints: self.composition_hints,
            });
        }

        let mut document = ast::Document::new();
        document.definitions.extend(
            directive_definitions
                .into_values()
                .map(Definition::DirectiveDefinition),
        );
        document
            .definitions
            .extend(merged_types.into_iter().map(MergedType::into_definition));
        Ok(MergeSuccess {
            document,
            composition_hints: self.composition_hints,
        })
    }

    fn check_kinds(&mut self, occurrences: &[TypeOccurrence]) -> bool {
        let first = &occurrences[0];
        let mut consistent = true;
        for other in occurrences.iter().filter(|o| o.kind != first.kind) {
            consistent = false;
            self.errors.push(SingleFederationError::TypeKindMismatch {
                service: other.service.to_string(),
                owner: first.service.to_string(),
                type_name: first.name.to_string(),
                expected: first.kind.definition_name().to_string(),
                actual: other.kind.definition_name().to_string(),
            });
        }
        consistent
    }

    /// Splits occurrences into base definitions and extensions, reporting extensions that have
    /// nothing to extend.
    fn split_bases<'o, 'a>(
        &mut self,
        name: &Name,
        occurrences: &'o [TypeOccurrence<'a>],
    ) -> Option<BasesAndExtensions<'o, 'a>> {
        let (bases, extensions): (Vec<_>, Vec<_>) =
            occurrences.iter().partition(|occurrence| !occurrence.is_extension);
        if bases.is_empty() && !ROOT_TYPE_NAMES.contains(&name.as_str()) {
            self.errors.push(SingleFederationError::ExtensionWithNoBase {
                service: occurrences[0].service.to_string(),
                type_name: name.to_string(),
            });
            return None;
        }
        Some((bases, extensions))
    }

    fn merge_descriptions(&mut self, name: &Name, merged: &mut Option<Node<str>>, new: Option<&Node<str>>) {
        match (&*merged, new) {
            (_, None) => {}
            (None, Some(new)) => *merged = Some(new.clone()),
            (Some(a), Some(b)) => {
                if a != b {
                    self.composition_hints
                        .push(format!("conflicting descriptions on {name}"));
                }
            }
        }
    }

    fn merge_composite_type(&mut self, name: &Name, occurrences: &[TypeOccurrence]) -> Option<MergedType> {
        let (bases, extensions) = self.split_bases(name, occurrences)?;
        let is_root = ROOT_TYPE_NAMES.contains(&name.as_str());
        let is_entity = occurrences.iter().any(|o| o.keys().next().is_some());
        let owner = bases.first().map(|base| base.service);

        if let Some(owner) = owner.filter(|_| is_entity) {
            for duplicate in bases.iter().skip(1) {
                self.errors.push(SingleFederationError::DuplicateEntityOwner {
                    service: duplicate.service.to_string(),
                    owner: owner.to_string(),
                    type_name: name.to_string(),
                });
            }
        }

        let base_keys = bases
            .iter()
            .flat_map(|base| self.validate_base_keys(name, base))
            .collect::<Vec<_>>();
        for extension in &extensions {
            self.validate_extension_keys(name, extension, owner, &base_keys);
        }

        let mut merged = MergedType::new(name.clone(), occurrences[0].kind);
        for occurrence in bases.iter().chain(&extensions) {
            self.merge_descriptions(name, &mut merged.description, occurrence.description);
            merged.implements.extend(occurrence.implements.iter().cloned());
            merge_type_directives(&mut merged.directives, occurrence.directives);
            for field in occurrence.fields {
                if field.directives.iter().any(|d| d.name == "external") {
                    if let Some(owner) = owner {
                        self.validate_external_field(name, occurrence.service, owner, &bases, field);
                    }
                    continue;
                }
                match merged.fields.entry(field.name.clone()) {
                    Vacant(entry) => {
                        entry.insert(MergedField {
                            service: occurrence.service.to_string(),
                            definition: without_federation_directives(field),
                        });
                    }
                    Occupied(entry) => {
                        let existing = entry.get();
                        if existing.definition.ty != field.ty {
                            self.errors.push(SingleFederationError::FieldTypeMismatch {
                                service: occurrence.service.to_string(),
                                owner: existing.service.clone(),
                                type_name: name.to_string(),
                                field: field.name.to_string(),
                                expected: existing.definition.ty.to_string(),
                                actual: field.ty.to_string(),
                            });
                        } else if (is_root || is_entity) && existing.service != occurrence.service {
                            self.errors.push(SingleFederationError::FieldDefinedMultipleTimes {
                                service: occurrence.service.to_string(),
                                owner: existing.service.clone(),
                                type_name: name.to_string(),
                                field: field.name.to_string(),
                            });
                        }
                    }
                }
            }
        }
        Some(merged)
    }

    /// Validates the `@key`s of a base definition and returns their normalized field sets.
    fn validate_base_keys(&mut self, name: &Name, base: &TypeOccurrence) -> Vec<String> {
        let mut keys = Vec::new();
        for key in base.keys() {
            let Some(fields) = self.key_fields(name, base.service, key) else {
                continue;
            };
            for field in &fields.names {
                if base.field(field).is_none() {
                    self.errors.push(SingleFederationError::KeyFieldsMissingOnBase {
                        service: base.service.to_string(),
                        type_name: name.to_string(),
                        field: field.clone(),
                    });
                }
            }
            keys.push(fields.normalized);
        }
        keys
    }

    fn validate_extension_keys(
        &mut self,
        name: &Name,
        extension: &TypeOccurrence,
        owner: Option<&str>,
        base_keys: &[String],
    ) {
        if extension.keys().count() > 1 {
            self.errors.push(SingleFederationError::MultipleKeysOnExtension {
                service: extension.service.to_string(),
                owner: owner.unwrap_or_default().to_string(),
                type_name: name.to_string(),
            });
        }
        for key in extension.keys() {
            let Some(fields) = self.key_fields(name, extension.service, key) else {
                continue;
            };
            for field in &fields.names {
                if extension.field(field).is_none() {
                    self.errors.push(SingleFederationError::KeyFieldsMissingExternal {
                        service: extension.service.to_string(),
                        type_name: name.to_string(),
                        field: field.clone(),
                    });
                }
            }
            if let Some(owner) = owner.filter(|_| !base_keys.contains(&fields.normalized)) {
                self.errors.push(SingleFederationError::KeyMissingOnBase {
                    service: extension.service.to_string(),
                    owner: owner.to_string(),
                    type_name: name.to_string(),
                    available: base_keys
                        .iter()
                        .map(|key| format!("@key(fields: \"{key}\")"))
                        .join(", "),
                });
            }
        }
    }

    fn key_fields(&mut self, name: &Name, service: &str, key: &ast::Directive) -> Option<FieldSet> {
        let raw = key
            .specified_argument_by_name("fields")
            .and_then(|value| value.as_str())
            .unwrap_or_default();
        match FieldSet::parse(raw) {
            Ok(fields) => Some(fields),
            Err(reason) => {
                self.errors.push(SingleFederationError::InvalidFieldSet {
                    service: service.to_string(),
                    type_name: name.to_string(),
                    fields: raw.to_string(),
                    reason,
                });
                None
            }
        }
    }

    fn validate_external_field(
        &mut self,
        name: &Name,
        service: &str,
        owner: &str,
        bases: &[&TypeOccurrence],
        field: &FieldDefinition,
    ) {
        match bases.iter().find_map(|base| base.field(&field.name)) {
            None => self.errors.push(SingleFederationError::ExternalMissingOnBase {
                service: service.to_string(),
                owner: owner.to_string(),
                type_name: name.to_string(),
                field: field.name.to_string(),
            }),
            Some(base_field) if base_field.ty != field.ty => {
                self.errors.push(SingleFederationError::FieldTypeMismatch {
                    service: service.to_string(),
                    owner: owner.to_string(),
                    type_name: name.to_string(),
                    field: field.name.to_string(),
                    expected: base_field.ty.to_string(),
                    actual: field.ty.to_string(),
                })
            }
            Some(_) => {}
        }
    }

    fn merge_input_object_type(&mut self, name: &Name, occurrences: &[TypeOccurrence]) -> Option<MergedType> {
        let (bases, extensions) = self.split_bases(name, occurrences)?;
        let mut merged = MergedType::new(name.clone(), TypeKind::InputObject);
        for occurrence in bases.iter().chain(&extensions) {
            self.merge_descriptions(name, &mut merged.description, occurrence.description);
            merge_type_directives(&mut merged.directives, occurrence.directives);
            for field in occurrence.input_fields {
                match merged.input_fields.entry(field.name.clone()) {
                    Vacant(entry) => {
                        entry.insert((occurrence.service.to_string(), field.clone()));
                    }
                    Occupied(entry) => {
                        let (owner, existing) = entry.get();
                        if existing.ty != field.ty {
                            self.errors.push(SingleFederationError::FieldTypeMismatch {
                                service: occurrence.service.to_string(),
                                owner: owner.clone(),
                                type_name: name.to_string(),
                                field: field.name.to_string(),
                                expected: existing.ty.to_string(),
                                actual: field.ty.to_string(),
                            });
                        }
                    }
                }
            }
        }
        Some(merged)
    }

    fn merge_enum_type(&mut self, name: &Name, occurrences: &[TypeOccurrence]) -> Option<MergedType> {
        let (bases, extensions) = self.split_bases(name, occurrences)?;
        let mut merged = MergedType::new(name.clone(), TypeKind::Enum);
        for occurrence in bases.iter().chain(&extensions) {
            self.merge_descriptions(name, &mut merged.description, occurrence.description);
            merge_type_directives(&mut merged.directives, occurrence.directives);
            let before = merged.values.len();
            for value in occurrence.values {
                merged
                    .values
                    .entry(value.value.clone())
                    .or_insert_with(|| value.clone());
            }
            if before > 0 && merged.values.len() != before {
                self.composition_hints.push(format!(
                    "enum {name} gained values from {}",
                    occurrence.service
                ));
            }
        }
        Some(merged)
    }

    fn merge_union_type(&mut self, name: &Name, occurrences: &[TypeOccurrence]) -> Option<MergedType> {
        let (bases, extensions) = self.split_bases(name, occurrences)?;
        let mut merged = MergedType::new(name.clone(), TypeKind::Union);
        for occurrence in bases.iter().chain(&extensions) {
            self.merge_descriptions(name, &mut merged.description, occurrence.description);
            merge_type_directives(&mut merged.directives, occurrence.directives);
            // IndexSet::extend deduplicates
            merged.members.extend(occurrence.members.iter().cloned());
        }
        Some(merged)
    }

    fn merge_scalar_type(&mut self, name: &Name, occurrences: &[TypeOccurrence]) -> Option<MergedType> {
        let (bases, extensions) = self.split_bases(name, occurrences)?;
        let mut merged = MergedType::new(name.clone(), TypeKind::Scalar);
        for occurrence in bases.iter().chain(&extensions) {
            self.merge_descriptions(name, &mut merged.description, occurrence.description);
            merge_type_directives(&mut merged.directives, occurrence.directives);
        }
        Some(merged)
    }
}

/// Copies non-federation type directives, once per directive name.
fn merge_type_directives(merged: &mut ast::DirectiveList, incoming: &ast::DirectiveList) {
    for directive in incoming.iter() {
        if !is_federation_directive(&directive.name) && !merged.iter().any(|d| d.name == directive.name) {
            merged.push(directive.clone());
        }
    }
}

fn without_federation_directives(field: &Node<FieldDefinition>) -> Node<FieldDefinition> {
    let mut field = field.clone();
    field
        .make_mut()
        .directives
        .retain(|directive| !is_federation_directive(&directive.name));
    field
}

/// A parsed `@key(fields:)` selection.
#[derive(Debug, PartialEq)]
struct FieldSet {
    /// Top-level field names.
    names: Vec<String>,
    /// Whitespace-normalized text, used to compare keys across fragments.
    normalized: String,
}

impl FieldSet {
    fn parse(fields: &str) -> Result<Self, String> {
        let spaced = fields
            .replace('{', " { ")
            .replace('}', " } ")
            .replace(',', " ");
        let tokens = spaced.split_whitespace().collect::<Vec<_>>();
        let mut names = Vec::new();
        let mut depth = 0usize;
        let mut after_name = false;
        for token in &tokens {
            match *token {
                "{" => {
                    if !after_name {
                        return Err("selection set is not attached to a field".to_string());
                    }
                    depth += 1;
                    after_name = false;
                }
                "}" => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| "unbalanced braces".to_string())?;
                    after_name = false;
                }
                name => {
                    if !is_valid_name(name) {
                        return Err(format!("`{name}` is not a valid field name"));
                    }
                    if depth == 0 {
                        names.push(name.to_string());
                    }
                    after_name = true;
                }
            }
        }
        if depth != 0 {
            return Err("unbalanced braces".to_string());
        }
        if names.is_empty() {
            return Err("no fields selected".to_string());
        }
        Ok(Self {
            names,
            normalized: tokens.join(" "),
        })
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
