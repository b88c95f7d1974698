//! Bookkeeping for directive usages that federation composition would otherwise discard.
//!
//! Usages are taken out of each fragment before composition ([`DirectiveUsages::strip`]),
//! merged across fragments ([`DirectiveUsages::merge`]) and spliced back into the composed
//! document ([`DirectiveUsages::attach`]).

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::ast;
use apollo_compiler::ast::Definition;
use indexmap::IndexMap;

/// Directives understood by federation composition itself. They stay in the fragment AST.
pub const FEDERATION_DIRECTIVES: [&str; 5] = ["key", "extends", "external", "requires", "provides"];

/// Directives built into GraphQL. They are never stripped either.
pub const BUILT_IN_DIRECTIVES: [&str; 4] = ["deprecated", "specifiedBy", "skip", "include"];

pub(crate) fn is_federation_directive(name: &str) -> bool {
    FEDERATION_DIRECTIVES.contains(&name)
}

fn is_preserved_by_composition(name: &str) -> bool {
    is_federation_directive(name) || BUILT_IN_DIRECTIVES.contains(&name)
}

/// What a directive usage is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DirectiveTarget {
    /// An object or interface type, or an extension of one.
    Object,
    Field,
    Enum,
    EnumValue,
}

/// One directive application recorded from a fragment.
#[derive(Clone, Debug, PartialEq)]
pub struct DirectiveUsage {
    pub directive: Node<ast::Directive>,
    pub target: DirectiveTarget,
    pub owner_type: Name,
    /// The field (or enum value) name for member-level usages.
    pub owner_field: Option<Name>,
}

#[derive(Clone, Debug, Default)]
struct TypeUsages {
    is_enum: bool,
    own: Vec<Node<ast::Directive>>,
    members: IndexMap<Name, Vec<Node<ast::Directive>>>,
}

/// Directive usages keyed by owner type and, for member usages, by field or enum value.
#[derive(Clone, Debug, Default)]
pub struct DirectiveUsages {
    types: IndexMap<Name, TypeUsages>,
}

impl DirectiveUsages {
    /// Removes every non-federation directive from `document`, returning what was removed.
    pub fn strip(document: &mut ast::Document) -> Self {
        let mut usages = Self::default();
        for definition in document.definitions.iter_mut() {
            match definition {
                Definition::ObjectTypeDefinition(def) => {
                    let def = def.make_mut();
                    usages.strip_composite(&def.name, &mut def.directives, &mut def.fields);
                }
                Definition::ObjectTypeExtension(def) => {
                    let def = def.make_mut();
                    usages.strip_composite(&def.name, &mut def.directives, &mut def.fields);
                }
                Definition::InterfaceTypeDefinition(def) => {
                    let def = def.make_mut();
                    usages.strip_composite(&def.name, &mut def.directives, &mut def.fields);
                }
                Definition::InterfaceTypeExtension(def) => {
                    let def = def.make_mut();
                    usages.strip_composite(&def.name, &mut def.directives, &mut def.fields);
                }
                Definition::EnumTypeDefinition(def) => {
                    let def = def.make_mut();
                    usages.strip_enum(&def.name, &mut def.directives, &mut def.values);
                }
                Definition::EnumTypeExtension(def) => {
                    let def = def.make_mut();
                    usages.strip_enum(&def.name, &mut def.directives, &mut def.values);
                }
                _ => {}
            }
        }
        usages
    }

    fn strip_composite(
        &mut self,
        type_name: &Name,
        directives: &mut ast::DirectiveList,
        fields: &mut [Node<ast::FieldDefinition>],
    ) {
        let own = take_custom_directives(directives);
        let entry = self.types.entry(type_name.clone()).or_default();
        entry.own.extend(own);
        for field in fields.iter_mut() {
            let field = field.make_mut();
            let custom = take_custom_directives(&mut field.directives);
            if !custom.is_empty() {
                entry
                    .members
                    .entry(field.name.clone())
                    .or_default()
                    .extend(custom);
            }
        }
    }

    fn strip_enum(
        &mut self,
        type_name: &Name,
        directives: &mut ast::DirectiveList,
        values: &mut [Node<ast::EnumValueDefinition>],
    ) {
        let own = take_custom_directives(directives);
        let entry = self.types.entry(type_name.clone()).or_default();
        entry.is_enum = true;
        entry.own.extend(own);
        for value in values.iter_mut() {
            let value = value.make_mut();
            let custom = take_custom_directives(&mut value.directives);
            if !custom.is_empty() {
                entry
                    .members
                    .entry(value.value.clone())
                    .or_default()
                    .extend(custom);
            }
        }
    }

    /// Merges per-fragment usages in fragment order.
    ///
    /// Object and field usages concatenate. Enum and enum value usages are deduplicated by
    /// directive name, keeping the first occurrence.
    pub fn merge(all: impl IntoIterator<Item = DirectiveUsages>) -> Self {
        let mut merged = Self::default();
        for usages in all {
            for (type_name, incoming) in usages.types {
                let existing = merged.types.entry(type_name).or_default();
                existing.is_enum |= incoming.is_enum;
                if existing.is_enum {
                    extend_unique(&mut existing.own, incoming.own);
                    for (member, directives) in incoming.members {
                        extend_unique(existing.members.entry(member).or_default(), directives);
                    }
                } else {
                    existing.own.extend(incoming.own);
                    for (member, directives) in incoming.members {
                        existing
                            .members
                            .entry(member)
                            .or_default()
                            .extend(directives);
                    }
                }
            }
        }
        merged
    }

    /// Splices recorded usages back into `document`, after any directive already present.
    pub fn attach(&self, document: &mut ast::Document) {
        for definition in document.definitions.iter_mut() {
            match definition {
                Definition::ObjectTypeDefinition(def) => {
                    if let Some(usages) = self.types.get(&def.name) {
                        let def = def.make_mut();
                        def.directives.extend(usages.own.iter().cloned());
                        attach_to_fields(usages, &mut def.fields);
                    }
                }
                Definition::InterfaceTypeDefinition(def) => {
                    if let Some(usages) = self.types.get(&def.name) {
                        let def = def.make_mut();
                        def.directives.extend(usages.own.iter().cloned());
                        attach_to_fields(usages, &mut def.fields);
                    }
                }
                Definition::EnumTypeDefinition(def) => {
                    if let Some(usages) = self.types.get(&def.name) {
                        let def = def.make_mut();
                        def.directives.extend(usages.own.iter().cloned());
                        for value in def.values.iter_mut() {
                            if let Some(directives) = usages.members.get(&value.value) {
                                value.make_mut().directives.extend(directives.iter().cloned());
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Type-level usages recorded for `type_name`.
    pub fn for_type(&self, type_name: &str) -> &[Node<ast::Directive>] {
        self.types
            .get(type_name)
            .map(|usages| usages.own.as_slice())
            .unwrap_or_default()
    }

    /// Usages recorded for a field (or enum value) of `type_name`.
    pub fn for_member(&self, type_name: &str, member: &str) -> &[Node<ast::Directive>] {
        self.types
            .get(type_name)
            .and_then(|usages| usages.members.get(member))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every recorded usage, flattened.
    pub fn iter(&self) -> impl Iterator<Item = DirectiveUsage> + '_ {
        self.types.iter().flat_map(|(type_name, usages)| {
            let (own_target, member_target) = if usages.is_enum {
                (DirectiveTarget::Enum, DirectiveTarget::EnumValue)
            } else {
                (DirectiveTarget::Object, DirectiveTarget::Field)
            };
            let own = usages.own.iter().map(move |directive| DirectiveUsage {
                directive: directive.clone(),
                target: own_target,
                owner_type: type_name.clone(),
                owner_field: None,
            });
            let members = usages.members.iter().flat_map(move |(member, directives)| {
                directives.iter().map(move |directive| DirectiveUsage {
                    directive: directive.clone(),
                    target: member_target,
                    owner_type: type_name.clone(),
                    owner_field: Some(member.clone()),
                })
            });
            own.chain(members)
        })
    }

    pub fn len(&self) -> usize {
        self.types
            .values()
            .map(|usages| usages.own.len() + usages.members.values().map(Vec::len).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn take_custom_directives(directives: &mut ast::DirectiveList) -> Vec<Node<ast::Directive>> {
    let (kept, custom): (Vec<_>, Vec<_>) = std::mem::take(&mut directives.0)
        .into_iter()
        .partition(|directive| is_preserved_by_composition(directive.name.as_str()));
    directives.0 = kept;
    custom
}

fn extend_unique(existing: &mut Vec<Node<ast::Directive>>, incoming: Vec<Node<ast::Directive>>) {
    for directive in incoming {
        if !existing.iter().any(|d| d.name == directive.name) {
            existing.push(directive);
        }
    }
}

fn attach_to_fields(usages: &TypeUsages, fields: &mut [Node<ast::FieldDefinition>]) {
    for field in fields.iter_mut() {
        if let Some(directives) = usages.members.get(&field.name) {
            field.make_mut().directives.extend(directives.iter().cloned());
        }
    }
}
