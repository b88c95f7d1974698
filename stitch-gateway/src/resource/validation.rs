use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use super::Resource;
use super::ResourceGroup;
use super::ResourceMetadata;
use super::Upstream;
use crate::error::ResourceError;
use crate::error::ResourceErrors;

/// GraphQL names, dashes allowed.
const NAME_PATTERN: &str = r"^[A-Z_a-z-][\w-]*$";

static VALID_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z_a-z-][0-9A-Z_a-z-]*$").expect("valid name pattern"));

const DUPLICATE_UPSTREAM_FOUND: &str = "DUPLICATE_UPSTREAM_FOUND";
const NAME_CONFLICT: &str = "NAME_CONFLICT";

/// Checks the upstreams and resource names of `group`.
///
/// Every problem found is reported in one [`ResourceError::Validation`].
pub fn validate_resource_group(group: &ResourceGroup) -> Result<(), ResourceError> {
    let mut errors = validate_upstreams(&group.upstreams);
    errors.extend(validate_names(group));
    errors.extend(validate_name_conflicts(group));
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ResourceError::Validation(ResourceErrors(errors)))
    }
}

fn validate_upstreams(upstreams: &[Upstream]) -> Vec<ResourceError> {
    let mut errors = Vec::new();

    let mut hosts: HashMap<&str, &Upstream> = HashMap::new();
    for upstream in upstreams {
        if let Some(existing) = hosts.get(upstream.host.as_str()) {
            errors.push(ResourceError::DuplicateOrConflictingResource {
                code: DUPLICATE_UPSTREAM_FOUND,
                message: format!(
                    "Duplicate host found on upstream {} (host {} is already used by {})",
                    upstream.metadata, upstream.host, existing.metadata
                ),
            });
        } else {
            hosts.insert(&upstream.host, upstream);
        }
    }

    let mut authorities: HashMap<_, &Upstream> = HashMap::new();
    for upstream in upstreams {
        let key = &upstream.auth.active_directory;
        if let Some(existing) = authorities.get(key) {
            errors.push(ResourceError::DuplicateOrConflictingResource {
                code: DUPLICATE_UPSTREAM_FOUND,
                message: format!(
                    "Duplicate authority+resource found on upstream {} (already used by {})",
                    upstream.metadata, existing.metadata
                ),
            });
        } else {
            authorities.insert(key, upstream);
        }
    }

    errors
}

/// The metadata of every named resource, with whether it is a policy.
fn all_metadata(group: &ResourceGroup) -> impl Iterator<Item = (&ResourceMetadata, bool)> {
    let plain = group
        .schemas
        .iter()
        .map(Resource::metadata)
        .chain(group.upstreams.iter().map(Resource::metadata))
        .chain(
            group
                .upstream_client_credentials
                .iter()
                .map(Resource::metadata),
        )
        .map(|metadata| (metadata, false));
    plain.chain(
        group
            .policies
            .iter()
            .map(|policy| (policy.metadata(), true)),
    )
}

fn validate_names(group: &ResourceGroup) -> Vec<ResourceError> {
    let mut errors = Vec::new();
    for (metadata, is_policy) in all_metadata(group) {
        if !VALID_NAME.is_match(&metadata.namespace) {
            errors.push(ResourceError::InvalidResourceName {
                message: format!(
                    "Invalid characters found in namespace name {}, allowed characters are /{NAME_PATTERN}/",
                    metadata.namespace
                ),
            });
        }
        if is_policy && !VALID_NAME.is_match(&metadata.name) {
            errors.push(ResourceError::InvalidResourceName {
                message: format!(
                    "Invalid characters found in policy name {}, allowed characters are /{NAME_PATTERN}/",
                    metadata.name
                ),
            });
        }
    }
    errors
}

/// Names that only differ by `-` and `_` would map to the same GraphQL field name.
fn validate_name_conflicts(group: &ResourceGroup) -> Vec<ResourceError> {
    let mut errors = Vec::new();
    let mut namespaces: HashMap<String, &str> = HashMap::new();
    let mut policy_names: HashMap<String, &str> = HashMap::new();

    for (metadata, is_policy) in all_metadata(group) {
        let namespace = metadata.namespace.as_str();
        let existing = *namespaces
            .entry(namespace.replace('-', "_"))
            .or_insert(namespace);
        if existing != namespace {
            errors.push(ResourceError::DuplicateOrConflictingResource {
                code: NAME_CONFLICT,
                message: format!(
                    "Namespace name conflict found between {existing} and {namespace}, they have to either match exactly or have a difference in non-special characters"
                ),
            });
        }

        if is_policy {
            let name = metadata.name.as_str();
            let existing = *policy_names.entry(name.replace('-', "_")).or_insert(name);
            if existing != name {
                errors.push(ResourceError::DuplicateOrConflictingResource {
                    code: NAME_CONFLICT,
                    message: format!(
                        "Policy name conflict found between {existing} and {name}, they have to either match exactly or have a difference in non-special characters"
                    ),
                });
            }
        }
    }
    errors
}
