//! Logic for loading configuration in to an object model
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use derivative::Derivative;
use displaydoc::Display;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_TEMPLATE_TIMEOUT: Duration = Duration::from_millis(20);
const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration error.
#[derive(Debug, Error, Display)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// could not read configuration file {path}: {error}
    CannotReadFile {
        path: PathBuf,
        error: std::io::Error,
    },
    /// {message}: {error}
    InvalidConfiguration {
        message: &'static str,
        error: String,
    },
}

/// The configuration for the gateway.
///
/// Can be created through `serde::Deserialize` from various formats,
/// or inline in Rust code with `serde_json::json!` and `serde_json::from_value`.
#[derive(Clone, Derivative, Deserialize, Serialize, JsonSchema, Default)]
#[derivative(Debug)]
#[serde(deny_unknown_fields, default)]
pub struct Configuration {
    /// Where resource groups are read from.
    pub resources: Resources,

    /// Background schema refresh.
    pub refresh: Refresh,

    /// Template evaluation limits.
    pub templates: Templates,

    /// Calls made by the `@gql` and `@rest` directives.
    pub remote: Remote,

    /// Query execution.
    pub execution: Execution,
}

impl Configuration {
    /// Reads and parses a YAML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        let content =
            std::fs::read_to_string(path).map_err(|error| ConfigurationError::CannotReadFile {
                path: path.to_path_buf(),
                error,
            })?;
        content
            .parse()
            .map_err(|error: serde_yaml::Error| ConfigurationError::InvalidConfiguration {
                message: "failed to parse yaml",
                error: error.to_string(),
            })
    }
}

impl FromStr for Configuration {
    type Err = serde_yaml::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Configuration::default());
        }
        serde_yaml::from_str(s)
    }
}

/// Resource repository configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Resources {
    /// Path of a JSON or YAML resource group file. An empty in-memory group is served when unset.
    pub path: Option<PathBuf>,
}

/// Schema refresh configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Refresh {
    /// How often resources are polled for changes, in human-readable format; defaults to 60s
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub interval: Duration,
}

impl Default for Refresh {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

/// Template configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Templates {
    /// Wall clock limit of a single template evaluation; defaults to 20ms
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub timeout: Duration,
}

impl Default for Templates {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TEMPLATE_TIMEOUT,
        }
    }
}

/// Remote call configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Remote {
    /// Timeout used when a directive does not set `timeoutMs`; defaults to 10s
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub timeout: Duration,
}

impl Default for Remote {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }
}

/// Execution configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Execution {
    /// Allow `__schema` and `__type` introspection fields. Defaults to false.
    pub introspection: bool,
}

/// The JSON schema of the configuration file.
pub fn generate_config_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(Configuration)
}
