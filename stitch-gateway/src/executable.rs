//! Main entry point for the `stitch-gateway` command line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use http::HeaderMap;
use http::HeaderValue;
use http::header::AUTHORIZATION;
use tracing_subscriber::EnvFilter;

use crate::Gateway;
use crate::configuration::Configuration;
use crate::configuration::generate_config_schema;
use crate::graphql::Request;
use crate::json_ext::Object;
use crate::policy::PolicyCompilers;
use crate::resource::FileSystemResourceRepository;
use crate::resource::InMemoryResourceRepository;
use crate::resource::ResourceRepository;
use crate::schema::GatewaySchema;
use crate::schema::SchemaOptions;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Options for the gateway
#[derive(Parser, Debug)]
#[command(name = "stitch-gateway", about = "Directive driven GraphQL gateway")]
struct Opt {
    /// Log level (off|error|warn|info|debug|trace) or a tracing filter directive.
    #[arg(long = "log", default_value = "info", global = true, env = "STITCH_LOG")]
    log_level: String,

    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Configuration file (YAML).
    #[arg(short, long = "config", global = true, env = "STITCH_CONFIG")]
    config_path: Option<PathBuf>,

    /// Resource group file (JSON or YAML). Overrides `resources.path`.
    #[arg(short, long = "resources", global = true, env = "STITCH_RESOURCES")]
    resources_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prints the composed schema of the resource group.
    Compose,
    /// Executes one GraphQL request and prints the response.
    Execute {
        #[arg(short, long)]
        query: String,
        /// Variables as a JSON object.
        #[arg(long)]
        variables: Option<String>,
        #[arg(long)]
        operation_name: Option<String>,
        /// Value of the `Authorization` header, `Bearer <jwt>` for example.
        #[arg(long)]
        authorization: Option<String>,
    },
    /// Prints the JSON schema of the configuration file.
    ConfigSchema,
}

/// The gateway command line.
///
/// Creates its own tokio runtime.
pub fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(Executable::builder().start())
}

/// Entry point into the command line, optionally with extra policy compilers.
pub struct Executable {}

#[buildstructor::buildstructor]
impl Executable {
    /// Parses the command line, sets up logging and runs the requested command.
    ///
    /// `compilers` replaces the default policy compilers, to register an `opa` compiler for
    /// example.
    #[builder(entry = "builder", exit = "start", visibility = "pub")]
    async fn start(compilers: Option<PolicyCompilers>) -> Result<()> {
        let opt = Opt::parse();

        if let Command::ConfigSchema = opt.command {
            let schema = generate_config_schema();
            println!("{}", serde_json::to_string_pretty(&schema)?);
            return Ok(());
        }

        let filter =
            EnvFilter::try_new(&opt.log_level).context("could not parse log configuration")?;
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);
        match opt.log_format {
            LogFormat::Json => subscriber.json().try_init(),
            LogFormat::Text => subscriber.try_init(),
        }
        .map_err(|error| anyhow!("could not install the log subscriber: {error}"))?;

        let configuration = match &opt.config_path {
            Some(path) => Configuration::from_file(path)
                .with_context(|| format!("could not load {}", path.display()))?,
            None => Configuration::default(),
        };
        let options = SchemaOptions::from(&configuration);
        let compilers = compilers.unwrap_or_else(|| PolicyCompilers::new(options.engine.clone()));
        let repository: Arc<dyn ResourceRepository> = match opt
            .resources_path
            .as_ref()
            .or(configuration.resources.path.as_ref())
        {
            Some(path) => Arc::new(FileSystemResourceRepository::new(path)),
            None => {
                tracing::info!("no resource file configured, serving an empty resource group");
                Arc::new(InMemoryResourceRepository::default())
            }
        };

        match opt.command {
            Command::Compose => compose(repository, &compilers, options).await,
            Command::Execute {
                query,
                variables,
                operation_name,
                authorization,
            } => {
                let variables = match variables {
                    Some(variables) => serde_json::from_str::<Object>(&variables)
                        .context("--variables must be a JSON object")?,
                    None => Object::new(),
                };
                let mut headers = HeaderMap::new();
                if let Some(authorization) = authorization {
                    headers.insert(
                        AUTHORIZATION,
                        HeaderValue::from_str(&authorization)
                            .context("invalid --authorization value")?,
                    );
                }
                let gateway = Gateway::builder()
                    .repository(repository)
                    .compilers(compilers)
                    .options(options)
                    .build()
                    .await?;
                let request = Request::builder()
                    .query(query)
                    .and_operation_name(operation_name)
                    .variables(variables)
                    .build();
                let response = gateway.execute(request, headers).await;
                println!("{}", serde_json::to_string_pretty(&response)?);
                Ok(())
            }
            Command::ConfigSchema => Ok(()),
        }
    }
}

async fn compose(
    repository: Arc<dyn ResourceRepository>,
    compilers: &PolicyCompilers,
    options: SchemaOptions,
) -> Result<()> {
    let group = repository.fetch_latest().await?.resource_group;
    match GatewaySchema::build_with_options(group, compilers, options) {
        Ok(schema) => {
            println!("{}", schema.sdl());
            Ok(())
        }
        Err(error) => {
            let errors = error
                .errors()
                .into_iter()
                .map(|error| error.to_graphql_error())
                .collect::<Vec<_>>();
            println!("{}", serde_json::to_string_pretty(&errors)?);
            Err(anyhow!("composition failed: {error}"))
        }
    }
}
