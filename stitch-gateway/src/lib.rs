//! A GraphQL gateway that composes namespaced schema fragments and resolves every field through
//! the directives attached to it.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stitch_gateway::Gateway;
//! use stitch_gateway::graphql::Request;
//! use stitch_gateway::resource::InMemoryResourceRepository;
//! use stitch_gateway::resource::ResourceRepository;
//!
//! # async fn run() -> Result<(), stitch_gateway::error::ResourceError> {
//! let repository: Arc<dyn ResourceRepository> = Arc::new(InMemoryResourceRepository::default());
//! let gateway = Gateway::builder()
//!     .repository(repository)
//!     .build()
//!     .await?;
//! let response = gateway
//!     .execute(
//!         Request::builder().query("{ default }").build(),
//!         Default::default(),
//!     )
//!     .await;
//! # Ok(())
//! # }
//! ```

#![warn(
    rustdoc::broken_intra_doc_links,
    unreachable_pub,
    unreachable_patterns,
    unused,
    unused_qualifications,
    dead_code,
    while_true,
    unconditional_panic,
    clippy::all
)]

pub mod json_ext;

pub mod configuration;
pub mod context;
mod directives;
pub mod error;
mod executable;
mod execution;
mod gateway;
pub mod graphql;
pub mod injection;
pub mod policy;
pub mod reload;
pub mod resource;
pub mod schema;

pub use configuration::Configuration;
pub use context::RequestContext;
pub use executable::Executable;
pub use executable::main;
pub use gateway::Gateway;
pub use schema::GatewaySchema;
pub use schema::SchemaOptions;

/// Boxed error type for collaborators such as policy compilers and modules.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
