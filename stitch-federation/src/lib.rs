//! Federated schema composition for the stitch gateway.
//!
//! Fragments are composed with federation 1 ownership rules, like separate subgraph services.
//! Directive usages that federation does not know about survive composition: they are taken out
//! of every fragment first, merged, and put back onto the composed types and fields.
//!
//! ```
//! use stitch_federation::SchemaFragment;
//! use stitch_federation::compose;
//!
//! let composed = compose(
//!     &[SchemaFragment::new("ns", "hello", r#"type Query { hello: String! @tag(name: "x") }"#)],
//!     "scalar JSON",
//!     "directive @tag(name: String!) on FIELD_DEFINITION",
//! )
//! .unwrap();
//! assert!(composed.sdl().contains(r#"hello: String! @tag(name: "x")"#));
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

mod composition;
pub mod directives;
pub mod error;
mod fragment;
mod merge;

pub use crate::composition::ComposedSchema;
pub use crate::composition::compose;
pub use crate::directives::DirectiveTarget;
pub use crate::directives::DirectiveUsage;
pub use crate::directives::DirectiveUsages;
pub use crate::error::CompositionError;
pub use crate::error::SingleFederationError;
pub use crate::fragment::SchemaFragment;
