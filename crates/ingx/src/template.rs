//! 🧩 Templates: the tiny language that turns dataset fields into documents.
//!
//! 🎬 COLD OPEN: INT. FORECAST OFFICE, 4:12 AM
//!
//! A radiosonde file lands in a directory. Nobody asked it to. It has 80 levels,
//! a station name, and absolutely no idea what a document id is. Somewhere a
//! template string reads `DD:V01:*station:&interval_start|3600:*epoch` and
//! promises to sort it all out. This module is that promise. 🦆
//!
//! ```text
//!   "&derive_key|PREFIX:*station_name:*fcst_hour"
//!        │           │        │              │
//!        │           │        └──── sub-tokens (resolved first)
//!        │           └── argument list (up to the first ':')
//!        └── handler name, looked up in a HandlerRegistry
//! ```
//!
//! - [`grammar`] tokenizes template strings into [`Token`]s.
//! - [`resolver`] walks tokens against a dataset row and produces [`Resolved`] values.
//! - [`handlers`] holds the registry of named handler functions.

pub mod grammar;
pub mod handlers;
pub mod resolver;
pub mod value;

pub use grammar::{FunctionCall, Token, parse};
pub use handlers::{HandlerFn, HandlerParams, HandlerRegistry};
pub use resolver::{ResolveContext, Resolver, TemplateNode};
pub use value::Resolved;

use thiserror::Error;

/// 💀 Everything that can go sideways while parsing or resolving a template.
///
/// `Malformed` and `UnknownHandler` are configuration mistakes and get caught before any
/// worker starts. `Handler` and `BadType` happen per row and only cost that row.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TemplateError {
    #[error("💀 malformed template '{template}': {reason}")]
    Malformed { template: String, reason: String },

    #[error("💀 no handler named '{0}' is registered for this builder")]
    UnknownHandler(String),

    #[error("💀 handler '{name}' failed: {message}")]
    Handler { name: String, message: String },

    #[error("💀 bad type while resolving '{context}': {reason}")]
    BadType { context: String, reason: String },
}
