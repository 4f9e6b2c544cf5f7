//! Capability bridges and built-in tools for clawloop.
//!
//! - [`schema`] filters model-supplied arguments down to what a tool declares
//! - [`remote`] forwards calls to remote tool-protocol endpoints and
//!   translates their typed results
//! - [`function`] wraps async closures as local handlers
//! - [`builtin`] ships a handful of small tools

pub mod builtin;
pub mod function;
pub mod remote;
pub mod schema;

pub use builtin::builtin_tools;
pub use function::{FnHandler, handler_fn, required_str};
pub use remote::{call_remote, translate};
pub use schema::{FilteredArguments, filter_arguments};
