//! Named payload types for the modlink wire codec.
//!
//! Modules and hosts exchange opaque structured values (sites, HTML
//! fragments, URLs, ...) by name. Both sides must agree on the set of names
//! up front: the codec refuses to encode or decode a named value whose name is
//! not in the [`TypeRegistry`]. A name may additionally carry a JSON Schema
//! (2020-12) that every value of that type must satisfy.

pub mod config;
pub mod error;
pub mod registry;
pub mod validator;

pub use config::RegistryConfig;
pub use error::{Result, SchemaError};
pub use registry::{TypeRegistry, BUILTIN_TYPES};
