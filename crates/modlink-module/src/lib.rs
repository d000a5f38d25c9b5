//! Module side of the modlink protocol.
//!
//! A module registers capability handlers per category, then calls
//! [`Module::start`] to serve the host over stdin/stdout:
//!
//! ```no_run
//! use modlink_module::{Fixture, Module, Response};
//! use modlink_peer::Value;
//!
//! let mut module = Module::abort_on_error(Module::new("shout"));
//! Module::abort_on_error(module.register_template_function(
//!     "upper",
//!     |request, response| {
//!         let text = request.data.first().and_then(Value::as_str).unwrap_or_default();
//!         response.add_data(Value::from(text.to_uppercase()));
//!     },
//!     Fixture::new(vec![Value::from("a")], "A"),
//! ));
//! module.start();
//! ```
//!
//! Module binaries must keep stdout free of anything but protocol frames.

pub mod config;
pub mod error;
pub mod module;
pub mod registry;
pub mod request;
pub mod response;
mod selftest;

pub use config::ModuleConfig;
pub use error::{RegistrationError, Result};
pub use module::{ExitReason, Module, REGISTRATION_EXIT_CODE};
pub use registry::Fixture;
pub use request::{
    DataLoaderRequest, DataParserRequest, DataPostProcessorRequest, IteratorRequest,
    SitePostProcessorRequest, TemplateFunctionRequest,
};
pub use response::{RelayResponse, RelayShape, Response, TemplateFunctionResponse};
