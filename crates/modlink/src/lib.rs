//! Out-of-process plugin modules for static-site builds.
//!
//! A host spawns module executables and talks to them over their stdio
//! with a framed, versioned, multiplexed request/response protocol.
//!
//! # Crate Structure
//!
//! - [`transport`]: module processes and in-process links
//! - [`frame`]: length-prefixed frames tagged message or response
//! - [`schema`]: registry of named payload types
//! - [`peer`]: values, connections, the host multiplexer and file relay
//! - [`module`]: the module-side dispatcher (behind the `module` feature)

/// Re-export transport types.
pub mod transport {
    pub use modlink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use modlink_frame::*;
}

/// Re-export payload type registry.
pub mod schema {
    pub use modlink_schema::*;
}

/// Re-export protocol and host types.
pub mod peer {
    pub use modlink_peer::*;
}

/// Re-export module-side types (requires `module` feature).
#[cfg(feature = "module")]
pub mod module {
    pub use modlink_module::*;
}

#[cfg(feature = "cli")]
pub mod logging;

pub use modlink_peer::{HostConfig, HostError, ModuleHost, RelayFile, Value};
