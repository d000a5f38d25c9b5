//! Protocol layer for modlink.
//!
//! A [`Connection`] carries typed messages and responses over one framed
//! stream. [`ModuleHost`] sits on the host side of that stream and lets
//! many threads call into one module at once. [`RelayFile`] moves bulk
//! data between pipeline stages without touching the stream.

#[cfg(feature = "async")]
pub mod async_host;
pub mod codec;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod host;
pub mod message;
pub mod relay;
pub mod site;
pub mod value;

#[cfg(feature = "async")]
pub use async_host::AsyncModuleHost;
pub use codec::{PayloadCodec, ResponseView};
pub use connection::{Connection, Token, Unanswered};
pub use error::{HostError, PeerError, RelayError, Result, VersionRelation};
pub use handshake::{handshake_host, handshake_module, HandshakeConfig, PROTOCOL_VERSION};
pub use host::{HostConfig, ModuleHost};
pub use message::{
    methods_from_value, methods_to_value, split_command, Category, CorrelationId, Fault, LogEntry,
    Message, Methods, Payload, Response, Severity, GET_METHODS, GET_VERSION, HANDSHAKE_ID,
    INTERNAL_CATEGORY, INTERNAL_CONFIG, INTERNAL_TEST_METHODS, KILL, MODULE_READY,
};
pub use relay::{RelayConfig, RelayFile, RelayRoot};
pub use site::{sites_from_value, sites_to_value, Site, SITE_TYPE};
pub use value::Value;
