use std::cmp::Ordering;

use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{PeerError, Result, VersionRelation};
use crate::message::{Payload, GET_VERSION, HANDSHAKE_ID};
use crate::value::Value;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Configuration for the version handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Version announced to the peer. Anything but [`PROTOCOL_VERSION`] is
    /// only useful to provoke mismatches in tests.
    pub protocol_version: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Run the host side of the handshake; returns the peer's version.
///
/// Sends the local version on the reserved handshake id and expects the
/// module's version back on the same id. Any mismatch is fatal.
pub fn handshake_host(connection: &Connection, config: &HandshakeConfig) -> Result<u32> {
    let local = config.protocol_version;
    connection.send(GET_VERSION, Payload::Version(local), HANDSHAKE_ID)?;

    let response = connection.try_get_response()?;
    if response.id != HANDSHAKE_ID {
        return Err(PeerError::ProtocolViolation(format!(
            "handshake answered on id {} instead of the reserved id",
            response.id
        )));
    }

    let peer = match response.data {
        Value::Int(version) => u32::try_from(version).map_err(|_| {
            PeerError::ProtocolViolation(format!("version {version} is out of range"))
        })?,
        other => {
            return Err(PeerError::ProtocolViolation(format!(
                "handshake answered with {} instead of a version",
                other.kind()
            )))
        }
    };

    compare_versions(local, peer)?;
    debug!(version = peer, "host handshake complete");
    Ok(peer)
}

/// Run the module side of the handshake; returns the host's version.
///
/// The module answers with its own version as soon as the request is well
/// formed, so on a mismatch both sides report it.
pub fn handshake_module(connection: &Connection, config: &HandshakeConfig) -> Result<u32> {
    let local = config.protocol_version;
    let message = connection.try_receive()?;

    if message.id != HANDSHAKE_ID || message.command != GET_VERSION {
        return Err(PeerError::ProtocolViolation(format!(
            "expected {GET_VERSION} on the reserved id, got {:?} on {}",
            message.command, message.id
        )));
    }
    let Payload::Version(peer) = message.payload else {
        return Err(PeerError::ProtocolViolation(
            "handshake message carries no version".to_string(),
        ));
    };

    connection.respond(HANDSHAKE_ID, &Value::Int(i64::from(local)), &[])?;

    compare_versions(local, peer)?;
    debug!(version = peer, "module handshake complete");
    Ok(peer)
}

fn compare_versions(local: u32, peer: u32) -> Result<()> {
    let relation = match peer.cmp(&local) {
        Ordering::Equal => return Ok(()),
        Ordering::Less => VersionRelation::Older,
        Ordering::Greater => VersionRelation::Newer,
    };
    warn!(local, peer, %relation, "protocol version mismatch");
    Err(PeerError::VersionMismatch {
        local,
        peer,
        relation,
    })
}
