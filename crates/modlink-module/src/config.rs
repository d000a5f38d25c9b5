use std::sync::Arc;

use modlink_frame::FrameConfig;
use modlink_peer::{HandshakeConfig, RelayConfig};
use modlink_schema::TypeRegistry;

/// Configuration for [`Module`](crate::Module).
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    pub frame: FrameConfig,
    pub handshake: HandshakeConfig,
    /// Payload types the module accepts and emits.
    pub registry: Arc<TypeRegistry>,
    /// When `root` is set, relay references outside it are refused.
    pub relay: RelayConfig,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            handshake: HandshakeConfig::default(),
            registry: Arc::new(TypeRegistry::builtin()),
            relay: RelayConfig::default(),
        }
    }
}
