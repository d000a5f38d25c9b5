use std::sync::Arc;

use modlink_schema::TypeRegistry;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{PeerError, Result};
use crate::message::{Message, Payload, Response};
use crate::value::Value;

/// Encodes protocol envelopes and checks every named value against the
/// type registry on the way in and out.
#[derive(Debug, Clone)]
pub struct PayloadCodec {
    registry: Arc<TypeRegistry>,
}

impl PayloadCodec {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }

    /// Codec over [`TypeRegistry::builtin`].
    pub fn builtin() -> Self {
        Self::new(Arc::new(TypeRegistry::builtin()))
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Reject unregistered or schema-violating `Typed` values anywhere in
    /// `value`, and floats JSON cannot carry.
    pub fn check(&self, value: &Value) -> Result<()> {
        match value {
            Value::Float(float) if !float.is_finite() => Err(PeerError::NonFiniteFloat(*float)),
            Value::Typed { name, value } => {
                self.registry.check(name, &value.to_json())?;
                self.check(value)
            }
            Value::List(items) => items.iter().try_for_each(|item| self.check(item)),
            Value::Map(map) => map.values().try_for_each(|item| self.check(item)),
            _ => Ok(()),
        }
    }

    pub fn encode_message(&self, message: &Message) -> Result<Vec<u8>> {
        if let Payload::Execute { args } = &message.payload {
            args.iter().try_for_each(|arg| self.check(arg))?;
        }
        self.encode(message)
    }

    pub fn decode_message(&self, bytes: &[u8]) -> Result<Message> {
        let message: Message = self.decode(bytes)?;
        if let Payload::Execute { args } = &message.payload {
            args.iter().try_for_each(|arg| self.check(arg))?;
        }
        Ok(message)
    }

    pub fn encode_response(&self, response: &impl ResponseView) -> Result<Vec<u8>> {
        self.check(response.data())?;
        self.encode(response)
    }

    pub fn decode_response(&self, bytes: &[u8]) -> Result<Response> {
        let response: Response = self.decode(bytes)?;
        self.check(&response.data)?;
        Ok(response)
    }

    pub fn encode_value(&self, value: &Value) -> Result<Vec<u8>> {
        self.check(value)?;
        self.encode(value)
    }

    pub fn decode_value(&self, bytes: &[u8]) -> Result<Value> {
        let value: Value = self.decode(bytes)?;
        self.check(&value)?;
        Ok(value)
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Anything that serializes like a [`Response`].
pub trait ResponseView: Serialize {
    fn data(&self) -> &Value;
}

impl ResponseView for Response {
    fn data(&self) -> &Value {
        &self.data
    }
}
