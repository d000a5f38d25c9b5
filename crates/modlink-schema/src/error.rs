/// Errors that can occur while registering or checking payload types.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// A type file could not be loaded.
    #[error("failed to load type: {0}")]
    LoadFailed(String),

    /// A type schema could not be compiled.
    #[error("failed to compile schema: {0}")]
    CompileFailed(String),

    /// The type name is not registered.
    #[error("unregistered payload type {0:?}")]
    UnknownType(String),

    /// A value failed its type's schema.
    #[error("value of type {type_name:?} failed validation: {message}")]
    ValidationFailed { type_name: String, message: String },

    /// A schema document is not valid JSON.
    #[error("schema is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SchemaError>;
