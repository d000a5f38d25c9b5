/// Controls type registry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// When true, object schemas reject properties they do not declare.
    pub strict_mode: bool,
    /// When true, unregistered type names return `SchemaError::UnknownType`.
    pub fail_on_unknown_type: bool,
    /// Maximum number of type files loaded from a directory.
    pub max_types_from_directory: usize,
    /// Maximum bytes allowed per type file loaded from a directory.
    pub max_schema_file_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            strict_mode: false,
            fail_on_unknown_type: true,
            max_types_from_directory: 256,
            max_schema_file_size: 256 * 1024,
        }
    }
}
