use std::collections::BTreeMap;
use std::fs::{File, Metadata};
use std::io::Read;
use std::path::Path;

use jsonschema::Validator;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::RegistryConfig;
use crate::error::{Result, SchemaError};
use crate::validator::validate_value;

const TYPE_FILE_SUFFIX: &str = ".type.json";

const SITE_SCHEMA: &str = r#"{
    "type": "object",
    "properties": {
        "slug": { "type": "string" },
        "template": { "type": "string" },
        "data": { "type": "object" }
    },
    "required": ["slug", "template", "data"]
}"#;

const STRING_SCHEMA: &str = r#"{ "type": "string" }"#;

/// Types every host and module agree on without configuration.
///
/// `site` is a page of the site tree; the rest are pre-escaped string wrappers
/// handed to and returned from template functions.
pub const BUILTIN_TYPES: [(&str, &str); 6] = [
    ("site", SITE_SCHEMA),
    ("html", STRING_SCHEMA),
    ("htmlAttr", STRING_SCHEMA),
    ("js", STRING_SCHEMA),
    ("jsStr", STRING_SCHEMA),
    ("url", STRING_SCHEMA),
];

/// Name-keyed registry of payload types, each with an optional compiled schema.
pub struct TypeRegistry {
    types: BTreeMap<String, Option<Validator>>,
    config: RegistryConfig,
}

impl TypeRegistry {
    /// Create an empty registry with default config.
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            types: BTreeMap::new(),
            config,
        }
    }

    /// Registry pre-populated with [`BUILTIN_TYPES`].
    pub fn builtin() -> Self {
        Self::builtin_with_config(RegistryConfig::default())
    }

    pub fn builtin_with_config(config: RegistryConfig) -> Self {
        let mut registry = Self::with_config(config);
        for (name, schema) in BUILTIN_TYPES {
            // Builtin schemas are constants and always compile.
            if let Err(err) = registry.register_with_schema(name, schema) {
                debug!(name, %err, "builtin type registered without schema");
                registry.register(name);
            }
        }
        registry
    }

    /// Register a type name without a schema contract.
    pub fn register(&mut self, name: impl Into<String>) {
        self.types.insert(name.into(), None);
    }

    /// Register a type whose values must satisfy `schema_json`.
    pub fn register_with_schema(&mut self, name: impl Into<String>, schema_json: &str) -> Result<()> {
        let schema: Value = serde_json::from_str(schema_json)?;
        self.register_schema_value(name, &schema)
    }

    pub fn register_schema_value(&mut self, name: impl Into<String>, schema: &Value) -> Result<()> {
        let mut schema = schema.clone();
        if self.config.strict_mode {
            apply_strict_mode(&mut schema);
        }

        let compiled = jsonschema::validator_for(&schema)
            .map_err(|err| SchemaError::CompileFailed(err.to_string()))?;

        self.types.insert(name.into(), Some(compiled));
        Ok(())
    }

    /// Builtin types plus every `<name>.type.json` file in `path`.
    pub fn from_directory(path: &Path) -> Result<Self> {
        Self::from_directory_with_config(path, RegistryConfig::default())
    }

    pub fn from_directory_with_config(path: &Path, config: RegistryConfig) -> Result<Self> {
        let mut registry = Self::builtin_with_config(config);
        registry.load_directory(path)?;
        Ok(registry)
    }

    /// Add every `<name>.type.json` file in `path` to this registry.
    ///
    /// A file with the empty object `{}` registers the name without
    /// constraints. Symlinked type files, files replaced while loading and
    /// files over the configured size are refused.
    pub fn load_directory(&mut self, path: &Path) -> Result<usize> {
        let entries = std::fs::read_dir(path)
            .map_err(|err| SchemaError::LoadFailed(format!("{}: {err}", path.display())))?;

        let mut loaded = 0usize;
        for entry in entries {
            let entry = entry.map_err(|err| SchemaError::LoadFailed(err.to_string()))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(type_name) = file_name.strip_suffix(TYPE_FILE_SUFFIX) else {
                continue;
            };

            let entry_path = entry.path();
            let link_metadata = std::fs::symlink_metadata(&entry_path)
                .map_err(|err| SchemaError::LoadFailed(err.to_string()))?;
            if link_metadata.file_type().is_symlink() {
                return Err(SchemaError::LoadFailed(format!(
                    "refusing to load type symlink: {file_name}"
                )));
            }
            if !link_metadata.is_file() {
                continue;
            }
            if !is_valid_type_name(type_name) {
                return Err(SchemaError::LoadFailed(format!(
                    "invalid type name in file name: {file_name}"
                )));
            }

            loaded = loaded.saturating_add(1);
            if loaded > self.config.max_types_from_directory {
                return Err(SchemaError::LoadFailed(format!(
                    "type count exceeds configured max ({})",
                    self.config.max_types_from_directory
                )));
            }

            let content = read_type_file(&entry_path, &link_metadata, self.config.max_schema_file_size)?;
            self.register_with_schema(type_name, &content)?;
            debug!(type_name, path = %entry_path.display(), "registered payload type");
        }

        Ok(loaded)
    }

    /// Check that `name` is registered and `value` satisfies its schema.
    ///
    /// With `fail_on_unknown_type` disabled, unknown names pass unchecked.
    pub fn check(&self, name: &str, value: &Value) -> Result<()> {
        match self.types.get(name) {
            Some(Some(validator)) => validate_value(name, value, validator),
            Some(None) => Ok(()),
            None if self.config.fail_on_unknown_type => {
                Err(SchemaError::UnknownType(name.to_string()))
            }
            None => Ok(()),
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn has_schema(&self, name: &str) -> bool {
        matches!(self.types.get(name), Some(Some(_)))
    }

    /// Registered names in sorted order.
    pub fn type_names(&self) -> Vec<&str> {
        self.types.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.type_names())
            .field("config", &self.config)
            .finish()
    }
}

fn is_valid_type_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn read_type_file(path: &Path, link_metadata: &Metadata, max_bytes: usize) -> Result<String> {
    let file = File::open(path).map_err(|err| {
        SchemaError::LoadFailed(format!("failed opening type {}: {err}", path.display()))
    })?;
    let opened = file
        .metadata()
        .map_err(|err| SchemaError::LoadFailed(err.to_string()))?;

    #[cfg(unix)]
    {
        if !same_file_identity(link_metadata, &opened) {
            return Err(SchemaError::LoadFailed(format!(
                "type file changed during load: {}",
                path.display()
            )));
        }
    }
    #[cfg(not(unix))]
    let _ = link_metadata;

    if opened.len() > max_bytes as u64 {
        return Err(SchemaError::LoadFailed(format!(
            "type file too large ({} bytes): {}",
            opened.len(),
            path.display()
        )));
    }

    // The file may grow between the metadata call and the read.
    let limit = u64::try_from(max_bytes.saturating_add(1)).unwrap_or(u64::MAX);
    let mut content = String::new();
    file.take(limit).read_to_string(&mut content).map_err(|err| {
        SchemaError::LoadFailed(format!("failed reading type {}: {err}", path.display()))
    })?;
    if content.len() > max_bytes {
        return Err(SchemaError::LoadFailed(format!(
            "type file grew past limit while reading: {}",
            path.display()
        )));
    }
    Ok(content)
}

#[cfg(unix)]
fn same_file_identity(a: &Metadata, b: &Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

const NESTED_SCHEMA_MAPS: [&str; 5] = [
    "properties",
    "patternProperties",
    "dependentSchemas",
    "$defs",
    "definitions",
];

const NESTED_SCHEMAS: [&str; 11] = [
    "propertyNames",
    "additionalProperties",
    "unevaluatedProperties",
    "items",
    "contains",
    "additionalItems",
    "unevaluatedItems",
    "not",
    "if",
    "then",
    "else",
];

const NESTED_SCHEMA_LISTS: [&str; 4] = ["prefixItems", "allOf", "anyOf", "oneOf"];

const OBJECT_KEYWORDS: [&str; 8] = [
    "properties",
    "patternProperties",
    "additionalProperties",
    "unevaluatedProperties",
    "required",
    "dependentRequired",
    "dependentSchemas",
    "propertyNames",
];

/// Close every object schema that leaves `additionalProperties` open.
fn apply_strict_mode(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            if is_object_schema(map) && !map.contains_key("additionalProperties") {
                map.insert("additionalProperties".to_string(), Value::Bool(false));
            }

            for key in NESTED_SCHEMA_MAPS {
                if let Some(Value::Object(children)) = map.get_mut(key) {
                    children.values_mut().for_each(apply_strict_mode);
                }
            }
            for key in NESTED_SCHEMAS {
                if let Some(child) = map.get_mut(key) {
                    apply_strict_mode(child);
                }
            }
            for key in NESTED_SCHEMA_LISTS {
                if let Some(Value::Array(children)) = map.get_mut(key) {
                    children.iter_mut().for_each(apply_strict_mode);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(apply_strict_mode),
        _ => {}
    }
}

fn is_object_schema(map: &Map<String, Value>) -> bool {
    match map.get("type") {
        Some(Value::String(kind)) => kind == "object",
        Some(Value::Array(kinds)) => kinds.iter().any(|k| k.as_str() == Some("object")),
        _ => OBJECT_KEYWORDS.iter().any(|keyword| map.contains_key(*keyword)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const POINT_SCHEMA: &str = r#"{
        "type": "object",
        "properties": {
            "x": { "type": "integer" },
            "y": { "type": "integer" }
        },
        "required": ["x", "y"]
    }"#;

    fn write_type(dir: &Path, file_name: &str, contents: &str) {
        std::fs::write(dir.join(file_name), contents).unwrap();
    }

    #[test]
    fn builtin_types_are_registered() {
        let registry = TypeRegistry::builtin();
        assert_eq!(
            registry.type_names(),
            vec!["html", "htmlAttr", "js", "jsStr", "site", "url"]
        );
        assert!(BUILTIN_TYPES
            .iter()
            .all(|(name, _)| registry.has_schema(name)));
    }

    #[test]
    fn site_schema_requires_all_fields() {
        let registry = TypeRegistry::builtin();
        let ok = json!({"slug": "/", "template": "index.html", "data": {}});
        assert!(registry.check("site", &ok).is_ok());

        let missing = json!({"slug": "/", "data": {}});
        assert!(matches!(
            registry.check("site", &missing),
            Err(SchemaError::ValidationFailed { type_name, .. }) if type_name == "site"
        ));
    }

    #[test]
    fn string_wrappers_reject_non_strings() {
        let registry = TypeRegistry::builtin();
        assert!(registry.check("html", &json!("<b>hi</b>")).is_ok());
        assert!(registry.check("url", &json!(42)).is_err());
    }

    #[test]
    fn unknown_type_rejected_by_default() {
        let registry = TypeRegistry::builtin();
        assert!(matches!(
            registry.check("widget", &json!({})),
            Err(SchemaError::UnknownType(name)) if name == "widget"
        ));
    }

    #[test]
    fn unknown_type_allowed_when_configured() {
        let registry = TypeRegistry::with_config(RegistryConfig {
            fail_on_unknown_type: false,
            ..RegistryConfig::default()
        });
        assert!(registry.check("widget", &json!(null)).is_ok());
    }

    #[test]
    fn schemaless_registration_accepts_anything() {
        let mut registry = TypeRegistry::new();
        registry.register("blob");
        assert!(registry.is_registered("blob"));
        assert!(!registry.has_schema("blob"));
        assert!(registry.check("blob", &json!([1, "two", null])).is_ok());
    }

    #[test]
    fn invalid_schema_fails_compile() {
        let mut registry = TypeRegistry::new();
        assert!(matches!(
            registry.register_with_schema("bad", r#"{"type":"not-a-type"}"#),
            Err(SchemaError::CompileFailed(_))
        ));
        assert!(matches!(
            registry.register_with_schema("bad", "{"),
            Err(SchemaError::InvalidJson(_))
        ));
    }

    #[test]
    fn strict_mode_closes_nested_objects() {
        let schema = r#"{
            "type": "object",
            "properties": {
                "inner": { "properties": { "v": { "type": "integer" } } }
            }
        }"#;
        let mut strict = TypeRegistry::with_config(RegistryConfig {
            strict_mode: true,
            ..RegistryConfig::default()
        });
        strict.register_with_schema("outer", schema).unwrap();

        assert!(strict.check("outer", &json!({"inner": {"v": 1}})).is_ok());
        assert!(strict
            .check("outer", &json!({"inner": {"v": 1, "extra": true}}))
            .is_err());
        assert!(strict.check("outer", &json!({"other": 1})).is_err());
    }

    #[test]
    fn directory_adds_to_builtins() {
        let dir = tempfile::tempdir().unwrap();
        write_type(dir.path(), "point.type.json", POINT_SCHEMA);
        write_type(dir.path(), "tag.type.json", "{}");
        write_type(dir.path(), "notes.json", "not even json");

        let registry = TypeRegistry::from_directory(dir.path()).unwrap();
        assert!(registry.is_registered("site"));
        assert!(registry.check("point", &json!({"x": 1, "y": 2})).is_ok());
        assert!(registry.check("point", &json!({"x": 1})).is_err());
        assert!(registry.check("tag", &json!("anything")).is_ok());
        assert!(!registry.is_registered("notes"));
    }

    #[test]
    fn invalid_type_file_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_type(dir.path(), "bad name.type.json", "{}");

        let result = TypeRegistry::from_directory(dir.path());
        assert!(matches!(result, Err(SchemaError::LoadFailed(_))));
    }

    #[test]
    fn type_count_limit_enforced() {
        let dir = tempfile::tempdir().unwrap();
        write_type(dir.path(), "a.type.json", "{}");
        write_type(dir.path(), "b.type.json", "{}");

        let config = RegistryConfig {
            max_types_from_directory: 1,
            ..RegistryConfig::default()
        };
        let result = TypeRegistry::from_directory_with_config(dir.path(), config);
        assert!(matches!(result, Err(SchemaError::LoadFailed(_))));
    }

    #[test]
    fn type_file_size_limit_enforced() {
        let dir = tempfile::tempdir().unwrap();
        write_type(dir.path(), "point.type.json", POINT_SCHEMA);

        let config = RegistryConfig {
            max_schema_file_size: 16,
            ..RegistryConfig::default()
        };
        let result = TypeRegistry::from_directory_with_config(dir.path(), config);
        assert!(matches!(result, Err(SchemaError::LoadFailed(_))));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_type_file_refused() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target.json");
        std::fs::write(&target, POINT_SCHEMA).unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join("point.type.json")).unwrap();

        let result = TypeRegistry::from_directory(dir.path());
        assert!(matches!(result, Err(SchemaError::LoadFailed(_))));
    }

    #[test]
    fn missing_directory_is_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let result = TypeRegistry::from_directory(&dir.path().join("absent"));
        assert!(matches!(result, Err(SchemaError::LoadFailed(_))));
    }

    #[test]
    fn type_name_rules() {
        assert!(is_valid_type_name("htmlAttr"));
        assert!(is_valid_type_name("my-type_2"));
        assert!(!is_valid_type_name(""));
        assert!(!is_valid_type_name("a.b"));
    }
}
