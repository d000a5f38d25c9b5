use jsonschema::Validator;
use serde_json::Value;

use crate::error::{Result, SchemaError};

/// Most errors reported in one `ValidationFailed` message.
const MAX_REPORTED_ERRORS: usize = 4;

pub(crate) fn validate_value(type_name: &str, value: &Value, validator: &Validator) -> Result<()> {
    let messages: Vec<String> = validator
        .iter_errors(value)
        .take(MAX_REPORTED_ERRORS)
        .map(|err| err.to_string())
        .collect();

    if messages.is_empty() {
        return Ok(());
    }

    Err(SchemaError::ValidationFailed {
        type_name: type_name.to_string(),
        message: messages.join("; "),
    })
}
