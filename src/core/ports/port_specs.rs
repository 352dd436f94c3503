use crate::core::errors::{FlowError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Datatypes a port may declare
pub const VALID_DATATYPES: [&str; 13] = [
    "all", "string", "number", "int", "object", "array", "boolean", "color", "date", "bang",
    "function", "buffer", "stream",
];

/// Normalize and validate a declared datatype and schema
fn validate_contract(datatype: &str, schema: Option<&str>) -> Result<String> {
    let datatype = match datatype {
        "" => "all",
        "integer" => "int",
        other => other,
    };
    if !VALID_DATATYPES.contains(&datatype) {
        return Err(FlowError::InvalidDatatype {
            datatype: datatype.to_string(),
            valid: VALID_DATATYPES.join(", "),
        });
    }
    if let Some(schema) = schema {
        if !schema.contains('/') {
            return Err(FlowError::InvalidSchema {
                schema: schema.to_string(),
            });
        }
    }
    Ok(datatype.to_string())
}

/// Input port specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InPortConfig {
    pub datatype: String,
    /// URL or MIME type describing the payload
    pub schema: Option<String>,
    pub required: bool,
    /// Accepts multiple numbered connections
    pub addressable: bool,
    pub buffered: bool,
    /// Keeps only the latest Data packet and ignores brackets
    pub control: bool,
    /// Whether arriving packets invoke the process function
    pub triggering: bool,
    /// Whether packets are isolated by scope
    pub scoped: bool,
    /// Value delivered when nothing else is connected
    pub default: Option<Value>,
    /// Allow-list for Data payloads
    pub values: Option<Vec<Value>>,
    pub description: Option<String>,
}

impl InPortConfig {
    /// Create a new input port accepting any datatype
    pub fn new() -> Self {
        Self {
            datatype: "all".to_string(),
            schema: None,
            required: false,
            addressable: false,
            buffered: false,
            control: false,
            triggering: true,
            scoped: true,
            default: None,
            values: None,
            description: None,
        }
    }

    /// Create a new input port with a datatype
    pub fn typed(datatype: &str) -> Self {
        Self::new().datatype(datatype)
    }

    pub fn datatype(mut self, datatype: &str) -> Self {
        self.datatype = datatype.to_string();
        self
    }

    pub fn schema(mut self, schema: &str) -> Self {
        self.schema = Some(schema.to_string());
        self
    }

    /// Mark this port as required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn addressable(mut self) -> Self {
        self.addressable = true;
        self
    }

    pub fn buffered(mut self) -> Self {
        self.buffered = true;
        self
    }

    pub fn control(mut self) -> Self {
        self.control = true;
        self
    }

    pub fn triggering(mut self, triggering: bool) -> Self {
        self.triggering = triggering;
        self
    }

    pub fn scoped(mut self, scoped: bool) -> Self {
        self.scoped = scoped;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn values(mut self, values: Vec<Value>) -> Self {
        self.values = Some(values);
        self
    }

    /// Add a description to this port
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Validate the declaration, normalizing datatype aliases
    pub fn validate(mut self) -> Result<Self> {
        self.datatype = validate_contract(&self.datatype, self.schema.as_deref())?;
        Ok(self)
    }
}

impl Default for InPortConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Output port specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutPortConfig {
    pub datatype: String,
    pub schema: Option<String>,
    /// Sending with no attached socket is an error
    pub required: bool,
    pub addressable: bool,
    pub buffered: bool,
    pub scoped: bool,
    /// Replay the last Data packet to newly attached sockets
    pub caching: bool,
    pub description: Option<String>,
}

impl OutPortConfig {
    /// Create a new output port
    pub fn new() -> Self {
        Self {
            datatype: "all".to_string(),
            schema: None,
            required: false,
            addressable: false,
            buffered: false,
            scoped: true,
            caching: false,
            description: None,
        }
    }

    pub fn typed(datatype: &str) -> Self {
        Self::new().datatype(datatype)
    }

    pub fn datatype(mut self, datatype: &str) -> Self {
        self.datatype = datatype.to_string();
        self
    }

    pub fn schema(mut self, schema: &str) -> Self {
        self.schema = Some(schema.to_string());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn addressable(mut self) -> Self {
        self.addressable = true;
        self
    }

    pub fn buffered(mut self) -> Self {
        self.buffered = true;
        self
    }

    pub fn scoped(mut self, scoped: bool) -> Self {
        self.scoped = scoped;
        self
    }

    pub fn caching(mut self) -> Self {
        self.caching = true;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn validate(mut self) -> Result<Self> {
        self.datatype = validate_contract(&self.datatype, self.schema.as_deref())?;
        Ok(self)
    }
}

impl Default for OutPortConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_alias() {
        let config = InPortConfig::typed("integer").validate().unwrap();
        assert_eq!(config.datatype, "int");
    }

    #[test]
    fn test_invalid_datatype_rejected() {
        let err = OutPortConfig::typed("banana").validate().unwrap_err();
        assert!(matches!(err, FlowError::InvalidDatatype { .. }));
    }

    #[test]
    fn test_schema_must_be_mime_or_url() {
        assert!(InPortConfig::new().schema("text/plain").validate().is_ok());
        let err = InPortConfig::new().schema("plain").validate().unwrap_err();
        assert!(matches!(err, FlowError::InvalidSchema { .. }));
    }

    #[test]
    fn test_in_port_defaults() {
        let config = InPortConfig::default();
        assert!(config.triggering);
        assert!(config.scoped);
        assert!(!config.control);
        assert!(!config.required);
    }
}
