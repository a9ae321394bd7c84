//! The function interface a service reports about itself.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Type of a function parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentType {
    Null,
    Boolean,
    Integer,
    Double,
    String,
    Map,
    List,
    /// A callback handle, transported as an integer id.
    Callback,
    /// A filesystem path, transported as a string.
    Path,
    Any,
}

impl ArgumentType {
    /// Whether `value` is acceptable for a parameter of this type.
    /// Integers and doubles are interchangeable.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ArgumentType::Null => value.is_null(),
            ArgumentType::Boolean => value.is_boolean(),
            ArgumentType::Integer | ArgumentType::Double => value.is_number(),
            ArgumentType::String | ArgumentType::Path => value.is_string(),
            ArgumentType::Map => value.is_object(),
            ArgumentType::List => value.is_array(),
            ArgumentType::Callback => value.is_u64() || value.is_i64(),
            ArgumentType::Any => true,
        }
    }
}

impl std::fmt::Display for ArgumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArgumentType::Null => "null",
            ArgumentType::Boolean => "boolean",
            ArgumentType::Integer => "integer",
            ArgumentType::Double => "double",
            ArgumentType::String => "string",
            ArgumentType::Map => "map",
            ArgumentType::List => "list",
            ArgumentType::Callback => "callback",
            ArgumentType::Path => "path",
            ArgumentType::Any => "any",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ArgumentType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub documentation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDescription {
    pub name: String,
    #[serde(default)]
    pub documentation: String,
    #[serde(default)]
    pub parameters: Vec<ParameterDescription>,
}

/// Full interface of one service version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub name: String,
    pub version: semver::Version,
    #[serde(default)]
    pub documentation: String,
    #[serde(default)]
    pub functions: Vec<FunctionDescription>,
}

impl ServiceDescription {
    /// Decode a description sent by a service process.
    pub fn from_json(value: Value) -> Result<Self> {
        let description: Self =
            serde_json::from_value(value).map_err(|e| Error::InvalidDescription(e.to_string()))?;
        if description.name.is_empty() {
            return Err(Error::InvalidDescription("empty service name".to_string()));
        }
        Ok(description)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDescription> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Check `args` against the declared parameters of `function`.
    pub fn validate_arguments(&self, function: &str, args: &Map<String, Value>) -> Result<()> {
        let func = self
            .function(function)
            .ok_or_else(|| Error::UnknownFunction(function.to_string()))?;

        for param in &func.parameters {
            match args.get(&param.name) {
                None if param.required => {
                    return Err(Error::MissingArgument {
                        function: function.to_string(),
                        argument: param.name.clone(),
                    });
                }
                None => {}
                Some(value) if !param.kind.accepts(value) => {
                    return Err(Error::ArgumentType {
                        function: function.to_string(),
                        argument: param.name.clone(),
                        expected: param.kind.to_string(),
                    });
                }
                Some(_) => {}
            }
        }

        if let Some(extra) = args.keys().find(|k| func.parameters.iter().all(|p| &p.name != *k)) {
            return Err(Error::UnexpectedArgument {
                function: function.to_string(),
                argument: extra.clone(),
            });
        }
        Ok(())
    }
}
