//! Project configuration document that designs are applied onto.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ConfigError, Design, ParamValue, ParameterSpec};

/// Opaque JSON project configuration consumed by the simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectConfig(Value);

impl Default for ProjectConfig {
    fn default() -> Self {
        Self(Value::Object(Map::new()))
    }
}

impl ProjectConfig {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Read the value at a JSON pointer.
    pub fn get(&self, pointer: &str) -> Option<&Value> {
        self.0.pointer(pointer)
    }

    /// Write one parameter value at the parameter's target pointer,
    /// creating intermediate objects as needed.
    pub fn apply(&mut self, spec: &ParameterSpec, value: &ParamValue) -> Result<(), ConfigError> {
        let json = match value {
            ParamValue::Number(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .ok_or_else(|| ConfigError::NonFiniteBounds(spec.id.clone()))?,
            ParamValue::Flag(b) => Value::Bool(*b),
            ParamValue::Text(s) => Value::String(s.clone()),
        };

        let tokens: Vec<String> = spec
            .target
            .split('/')
            .skip(1)
            .map(|t| t.replace("~1", "/").replace("~0", "~"))
            .collect();
        let Some((last, parents)) = tokens.split_last() else {
            return Err(ConfigError::ApplyFailed(spec.target.clone()));
        };

        let mut node = &mut self.0;
        for token in parents {
            let Value::Object(map) = node else {
                return Err(ConfigError::ApplyFailed(spec.target.clone()));
            };
            node = map
                .entry(token.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }

        match node {
            Value::Object(map) => {
                map.insert(last.clone(), json);
                Ok(())
            }
            _ => Err(ConfigError::ApplyFailed(spec.target.clone())),
        }
    }

    /// Copy of this configuration with every design value applied.
    pub fn with_design(
        &self,
        design: &Design,
        specs: &[ParameterSpec],
    ) -> Result<ProjectConfig, ConfigError> {
        let mut applied = self.clone();
        for spec in specs {
            if let Some(value) = design.get(&spec.id) {
                applied.apply(spec, value)?;
            }
        }
        Ok(applied)
    }
}
