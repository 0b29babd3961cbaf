use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServingError};
use crate::pipeline::step::StepConfig;

fn default_port() -> u16 {
    9008
}

/// Wire format for successful pipeline responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutputFormat {
    /// Zip archive of npy entries, one per declared output name.
    #[default]
    Numpy,
    /// JSON object of nested arrays; mainly for debugging clients.
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServingConfig {
    #[serde(default = "default_port")]
    pub http_port: u16,
    #[serde(default)]
    pub output_format: OutputFormat,
}

impl Default for ServingConfig {
    fn default() -> Self {
        ServingConfig {
            http_port: default_port(),
            output_format: OutputFormat::default(),
        }
    }
}

/// Top-level configuration: serving parameters plus the ordered step list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfiguration {
    #[serde(default)]
    pub serving: ServingConfig,
    pub steps: Vec<StepConfig>,
}

impl InferenceConfiguration {
    /// Loads a configuration document, JSON or TOML by file extension.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            ServingError::Configuration(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        let config: InferenceConfiguration = match path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
        {
            "toml" => toml::from_str(&contents)?,
            _ => serde_json::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Validates every step's internal consistency. Any failure here aborts
    /// startup before a runner is built.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(ServingError::Configuration(
                "configuration declares no pipeline steps".to_string(),
            ));
        }
        for step in &self.steps {
            step.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_config_round_trips() {
        let raw = r#"{
            "serving": {"http_port": 8080, "output_format": "NUMPY"},
            "steps": [
                {
                    "kind": "model",
                    "model_path": "models/facedetector.onnx",
                    "backend": "passthrough",
                    "input_names": ["input"],
                    "output_names": ["scores", "boxes"]
                }
            ]
        }"#;
        let config: InferenceConfiguration = serde_json::from_str(raw).unwrap();
        assert_eq!(config.serving.http_port, 8080);
        assert_eq!(config.steps.len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn load_detects_toml_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serving.toml");
        std::fs::write(
            &path,
            r#"
[serving]
http_port = 9090

[[steps]]
kind = "model"
model_path = "models/m.onnx"
backend = "passthrough"
input_names = ["input"]
output_names = ["scores"]
"#,
        )
        .unwrap();
        let config = InferenceConfiguration::load(&path).unwrap();
        assert_eq!(config.serving.http_port, 9090);
        config.validate().unwrap();
    }

    #[test]
    fn missing_config_file_is_a_configuration_error() {
        let err = InferenceConfiguration::load(Path::new("/no/such/config.json")).unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }
}
