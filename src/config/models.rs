use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;
use log::info;
use crate::llm::directory::Capability;

#[derive(Debug)]
pub enum ModelsFileError {
    IoError(std::io::Error),
    JsonError(serde_json::Error),
    UnknownCapability(String),
    EmptyName(String),
}

impl fmt::Display for ModelsFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelsFileError::IoError(e) => write!(f, "Models file IO error: {}", e),
            ModelsFileError::JsonError(e) => write!(f, "Models JSON parsing error: {}", e),
            ModelsFileError::UnknownCapability(name) =>
                write!(f, "Unknown capability '{}' in models file", name),
            ModelsFileError::EmptyName(section) =>
                write!(f, "Empty model name in models file section '{}'", section),
        }
    }
}

impl Error for ModelsFileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ModelsFileError::IoError(e) => Some(e),
            ModelsFileError::JsonError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ModelsFileError {
    fn from(err: std::io::Error) -> Self {
        ModelsFileError::IoError(err)
    }
}

impl From<serde_json::Error> for ModelsFileError {
    fn from(err: serde_json::Error) -> Self {
        ModelsFileError::JsonError(err)
    }
}

/// Additions layered over the built-in model tables.
///
/// ```json
/// {
///   "aliases": { "o3": "openai/o3" },
///   "capabilities": { "vision": ["openai/o3"] },
///   "context_windows": { "openai/o3": 200000 }
/// }
/// ```
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ModelsFile {
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    #[serde(default)]
    pub capabilities: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub context_windows: HashMap<String, u32>,
}

impl ModelsFile {
    fn validate(&self) -> Result<(), ModelsFileError> {
        for (alias, canonical) in &self.aliases {
            if alias.trim().is_empty() || canonical.trim().is_empty() {
                return Err(ModelsFileError::EmptyName("aliases".to_string()));
            }
        }
        for (capability, models) in &self.capabilities {
            if capability.parse::<Capability>().is_err() {
                return Err(ModelsFileError::UnknownCapability(capability.clone()));
            }
            if models.iter().any(|m| m.trim().is_empty()) {
                return Err(ModelsFileError::EmptyName(format!("capabilities.{}", capability)));
            }
        }
        if self.context_windows.keys().any(|m| m.trim().is_empty()) {
            return Err(ModelsFileError::EmptyName("context_windows".to_string()));
        }
        Ok(())
    }
}

pub fn load_models_file<P: AsRef<Path>>(path: P) -> Result<ModelsFile, ModelsFileError> {
    let file_content = fs::read_to_string(&path)?;
    let models: ModelsFile = serde_json::from_str(&file_content)?;
    models.validate()?;
    info!(
        "Loaded model overrides from {}: {} aliases, {} capability lists, {} context windows",
        path.as_ref().display(),
        models.aliases.len(),
        models.capabilities.len(),
        models.context_windows.len()
    );
    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_partial_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("models.json");
        fs::write(&path, r#"{"aliases": {"o3": "openai/o3"}}"#).unwrap();

        let models = load_models_file(&path).unwrap();
        assert_eq!(models.aliases.get("o3").map(String::as_str), Some("openai/o3"));
        assert!(models.capabilities.is_empty());
    }

    #[test]
    fn rejects_unknown_capability() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("models.json");
        fs::write(&path, r#"{"capabilities": {"telepathy": ["x/y"]}}"#).unwrap();

        assert!(matches!(load_models_file(&path), Err(ModelsFileError::UnknownCapability(_))));
    }

    #[test]
    fn accepts_dashed_capability_names() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("models.json");
        fs::write(&path, r#"{"capabilities": {"function-calling": ["openai/o3"], "Vision": ["openai/o3"]}}"#).unwrap();

        let models = load_models_file(&path).unwrap();
        assert_eq!(models.capabilities.len(), 2);
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(load_models_file("/nonexistent/models.json"), Err(ModelsFileError::IoError(_))));
    }
}
