//! Configuration management for codemend
//!
//! Reads defaults from ~/.config/codemend/config.json. CLI flags override
//! config values; config values override the built-in defaults.

use crate::ollama::{DEFAULT_ENDPOINT, DEFAULT_MODEL};
use crate::sandbox::DEFAULT_TIMEOUT_SECS;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Default Ollama model to use when --model is not given
    pub model: Option<String>,
    /// Default inference endpoint when --endpoint is not given
    pub endpoint: Option<String>,
    /// Default sandbox wall-clock timeout in seconds
    pub run_timeout_secs: Option<u64>,
}

impl Config {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("codemend"))
    }

    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if let Ok(content) = fs::read_to_string(&path) {
                match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(err) => {
                        preserve_corrupt_config(&path, &content);
                        eprintln!(
                            "  Warning: Config file was corrupted ({}). A backup was saved and defaults were loaded.",
                            err
                        );
                    }
                }
            }
        }
        Self::default()
    }

    pub fn model(&self) -> String {
        self.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    pub fn endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
    }

    pub fn run_timeout_secs(&self) -> u64 {
        self.run_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)
    }
}

fn preserve_corrupt_config(path: &std::path::Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_fallbacks() {
        let config = Config::default();
        assert_eq!(config.model(), DEFAULT_MODEL);
        assert_eq!(config.endpoint(), DEFAULT_ENDPOINT);
        assert_eq!(config.run_timeout_secs(), DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_config_overrides_defaults() {
        let config = Config {
            model: Some("qwen2.5-coder:7b".to_string()),
            endpoint: Some("http://localhost:9999".to_string()),
            run_timeout_secs: Some(10),
        };
        assert_eq!(config.model(), "qwen2.5-coder:7b");
        assert_eq!(config.endpoint(), "http://localhost:9999");
        assert_eq!(config.run_timeout_secs(), 10);
    }
}
