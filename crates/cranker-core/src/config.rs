//! Shared YAML configuration loading with `${VAR}` / `${VAR:-default}`
//! environment-variable expansion, mirroring the loader conventions used
//! elsewhere in this codebase's ambient stack.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur while loading a router/connector configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("configuration parse error: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Loads a YAML configuration of type `T`, searching a list of candidate
/// file names across a list of search directories, falling back to `T::default()`.
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
    candidate_names: Vec<String>,
}

impl ConfigLoader {
    pub fn new(candidate_names: &[&str]) -> Self {
        Self {
            search_paths: Vec::new(),
            candidate_names: candidate_names.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn add_search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    pub fn with_current_dir(self) -> Self {
        if let Ok(cwd) = std::env::current_dir() {
            self.add_search_path(cwd)
        } else {
            self
        }
    }

    /// Loads from the first candidate file found, or `Ok(T::default())` if none exists.
    pub fn load<T: DeserializeOwned + Default>(&self) -> ConfigResult<T> {
        match self.find_config_file() {
            Some(path) => self.load_from_file(&path),
            None => {
                info!("no configuration file found, using defaults");
                Ok(T::default())
            }
        }
    }

    pub fn load_from_file<T: DeserializeOwned, P: AsRef<Path>>(&self, path: P) -> ConfigResult<T> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        self.load_from_str(&content)
    }

    pub fn load_from_str<T: DeserializeOwned>(&self, yaml: &str) -> ConfigResult<T> {
        let expanded = expand_env_vars(yaml);
        Ok(serde_yaml::from_str(&expanded)?)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        for search_path in &self.search_paths {
            for name in &self.candidate_names {
                let path = search_path.join(name);
                debug!(path = %path.display(), "checking for config file");
                if path.exists() {
                    info!(path = %path.display(), "found configuration file");
                    return Some(path);
                }
            }
        }
        None
    }
}

/// Expands `${VAR}` and `${VAR:-default}` occurrences against the process environment.
pub fn expand_env_vars(content: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(:-([^}]*))?\}").unwrap();
    let mut result = content.to_string();
    for cap in re.captures_iter(content) {
        let full_match = cap.get(0).unwrap().as_str();
        let var_name = cap.get(1).unwrap().as_str();
        let default_value = cap.get(3).map(|m| m.as_str());
        let value = std::env::var(var_name)
            .ok()
            .or_else(|| default_value.map(String::from))
            .unwrap_or_default();
        result = result.replace(full_match, &value);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, Default, PartialEq)]
    struct Demo {
        #[serde(default)]
        url: String,
    }

    #[test]
    fn expands_env_var_with_default() {
        let yaml = "url: ${NOPE_VAR:-ws://default:8080}";
        let loader = ConfigLoader::new(&["demo.yaml"]);
        let demo: Demo = loader.load_from_str(yaml).unwrap();
        assert_eq!(demo.url, "ws://default:8080");
    }

    #[test]
    fn expands_env_var_from_environment() {
        // SAFETY: test runs single-threaded within this process.
        unsafe { std::env::set_var("CRANKER_TEST_URL", "ws://real:9090") };
        let yaml = "url: ${CRANKER_TEST_URL}";
        let loader = ConfigLoader::new(&["demo.yaml"]);
        let demo: Demo = loader.load_from_str(yaml).unwrap();
        assert_eq!(demo.url, "ws://real:9090");
        unsafe { std::env::remove_var("CRANKER_TEST_URL") };
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let loader = ConfigLoader::new(&["nonexistent.yaml"]).with_current_dir();
        let demo: Demo = loader.load().unwrap();
        assert_eq!(demo, Demo::default());
    }
}
