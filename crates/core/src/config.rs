use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::QualityMode;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "GRADIA_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub default_quality: QualityMode,
    /// Inference backend: "cuda" or "tensorrt".
    pub backend: String,
    /// Expected LUT cube edge of the diffuser output; 0 disables the check.
    pub lut_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            server: ServerConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            upload_dir: PathBuf::from("uploads"),
            output_dir: PathBuf::from("outputs"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_quality: QualityMode::Balanced,
            backend: "cuda".to_string(),
            lut_size: crate::sampler::DEFAULT_LUT_SIZE,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. GRADIA_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Initialize the data directory structure on first run: creates the
/// data, upload and output directories, and writes a default config.toml
/// if one does not exist yet.
pub fn initialize_data_dir(data_dir: &Path) -> Result<AppConfig> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }
    let config = AppConfig::load_from_path(&cfg_path)?;

    for dir in [&config.paths.upload_dir, &config.paths.output_dir] {
        let resolved = resolve_relative_to(data_dir, dir);
        fs::create_dir_all(&resolved)
            .with_context(|| format!("failed to create directory: {}", resolved.display()))?;
    }

    Ok(config)
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.models_dir, PathBuf::from("models"));
        assert_eq!(cfg.paths.upload_dir, PathBuf::from("uploads"));
        assert_eq!(cfg.paths.output_dir, PathBuf::from("outputs"));
        assert_eq!(cfg.paths.trt_cache_dir, PathBuf::from("trt_cache"));

        assert_eq!(cfg.server.port, 8000);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.pipeline.default_quality, QualityMode::Balanced);
        assert_eq!(cfg.pipeline.backend, "cuda");
        assert_eq!(cfg.pipeline.lut_size, 33);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let decoded: AppConfig =
            toml::from_str("[server]\nport = 9000\n").expect("deserialize partial config");
        assert_eq!(decoded.server.port, 9000);
        assert_eq!(decoded.server.host, "0.0.0.0");
        assert_eq!(decoded.pipeline.default_quality, QualityMode::Balanced);
    }

    #[test]
    fn quality_mode_deserializes_lowercase() {
        let decoded: AppConfig = toml::from_str("[pipeline]\ndefault_quality = \"high\"\n")
            .expect("deserialize quality");
        assert_eq!(decoded.pipeline.default_quality, QualityMode::High);
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let temp = tempfile::tempdir().expect("temp dir");
        let loaded = AppConfig::load_from_path(&temp.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_uses_env_var_when_no_cli() {
        env::set_var(ENV_DATA_DIR, "/env/path");
        let result = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        assert_eq!(result, PathBuf::from("/env/path"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_dirs_and_config() {
        let temp = tempfile::tempdir().expect("temp dir");
        let config = initialize_data_dir(temp.path()).expect("initialize data dir");

        assert!(temp.path().join("config.toml").exists());
        assert!(temp.path().join(&config.paths.upload_dir).exists());
        assert!(temp.path().join(&config.paths.output_dir).exists());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("temp dir");
        let cfg_path = temp.path().join("config.toml");
        fs::write(&cfg_path, "[server]\nport = 9999\n").expect("write custom config");

        let config = initialize_data_dir(temp.path()).expect("initialize data dir");
        assert_eq!(config.server.port, 9999);

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert!(content.contains("9999"));
    }

    #[test]
    fn resolve_relative_to_behaves() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
    }
}
