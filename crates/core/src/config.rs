use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::{EnhancementRequest, DEFAULT_PATCH_SIZE, DEFAULT_SCALE};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "SRTILE_DATA_DIR";

pub const DEFAULT_GAN_MODEL: &str = "RealESRGAN_x4plus";
pub const DEFAULT_CPU_TILE_SIZE: usize = 256;
pub const DEFAULT_TILE_PAD: usize = 10;
pub const DEFAULT_LOG_RETENTION: usize = 14;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub enhance: EnhanceConfig,
    pub gan: GanConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
}

/// Defaults for requests that do not spell out every parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnhanceConfig {
    pub scale: f64,
    pub use_patches: bool,
    pub patch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GanConfig {
    /// Tile size when running on CPU; CUDA always runs whole images.
    pub cpu_tile_size: usize,
    pub tile_pad: usize,
    pub default_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub retention_files: usize,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
        }
    }
}

impl Default for EnhanceConfig {
    fn default() -> Self {
        Self {
            scale: DEFAULT_SCALE,
            use_patches: true,
            patch_size: DEFAULT_PATCH_SIZE,
        }
    }
}

impl Default for GanConfig {
    fn default() -> Self {
        Self {
            cpu_tile_size: DEFAULT_CPU_TILE_SIZE,
            tile_pad: DEFAULT_TILE_PAD,
            default_model: DEFAULT_GAN_MODEL.to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            retention_files: DEFAULT_LOG_RETENTION,
        }
    }
}

impl EnhanceConfig {
    pub fn request(&self) -> EnhancementRequest {
        EnhancementRequest {
            scale: self.scale,
            use_patches: self.use_patches,
            patch_size: self.patch_size,
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

    /// `paths.models_dir`, resolved against `data_dir` when relative.
    pub fn models_dir(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.models_dir)
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. SRTILE_DATA_DIR environment variable
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

/// Initialize the data directory structure on first run:
/// - Creates data_dir if missing
/// - Writes default config.toml only if file doesn't exist
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
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
        assert_eq!(cfg.enhance.scale, 2.0);
        assert!(cfg.enhance.use_patches);
        assert_eq!(cfg.enhance.patch_size, 300);
        assert_eq!(cfg.gan.cpu_tile_size, 256);
        assert_eq!(cfg.gan.tile_pad, 10);
        assert_eq!(cfg.gan.default_model, "RealESRGAN_x4plus");
        assert_eq!(cfg.logging.retention_files, 14);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let decoded: AppConfig =
            toml::from_str("[enhance]\nscale = 3.5\n[gan]\ntile_pad = 4\n").expect("parse");
        assert_eq!(decoded.enhance.scale, 3.5);
        assert_eq!(decoded.enhance.patch_size, 300);
        assert_eq!(decoded.gan.tile_pad, 4);
        assert_eq!(decoded.gan.cpu_tile_size, 256);

        let request = decoded.enhance.request();
        assert_eq!(request.scale, 3.5);
        assert!(request.use_patches);
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let temp = tempfile::tempdir().expect("temp dir");
        let loaded = AppConfig::load_from_path(&temp.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_from_empty_file_returns_defaults() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "  \n").expect("write empty config");
        assert_eq!(
            AppConfig::load_from_path(&path).expect("load"),
            AppConfig::default()
        );
    }

    #[test]
    fn load_rejects_malformed_toml() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[enhance\nscale = ").expect("write config");
        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config TOML"));
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
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().expect("temp dir");
        let data = temp.path().join("data");
        initialize_data_dir(&data).expect("initialize data dir");

        assert!(data.exists());
        let loaded = AppConfig::load_from_path(&data.join("config.toml")).expect("load");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("temp dir");
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[enhance]\npatch_size = 128\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn models_dir_resolves_against_data_dir() {
        let mut cfg = AppConfig::default();
        assert_eq!(
            cfg.models_dir(Path::new("/base")),
            PathBuf::from("/base/models")
        );
        cfg.paths.models_dir = PathBuf::from("/opt/models");
        assert_eq!(
            cfg.models_dir(Path::new("/base")),
            PathBuf::from("/opt/models")
        );
    }
}
