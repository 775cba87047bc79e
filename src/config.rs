use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::downloader::progress::SpeedUnit;
use crate::downloader::{Quality, TaskSettings};
use crate::errors::{AppError, Result};

/// Prefix of environment overrides, e.g. `MEDIA_DL_DOWNLOAD_PATH` or
/// `MEDIA_DL_NETWORK__CHUNK_TIMEOUT_SECS`.
pub const ENV_PREFIX: &str = "MEDIA_DL";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub download_path: PathBuf,
    pub preferred_quality: Quality,
    pub speed_unit: SpeedUnit,
    pub ytdlp_path: String,
    pub proxy: Option<String>,
    pub network: NetworkConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub max_connections: usize,
    pub connect_timeout_secs: u64,
    /// `None` waits for yt-dlp indefinitely.
    pub resolve_timeout_secs: Option<u64>,
    /// `None` lets a stalled transfer hang until it is cancelled.
    pub chunk_timeout_secs: Option<u64>,
    pub user_agent: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            download_path: dirs::download_dir().unwrap_or_else(|| PathBuf::from("./downloads")),
            preferred_quality: Quality::Best,
            speed_unit: SpeedUnit::KilobytesPerSecond,
            ytdlp_path: "yt-dlp".to_string(),
            proxy: None,
            network: NetworkConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_timeout_secs: 15,
            resolve_timeout_secs: Some(120),
            chunk_timeout_secs: Some(60),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
        }
    }
}

impl AppConfig {
    /// Loads the effective config, creating the file with defaults on first
    /// run. Environment overrides apply to the result but never reach disk.
    pub fn load() -> Result<Self> {
        Self::load_or_init(&Self::get_config_path()?, None)
    }

    /// The config as stored on disk, without environment overrides. Edit and
    /// save this one.
    pub fn load_file() -> Result<Self> {
        Self::load_file_from(&Self::get_config_path()?)
    }

    /// Defaults, then the JSON file at `path` if present, then `MEDIA_DL_*`
    /// environment variables.
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::layered(path, None)
    }

    /// Defaults, then the JSON file at `path` if present.
    pub fn load_file_from(path: &Path) -> Result<Self> {
        Self::from_sources(path, None)
    }

    fn load_or_init(path: &Path, env: Option<HashMap<String, String>>) -> Result<Self> {
        if !path.exists() {
            Self::default().save_to(path)?;
        }
        Self::layered(path, env)
    }

    fn layered(path: &Path, env: Option<HashMap<String, String>>) -> Result<Self> {
        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(env);
        Self::from_sources(path, Some(environment))
    }

    fn from_sources(path: &Path, environment: Option<config::Environment>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(
            config::File::from(path.to_path_buf())
                .format(config::FileFormat::Json)
                .required(false),
        );
        if let Some(environment) = environment {
            builder = builder.add_source(environment);
        }

        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::get_config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(config_dir) = config_path.parent() {
            if !config_dir.exists() {
                std::fs::create_dir_all(config_dir)?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            AppError::Config(config::ConfigError::Message(
                "Could not find config directory".to_string(),
            ))
        })?;

        Ok(config_dir.join("media-downloader").join("config.json"))
    }

    pub fn task_settings(&self) -> TaskSettings {
        TaskSettings {
            speed_unit: self.speed_unit,
            resolve_timeout: self.network.resolve_timeout_secs.map(Duration::from_secs),
            chunk_timeout: self.network.chunk_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::CustomQuality;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            AppConfig::layered(&dir.path().join("config.json"), Some(HashMap::new())).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = AppConfig {
            download_path: PathBuf::from("/srv/media"),
            preferred_quality: Quality::Custom(CustomQuality {
                max_height: Some(720),
                extension: Some("mp4".to_string()),
                ..Default::default()
            }),
            proxy: Some("socks5://127.0.0.1:1080".to_string()),
            ..Default::default()
        };

        config.save_to(&path).unwrap();
        let loaded = AppConfig::layered(&path, Some(HashMap::new())).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "ytdlp_path": "/opt/yt-dlp", "network": { "chunk_timeout_secs": 5 } }"#)
            .unwrap();

        let config = AppConfig::layered(&path, Some(HashMap::new())).unwrap();
        assert_eq!(config.ytdlp_path, "/opt/yt-dlp");
        assert_eq!(config.network.chunk_timeout_secs, Some(5));
        assert_eq!(config.network.connect_timeout_secs, 15);
        assert_eq!(config.preferred_quality, Quality::Best);
    }

    #[test]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "ytdlp_path": "/opt/yt-dlp" }"#).unwrap();
        let env = HashMap::from([
            ("MEDIA_DL_YTDLP_PATH".to_string(), "/usr/local/bin/yt-dlp".to_string()),
            ("MEDIA_DL_NETWORK__CONNECT_TIMEOUT_SECS".to_string(), "3".to_string()),
        ]);

        let config = AppConfig::layered(&path, Some(env)).unwrap();
        assert_eq!(config.ytdlp_path, "/usr/local/bin/yt-dlp");
        assert_eq!(config.network.connect_timeout_secs, 3);
    }

    #[test]
    fn first_run_writes_defaults_without_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let env = HashMap::from([(
            "MEDIA_DL_YTDLP_PATH".to_string(),
            "/tmp/one-off-yt-dlp".to_string(),
        )]);

        let runtime = AppConfig::load_or_init(&path, Some(env)).unwrap();
        assert_eq!(runtime.ytdlp_path, "/tmp/one-off-yt-dlp");

        assert_eq!(AppConfig::load_file_from(&path).unwrap(), AppConfig::default());
        let reloaded = AppConfig::layered(&path, Some(HashMap::new())).unwrap();
        assert_eq!(reloaded.ytdlp_path, "yt-dlp");
    }

    #[test]
    fn saving_the_file_layer_keeps_environment_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "ytdlp_path": "/opt/yt-dlp" }"#).unwrap();
        let env = HashMap::from([(
            "MEDIA_DL_YTDLP_PATH".to_string(),
            "/tmp/one-off-yt-dlp".to_string(),
        )]);
        assert_eq!(
            AppConfig::layered(&path, Some(env)).unwrap().ytdlp_path,
            "/tmp/one-off-yt-dlp"
        );

        let mut stored = AppConfig::load_file_from(&path).unwrap();
        stored.network.chunk_timeout_secs = Some(5);
        stored.save_to(&path).unwrap();

        let reloaded = AppConfig::layered(&path, Some(HashMap::new())).unwrap();
        assert_eq!(reloaded.ytdlp_path, "/opt/yt-dlp");
        assert_eq!(reloaded.network.chunk_timeout_secs, Some(5));
    }

    #[test]
    fn task_settings_follow_network_timeouts() {
        let mut config = AppConfig::default();
        config.network.chunk_timeout_secs = None;
        let settings = config.task_settings();
        assert_eq!(settings.resolve_timeout, Some(Duration::from_secs(120)));
        assert_eq!(settings.chunk_timeout, None);
        assert_eq!(settings.speed_unit, SpeedUnit::KilobytesPerSecond);
    }
}
