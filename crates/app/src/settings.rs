use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use council_client::{ClientConfig, ClientError, DEFAULT_BASE_URL, normalize_base_url};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "council";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "COUNCIL_";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl ClientSettings {
    pub fn normalized(mut self) -> Self {
        let base_url = self.base_url.trim().trim_end_matches('/');
        self.base_url = if base_url.is_empty() {
            default_base_url()
        } else {
            base_url.to_string()
        };
        if self.connect_timeout_secs == 0 {
            self.connect_timeout_secs = default_connect_timeout_secs();
        }
        self
    }

    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.base_url.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

/// Client settings with lock-free reads and atomic saves.
pub struct SettingsStore {
    settings: Arc<ArcSwap<ClientSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".council"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&self, settings: ClientSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Validates and saves a new server address; the running client keeps its own.
    pub fn set_base_url(&self, raw: &str) -> Result<Arc<ClientSettings>, SettingsError> {
        let base_url = normalize_base_url(raw).context(InvalidBaseUrlSnafu {
            stage: "validate-base-url",
        })?;
        self.update(ClientSettings {
            base_url,
            ..(*self.settings()).clone()
        })?;
        Ok(self.settings())
    }

    // Defaults, then the JSON file, then `COUNCIL_*` variables.
    fn load_from_disk(path: &Path) -> ClientSettings {
        if !path.exists() {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(ClientSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX));

        match figment.extract::<ClientSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    %error,
                    "failed to parse settings, using defaults"
                );
                ClientSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("rejected server address on `{stage}`: {source}"))]
    InvalidBaseUrl {
        stage: &'static str,
        source: ClientError,
    },
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_trims_and_fills_defaults() {
        let settings = ClientSettings {
            base_url: "  http://council.local:9000/ ".to_string(),
            connect_timeout_secs: 0,
        }
        .normalized();

        assert_eq!(settings.base_url, "http://council.local:9000");
        assert_eq!(settings.connect_timeout_secs, DEFAULT_CONNECT_TIMEOUT_SECS);

        let blank = ClientSettings {
            base_url: "   ".to_string(),
            connect_timeout_secs: 3,
        }
        .normalized();
        assert_eq!(blank.base_url, DEFAULT_BASE_URL);
        assert_eq!(blank.connect_timeout_secs, 3);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");

        let store = SettingsStore::new(dir.path().join(SETTINGS_FILE_NAME));

        assert_eq!(store.settings().base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn partial_file_is_layered_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{"base_url": "http://10.0.0.5:8001/"}"#).expect("written");

        let store = SettingsStore::new(path);

        let settings = store.settings();
        assert_eq!(settings.base_url, "http://10.0.0.5:8001");
        assert_eq!(settings.connect_timeout_secs, DEFAULT_CONNECT_TIMEOUT_SECS);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").expect("written");

        let store = SettingsStore::new(path);

        assert_eq!(*store.settings(), ClientSettings::default());
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());

        store
            .update(ClientSettings {
                base_url: "https://council.example/".to_string(),
                connect_timeout_secs: 30,
            })
            .expect("saved");

        assert_eq!(store.settings().base_url, "https://council.example");
        assert!(!path.with_extension("json.tmp").exists());
        let reloaded = SettingsStore::new(path);
        assert_eq!(*reloaded.settings(), *store.settings());
    }

    #[test]
    fn set_base_url_keeps_the_timeout_and_survives_a_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{"connect_timeout_secs": 25}"#).expect("written");
        let store = SettingsStore::new(path.clone());

        let saved = store.set_base_url(" http://10.0.0.5:8001/ ").expect("saved");

        assert_eq!(saved.base_url, "http://10.0.0.5:8001");
        assert_eq!(saved.connect_timeout_secs, 25);
        assert_eq!(*SettingsStore::new(path).settings(), *saved);
    }

    #[test]
    fn invalid_base_url_is_rejected_and_nothing_is_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());

        let result = store.set_base_url("ftp://council.example");

        assert!(matches!(result, Err(SettingsError::InvalidBaseUrl { .. })));
        assert!(!path.exists());
        assert_eq!(store.settings().base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn client_config_carries_the_timeout() {
        let settings = ClientSettings {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout_secs: 7,
        };

        let config = settings.to_client_config();

        assert_eq!(config.connect_timeout, Duration::from_secs(7));
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
    }
}
