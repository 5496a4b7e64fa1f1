use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use magister_llm::{
    BackendTransportConfig, DEFAULT_OPENAI_MODEL, DEFAULT_STREAM_PATH, ModelConfig,
    RIG_OPENAI_PROVIDER_ID, TransportConfig,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::backend::DEFAULT_TITLE_MAX_CHARS;
use crate::i18n::Language;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:3001";
pub const DEFAULT_MODEL_ENDPOINT: &str = "https://api.openai.com/v1";
pub const SETTINGS_DIRECTORY_NAME: &str = "magister";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const GUEST_DATABASE_FILE_NAME: &str = "guest.sqlite";
/// Environment overrides, e.g. `MAGISTER_LANGUAGE=en` or `MAGISTER_MODEL__API_KEY=...`.
pub const ENV_PREFIX: &str = "MAGISTER_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Stream through the chat backend's generation endpoint.
    #[default]
    Backend,
    /// Stream straight from the model provider.
    Direct,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestStoreKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestStoreSettings {
    #[serde(default)]
    pub kind: GuestStoreKind,
    /// Database file for `sqlite`; defaults to the config directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl GuestStoreSettings {
    pub fn database_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| SettingsStore::default_config_dir().join(GUEST_DATABASE_FILE_NAME))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default)]
    pub preamble: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_model_endpoint(),
            model_name: default_model_name(),
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl ModelSettings {
    fn normalized(mut self) -> Self {
        self.provider_id = or_default(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = or_default(self.endpoint, default_model_endpoint);
        self.model_name = or_default(self.model_name, default_model_name);
        self.preamble = self
            .preamble
            .map(|preamble| preamble.trim().to_string())
            .filter(|preamble| !preamble.is_empty());
        self
    }

    pub fn to_model_config(&self) -> ModelConfig {
        ModelConfig {
            provider_id: self.provider_id.clone(),
            api_key: self.api_key.clone(),
            endpoint: self.endpoint.clone(),
            model_id: self.model_name.clone(),
            preamble: self.preamble.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
    #[serde(default)]
    pub language: Language,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub guest_store: GuestStoreSettings,
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            stream_path: default_stream_path(),
            language: Language::default(),
            transport: TransportKind::default(),
            model: ModelSettings::default(),
            guest_store: GuestStoreSettings::default(),
            title_max_chars: default_title_max_chars(),
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        self.backend_url = or_default(self.backend_url, default_backend_url);
        self.stream_path = or_default(self.stream_path, default_stream_path);
        self.model = self.model.normalized();
        if self.title_max_chars == 0 {
            self.title_max_chars = default_title_max_chars();
        }
        self
    }

    /// Generation transport for a session; `token` authenticates backend requests.
    pub fn transport_config(&self, token: Option<&str>) -> TransportConfig {
        match self.transport {
            TransportKind::Backend => TransportConfig::Backend(BackendTransportConfig {
                base_url: self.backend_url.clone(),
                stream_path: self.stream_path.clone(),
                token: token.map(str::to_string),
            }),
            TransportKind::Direct => TransportConfig::Direct(self.model.to_model_config()),
        }
    }
}

/// Layered settings: defaults, then the JSON file, then `MAGISTER_*` variables.
pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".magister"))
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

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    pub fn set_language(&self, language: Language) -> Result<(), SettingsError> {
        let mut settings = Settings::clone(&self.settings());
        settings.language = language;
        self.update(settings)
    }

    fn load_from_disk(path: &Path) -> Settings {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }
        let figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
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

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
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

fn or_default(value: String, default: fn() -> String) -> String {
    let value = value.trim();
    if value.is_empty() {
        default()
    } else {
        value.to_string()
    }
}

fn default_backend_url() -> String {
    DEFAULT_BACKEND_URL.to_string()
}

fn default_stream_path() -> String {
    DEFAULT_STREAM_PATH.to_string()
}

fn default_provider_id() -> String {
    RIG_OPENAI_PROVIDER_ID.to_string()
}

fn default_model_endpoint() -> String {
    DEFAULT_MODEL_ENDPOINT.to_string()
}

fn default_model_name() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn default_title_max_chars() -> usize {
    DEFAULT_TITLE_MAX_CHARS
}
