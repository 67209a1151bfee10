use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Top-level configuration for the assistant server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantSettings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub assistant: PersonaSettings,
    #[serde(default)]
    pub chat: ChatSettings,
    #[serde(default)]
    pub weather: WeatherSettings,
    #[serde(default)]
    pub mail: MailSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub logs: LogSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl AssistantSettings {
    /// Load settings from disk, writing defaults if missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Unable to read config at {}", path.display()))?;
            let parsed: Self = serde_json::from_str(&raw)
                .with_context(|| format!("Malformed config at {}", path.display()))?;
            Ok(parsed)
        } else {
            let settings = Self::default();
            settings.save(path)?;
            Ok(settings)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        let serialised = serde_json::to_string_pretty(self)?;
        fs::write(path, serialised)
            .with_context(|| format!("Failed to persist config to {}", path.display()))
    }

    /// Apply `PORT`, `DEFAULT_LOCATION` and `SIDEKICK_LOG_DIR` from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| env::var(key).ok());
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(port) = read("PORT") {
            self.server.listen_addr = self.server.with_port(&port);
        }
        if let Some(location) = read("DEFAULT_LOCATION") {
            self.weather.default_location = location;
        }
        if let Some(dir) = read("SIDEKICK_LOG_DIR") {
            self.logs.directory = Some(PathBuf::from(dir));
        }
    }

    /// Resolve the directory holding daily conversation logs.
    pub fn resolve_log_dir(&self) -> Result<PathBuf> {
        if let Some(path) = &self.logs.directory {
            return Ok(path.clone());
        }
        let dirs = project_dirs()?;
        Ok(dirs.data_dir().join("logs"))
    }
}

/// HTTP/WebSocket listener options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "ServerSettings::default_listen_addr")]
    pub listen_addr: String,
    /// Directory holding the browser client assets.
    #[serde(default = "ServerSettings::default_static_dir")]
    pub static_dir: PathBuf,
}

impl ServerSettings {
    fn default_listen_addr() -> String {
        "0.0.0.0:3000".into()
    }

    fn default_static_dir() -> PathBuf {
        PathBuf::from("public")
    }

    fn with_port(&self, port: &str) -> String {
        let host = self
            .listen_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or("0.0.0.0");
        format!("{host}:{port}")
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: Self::default_listen_addr(),
            static_dir: Self::default_static_dir(),
        }
    }
}

/// How the assistant addresses the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaSettings {
    #[serde(default)]
    pub user_name: Option<String>,
}

impl PersonaSettings {
    /// `, Name` when a user name is configured, empty otherwise.
    pub fn address_suffix(&self) -> String {
        match self.user_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => format!(", {name}"),
            _ => String::new(),
        }
    }
}

/// Chat-completion provider (OpenRouter compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "ChatSettings::default_endpoint")]
    pub endpoint: String,
    #[serde(default = "ChatSettings::default_chat_path")]
    pub chat_path: String,
    #[serde(default = "ChatSettings::default_model")]
    pub model: String,
    #[serde(default = "ChatSettings::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ChatSettings {
    fn default_endpoint() -> String {
        "https://openrouter.ai/api/v1".into()
    }

    fn default_chat_path() -> String {
        "chat/completions".into()
    }

    fn default_model() -> String {
        "openai/gpt-3.5-turbo".into()
    }

    fn default_api_key_env() -> String {
        "OPENROUTER_API_KEY".into()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            endpoint: Self::default_endpoint(),
            chat_path: Self::default_chat_path(),
            model: Self::default_model(),
            api_key_env: Self::default_api_key_env(),
            timeout_secs: None,
        }
    }
}

/// Current-conditions weather provider (OpenWeatherMap compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherSettings {
    #[serde(default = "WeatherSettings::default_endpoint")]
    pub endpoint: String,
    #[serde(default = "WeatherSettings::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "WeatherSettings::default_location")]
    pub default_location: String,
    #[serde(default = "WeatherSettings::default_units")]
    pub units: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl WeatherSettings {
    fn default_endpoint() -> String {
        "https://api.openweathermap.org/data/2.5/weather".into()
    }

    fn default_api_key_env() -> String {
        "WEATHER_API_KEY".into()
    }

    fn default_location() -> String {
        "Mumbai".into()
    }

    fn default_units() -> String {
        "metric".into()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Default for WeatherSettings {
    fn default() -> Self {
        Self {
            endpoint: Self::default_endpoint(),
            api_key_env: Self::default_api_key_env(),
            default_location: Self::default_location(),
            units: Self::default_units(),
            timeout_secs: None,
        }
    }
}

/// SMTP relay used for outgoing mail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailSettings {
    #[serde(default = "MailSettings::default_smtp_host")]
    pub smtp_host: String,
    #[serde(default)]
    pub smtp_port: Option<u16>,
    #[serde(default = "MailSettings::default_username_env")]
    pub username_env: String,
    #[serde(default = "MailSettings::default_password_env")]
    pub password_env: String,
}

impl MailSettings {
    fn default_smtp_host() -> String {
        "smtp.gmail.com".into()
    }

    fn default_username_env() -> String {
        "GMAIL_EMAIL".into()
    }

    fn default_password_env() -> String {
        "GMAIL_PASSWORD".into()
    }
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            smtp_host: Self::default_smtp_host(),
            smtp_port: None,
            username_env: Self::default_username_env(),
            password_env: Self::default_password_env(),
        }
    }
}

/// Push cadences and per-connection limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "SessionSettings::default_time_interval_ms")]
    pub time_interval_ms: u64,
    #[serde(default = "SessionSettings::default_weather_interval_secs")]
    pub weather_interval_secs: u64,
    #[serde(default = "SessionSettings::default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    /// Oldest turns are retired past this many; unbounded when unset.
    #[serde(default)]
    pub history_limit: Option<usize>,
    #[serde(default = "SessionSettings::default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl SessionSettings {
    const fn default_time_interval_ms() -> u64 {
        1_000
    }

    const fn default_weather_interval_secs() -> u64 {
        300
    }

    const fn default_stats_interval_secs() -> u64 {
        5
    }

    const fn default_outbound_buffer() -> usize {
        64
    }

    pub fn time_interval(&self) -> Duration {
        Duration::from_millis(self.time_interval_ms.max(1))
    }

    pub fn weather_interval(&self) -> Duration {
        Duration::from_secs(self.weather_interval_secs.max(1))
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            time_interval_ms: Self::default_time_interval_ms(),
            weather_interval_secs: Self::default_weather_interval_secs(),
            stats_interval_secs: Self::default_stats_interval_secs(),
            history_limit: None,
            outbound_buffer: Self::default_outbound_buffer(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSettings {
    /// Optional override for where daily conversation logs are written.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default)]
    pub traces: TraceSettings,
}

/// Controls structured JSON trace export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "TraceSettings::default_max_files")]
    pub max_files: usize,
}

impl TraceSettings {
    const fn default_max_files() -> usize {
        10
    }
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
            max_files: Self::default_max_files(),
        }
    }
}

pub(crate) fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("sh", "sidekick", "Sidekick")
        .context("Unable to resolve platform data directory")
}

pub fn default_config_path() -> Result<PathBuf> {
    let dirs = project_dirs()?;
    Ok(dirs.config_dir().join("config.json"))
}
