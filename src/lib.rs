pub mod chat;
pub mod clock;
pub mod config;
pub mod desktop;
pub mod dispatch;
pub mod error;
pub mod intent;
pub mod journal;
pub mod mail;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;
pub mod telemetry;
pub mod weather;

#[cfg(test)]
pub(crate) mod testing;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::chat::OpenRouterClient;
use crate::clock::{Clock, SystemClock};
use crate::config::{AssistantSettings, default_config_path};
use crate::desktop::{DesktopFiles, SystemOpener};
use crate::dispatch::{Dispatcher, Providers};
use crate::journal::ConversationLog;
use crate::mail::SmtpMailer;
use crate::server::AppState;
use crate::stats::SysinfoStats;
use crate::weather::OpenWeatherClient;

/// Load settings from `config_override` or the platform config path, then
/// apply environment overrides.
pub fn load_settings(config_override: Option<PathBuf>) -> Result<AssistantSettings> {
    let path = match config_override {
        Some(path) => path,
        None => default_config_path()?,
    };
    let mut settings = AssistantSettings::load_or_default(&path)?;
    settings.apply_env_overrides();
    Ok(settings)
}

/// Production providers wired from settings.
pub fn default_providers(settings: &AssistantSettings) -> Result<Providers> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    Ok(Providers {
        weather: Arc::new(OpenWeatherClient::new(&settings.weather, Arc::clone(&clock))?),
        chat: Arc::new(OpenRouterClient::new(&settings.chat)?),
        mail: Arc::new(SmtpMailer::new(&settings.mail)),
        stats: Arc::new(SysinfoStats::new(Arc::clone(&clock))),
        opener: Arc::new(SystemOpener),
        desktop: DesktopFiles::from_user_dirs()?,
        clock,
    })
}

/// The assembled assistant: dispatcher, conversation log and server state.
pub struct Assistant {
    settings: AssistantSettings,
    state: AppState,
}

impl Assistant {
    pub fn from_settings(settings: AssistantSettings) -> Result<Self> {
        let providers = default_providers(&settings)?;
        Self::with_providers(settings, providers)
    }

    pub fn with_providers(settings: AssistantSettings, providers: Providers) -> Result<Self> {
        let log_dir = settings.resolve_log_dir()?;
        let log = ConversationLog::new(log_dir).context("failed to open conversation log")?;
        info!(
            logs = %log.dir().display(),
            desktop = %providers.desktop.root().display(),
            model = %settings.chat.model,
            "assistant ready"
        );
        let dispatcher = Dispatcher::new(providers, settings.assistant.clone());
        let state = AppState::new(
            Arc::new(dispatcher),
            Arc::new(log),
            settings.session.clone(),
            settings.server.static_dir.clone(),
        );
        Ok(Self { settings, state })
    }

    pub fn settings(&self) -> &AssistantSettings {
        &self.settings
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Serve HTTP and WebSocket clients until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        server::serve(self.state, &self.settings.server.listen_addr, shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestRig;
    use tempfile::tempdir;

    #[test]
    fn explicit_config_path_is_created_with_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");
        let settings = load_settings(Some(path.clone())).expect("settings");
        assert!(path.exists());
        assert_eq!(settings.chat.model, "openai/gpt-3.5-turbo");
    }

    #[tokio::test]
    async fn assistant_opens_log_directory_from_settings() {
        let dir = tempdir().expect("tempdir");
        let mut settings = AssistantSettings::default();
        settings.logs.directory = Some(dir.path().join("logs"));
        let rig = TestRig::new();
        let assistant = Assistant::with_providers(settings, rig.providers()).expect("assistant");
        assert!(dir.path().join("logs").is_dir());
        assert_eq!(assistant.state().registry().len(), 0);
    }
}
