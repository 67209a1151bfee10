use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::task;
use tracing::{debug, info, warn};

use crate::chat::ChatResponder;
use crate::clock::{Clock, TimeInfo};
use crate::config::PersonaSettings;
use crate::desktop::{DesktopFiles, UrlOpener};
use crate::error::DispatchError;
use crate::intent::{self, Intent, IntentKind};
use crate::mail::{MailSender, OutgoingMail};
use crate::stats::StatsProvider;
use crate::weather::{WEATHER_FALLBACK_MESSAGE, WeatherProvider};

pub const CHAT_FALLBACK: &str = "Sorry, I encountered an error processing your request.";

/// External collaborators the dispatcher can route to.
#[derive(Clone)]
pub struct Providers {
    pub clock: Arc<dyn Clock>,
    pub weather: Arc<dyn WeatherProvider>,
    pub chat: Arc<dyn ChatResponder>,
    pub mail: Arc<dyn MailSender>,
    pub stats: Arc<dyn StatsProvider>,
    pub opener: Arc<dyn UrlOpener>,
    pub desktop: DesktopFiles,
}

/// Reply to one command.
#[derive(Debug, Clone, Serialize)]
pub struct AssistantResponse {
    pub text: String,
    pub intent: IntentKind,
    pub generated_at: DateTime<Utc>,
}

/// Classifies a command, invokes one provider and phrases the reply.
#[derive(Clone)]
pub struct Dispatcher {
    providers: Providers,
    persona: PersonaSettings,
}

impl Dispatcher {
    pub fn new(providers: Providers, persona: PersonaSettings) -> Self {
        Self { providers, persona }
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    /// Never fails: every error becomes a reply string.
    pub async fn dispatch(&self, command: &str) -> AssistantResponse {
        let kind = intent::route_kind(command);
        info!(intent = %kind, "dispatching command");

        let outcome = match intent::classify(command) {
            Ok(intent) => AssertUnwindSafe(self.execute(intent))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(DispatchError::provider(kind, "provider panicked"))
                }),
            Err(err) => Err(err),
        };

        let text = match outcome {
            Ok(text) => text,
            Err(err) => {
                match &err {
                    DispatchError::MalformedCommand { .. } | DispatchError::ResourceNotFound { .. } => {
                        debug!(intent = %kind, reason = %err, "command not fulfilled")
                    }
                    _ => warn!(intent = %kind, error = %err, "provider failed"),
                }
                self.recover(kind, err)
            }
        };

        AssistantResponse {
            text,
            intent: kind,
            generated_at: Utc::now(),
        }
    }

    async fn execute(&self, intent: Intent) -> Result<String, DispatchError> {
        let suffix = self.persona.address_suffix();
        match intent {
            Intent::SendEmail { to, subject, body } => {
                let mail = OutgoingMail { to, subject, body };
                self.providers
                    .mail
                    .send(&mail)
                    .await
                    .map(|_| format!("Email sent successfully to {}!", mail.to))
                    .map_err(|failure| DispatchError::provider(IntentKind::SendEmail, failure))
            }
            Intent::QueryTime => Ok(TimeInfo::now(self.providers.clock.as_ref()).sentence()),
            Intent::QueryWeather { location } => Ok(self
                .providers
                .weather
                .current(location.as_deref())
                .await
                .describe()),
            Intent::OpenUrl { url } => {
                let opener = Arc::clone(&self.providers.opener);
                let target = url.clone();
                task::spawn_blocking(move || opener.open(&target))
                    .await
                    .map_err(|err| DispatchError::provider(IntentKind::OpenUrl, err))?
                    .map_err(|err| DispatchError::provider(IntentKind::OpenUrl, format!("{err:#}")))?;
                Ok(format!("Opening {url} for you{suffix}."))
            }
            Intent::CreateFile { name } => {
                self.providers
                    .desktop
                    .create(&name)
                    .await
                    .map_err(|err| DispatchError::provider(IntentKind::CreateFile, format!("{err:#}")))?;
                Ok(format!("Created file {name} on your desktop{suffix}."))
            }
            Intent::ReadFile { name } => {
                match self
                    .providers
                    .desktop
                    .read(&name)
                    .await
                    .map_err(|err| DispatchError::provider(IntentKind::ReadFile, format!("{err:#}")))?
                {
                    Some(content) => Ok(format!("Contents of {name}:\n{content}")),
                    None => Err(DispatchError::ResourceNotFound { name }),
                }
            }
            Intent::QuerySystemStats => self
                .providers
                .stats
                .snapshot()
                .await
                .map(|stats| stats.summary())
                .map_err(|err| DispatchError::provider(IntentKind::QuerySystemStats, format!("{err:#}"))),
            Intent::FreeformChat { prompt } => self
                .providers
                .chat
                .reply(&prompt)
                .await
                .map_err(|err| DispatchError::provider(IntentKind::FreeformChat, format!("{err:#}"))),
        }
    }

    fn recover(&self, kind: IntentKind, err: DispatchError) -> String {
        let suffix = self.persona.address_suffix();
        match err {
            DispatchError::MalformedCommand { usage } => usage,
            DispatchError::ResourceNotFound { name } => {
                format!("File {name} not found on desktop{suffix}.")
            }
            DispatchError::ProviderUnavailable { intent, message } => {
                fallback_message(intent, &message)
            }
            DispatchError::Unclassified => fallback_message(kind, ""),
        }
    }
}

/// Apology used when the provider behind `intent` fails.
pub fn fallback_message(intent: IntentKind, detail: &str) -> String {
    match intent {
        IntentKind::SendEmail => format!("Failed to send email: {detail}"),
        IntentKind::QueryTime => "Sorry, I couldn't read the clock right now.".into(),
        IntentKind::QueryWeather => WEATHER_FALLBACK_MESSAGE.into(),
        IntentKind::OpenUrl => "Sorry, I couldn't open that link.".into(),
        IntentKind::CreateFile => "Sorry, I couldn't create that file on your desktop.".into(),
        IntentKind::ReadFile => "Sorry, I couldn't read that file from your desktop.".into(),
        IntentKind::QuerySystemStats => "Sorry, I couldn't read the system stats right now.".into(),
        IntentKind::FreeformChat => CHAT_FALLBACK.into(),
    }
}
