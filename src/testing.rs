//! Stub providers shared by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

use crate::chat::ChatResponder;
use crate::clock::TimeInfo;
use crate::clock::tests::{FixedClock, moment};
use crate::config::PersonaSettings;
use crate::desktop::{DesktopFiles, UrlOpener};
use crate::dispatch::{Dispatcher, Providers};
use crate::mail::{MailFailure, MailReceipt, MailSender, OutgoingMail};
use crate::stats::tests::sample_stats;
use crate::stats::{StatsProvider, SystemStats};
use crate::weather::{WeatherProvider, WeatherReport};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn frozen_time() -> TimeInfo {
    TimeInfo::at(moment(14, 5, 0))
}

#[derive(Default)]
pub(crate) struct StubWeather {
    failure: Mutex<Option<String>>,
    requests: Mutex<Vec<Option<String>>>,
}

impl StubWeather {
    pub(crate) fn fail_with(&self, message: &str) {
        *lock(&self.failure) = Some(message.to_string());
    }

    pub(crate) fn requests(&self) -> Vec<Option<String>> {
        lock(&self.requests).clone()
    }
}

pub(crate) fn sunny_report() -> WeatherReport {
    WeatherReport {
        location: Some("Mumbai".into()),
        country: Some("IN".into()),
        description: Some("clear sky".into()),
        temperature: Some(31),
        feels_like: Some(35),
        humidity: Some(70),
        wind_speed: Some(3.6),
        sunrise: Some("6:31:00 AM".into()),
        sunset: Some("6:12:00 PM".into()),
        error: false,
        message: None,
        time: frozen_time(),
    }
}

#[async_trait]
impl WeatherProvider for StubWeather {
    async fn current(&self, location: Option<&str>) -> WeatherReport {
        lock(&self.requests).push(location.map(str::to_string));
        match lock(&self.failure).clone() {
            Some(message) => WeatherReport::failed(message, frozen_time()),
            None => sunny_report(),
        }
    }
}

#[derive(Default)]
pub(crate) struct StubChat {
    failing: AtomicBool,
    panic_next: AtomicBool,
    prompts: Mutex<Vec<String>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    pub(crate) entered: Notify,
}

impl StubChat {
    pub(crate) fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub(crate) fn panic_next(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    /// Replies block until a permit is added to the returned gate.
    pub(crate) fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *lock(&self.gate) = Some(Arc::clone(&gate));
        gate
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

#[async_trait]
impl ChatResponder for StubChat {
    async fn reply(&self, prompt: &str) -> Result<String> {
        lock(&self.prompts).push(prompt.to_string());
        self.entered.notify_one();
        let gate = lock(&self.gate).clone();
        if let Some(gate) = gate {
            gate.acquire().await.map_err(|_| anyhow!("gate closed"))?.forget();
        }
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("chat stub asked to panic");
        }
        if self.failing.load(Ordering::SeqCst) {
            bail!("chat provider offline");
        }
        Ok(format!("echo: {prompt}"))
    }
}

#[derive(Default)]
pub(crate) struct StubMail {
    failure: Mutex<Option<MailFailure>>,
    sent: Mutex<Vec<OutgoingMail>>,
    attempts: AtomicUsize,
}

impl StubMail {
    pub(crate) fn fail_with(&self, failure: MailFailure) {
        *lock(&self.failure) = Some(failure);
    }

    pub(crate) fn sent(&self) -> Vec<OutgoingMail> {
        lock(&self.sent).clone()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailSender for StubMail {
    async fn send(&self, mail: &OutgoingMail) -> Result<MailReceipt, MailFailure> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = lock(&self.failure).clone() {
            return Err(failure);
        }
        lock(&self.sent).push(mail.clone());
        Ok(MailReceipt {
            message_id: "<stub@sidekick>".into(),
        })
    }
}

#[derive(Default)]
pub(crate) struct StubStats {
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl StubStats {
    pub(crate) fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatsProvider for StubStats {
    async fn snapshot(&self) -> Result<SystemStats> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            bail!("sampler unavailable");
        }
        Ok(sample_stats())
    }
}

#[derive(Default)]
pub(crate) struct StubOpener {
    failing: AtomicBool,
    opened: Mutex<Vec<String>>,
}

impl StubOpener {
    pub(crate) fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub(crate) fn opened(&self) -> Vec<String> {
        lock(&self.opened).clone()
    }
}

impl UrlOpener for StubOpener {
    fn open(&self, url: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("no browser available");
        }
        lock(&self.opened).push(url.to_string());
        Ok(())
    }
}

/// A full set of stub providers over a temporary desktop directory.
pub(crate) struct TestRig {
    pub(crate) weather: Arc<StubWeather>,
    pub(crate) chat: Arc<StubChat>,
    pub(crate) mail: Arc<StubMail>,
    pub(crate) stats: Arc<StubStats>,
    pub(crate) opener: Arc<StubOpener>,
    persona: PersonaSettings,
    desktop: TempDir,
}

impl TestRig {
    pub(crate) fn new() -> Self {
        Self {
            weather: Arc::default(),
            chat: Arc::default(),
            mail: Arc::default(),
            stats: Arc::default(),
            opener: Arc::default(),
            persona: PersonaSettings::default(),
            desktop: tempfile::tempdir().expect("desktop tempdir"),
        }
    }

    pub(crate) fn with_user_name(name: &str) -> Self {
        let mut rig = Self::new();
        rig.persona.user_name = Some(name.to_string());
        rig
    }

    pub(crate) fn desktop_dir(&self) -> &std::path::Path {
        self.desktop.path()
    }

    pub(crate) fn providers(&self) -> Providers {
        Providers {
            clock: Arc::new(FixedClock(moment(14, 5, 0))),
            weather: self.weather.clone(),
            chat: self.chat.clone(),
            mail: self.mail.clone(),
            stats: self.stats.clone(),
            opener: self.opener.clone(),
            desktop: DesktopFiles::new(self.desktop.path().to_path_buf()),
        }
    }

    pub(crate) fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.providers(), self.persona.clone())
    }

    /// Calls made to providers that would reach the network.
    pub(crate) fn network_calls(&self) -> usize {
        self.weather.requests().len() + self.chat.prompts().len() + self.mail.attempts()
    }
}
