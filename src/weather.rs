use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{Clock, TimeInfo, format_clock_time};
use crate::config::WeatherSettings;

pub const WEATHER_FALLBACK_MESSAGE: &str =
    "Couldn't fetch weather information. Please specify a valid city name.";

static LEADING_IN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^in\s+").unwrap_or_else(|err| panic!("invalid location pattern: {err}"))
});

/// Normalised current conditions, or an error marker with a user-facing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feels_like: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wind_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sunrise: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sunset: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub time: TimeInfo,
}

impl WeatherReport {
    pub fn failed(message: impl Into<String>, time: TimeInfo) -> Self {
        Self {
            location: None,
            country: None,
            description: None,
            temperature: None,
            feels_like: None,
            humidity: None,
            wind_speed: None,
            sunrise: None,
            sunset: None,
            error: true,
            message: Some(message.into()),
            time,
        }
    }

    /// Sentence spoken back for a weather query.
    pub fn describe(&self) -> String {
        if self.error {
            return self
                .message
                .clone()
                .unwrap_or_else(|| WEATHER_FALLBACK_MESSAGE.to_string());
        }
        format!(
            "Current weather in {}, {}: {}. Temperature is {}°C (feels like {}°C) with {}% humidity and wind speed of {}m/s. Sunrise at {} and sunset at {}.",
            text(&self.location),
            text(&self.country),
            text(&self.description),
            number(self.temperature),
            number(self.feels_like),
            number(self.humidity),
            number(self.wind_speed),
            text(&self.sunrise),
            text(&self.sunset),
        )
    }
}

fn text(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("unknown")
}

fn number<T: std::fmt::Display>(value: Option<T>) -> String {
    value
        .map(|value| value.to_string())
        .unwrap_or_else(|| "?".into())
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    /// Current conditions for `location`, or the configured default when `None`.
    ///
    /// Failures are reported inside the returned value rather than as `Err`.
    async fn current(&self, location: Option<&str>) -> WeatherReport;
}

/// Trim the requested location, fall back to the default and drop a leading `in `.
pub fn resolve_location(requested: Option<&str>, default_location: &str) -> String {
    let trimmed = requested.map(str::trim).unwrap_or_default();
    let target = if trimmed.is_empty() {
        default_location.trim()
    } else {
        trimmed
    };
    LEADING_IN.replace(target, "").trim().to_string()
}

/// OpenWeatherMap current-weather client.
pub struct OpenWeatherClient {
    client: Client,
    settings: WeatherSettings,
    clock: Arc<dyn Clock>,
}

impl OpenWeatherClient {
    pub fn new(settings: &WeatherSettings, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut builder = Client::builder().user_agent("Sidekick/0.1 (weather)");
        if let Some(timeout) = settings.timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .context("Failed to build weather HTTP client")?;
        Ok(Self {
            client,
            settings: settings.clone(),
            clock,
        })
    }

    async fn fetch(&self, location: &str) -> std::result::Result<OwmResponse, String> {
        let api_key = env::var(&self.settings.api_key_env)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                format!(
                    "Weather service is not configured; set {}.",
                    self.settings.api_key_env
                )
            })?;

        let response = self
            .client
            .get(&self.settings.endpoint)
            .query(&[
                ("q", location),
                ("appid", api_key.as_str()),
                ("units", self.settings.units.as_str()),
            ])
            .send()
            .await
            .map_err(|err| {
                warn!(error = %err, location, "weather request failed");
                WEATHER_FALLBACK_MESSAGE.to_string()
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|err| {
            warn!(error = %err, location, "weather response unreadable");
            WEATHER_FALLBACK_MESSAGE.to_string()
        })?;

        if !status.is_success() {
            let message = api_error_message(&body);
            warn!(%status, location, message = ?message, "weather endpoint returned error");
            return Err(message.unwrap_or_else(|| WEATHER_FALLBACK_MESSAGE.to_string()));
        }

        serde_json::from_str(&body).map_err(|err| {
            warn!(error = %err, location, "malformed weather payload");
            WEATHER_FALLBACK_MESSAGE.to_string()
        })
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherClient {
    async fn current(&self, location: Option<&str>) -> WeatherReport {
        let target = resolve_location(location, &self.settings.default_location);
        debug!(location = %target, "fetching weather");
        let time = TimeInfo::now(self.clock.as_ref());
        match self.fetch(&target).await {
            Ok(payload) => payload.into_report(time),
            Err(message) => WeatherReport::failed(message, time),
        }
    }
}

/// `message` field from an OpenWeatherMap error body.
pub fn api_error_message(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ApiError {
        message: Option<String>,
    }
    serde_json::from_str::<ApiError>(body)
        .ok()
        .and_then(|err| err.message)
        .filter(|message| !message.trim().is_empty())
}

#[derive(Debug, Deserialize)]
pub struct OwmResponse {
    name: String,
    sys: OwmSys,
    #[serde(default)]
    weather: Vec<OwmCondition>,
    main: OwmMain,
    #[serde(default)]
    wind: Option<OwmWind>,
}

#[derive(Debug, Deserialize)]
struct OwmSys {
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    sunrise: Option<i64>,
    #[serde(default)]
    sunset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OwmCondition {
    description: String,
}

#[derive(Debug, Deserialize)]
struct OwmMain {
    temp: f64,
    feels_like: f64,
    humidity: u64,
}

#[derive(Debug, Deserialize)]
struct OwmWind {
    speed: f64,
}

impl OwmResponse {
    pub fn into_report(self, time: TimeInfo) -> WeatherReport {
        WeatherReport {
            location: Some(self.name),
            country: self.sys.country,
            description: self.weather.into_iter().next().map(|c| c.description),
            temperature: Some(self.main.temp.round() as i64),
            feels_like: Some(self.main.feels_like.round() as i64),
            humidity: Some(self.main.humidity),
            wind_speed: self.wind.map(|wind| wind.speed),
            sunrise: self.sys.sunrise.and_then(local_clock_time),
            sunset: self.sys.sunset.and_then(local_clock_time),
            error: false,
            message: None,
            time,
        }
    }
}

fn local_clock_time(unix_seconds: i64) -> Option<String> {
    DateTime::from_timestamp(unix_seconds, 0)
        .map(|utc| format_clock_time(utc.with_timezone(&Local).naive_local()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tests::moment;
    use serde_json::json;

    fn sample_payload() -> serde_json::Value {
        json!({
            "name": "Paris",
            "sys": {"country": "FR", "sunrise": 1_760_420_000, "sunset": 1_760_460_000},
            "weather": [{"description": "light rain"}, {"description": "mist"}],
            "main": {"temp": 12.6, "feels_like": 11.4, "humidity": 81},
            "wind": {"speed": 4.1}
        })
    }

    #[test]
    fn location_defaults_and_strips_leading_in() {
        assert_eq!(resolve_location(Some("in Paris"), "Mumbai"), "Paris");
        assert_eq!(resolve_location(Some("  IN   new york "), "Mumbai"), "new york");
        assert_eq!(resolve_location(Some("   "), "Mumbai"), "Mumbai");
        assert_eq!(resolve_location(None, "in Lima"), "Lima");
        assert_eq!(resolve_location(Some("Insbruck"), "Mumbai"), "Insbruck");
    }

    #[test]
    fn payload_is_normalised_and_described() {
        let payload: OwmResponse = serde_json::from_value(sample_payload()).expect("payload");
        let report = payload.into_report(TimeInfo::at(moment(9, 0, 0)));
        assert_eq!(report.location.as_deref(), Some("Paris"));
        assert_eq!(report.description.as_deref(), Some("light rain"));
        assert_eq!(report.temperature, Some(13));
        assert_eq!(report.feels_like, Some(11));
        assert!(report.sunrise.is_some());

        let sentence = report.describe();
        assert!(sentence.starts_with(
            "Current weather in Paris, FR: light rain. Temperature is 13°C (feels like 11°C) with 81% humidity and wind speed of 4.1m/s."
        ));
    }

    #[test]
    fn failed_report_describes_with_its_message_only() {
        let report = WeatherReport::failed("city not found", TimeInfo::at(moment(9, 0, 0)));
        assert_eq!(report.describe(), "city not found");

        let value = serde_json::to_value(&report).expect("json");
        assert_eq!(value["error"], true);
        assert_eq!(value["message"], "city not found");
        assert!(value.get("temperature").is_none());
        assert!(value.get("humidity").is_none());
        assert_eq!(value["time"]["timeOfDay"], "morning");
    }

    #[test]
    fn successful_report_omits_error_flag() {
        let payload: OwmResponse = serde_json::from_value(sample_payload()).expect("payload");
        let value =
            serde_json::to_value(payload.into_report(TimeInfo::at(moment(9, 0, 0)))).expect("json");
        assert!(value.get("error").is_none());
        assert_eq!(value["humidity"], 81);
        assert_eq!(value["wind_speed"], 4.1);
    }

    #[test]
    fn api_error_message_is_extracted() {
        assert_eq!(
            api_error_message(r#"{"cod":"404","message":"city not found"}"#).as_deref(),
            Some("city not found")
        );
        assert_eq!(api_error_message("<html>bad gateway</html>"), None);
        assert_eq!(api_error_message(r#"{"message":""}"#), None);
    }
}
