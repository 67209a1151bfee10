//! Ordered keyword routing from raw command text to a typed intent.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::error::DispatchError;

pub const EMAIL_USAGE: &str = "Please provide email details in the format: send email to recipient@example.com subject \"Your Subject\" body \"Your Message\"";
pub const URL_USAGE: &str =
    "Please include a full web address starting with http:// or https:// for me to open.";
pub const CREATE_FILE_USAGE: &str =
    "Please tell me which file to create, for example: create file notes.txt";
pub const READ_FILE_USAGE: &str =
    "Please tell me which file to read, for example: read file notes.txt";

static EMAIL_TO: Lazy<Regex> = Lazy::new(|| compile(r"(?i)to\s+(\S+@\S+)"));
static EMAIL_SUBJECT: Lazy<Regex> = Lazy::new(|| compile(r#"(?i)subject\s+"([^"]+)""#));
static EMAIL_BODY: Lazy<Regex> = Lazy::new(|| compile(r#"(?i)body\s+"([^"]+)""#));
static WEB_URL: Lazy<Regex> = Lazy::new(|| compile(r"(?i)https?://\S+"));

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|err| panic!("invalid built-in pattern {pattern}: {err}"))
}

/// Closed set of intent categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    SendEmail,
    QueryTime,
    QueryWeather,
    OpenUrl,
    CreateFile,
    ReadFile,
    QuerySystemStats,
    FreeformChat,
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            IntentKind::SendEmail => "email",
            IntentKind::QueryTime => "time",
            IntentKind::QueryWeather => "weather",
            IntentKind::OpenUrl => "open-url",
            IntentKind::CreateFile => "create-file",
            IntentKind::ReadFile => "read-file",
            IntentKind::QuerySystemStats => "system-stats",
            IntentKind::FreeformChat => "chat",
        };
        f.write_str(label)
    }
}

/// Classified command with its extracted parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    SendEmail {
        to: String,
        subject: String,
        body: String,
    },
    QueryTime,
    QueryWeather {
        location: Option<String>,
    },
    OpenUrl {
        url: String,
    },
    CreateFile {
        name: String,
    },
    ReadFile {
        name: String,
    },
    QuerySystemStats,
    FreeformChat {
        prompt: String,
    },
}

impl Intent {
    pub fn kind(&self) -> IntentKind {
        match self {
            Intent::SendEmail { .. } => IntentKind::SendEmail,
            Intent::QueryTime => IntentKind::QueryTime,
            Intent::QueryWeather { .. } => IntentKind::QueryWeather,
            Intent::OpenUrl { .. } => IntentKind::OpenUrl,
            Intent::CreateFile { .. } => IntentKind::CreateFile,
            Intent::ReadFile { .. } => IntentKind::ReadFile,
            Intent::QuerySystemStats => IntentKind::QuerySystemStats,
            Intent::FreeformChat { .. } => IntentKind::FreeformChat,
        }
    }
}

/// Command text paired with an ASCII-folded copy used for keyword tests.
///
/// ASCII folding keeps byte offsets identical between the two, so a keyword
/// found in `folded` can be used to slice `raw`.
#[derive(Debug)]
pub struct CommandText<'a> {
    raw: &'a str,
    folded: String,
}

impl<'a> CommandText<'a> {
    pub fn new(raw: &'a str) -> Self {
        Self {
            raw,
            folded: raw.to_ascii_lowercase(),
        }
    }

    pub fn raw(&self) -> &'a str {
        self.raw
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.folded.contains(keyword)
    }

    /// Original-case text after the first occurrence of `keyword`, trimmed.
    pub fn after(&self, keyword: &str) -> Option<&'a str> {
        let start = self.folded.find(keyword)? + keyword.len();
        Some(self.raw[start..].trim())
    }
}

type Predicate = fn(&CommandText<'_>) -> bool;
type Extractor = fn(&CommandText<'_>) -> Result<Intent, DispatchError>;

/// One keyword route: when `matches` holds, `extract` builds the intent.
pub struct Route {
    pub kind: IntentKind,
    matches: Predicate,
    extract: Extractor,
}

impl Route {
    pub fn matches(&self, command: &CommandText<'_>) -> bool {
        (self.matches)(command)
    }

    pub fn extract(&self, command: &CommandText<'_>) -> Result<Intent, DispatchError> {
        (self.extract)(command)
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route").field("kind", &self.kind).finish()
    }
}

/// Keyword routes in priority order; the first match wins.
pub static ROUTES: &[Route] = &[
    Route {
        kind: IntentKind::SendEmail,
        matches: |c| c.contains("send email") || c.contains("send mail"),
        extract: extract_email,
    },
    Route {
        kind: IntentKind::QueryTime,
        matches: |c| c.contains("time"),
        extract: |_| Ok(Intent::QueryTime),
    },
    Route {
        kind: IntentKind::QueryWeather,
        matches: |c| c.contains("weather"),
        extract: extract_weather,
    },
    Route {
        kind: IntentKind::OpenUrl,
        matches: |c| c.contains("open") && c.contains("http"),
        extract: extract_url,
    },
    Route {
        kind: IntentKind::CreateFile,
        matches: |c| c.contains("create file"),
        extract: |c| {
            file_name(c, "create file", CREATE_FILE_USAGE).map(|name| Intent::CreateFile { name })
        },
    },
    Route {
        kind: IntentKind::ReadFile,
        matches: |c| c.contains("read file"),
        extract: |c| {
            file_name(c, "read file", READ_FILE_USAGE).map(|name| Intent::ReadFile { name })
        },
    },
    Route {
        kind: IntentKind::QuerySystemStats,
        matches: |c| c.contains("system") || c.contains("stats"),
        extract: |_| Ok(Intent::QuerySystemStats),
    },
];

/// First keyword route matching the command, or `Unclassified`.
pub fn match_route(command: &CommandText<'_>) -> Result<&'static Route, DispatchError> {
    ROUTES
        .iter()
        .find(|route| route.matches(command))
        .ok_or(DispatchError::Unclassified)
}

/// Classify a raw command. Unmatched text becomes free-form chat.
pub fn classify(raw: &str) -> Result<Intent, DispatchError> {
    let command = CommandText::new(raw);
    match match_route(&command) {
        Ok(route) => route.extract(&command),
        Err(DispatchError::Unclassified) => Ok(Intent::FreeformChat {
            prompt: raw.to_string(),
        }),
        Err(other) => Err(other),
    }
}

/// Kind a command routes to, whether or not its parameters are well formed.
pub fn route_kind(raw: &str) -> IntentKind {
    match_route(&CommandText::new(raw))
        .map(|route| route.kind)
        .unwrap_or(IntentKind::FreeformChat)
}

fn extract_email(command: &CommandText<'_>) -> Result<Intent, DispatchError> {
    let capture = |pattern: &Regex| {
        pattern
            .captures(command.raw())
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    };
    match (
        capture(&EMAIL_TO),
        capture(&EMAIL_SUBJECT),
        capture(&EMAIL_BODY),
    ) {
        (Some(to), Some(subject), Some(body)) => Ok(Intent::SendEmail { to, subject, body }),
        _ => Err(DispatchError::malformed(EMAIL_USAGE)),
    }
}

fn extract_weather(command: &CommandText<'_>) -> Result<Intent, DispatchError> {
    let location = command
        .after("weather")
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    Ok(Intent::QueryWeather { location })
}

fn extract_url(command: &CommandText<'_>) -> Result<Intent, DispatchError> {
    WEB_URL
        .find(command.raw())
        .map(|m| Intent::OpenUrl {
            url: m.as_str().to_string(),
        })
        .ok_or_else(|| DispatchError::malformed(URL_USAGE))
}

fn file_name(
    command: &CommandText<'_>,
    keyword: &str,
    usage: &str,
) -> Result<String, DispatchError> {
    command
        .after(keyword)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| DispatchError::malformed(usage))
}
