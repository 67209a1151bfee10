use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static ENTRY_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}T\S+) - (User|Assistant): (.*)$")
        .unwrap_or_else(|err| panic!("invalid log header pattern: {err}"))
});

/// One user/assistant exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub user: String,
    pub assistant: String,
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    /// Timestamps are kept at millisecond precision so they survive the log format.
    pub fn new(
        user: impl Into<String>,
        assistant: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
            timestamp: timestamp.trunc_subsecs(3),
        }
    }
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

mod iso_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|value| value.with_timezone(&Utc))
            .map_err(D::Error::custom)
    }
}

/// Append-only daily conversation log (`conversation_<YYYY-MM-DD>.txt`).
#[derive(Debug)]
pub struct ConversationLog {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl ConversationLog {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_for(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("conversation_{}.txt", day.format("%Y-%m-%d")))
    }

    /// Append a turn to the file for its UTC calendar day.
    pub fn append(&self, turn: &ConversationTurn) -> Result<PathBuf> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("conversation log lock poisoned"))?;
        let path = self.file_for(turn.timestamp.date_naive());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open conversation log {}", path.display()))?;
        file.write_all(render_entry(turn).as_bytes())
            .with_context(|| format!("failed to append to conversation log {}", path.display()))?;
        Ok(path)
    }

    /// Turns recorded for `day`, in append order.
    pub fn read_day(&self, day: NaiveDate) -> Result<Vec<ConversationTurn>> {
        let path = self.file_for(day);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(parse_log(&contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read conversation log {}", path.display()))
            }
        }
    }
}

pub fn render_entry(turn: &ConversationTurn) -> String {
    let stamp = format_timestamp(&turn.timestamp);
    format!(
        "{stamp} - User: {}\n{stamp} - Assistant: {}\n\n",
        turn.user, turn.assistant
    )
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Speaker {
    User,
    Assistant,
}

struct Block {
    speaker: Speaker,
    timestamp: DateTime<Utc>,
    lines: Vec<String>,
}

/// Rebuild turns from log text. Lines that are not entry headers continue the
/// previous message; the blank separator after each assistant line is dropped.
///
/// Messages are written unescaped, so a message line that itself looks like
/// `<timestamp> - User: ...` starts a new entry when read back. Trailing blank
/// lines of an assistant message are not recoverable either.
pub fn parse_log(contents: &str) -> Vec<ConversationTurn> {
    let mut turns = Vec::new();
    let mut pending_user: Option<String> = None;
    let mut current: Option<Block> = None;

    for line in contents.split('\n') {
        match parse_header(line) {
            Some(block) => {
                if let Some(done) = current.replace(block) {
                    finish_block(done, &mut pending_user, &mut turns);
                }
            }
            None => {
                if let Some(block) = current.as_mut() {
                    block.lines.push(line.to_string());
                }
            }
        }
    }
    if let Some(done) = current {
        finish_block(done, &mut pending_user, &mut turns);
    }
    turns
}

fn parse_header(line: &str) -> Option<Block> {
    let caps = ENTRY_HEADER.captures(line)?;
    let timestamp = DateTime::parse_from_rfc3339(caps.get(1)?.as_str())
        .ok()?
        .with_timezone(&Utc);
    let speaker = match caps.get(2)?.as_str() {
        "User" => Speaker::User,
        _ => Speaker::Assistant,
    };
    Some(Block {
        speaker,
        timestamp,
        lines: vec![caps.get(3)?.as_str().to_string()],
    })
}

fn finish_block(
    mut block: Block,
    pending_user: &mut Option<String>,
    turns: &mut Vec<ConversationTurn>,
) {
    match block.speaker {
        Speaker::User => *pending_user = Some(block.lines.join("\n")),
        Speaker::Assistant => {
            while block.lines.len() > 1 && block.lines.last().is_some_and(|line| line.is_empty()) {
                block.lines.pop();
            }
            if let Some(user) = pending_user.take() {
                turns.push(ConversationTurn::new(
                    user,
                    block.lines.join("\n"),
                    block.timestamp,
                ));
            }
        }
    }
}
