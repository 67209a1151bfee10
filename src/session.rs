use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::TimeInfo;
use crate::dispatch::Dispatcher;
use crate::journal::{ConversationLog, ConversationTurn};
use crate::stats::SystemStats;
use crate::weather::WeatherReport;

/// Frames sent by the browser client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    ProcessCommand(CommandPayload),
}

/// `processCommand` data: either `{ "command": "..." }` or a bare string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CommandPayload {
    Wrapped { command: String },
    Bare(String),
}

impl CommandPayload {
    pub fn into_command(self) -> String {
        match self {
            CommandPayload::Wrapped { command } | CommandPayload::Bare(command) => command,
        }
    }
}

/// Frames pushed to the browser client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    AssistantResponse {
        text: String,
        history: Vec<ConversationTurn>,
    },
    TimeUpdate(TimeInfo),
    WeatherUpdate(WeatherReport),
    SystemStats(SystemStats),
}

impl ServerMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::AssistantResponse { .. } => "assistantResponse",
            ServerMessage::TimeUpdate(_) => "timeUpdate",
            ServerMessage::WeatherUpdate(_) => "weatherUpdate",
            ServerMessage::SystemStats(_) => "systemStats",
        }
    }

    pub fn to_frame(&self) -> Result<String> {
        serde_json::to_string(self)
            .with_context(|| format!("failed to encode {} frame", self.event_name()))
    }
}

pub fn parse_frame(text: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// Transport-neutral view of one inbound WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(usize),
    Control,
    Close,
}

/// Per-connection conversation: dispatches commands and owns the turn history.
pub struct Session {
    id: Uuid,
    dispatcher: Arc<Dispatcher>,
    log: Arc<ConversationLog>,
    history: Vec<ConversationTurn>,
    history_limit: Option<usize>,
}

impl Session {
    pub fn new(
        id: Uuid,
        dispatcher: Arc<Dispatcher>,
        log: Arc<ConversationLog>,
        history_limit: Option<usize>,
    ) -> Self {
        Self {
            id,
            dispatcher,
            log,
            history: Vec::new(),
            history_limit,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    /// Dispatch, log and record one command; the log entry and the history
    /// turn share a single timestamp.
    pub async fn handle_command(&mut self, command: &str) -> ServerMessage {
        let response = self.dispatcher.dispatch(command).await;
        let turn = ConversationTurn::new(command, response.text.clone(), response.generated_at);

        let log = Arc::clone(&self.log);
        let entry = turn.clone();
        match task::spawn_blocking(move || log.append(&entry)).await {
            Ok(Ok(path)) => debug!(connection = %self.id, path = %path.display(), "conversation logged"),
            Ok(Err(err)) => {
                warn!(connection = %self.id, error = %format!("{err:#}"), "failed to append conversation log")
            }
            Err(err) => warn!(connection = %self.id, error = %err, "conversation log worker panicked"),
        }

        self.push_turn(turn);
        ServerMessage::AssistantResponse {
            text: response.text,
            history: self.history.clone(),
        }
    }

    fn push_turn(&mut self, turn: ConversationTurn) {
        self.history.push(turn);
        if let Some(limit) = self.history_limit {
            let excess = self.history.len().saturating_sub(limit);
            if excess > 0 {
                self.history.drain(..excess);
            }
        }
    }
}

/// Read frames until the client goes away, feeding commands to a FIFO worker.
///
/// Returns the worker handle once the inbound side closes. Every command
/// already received is still dispatched and logged, but nothing more is sent
/// to a closed connection.
pub async fn drive<S>(
    session: Session,
    mut inbound: S,
    outbound: mpsc::Sender<ServerMessage>,
    queue_depth: usize,
) -> JoinHandle<()>
where
    S: Stream<Item = InboundFrame> + Unpin,
{
    let id = session.id();
    let closed = Arc::new(AtomicBool::new(false));
    let (commands_tx, commands_rx) = mpsc::channel::<String>(queue_depth.max(1));
    let worker = tokio::spawn(run_worker(session, commands_rx, outbound, Arc::clone(&closed)));

    while let Some(frame) = inbound.next().await {
        match frame {
            InboundFrame::Text(text) => match parse_frame(&text) {
                Ok(ClientMessage::ProcessCommand(payload)) => {
                    let command = payload.into_command();
                    debug!(connection = %id, command = %command, "command received");
                    if commands_tx.send(command).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(connection = %id, error = %err, "ignoring malformed frame"),
            },
            InboundFrame::Binary(len) => {
                warn!(connection = %id, bytes = len, "ignoring binary frame")
            }
            InboundFrame::Control => {}
            InboundFrame::Close => break,
        }
    }

    closed.store(true, Ordering::SeqCst);
    info!(connection = %id, "inbound stream closed");
    worker
}

async fn run_worker(
    mut session: Session,
    mut commands: mpsc::Receiver<String>,
    outbound: mpsc::Sender<ServerMessage>,
    closed: Arc<AtomicBool>,
) {
    let id = session.id();
    let mut deliver = true;
    while let Some(command) = commands.recv().await {
        let reply = session.handle_command(&command).await;
        if !deliver {
            continue;
        }
        if closed.load(Ordering::SeqCst) {
            debug!(connection = %id, "dropping responses for closed connection");
            deliver = false;
            continue;
        }
        if outbound.send(reply).await.is_err() {
            debug!(connection = %id, "outbound queue closed");
            deliver = false;
        }
    }
}
