use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{ArgAction, Parser};
use sidekick::Assistant;
use sidekick::config::AssistantSettings;
use sidekick::journal::ConversationLog;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "sidekick", version, about = "Voice and text personal assistant server", long_about = None)]
struct Args {
    /// Override path to the sidekick config.json
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override listen address (host:port)
    #[arg(long, value_name = "ADDR:PORT")]
    listen: Option<String>,

    /// Serve client assets from this directory
    #[arg(long, value_name = "DIR")]
    static_dir: Option<PathBuf>,

    /// Print the conversation log for a day (YYYY-MM-DD) and exit
    #[arg(long, value_name = "DATE")]
    print_log: Option<NaiveDate>,

    /// Increase logging verbosity
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn apply_overrides(settings: &mut AssistantSettings, args: &Args) {
    if let Some(listen) = &args.listen {
        settings.server.listen_addr = listen.clone();
    }
    if let Some(dir) = &args.static_dir {
        settings.server.static_dir = dir.clone();
    }
}

fn print_log(settings: &AssistantSettings, day: NaiveDate) -> Result<()> {
    let log = ConversationLog::new(settings.resolve_log_dir()?)?;
    let turns = log.read_day(day)?;
    if turns.is_empty() {
        println!("No conversations recorded on {day}.");
        return Ok(());
    }
    for turn in turns {
        println!("[{}]", turn.timestamp.format("%H:%M:%S"));
        println!("  you: {}", turn.user);
        println!("  sidekick: {}", turn.assistant);
    }
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(err) => warn!(error = %err, "failed to listen for ctrl-c; shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = sidekick::load_settings(args.config.clone())?;
    apply_overrides(&mut settings, &args);

    if let Err(err) = sidekick::telemetry::init_tracing("sidekick", args.verbose, &settings.telemetry)
    {
        eprintln!("warning: failed to initialise sidekick tracing: {err}");
    }
    if let Some(path) = sidekick::telemetry::current_trace_file() {
        info!(path = %path.display(), "writing JSON traces");
    }

    if let Some(day) = args.print_log {
        return print_log(&settings, day);
    }

    let assistant = Assistant::from_settings(settings).context("failed to assemble assistant")?;
    assistant.run(shutdown_signal()).await?;
    info!("sidekick stopped");
    Ok(())
}
