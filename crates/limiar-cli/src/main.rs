//! # limiar
//!
//! Command-line client: tails a session's roll feed, submits rolls, follows
//! GM commands and campaign events, and drives the session lifecycle over
//! REST.

#![deny(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use limiar_api::ApiClient;
use limiar_core::roll::{RollEvent, RollHistory};
use limiar_core::session::{SessionCommandKind, SessionSummary};
use limiar_core::{CampaignId, RollId, SessionId};
use limiar_realtime::{
    CampaignChannel, CommandChannel, ConnectionState, RollSessionChannel, TransportFactory,
    TungsteniteConnector,
};
use limiar_settings::LimiarSettings;
use serde_json::{Map, Value};

/// Limiar realtime client.
#[derive(Parser, Debug)]
#[command(name = "limiar", version, about = "Limiar realtime session client")]
struct Cli {
    /// API base URL (overrides settings and `LIMIAR_API_BASE_URL`).
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Bearer token for REST and realtime endpoints.
    #[arg(long, global = true, env = "LIMIAR_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Log filter directive (overrides settings).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print history and live rolls for a session until Ctrl-C.
    Tail {
        /// Session id.
        session: String,
    },
    /// Submit one roll and print the outcome.
    Roll {
        /// Session id.
        session: String,
        /// Dice expression, e.g. `1d20+3`.
        expression: String,
        /// Optional label.
        #[arg(long)]
        label: Option<String>,
        /// Seconds to wait for the connection and the result.
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
    /// Print GM commands and session end notices until Ctrl-C.
    Commands {
        /// Session id.
        session: String,
    },
    /// Print campaign session lifecycle events until Ctrl-C.
    Campaign {
        /// Campaign id.
        campaign: String,
    },
    /// Session lifecycle over REST.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand, Debug)]
enum SessionAction {
    /// Start a new session in a campaign.
    Start {
        /// Campaign id.
        campaign: String,
        /// Session title.
        #[arg(long, default_value = "")]
        title: String,
    },
    /// Show the campaign's active session.
    Active {
        /// Campaign id.
        campaign: String,
    },
    /// List a campaign's sessions.
    List {
        /// Campaign id.
        campaign: String,
    },
    /// Close a session.
    Close {
        /// Session id.
        session: String,
    },
    /// Resume a closed session.
    Resume {
        /// Session id.
        session: String,
    },
    /// Issue a GM command.
    Command {
        /// Session id.
        session: String,
        /// `open_shop`, `close_shop` or `request_roll`.
        kind: SessionCommandKind,
        /// JSON object payload.
        #[arg(long)]
        data: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = limiar_settings::load_settings().context("Failed to load settings")?;
    if let Some(base_url) = &cli.base_url {
        settings.api.base_url = Some(base_url.clone());
    }
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| settings.logging.level.clone());
    limiar_core::logging::init_subscriber(&level, settings.logging.format);
    tracing::debug!(base_url = ?settings.api.base_url, "settings loaded");

    let token = cli.token.filter(|t| !t.is_empty());
    match cli.command {
        Command::Tail { session } => tail(&settings, token, SessionId::from(session)).await,
        Command::Roll {
            session,
            expression,
            label,
            wait,
        } => {
            roll(
                &settings,
                token,
                SessionId::from(session),
                &expression,
                label.as_deref(),
                Duration::from_secs(wait),
            )
            .await
        }
        Command::Commands { session } => {
            commands(&settings, token.as_deref(), SessionId::from(session)).await
        }
        Command::Campaign { campaign } => {
            campaign_events(&settings, token.as_deref(), CampaignId::from(campaign)).await
        }
        Command::Session { action } => session(&settings, token, action).await,
    }
}

fn factory(settings: &LimiarSettings) -> Result<TransportFactory> {
    TransportFactory::from_settings(settings, Arc::new(TungsteniteConnector::default()))
        .context("Failed to configure realtime endpoint")
}

fn roll_channel(settings: &LimiarSettings, token: Option<String>) -> Result<RollSessionChannel> {
    let api = ApiClient::from_settings(settings, token).context("Failed to configure API client")?;
    Ok(RollSessionChannel::new(factory(settings)?, Arc::new(api)))
}

async fn tail(settings: &LimiarSettings, token: Option<String>, session_id: SessionId) -> Result<()> {
    let channel = roll_channel(settings, token.clone())?;
    channel.activate(session_id.clone(), token.as_deref());
    eprintln!("tailing session {session_id} (Ctrl-C to stop)");

    let mut rx = channel.changes();
    let mut printed = HashSet::new();
    let mut state = None;
    let mut error = None;
    loop {
        let view = rx.borrow_and_update().clone();
        if state != Some(view.connection_state) {
            eprintln!("[{}]", view.connection_state);
            state = Some(view.connection_state);
        }
        if view.last_error != error {
            if let Some(err) = &view.last_error {
                eprintln!("error: {err}");
            }
            error = view.last_error.clone();
        }
        for event in unseen(&view.events, &mut printed) {
            println!("{}", format_roll(event));
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = rx.changed() => if changed.is_err() { break },
        }
    }
    channel.deactivate();
    Ok(())
}

async fn roll(
    settings: &LimiarSettings,
    token: Option<String>,
    session_id: SessionId,
    expression: &str,
    label: Option<&str>,
    wait: Duration,
) -> Result<()> {
    if token.is_none() {
        bail!("a token is required to roll (use --token or LIMIAR_TOKEN)");
    }
    let channel = roll_channel(settings, token.clone())?;
    channel.activate(session_id, token.as_deref());
    let outcome = submit_roll(&channel, expression, label, wait).await;
    channel.deactivate();
    println!("{}", format_roll(&outcome?));
    Ok(())
}

/// Wait for the connection and the history fetch, submit one roll, and
/// return the first new event echoing its expression.
async fn submit_roll(
    channel: &RollSessionChannel,
    expression: &str,
    label: Option<&str>,
    wait: Duration,
) -> Result<RollEvent> {
    let mut rx = channel.changes();
    let ready = tokio::time::timeout(wait, async {
        loop {
            {
                let view = rx.borrow_and_update();
                if view.connection_state == ConnectionState::Connected && view.history_loaded {
                    return true;
                }
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    })
    .await;
    if !matches!(ready, Ok(true)) {
        bail!("not connected after {}s", wait.as_secs());
    }

    let mut seen: HashSet<RollId> = channel.events().into_iter().map(|e| e.id).collect();
    let request_id = channel.roll(expression, label)?;
    tracing::debug!(%request_id, "roll submitted");
    let wanted = compact(expression);

    let outcome = tokio::time::timeout(wait, async {
        loop {
            {
                let view = rx.borrow_and_update();
                if let Some(err) = view
                    .last_error
                    .as_ref()
                    .filter(|e| e.request_id.as_ref() == Some(&request_id))
                {
                    return Err(anyhow::anyhow!("{err}"));
                }
                let echo = unseen(&view.events, &mut seen)
                    .into_iter()
                    .find(|e| compact(&e.expression) == wanted);
                if let Some(event) = echo {
                    return Ok(event.clone());
                }
            }
            if rx.changed().await.is_err() {
                bail!("roll channel closed");
            }
        }
    })
    .await;
    outcome.unwrap_or_else(|_| Err(anyhow::anyhow!("no result within {}s", wait.as_secs())))
}

/// Expression without whitespace, lowercased.
fn compact(expression: &str) -> String {
    expression
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase()
}

async fn commands(settings: &LimiarSettings, token: Option<&str>, session_id: SessionId) -> Result<()> {
    let channel = CommandChannel::new(factory(settings)?);
    channel.activate(session_id.clone(), token);
    eprintln!("following commands for session {session_id} (Ctrl-C to stop)");

    let mut rx = channel.changes();
    let mut last = rx.borrow().clone();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = rx.changed() => if changed.is_err() { break },
        }
        let view = rx.borrow_and_update().clone();
        if view.connection_state != last.connection_state {
            eprintln!("[{}]", view.connection_state);
        }
        if view.last_command != last.last_command {
            if let Some(command) = &view.last_command {
                let data = command
                    .data
                    .as_ref()
                    .map(|d| Value::Object(d.clone()).to_string())
                    .unwrap_or_default();
                println!("command {} {data}", command.command);
            }
        }
        if view.session_ended_at != last.session_ended_at {
            if let Some(at) = view.session_ended_at {
                println!("session ended at {}", at.to_rfc3339());
            }
        }
        last = view;
    }
    channel.deactivate();
    Ok(())
}

async fn campaign_events(
    settings: &LimiarSettings,
    token: Option<&str>,
    campaign_id: CampaignId,
) -> Result<()> {
    let channel = CampaignChannel::new(factory(settings)?);
    channel.activate(campaign_id.clone(), token);
    eprintln!("following campaign {campaign_id} (Ctrl-C to stop)");

    let mut rx = channel.changes();
    let mut last = rx.borrow().clone();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = rx.changed() => if changed.is_err() { break },
        }
        let view = rx.borrow_and_update().clone();
        if view.connection_state != last.connection_state {
            eprintln!("[{}]", view.connection_state);
        }
        let fresh = match (&view.last_event, &last.last_event) {
            (Some(now), Some(before)) => !Arc::ptr_eq(now, before),
            (Some(_), None) => true,
            _ => false,
        };
        if let Some(event) = view.last_event.as_ref().filter(|_| fresh) {
            let kind = serde_json::to_value(event.kind).unwrap_or(Value::Null);
            println!("{} {}", kind.as_str().unwrap_or("event"), Value::Object(event.payload.clone()));
        }
        last = view;
    }
    channel.deactivate();
    Ok(())
}

async fn session(settings: &LimiarSettings, token: Option<String>, action: SessionAction) -> Result<()> {
    let api = ApiClient::from_settings(settings, token).context("Failed to configure API client")?;
    match action {
        SessionAction::Start { campaign, title } => {
            print_summary(&api.activate_session(&CampaignId::from(campaign), &title).await?)
        }
        SessionAction::Active { campaign } => {
            print_summary(&api.active_session(&CampaignId::from(campaign)).await?)
        }
        SessionAction::List { campaign } => {
            for summary in api.list_sessions(&CampaignId::from(campaign)).await? {
                println!(
                    "{}\t#{}\t{:?}\t{}",
                    summary.id,
                    summary.number,
                    summary.status,
                    summary.title.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        SessionAction::Close { session } => {
            print_summary(&api.close_session(&SessionId::from(session)).await?)
        }
        SessionAction::Resume { session } => {
            print_summary(&api.resume_session(&SessionId::from(session)).await?)
        }
        SessionAction::Command {
            session,
            kind,
            data,
        } => {
            let payload = data.as_deref().map(parse_data).transpose()?;
            let ack = api
                .send_command(&SessionId::from(session), kind.as_str(), payload.as_ref())
                .await?;
            println!("ok: {}", ack.ok);
            Ok(())
        }
    }
}

fn print_summary(summary: &SessionSummary) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

fn parse_data(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw).context("--data must be JSON")? {
        Value::Object(map) => Ok(map),
        _ => bail!("--data must be a JSON object"),
    }
}

/// Events not yet in `seen`, oldest first. Marks them seen.
fn unseen<'a>(history: &'a RollHistory, seen: &mut HashSet<RollId>) -> Vec<&'a RollEvent> {
    let mut fresh: Vec<&RollEvent> = history.iter().filter(|e| seen.insert(e.id.clone())).collect();
    fresh.reverse();
    fresh
}

fn format_roll(event: &RollEvent) -> String {
    let label = event
        .label
        .as_deref()
        .map(|l| format!(" ({l})"))
        .unwrap_or_default();
    format!(
        "{} {}{label}: {:?} = {}",
        event.author_name, event.expression, event.results, event.total
    )
}
