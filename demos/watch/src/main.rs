//! Follow pending agent actions from the terminal and decide them.
//!
//! Run with: cargo run -p agent-sync-watch -- --token dev-token --session demo
//!
//! Commands read from stdin:
//! - `a <id>` approve one action
//! - `r <id> [reason]` reject one action
//! - `A` approve everything pending
//! - `R [reason]` reject everything pending
//! - `l` list pending actions
//! - `q` quit

use std::{path::PathBuf, str::FromStr, sync::Arc};

use agent_sync_actions::{ControlPlane, RestActionSource};
use agent_sync_core::{ActionChange, ActionId, BatchOutcome, CursorStore, SyncConfig, TrackedAction};
use agent_sync_session::FileCursorStore;
use agent_sync_transport::Envelope;
use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "agent-sync-watch", version, about)]
struct Args {
    /// TOML config file; flags below override it.
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Control-plane WebSocket endpoint.
    #[arg(long)]
    ws_url: Option<String>,
    /// Base URL of the action REST API.
    #[arg(long)]
    api_url: Option<String>,
    /// Bearer token for both surfaces.
    #[arg(long, env = "AGENT_SYNC_TOKEN")]
    token: String,
    /// Session to follow.
    #[arg(long, default_value = "demo")]
    session: String,
    /// Cursor file; defaults to the platform data directory.
    #[arg(long)]
    cursors: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Approve(ActionId),
    Reject(ActionId, Option<String>),
    ApproveAll,
    RejectAll(Option<String>),
    List,
    Quit,
}

impl FromStr for Input {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        let reason = (!rest.is_empty()).then(|| rest.to_owned());
        match cmd {
            "a" if !rest.is_empty() => Ok(Self::Approve(rest.into())),
            "r" if !rest.is_empty() => {
                let (id, reason) = rest.split_once(' ').unwrap_or((rest, ""));
                let reason = reason.trim();
                Ok(Self::Reject(
                    id.into(),
                    (!reason.is_empty()).then(|| reason.to_owned()),
                ))
            }
            "A" => Ok(Self::ApproveAll),
            "R" => Ok(Self::RejectAll(reason)),
            "l" => Ok(Self::List),
            "q" => Ok(Self::Quit),
            _ => Err(format!("unknown command: {line}")),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,agent_sync=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => SyncConfig::load(path).context("loading config")?,
        None => SyncConfig::default(),
    };
    if let Some(url) = args.ws_url {
        config = config.with_ws_url(url);
    }
    if let Some(url) = args.api_url {
        config = config.with_api_base_url(url);
    }

    let source = RestActionSource::new(&config.api_base_url)
        .context("building REST client")?
        .with_credential(args.token.clone());
    let cursors: Arc<dyn CursorStore> = match args.cursors {
        Some(path) => Arc::new(FileCursorStore::new(path)),
        None => Arc::new(FileCursorStore::in_data_dir().context("locating cursor file")?),
    };

    let plane = ControlPlane::builder(config, Arc::new(source))
        .cursor_store(cursors)
        .credential(args.token)
        .build();

    let mut states = plane.watch_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            println!("-- connection {state}");
        }
    });

    let mut changes = plane.watch_actions();
    tokio::spawn(async move {
        while let Some(change) = changes.next().await {
            print_change(&change);
        }
    });

    if let Err(e) = plane.initial_sync().await {
        tracing::warn!(error = %e, "Initial sync failed, relying on live events");
    }
    let _session = plane
        .subscribe_session(&args.session, |env: &Envelope| {
            tracing::debug!(kind = %env.kind, seq = ?env.seq, "Session event");
        })
        .await
        .context("attaching session")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Input>() {
                    Ok(Input::Quit) => break,
                    Ok(input) => run(&plane, input).await,
                    Err(e) => eprintln!("{e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    plane.shutdown();
    Ok(())
}

async fn run(plane: &ControlPlane, input: Input) {
    match input {
        Input::Approve(id) => match plane.approve(&id).await {
            Ok(()) => println!("approved {id}"),
            Err(e) => eprintln!("approve {id}: {e}"),
        },
        Input::Reject(id, reason) => match plane.reject(&id, reason.as_deref()).await {
            Ok(()) => println!("rejected {id}"),
            Err(e) => eprintln!("reject {id}: {e}"),
        },
        Input::ApproveAll => print_batch("approve", &plane.approve_all().await),
        Input::RejectAll(reason) => {
            print_batch("reject", &plane.reject_all(reason.as_deref()).await);
        }
        Input::List => {
            let pending = plane.pending();
            if pending.is_empty() {
                println!("nothing pending");
            }
            for action in pending {
                println!("  {} [{}] {}", action.id, action.tool_name, action.description);
            }
        }
        Input::Quit => {}
    }
}

fn print_change(change: &ActionChange) {
    match change {
        ActionChange::Snapshot(actions) => {
            println!("{} action(s) in view", actions.len());
            for tracked in actions {
                print_tracked(tracked);
            }
        }
        ActionChange::Added(tracked) => print_tracked(tracked),
        ActionChange::StatusChanged { id, status } => println!("~ {id} {status}"),
        ActionChange::Removed(id) => println!("- {id}"),
    }
}

fn print_tracked(tracked: &TrackedAction) {
    let action = &tracked.action;
    println!(
        "+ {} [{}] {} ({})",
        action.id, action.tool_name, action.description, tracked.status
    );
    if let Some(preview) = &action.preview {
        println!("    {preview}");
    }
}

fn print_batch(verb: &str, outcome: &BatchOutcome) {
    if outcome.items.is_empty() {
        println!("nothing to {verb}");
        return;
    }
    let ok = outcome.succeeded().count();
    println!("{verb}: {ok}/{} succeeded", outcome.items.len());
    for item in outcome.failed() {
        println!(
            "  {} failed: {}",
            item.id,
            item.error.as_deref().unwrap_or("unknown error")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!("a a1".parse(), Ok(Input::Approve("a1".into())));
        assert_eq!(
            "r a1 too risky".parse(),
            Ok(Input::Reject("a1".into(), Some("too risky".into())))
        );
        assert_eq!("r a1".parse(), Ok(Input::Reject("a1".into(), None)));
        assert_eq!("A".parse(), Ok(Input::ApproveAll));
        assert_eq!("R ".parse(), Ok(Input::RejectAll(None)));
        assert_eq!("q".parse(), Ok(Input::Quit));
        assert!("a".parse::<Input>().is_err());
        assert!("x y".parse::<Input>().is_err());
    }
}
